//! Live process memory

use region::Protection;

use super::{MemoryAccess, MemoryError};

/// The current process's address space
#[derive(Debug, Default, Clone, Copy)]
pub struct ProcessMemory;

impl ProcessMemory {
    pub fn new() -> Self {
        Self
    }

    /// Check that every byte of the range is mapped and readable
    fn ensure_readable(&self, address: usize, len: usize) -> Result<(), MemoryError> {
        let end = address
            .checked_add(len)
            .ok_or(MemoryError::Unmapped { address, len })?;

        let regions = region::query_range(address as *const u8, len)
            .map_err(|_| MemoryError::Unmapped { address, len })?;

        // Regions come back in ascending order; any gap means unmapped bytes
        let mut covered = address;
        for region in regions {
            let region = region.map_err(|_| MemoryError::Unmapped { address, len })?;
            let range = region.as_range();
            if range.start > covered {
                return Err(MemoryError::Unmapped { address, len });
            }
            if !region.is_readable() {
                return Err(MemoryError::Unreadable { address, len });
            }
            covered = covered.max(range.end);
            if covered >= end {
                return Ok(());
            }
        }

        Err(MemoryError::Unmapped { address, len })
    }
}

impl MemoryAccess for ProcessMemory {
    fn read(&self, address: usize, buf: &mut [u8]) -> Result<(), MemoryError> {
        if address == 0 {
            return Err(MemoryError::NullAddress);
        }
        if buf.is_empty() {
            return Ok(());
        }

        self.ensure_readable(address, buf.len())?;

        // SAFETY: the whole range was just verified to be mapped and readable
        unsafe {
            std::ptr::copy_nonoverlapping(address as *const u8, buf.as_mut_ptr(), buf.len());
        }
        Ok(())
    }

    fn write(&self, address: usize, bytes: &[u8]) -> Result<(), MemoryError> {
        if address == 0 {
            return Err(MemoryError::NullAddress);
        }
        if bytes.is_empty() {
            return Ok(());
        }

        // Covers every page the range touches; the guard restores the
        // previous protection when dropped
        let guard = unsafe {
            region::protect_with_handle(
                address as *const u8,
                bytes.len(),
                Protection::READ_WRITE_EXECUTE,
            )
        }
        .map_err(|e| MemoryError::Protection {
            address,
            reason: e.to_string(),
        })?;

        // SAFETY: the range is mapped (protect succeeded) and now writable
        unsafe {
            std::ptr::copy_nonoverlapping(bytes.as_ptr(), address as *mut u8, bytes.len());
        }
        drop(guard);

        self.flush_instruction_cache(Some((address, bytes.len())));
        Ok(())
    }

    #[cfg(windows)]
    fn flush_instruction_cache(&self, range: Option<(usize, usize)>) {
        use windows::Win32::System::Diagnostics::Debug::FlushInstructionCache;
        use windows::Win32::System::Threading::GetCurrentProcess;

        let (address, len) = match range {
            Some((address, len)) => (Some(address as *const std::ffi::c_void), len),
            None => (None, 0),
        };

        if let Err(e) = unsafe { FlushInstructionCache(GetCurrentProcess(), address, len) } {
            tracing::warn!("FlushInstructionCache failed: {}", e);
        }
    }

    #[cfg(not(windows))]
    fn flush_instruction_cache(&self, _range: Option<(usize, usize)>) {
        // x86-64 keeps instruction fetch coherent with stores
        std::sync::atomic::fence(std::sync::atomic::Ordering::SeqCst);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_read_rejects_null_and_unmapped() {
        let memory = ProcessMemory::new();
        let mut buf = [0u8; 8];

        assert!(matches!(
            memory.read(0, &mut buf),
            Err(MemoryError::NullAddress)
        ));
        assert!(memory.read(0x10, &mut buf).is_err());
    }

    #[test]
    fn test_read_live_value() {
        let value: u64 = 0x0123_4567_89AB_CDEF;
        let mut buf = [0u8; 8];

        ProcessMemory::new()
            .read(&value as *const u64 as usize, &mut buf)
            .unwrap();
        assert_eq!(u64::from_le_bytes(buf), value);
    }

    #[test]
    fn test_write_restores_protection_across_pages() {
        let page = region::page::size();
        let allocation = region::alloc(page * 2, Protection::READ).unwrap();
        let base = allocation.as_ptr::<u8>() as usize;
        let address = base + page - 4;

        let memory = ProcessMemory::new();
        memory.write(address, &0xAABB_CCDD_1122_3344u64.to_le_bytes()).unwrap();

        let mut buf = [0u8; 8];
        memory.read(address, &mut buf).unwrap();
        assert_eq!(u64::from_le_bytes(buf), 0xAABB_CCDD_1122_3344);

        for offset in [0, page] {
            let info = region::query((base + offset) as *const u8).unwrap();
            assert_eq!(info.protection(), Protection::READ);
        }
    }

    #[test]
    fn test_write_to_unmapped_fails() {
        let memory = ProcessMemory::new();
        assert!(matches!(
            memory.write(0x10, &[0x90]),
            Err(MemoryError::Protection { .. })
        ));
    }
}
