//! Byte buffer mapped at a virtual base

use std::sync::Arc;

use parking_lot::Mutex;

use super::{MemoryAccess, MemoryError};

struct BufferState {
    bytes: Vec<u8>,
    flushes: Vec<Option<(usize, usize)>>,
    deny_protection: bool,
}

/// A buffer pretending to be mapped at `base`
///
/// Clones share the same buffer, so a caller can hand one clone to a
/// runtime and inspect the result through another.
#[derive(Clone)]
pub struct BufferMemory {
    base: usize,
    state: Arc<Mutex<BufferState>>,
}

impl BufferMemory {
    pub fn new(base: usize, bytes: Vec<u8>) -> Self {
        Self {
            base,
            state: Arc::new(Mutex::new(BufferState {
                bytes,
                flushes: Vec::new(),
                deny_protection: false,
            })),
        }
    }

    /// Virtual base of the buffer
    pub fn base(&self) -> usize {
        self.base
    }

    /// Copy of the current contents
    pub fn snapshot(&self) -> Vec<u8> {
        self.state.lock().bytes.clone()
    }

    /// Make subsequent writes fail as if the OS refused the protection change
    pub fn deny_protection(&self, deny: bool) {
        self.state.lock().deny_protection = deny;
    }

    /// Instruction cache flushes requested so far
    pub fn flushes(&self) -> Vec<Option<(usize, usize)>> {
        self.state.lock().flushes.clone()
    }

    fn offset(&self, address: usize, len: usize, size: usize) -> Result<usize, MemoryError> {
        if address == 0 {
            return Err(MemoryError::NullAddress);
        }

        address
            .checked_sub(self.base)
            .filter(|offset| offset.checked_add(len).is_some_and(|end| end <= size))
            .ok_or(MemoryError::Unmapped { address, len })
    }
}

impl MemoryAccess for BufferMemory {
    fn read(&self, address: usize, buf: &mut [u8]) -> Result<(), MemoryError> {
        let state = self.state.lock();
        let offset = self.offset(address, buf.len(), state.bytes.len())?;
        buf.copy_from_slice(&state.bytes[offset..offset + buf.len()]);
        Ok(())
    }

    fn write(&self, address: usize, bytes: &[u8]) -> Result<(), MemoryError> {
        let mut state = self.state.lock();
        let offset = self.offset(address, bytes.len(), state.bytes.len())?;

        if state.deny_protection {
            return Err(MemoryError::Protection {
                address,
                reason: "protection change denied".to_string(),
            });
        }

        state.bytes[offset..offset + bytes.len()].copy_from_slice(bytes);
        state.flushes.push(Some((address, bytes.len())));
        Ok(())
    }

    fn flush_instruction_cache(&self, range: Option<(usize, usize)>) {
        self.state.lock().flushes.push(range);
    }
}

impl std::fmt::Debug for BufferMemory {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("BufferMemory")
            .field("base", &format_args!("{:#x}", self.base))
            .field("len", &self.state.lock().bytes.len())
            .finish()
    }
}
