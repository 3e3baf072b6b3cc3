//! Safe memory patching
//!
//! All writes to executable memory go through a [`MemoryAccess`]
//! implementation, wrapped in a [`Patch`] so every modification is
//! recorded with the bytes it replaced.
//!
//! - [`ProcessMemory`] writes live process memory, toggling page protection
//!   around the write and flushing the instruction cache.
//! - [`BufferMemory`] maps a byte buffer at an arbitrary virtual base, for
//!   dry runs and tests against synthetic images.

mod buffer;
mod patch;
mod process;

pub use buffer::BufferMemory;
pub use patch::{write_word, Patch, PatchState};
pub use process::ProcessMemory;

/// Error type for memory reads, writes and patches
#[derive(Debug, thiserror::Error)]
pub enum MemoryError {
    #[error("Null address")]
    NullAddress,

    #[error("Address range {address:#x}+{len:#x} is not mapped")]
    Unmapped { address: usize, len: usize },

    #[error("Address range {address:#x}+{len:#x} is not readable")]
    Unreadable { address: usize, len: usize },

    #[error("Failed to change protection at {address:#x}: {reason}")]
    Protection { address: usize, reason: String },

    #[error("Patch at {address:#x} is {state:?}, cannot {action}")]
    PatchState {
        address: usize,
        state: PatchState,
        action: &'static str,
    },
}

/// Width of a single word write
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WordWidth {
    Byte,
    Half,
    Word,
    Quad,
}

impl WordWidth {
    /// Number of bytes written
    pub fn size(self) -> usize {
        match self {
            WordWidth::Byte => 1,
            WordWidth::Half => 2,
            WordWidth::Word => 4,
            WordWidth::Quad => 8,
        }
    }

    /// Pointer-sized width for an image of the given architecture
    pub fn pointer(wide: bool) -> Self {
        if wide {
            WordWidth::Quad
        } else {
            WordWidth::Word
        }
    }

    /// Little-endian encoding of the low `size()` bytes of `value`
    pub fn encode(self, value: u64) -> Vec<u8> {
        value.to_le_bytes()[..self.size()].to_vec()
    }
}

/// Raw access to an address space
pub trait MemoryAccess: Send + Sync {
    /// Copy `buf.len()` bytes from `address`, failing rather than faulting
    /// if any of the range is unmapped or unreadable
    fn read(&self, address: usize, buf: &mut [u8]) -> Result<(), MemoryError>;

    /// Overwrite `bytes.len()` bytes at `address`, making the pages writable
    /// for the duration and flushing the instruction cache afterwards
    fn write(&self, address: usize, bytes: &[u8]) -> Result<(), MemoryError>;

    /// Invalidate the instruction cache for `address..address + len`, or for
    /// the whole process when `range` is `None`
    fn flush_instruction_cache(&self, range: Option<(usize, usize)>);
}

/// Typed reads on top of [`MemoryAccess`]
pub trait MemoryAccessExt: MemoryAccess {
    /// Read a little-endian word of the given width
    fn read_word(&self, address: usize, width: WordWidth) -> Result<u64, MemoryError> {
        let mut buf = [0u8; 8];
        self.read(address, &mut buf[..width.size()])?;
        Ok(u64::from_le_bytes(buf))
    }

    fn read_u32(&self, address: usize) -> Result<u32, MemoryError> {
        Ok(self.read_word(address, WordWidth::Word)? as u32)
    }

    fn read_usize(&self, address: usize) -> Result<usize, MemoryError> {
        let width = WordWidth::pointer(cfg!(target_pointer_width = "64"));
        Ok(self.read_word(address, width)? as usize)
    }
}

impl<M: MemoryAccess + ?Sized> MemoryAccessExt for M {}
