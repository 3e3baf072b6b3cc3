//! Recorded memory modifications

use super::{MemoryAccess, MemoryError, WordWidth};

/// Lifecycle of a [`Patch`]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PatchState {
    /// Built but not yet written
    Pending,
    /// Replacement bytes are in memory
    Committed,
    /// Original bytes were written back
    RolledBack,
}

/// A byte range replacement that remembers what it overwrote
#[derive(Debug, Clone)]
pub struct Patch {
    address: usize,
    original: Vec<u8>,
    replacement: Vec<u8>,
    state: PatchState,
}

impl Patch {
    pub fn new(address: usize, replacement: Vec<u8>) -> Self {
        Self {
            address,
            original: Vec::new(),
            replacement,
            state: PatchState::Pending,
        }
    }

    /// Patch writing a single little-endian word
    pub fn word(address: usize, value: u64, width: WordWidth) -> Self {
        Self::new(address, width.encode(value))
    }

    pub fn address(&self) -> usize {
        self.address
    }

    pub fn len(&self) -> usize {
        self.replacement.len()
    }

    pub fn is_empty(&self) -> bool {
        self.replacement.is_empty()
    }

    pub fn state(&self) -> PatchState {
        self.state
    }

    /// Bytes that were in place before the commit; empty until committed
    pub fn original(&self) -> &[u8] {
        &self.original
    }

    pub fn replacement(&self) -> &[u8] {
        &self.replacement
    }

    /// Capture the current bytes and write the replacement
    pub fn commit(&mut self, memory: &dyn MemoryAccess) -> Result<(), MemoryError> {
        if self.state != PatchState::Pending {
            return Err(MemoryError::PatchState {
                address: self.address,
                state: self.state,
                action: "commit",
            });
        }

        let mut original = vec![0u8; self.replacement.len()];
        memory.read(self.address, &mut original)?;
        memory.write(self.address, &self.replacement)?;

        self.original = original;
        self.state = PatchState::Committed;
        tracing::trace!(
            "Committed {} byte patch at {:#x}",
            self.replacement.len(),
            self.address
        );
        Ok(())
    }

    /// Write the captured original bytes back
    pub fn rollback(&mut self, memory: &dyn MemoryAccess) -> Result<(), MemoryError> {
        if self.state != PatchState::Committed {
            return Err(MemoryError::PatchState {
                address: self.address,
                state: self.state,
                action: "roll back",
            });
        }

        memory.write(self.address, &self.original)?;
        self.state = PatchState::RolledBack;
        tracing::trace!("Rolled back patch at {:#x}", self.address);
        Ok(())
    }
}

/// Overwrite one word at `address`, returning the committed patch
pub fn write_word(
    memory: &dyn MemoryAccess,
    address: usize,
    value: u64,
    width: WordWidth,
) -> Result<Patch, MemoryError> {
    let mut patch = Patch::word(address, value, width);
    patch.commit(memory)?;
    Ok(patch)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::memory::BufferMemory;

    #[test]
    fn test_commit_captures_original() {
        let memory = BufferMemory::new(0x1000, vec![0x11, 0x22, 0x33, 0x44, 0x55]);
        let patch = write_word(&memory, 0x1001, 0xAABB, WordWidth::Half).unwrap();

        assert_eq!(patch.state(), PatchState::Committed);
        assert_eq!(patch.original(), &[0x22, 0x33]);
        assert_eq!(patch.replacement(), &[0xBB, 0xAA]);
        assert_eq!(memory.snapshot(), vec![0x11, 0xBB, 0xAA, 0x44, 0x55]);
    }

    #[test]
    fn test_rollback_restores_bytes() {
        let memory = BufferMemory::new(0x1000, vec![1, 2, 3, 4]);
        let mut patch = Patch::word(0x1000, 0xFFFF_FFFF, WordWidth::Word);

        patch.commit(&memory).unwrap();
        assert_eq!(memory.snapshot(), vec![0xFF; 4]);

        patch.rollback(&memory).unwrap();
        assert_eq!(patch.state(), PatchState::RolledBack);
        assert_eq!(memory.snapshot(), vec![1, 2, 3, 4]);
    }

    #[test]
    fn test_state_transitions_are_enforced() {
        let memory = BufferMemory::new(0x1000, vec![0u8; 8]);
        let mut patch = Patch::new(0x1000, vec![0x90]);

        assert!(matches!(
            patch.rollback(&memory),
            Err(MemoryError::PatchState { action: "roll back", .. })
        ));

        patch.commit(&memory).unwrap();
        assert!(matches!(
            patch.commit(&memory),
            Err(MemoryError::PatchState {
                state: PatchState::Committed,
                ..
            })
        ));

        patch.rollback(&memory).unwrap();
        assert!(patch.rollback(&memory).is_err());
        assert!(patch.commit(&memory).is_err());
    }

    #[test]
    fn test_failed_commit_stays_pending() {
        let memory = BufferMemory::new(0x1000, vec![7u8; 8]);
        memory.deny_protection(true);

        let mut patch = Patch::word(0x1000, 0, WordWidth::Quad);
        assert!(matches!(
            patch.commit(&memory),
            Err(MemoryError::Protection { .. })
        ));
        assert_eq!(patch.state(), PatchState::Pending);
        assert!(patch.original().is_empty());
        assert_eq!(memory.snapshot(), vec![7u8; 8]);
    }
}
