//! Static offset to runtime address translation
//!
//! The host is loaded at a randomized base, so every statically known
//! location (vtables, globals, type descriptors) is stored as an offset from
//! the image base and resolved here.

use std::marker::PhantomData;

/// Holds the actual load base of the host image
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RelocationManager {
    base: usize,
}

impl RelocationManager {
    /// Record the load base
    pub fn new(base: usize) -> Self {
        Self { base }
    }

    /// The recorded load base
    pub fn base(&self) -> usize {
        self.base
    }

    /// Runtime address of a static offset
    pub fn resolve(&self, offset: usize) -> usize {
        self.base.saturating_add(offset)
    }

    /// Static offset of a runtime address, if it lies above the base
    pub fn offset_of(&self, address: usize) -> Option<usize> {
        address.checked_sub(self.base)
    }
}

/// A typed static offset into the host image
pub struct RelocAddr<T> {
    offset: usize,
    _marker: PhantomData<fn() -> T>,
}

impl<T> RelocAddr<T> {
    pub const fn new(offset: usize) -> Self {
        Self {
            offset,
            _marker: PhantomData,
        }
    }

    /// The static offset
    pub const fn offset(&self) -> usize {
        self.offset
    }

    /// Runtime pointer for this offset
    pub fn get(&self, relocations: &RelocationManager) -> *mut T {
        relocations.resolve(self.offset) as *mut T
    }
}

impl<T> Clone for RelocAddr<T> {
    fn clone(&self) -> Self {
        *self
    }
}

impl<T> Copy for RelocAddr<T> {}

impl<T> std::fmt::Debug for RelocAddr<T> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "RelocAddr({:#x})", self.offset)
    }
}
