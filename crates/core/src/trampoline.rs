//! Trampoline memory allocation
//!
//! Reserves executable regions within ±2GB of an anchor address so 5-byte
//! relative branches can reach them, then hands out stubs by bump allocation.

#[cfg(unix)]
use std::ffi::c_void;
#[cfg(unix)]
use std::ptr::NonNull;

use iced_x86::{Code, Encoder, Instruction, MemoryOperand, Register};
use region::{Allocation, Protection};

use crate::memory::{MemoryAccess, MemoryError, Patch, ProcessMemory};

/// Maximum distance between anchor and region (2GB minus slack)
const MAX_RANGE: usize = 0x7FFF_0000;

/// Step between reservation attempts (allocation granularity on Windows)
const SEARCH_STEP: usize = 0x1_0000;

/// Stub alignment
const STUB_ALIGN: usize = 16;

/// `jmp qword ptr [rip+0]` followed by the absolute target
pub const RELAY_SIZE: usize = 14;

/// `jmp rel32` / `call rel32`
pub const BRANCH5_SIZE: usize = 5;

/// Default capacity of each region
pub const DEFAULT_REGION_SIZE: usize = 64 * 1024;

/// Error type for trampoline operations
#[derive(Debug, thiserror::Error)]
pub enum TrampolineError {
    #[error("Trampoline region '{0}' needs a non-zero capacity")]
    InvalidCapacity(&'static str),

    #[error("Failed to reserve trampoline region '{name}': {reason}")]
    Reservation { name: &'static str, reason: String },

    #[error("Trampoline region out of space: requested {requested}, remaining {remaining}")]
    OutOfSpace { requested: usize, remaining: usize },

    #[error("Trampoline regions have not been reserved")]
    Unavailable,

    #[error("Failed to encode branch: {0}")]
    Encode(String),

    #[error(transparent)]
    Memory(#[from] MemoryError),
}

impl From<iced_x86::IcedError> for TrampolineError {
    fn from(error: iced_x86::IcedError) -> Self {
        TrampolineError::Encode(error.to_string())
    }
}

/// An executable region handing out stubs in ascending order
pub struct TrampolineRegion {
    name: &'static str,
    mapping: Mapping,
    capacity: usize,
    cursor: usize,
}

// SAFETY: the mapping is exclusively owned; stubs are only written through
// `&mut self`
unsafe impl Send for TrampolineRegion {}
unsafe impl Sync for TrampolineRegion {}

impl TrampolineRegion {
    /// Reserve `capacity` bytes of RWX memory as close to `anchor` as possible
    pub fn reserve(
        name: &'static str,
        capacity: usize,
        anchor: usize,
    ) -> Result<Self, TrampolineError> {
        if capacity == 0 {
            return Err(TrampolineError::InvalidCapacity(name));
        }

        let mapping = match alloc_near(anchor, capacity) {
            Some(mapping) => mapping,
            None => {
                let allocation = region::alloc(capacity, Protection::READ_WRITE_EXECUTE)
                    .map_err(|e| TrampolineError::Reservation {
                        name,
                        reason: e.to_string(),
                    })?;
                let mapping = Mapping::Region(allocation);
                tracing::warn!(
                    "Trampoline region '{}' fallback: allocated at {:x} for anchor {:x}",
                    name,
                    mapping.base(),
                    anchor
                );
                mapping
            }
        };

        tracing::debug!(
            "Reserved trampoline region '{}' ({:#x} bytes) at {:x}",
            name,
            capacity,
            mapping.base()
        );

        Ok(Self {
            name,
            mapping,
            capacity,
            cursor: 0,
        })
    }

    pub fn name(&self) -> &'static str {
        self.name
    }

    pub fn base(&self) -> usize {
        self.mapping.base()
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    /// Bytes handed out so far, including alignment padding
    pub fn used(&self) -> usize {
        self.cursor
    }

    pub fn remaining(&self) -> usize {
        self.capacity - self.cursor
    }

    /// Whether `address` lies inside the region
    pub fn contains(&self, address: usize) -> bool {
        address >= self.base() && address < self.base() + self.capacity
    }

    /// Hand out `size` bytes at the next 16-byte boundary
    pub fn allocate(&mut self, size: usize) -> Result<usize, TrampolineError> {
        let start = self.cursor.next_multiple_of(STUB_ALIGN);
        let end = start.checked_add(size).filter(|end| *end <= self.capacity);

        match end {
            Some(end) => {
                self.cursor = end;
                Ok(self.base() + start)
            }
            None => Err(TrampolineError::OutOfSpace {
                requested: size,
                remaining: self.capacity.saturating_sub(start),
            }),
        }
    }

    /// Emit an absolute jump to `target` and return the stub address
    pub fn emit_relay(&mut self, target: usize) -> Result<usize, TrampolineError> {
        let mut encoder = Encoder::new(64);
        let stub = self.base() + self.cursor.next_multiple_of(STUB_ALIGN);

        // RIP-relative operand pointing right past the instruction
        let jump = Instruction::with1(
            Code::Jmp_rm64,
            MemoryOperand::with_base_displ(Register::RIP, (stub + 6) as i64),
        )?;
        encoder.encode(&jump, stub as u64)?;

        let mut bytes = encoder.take_buffer();
        bytes.extend_from_slice(&(target as u64).to_le_bytes());
        debug_assert_eq!(bytes.len(), RELAY_SIZE);

        let stub = self.allocate(bytes.len())?;
        self.write(stub, &bytes);

        tracing::trace!("Relay in '{}' at {:x} -> {:x}", self.name, stub, target);
        Ok(stub)
    }

    fn write(&mut self, address: usize, bytes: &[u8]) {
        // SAFETY: `address` came from `allocate`, so the range lies inside our
        // RWX allocation
        unsafe {
            std::ptr::copy_nonoverlapping(bytes.as_ptr(), address as *mut u8, bytes.len());
        }
        ProcessMemory::new().flush_instruction_cache(Some((address, bytes.len())));
    }
}

impl std::fmt::Debug for TrampolineRegion {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TrampolineRegion")
            .field("name", &self.name)
            .field("base", &format_args!("{:#x}", self.base()))
            .field("capacity", &self.capacity)
            .field("cursor", &self.cursor)
            .finish()
    }
}

fn distance(a: usize, b: usize) -> usize {
    a.abs_diff(b)
}

/// Whether a region of `capacity` bytes at `base` stays within branch range
fn in_range(base: usize, anchor: usize, capacity: usize) -> bool {
    distance(base, anchor) < MAX_RANGE
        && base
            .checked_add(capacity)
            .is_some_and(|end| distance(end, anchor) < MAX_RANGE)
}

/// Candidate bases at 64KB steps moving outward from `anchor`
fn candidates(anchor: usize, capacity: usize) -> impl Iterator<Item = usize> {
    let origin = anchor & !(SEARCH_STEP - 1);

    (1..MAX_RANGE / SEARCH_STEP)
        .flat_map(move |step| {
            let offset = step * SEARCH_STEP;
            [origin.checked_add(offset), origin.checked_sub(offset)]
        })
        .flatten()
        .filter(move |&hint| hint != 0 && in_range(hint, anchor, capacity))
}

/// Reserve a region within branch range of `anchor`
fn alloc_near(anchor: usize, capacity: usize) -> Option<Mapping> {
    if anchor == 0 {
        return None;
    }

    let mapping = candidates(anchor, capacity).find_map(|hint| map_at(hint, anchor, capacity));
    if mapping.is_none() {
        tracing::error!("Failed to allocate region near {:x}", anchor);
    }
    mapping
}

#[cfg(windows)]
fn map_at(hint: usize, _anchor: usize, capacity: usize) -> Option<Mapping> {
    // VirtualAlloc fails on ranges that are already reserved
    region::alloc_at(hint as *const u8, capacity, Protection::READ_WRITE_EXECUTE)
        .ok()
        .map(Mapping::Region)
}

#[cfg(unix)]
fn map_at(hint: usize, anchor: usize, capacity: usize) -> Option<Mapping> {
    use nix::sys::mman::{mmap_anonymous, munmap, MapFlags, ProtFlags};
    use std::num::NonZeroUsize;

    // No MAP_FIXED: an occupied hint makes the kernel pick another address
    let ptr = unsafe {
        mmap_anonymous(
            NonZeroUsize::new(hint),
            NonZeroUsize::new(capacity)?,
            ProtFlags::PROT_READ | ProtFlags::PROT_WRITE | ProtFlags::PROT_EXEC,
            MapFlags::MAP_PRIVATE | MapFlags::MAP_ANONYMOUS,
        )
    }
    .ok()?;

    if in_range(ptr.as_ptr() as usize, anchor, capacity) {
        return Some(Mapping::Anonymous { ptr, len: capacity });
    }

    // Landed too far away, unmap it
    unsafe {
        let _ = munmap(ptr, capacity);
    }
    None
}

#[cfg(not(any(unix, windows)))]
fn map_at(_hint: usize, _anchor: usize, _capacity: usize) -> Option<Mapping> {
    None
}

/// Memory backing a region
enum Mapping {
    Region(Allocation),
    #[cfg(unix)]
    Anonymous {
        ptr: NonNull<c_void>,
        len: usize,
    },
}

impl Mapping {
    fn base(&self) -> usize {
        match self {
            Mapping::Region(allocation) => allocation.as_ptr::<u8>() as usize,
            #[cfg(unix)]
            Mapping::Anonymous { ptr, .. } => ptr.as_ptr() as usize,
        }
    }
}

#[cfg(unix)]
impl Drop for Mapping {
    fn drop(&mut self) {
        if let Mapping::Anonymous { ptr, len } = *self {
            // SAFETY: the mapping came from `mmap_anonymous` and is dropped once
            unsafe {
                let _ = nix::sys::mman::munmap(ptr, len);
            }
        }
    }
}

/// The runtime's two code regions
///
/// `branch` sits near the host image and holds relays reached by patched
/// call sites; `local` sits near the runtime module for generated code.
#[derive(Debug)]
pub struct Trampolines {
    pub branch: TrampolineRegion,
    pub local: TrampolineRegion,
}

impl Trampolines {
    pub fn reserve(
        host_anchor: usize,
        local_anchor: usize,
        branch_size: usize,
        local_size: usize,
    ) -> Result<Self, TrampolineError> {
        let branch = TrampolineRegion::reserve("branch", branch_size, host_anchor)?;
        let local = TrampolineRegion::reserve("local", local_size, local_anchor)?;

        tracing::info!(
            "Trampolines reserved: branch at {:x}, local at {:x}",
            branch.base(),
            local.base()
        );
        Ok(Self { branch, local })
    }

    /// Route `src` to `dst` through a branch relay with a 5-byte `jmp rel32`
    pub fn write_branch5(
        &mut self,
        memory: &dyn MemoryAccess,
        src: usize,
        dst: usize,
    ) -> Result<Patch, TrampolineError> {
        self.write_rel32(memory, Code::Jmp_rel32_64, src, dst)
    }

    /// Route `src` to `dst` through a branch relay with a 5-byte `call rel32`
    pub fn write_call5(
        &mut self,
        memory: &dyn MemoryAccess,
        src: usize,
        dst: usize,
    ) -> Result<Patch, TrampolineError> {
        self.write_rel32(memory, Code::Call_rel32_64, src, dst)
    }

    fn write_rel32(
        &mut self,
        memory: &dyn MemoryAccess,
        code: Code,
        src: usize,
        dst: usize,
    ) -> Result<Patch, TrampolineError> {
        let relay = self.branch.emit_relay(dst)?;

        let branch = Instruction::with_branch(code, relay as u64)?;
        let mut encoder = Encoder::new(64);
        encoder.encode(&branch, src as u64)?;
        let bytes = encoder.take_buffer();
        debug_assert_eq!(bytes.len(), BRANCH5_SIZE);

        let mut patch = Patch::new(src, bytes);
        patch.commit(memory)?;

        tracing::debug!("Branch at {:x} -> relay {:x} -> {:x}", src, relay, dst);
        Ok(patch)
    }
}
