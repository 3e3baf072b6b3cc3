//! Bootstrap state and stages

use std::sync::atomic::{AtomicU8, Ordering};

/// Progress of the two bootstrap phases
///
/// Strictly ordered; the `Running` states mark a phase in progress so
/// re-entrant events pass through instead of starting it again.
#[repr(u8)]
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum BootstrapState {
    NotStarted = 0,
    PreinitRunning = 1,
    PreinitDone = 2,
    InitRunning = 3,
    InitDone = 4,
}

impl BootstrapState {
    fn from_u8(value: u8) -> Self {
        match value {
            0 => BootstrapState::NotStarted,
            1 => BootstrapState::PreinitRunning,
            2 => BootstrapState::PreinitDone,
            3 => BootstrapState::InitRunning,
            _ => BootstrapState::InitDone,
        }
    }
}

/// Extension callback stages, in execution order
#[repr(u8)]
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum Stage {
    /// Before the host's static initializers (phase 1)
    Preload = 0,
    /// Start of phase 2, after static initialization
    Load = 1,
    LoadComplete = 2,
    PostLoad = 3,
}

impl Stage {
    pub const ALL: [Stage; 4] = [Stage::Preload, Stage::Load, Stage::LoadComplete, Stage::PostLoad];

    /// Stages run by the second phase
    pub const INIT: [Stage; 3] = [Stage::Load, Stage::LoadComplete, Stage::PostLoad];

    pub fn index(self) -> usize {
        self as usize
    }

    /// Stage for a C ABI stage number
    pub fn from_raw(raw: u32) -> Option<Self> {
        match raw {
            0 => Some(Stage::Preload),
            1 => Some(Stage::Load),
            2 => Some(Stage::LoadComplete),
            3 => Some(Stage::PostLoad),
            _ => None,
        }
    }
}

impl std::fmt::Display for Stage {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let name = match self {
            Stage::Preload => "preload",
            Stage::Load => "load",
            Stage::LoadComplete => "load complete",
            Stage::PostLoad => "post load",
        };
        f.write_str(name)
    }
}

/// Atomic latch over [`BootstrapState`]
#[derive(Debug)]
pub struct StateLatch(AtomicU8);

impl StateLatch {
    pub const fn new() -> Self {
        Self(AtomicU8::new(BootstrapState::NotStarted as u8))
    }

    pub fn get(&self) -> BootstrapState {
        BootstrapState::from_u8(self.0.load(Ordering::Acquire))
    }

    /// Move `from -> to` if nobody else has; false means someone else owns
    /// the transition (or it already happened)
    pub fn advance(&self, from: BootstrapState, to: BootstrapState) -> bool {
        self.0
            .compare_exchange(from as u8, to as u8, Ordering::AcqRel, Ordering::Acquire)
            .is_ok()
    }

    pub fn store(&self, state: BootstrapState) {
        self.0.store(state as u8, Ordering::Release);
    }
}

impl Default for StateLatch {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_latch_advances_once() {
        let latch = StateLatch::new();
        assert_eq!(latch.get(), BootstrapState::NotStarted);

        assert!(latch.advance(BootstrapState::NotStarted, BootstrapState::PreinitRunning));
        assert!(!latch.advance(BootstrapState::NotStarted, BootstrapState::PreinitRunning));
        assert_eq!(latch.get(), BootstrapState::PreinitRunning);

        latch.store(BootstrapState::PreinitDone);
        assert!(latch.get() > BootstrapState::PreinitRunning);
    }

    #[test]
    fn test_stage_from_raw() {
        assert_eq!(Stage::from_raw(0), Some(Stage::Preload));
        assert_eq!(Stage::from_raw(3), Some(Stage::PostLoad));
        assert_eq!(Stage::from_raw(4), None);
        assert_eq!(Stage::LoadComplete.index(), 2);
        assert_eq!(Stage::ALL.len(), 4);
    }
}
