//! Two-phase bootstrap
//!
//! Phase 1 runs from the host's first static-initializer call, before any of
//! its own initializers; phase 2 runs when the host asks for its command
//! line, after static initialization. Each phase runs exactly once no matter
//! how often (or how re-entrantly) its event fires.

mod sequencer;
mod state;

pub use sequencer::{BootstrapError, BootstrapSequencer, CallbackKey, StageCallback};
pub use state::{BootstrapState, Stage, StateLatch};
