//! EarlyHook Core - Bootstrap and Patching Logic
//!
//! This crate contains everything the runtime does once it is inside the
//! host process: sequencing the two bootstrap phases, hooking imports,
//! reserving trampolines and patching memory safely.
//!
//! # Re-exports
//!
//! This crate re-exports the SDK and engine crates for convenience:
//! - [`sdk`] - PE, RTTI and CRT layouts
//! - [`engine`] - Image inspection and relocations

pub use earlyhook_engine as engine;
pub use earlyhook_sdk as sdk;

pub mod bootstrap;
pub mod config;
pub mod hooks;
pub mod memory;
pub mod offsets;
pub mod rtti;
pub mod runtime;
pub mod trampoline;

pub use bootstrap::{BootstrapError, BootstrapState, CallbackKey, Stage};
pub use config::{ConfigError, ConfigResult, CoreConfig};
pub use hooks::{HookError, HookInstallation, IatHookKey, PendingHook};
pub use memory::{
    write_word, BufferMemory, MemoryAccess, MemoryAccessExt, MemoryError, Patch, PatchState,
    ProcessMemory, WordWidth,
};
pub use offsets::{Offsets, OffsetsError};
pub use runtime::Runtime;
pub use trampoline::{TrampolineError, TrampolineRegion, Trampolines};

/// Runtime version as `(major, minor, patch)`
pub const VERSION: (u32, u32, u32) = (0, 1, 0);

/// Version packed as `major << 24 | minor << 16 | patch << 4`
pub const fn packed_version() -> u32 {
    (VERSION.0 << 24) | (VERSION.1 << 16) | (VERSION.2 << 4)
}
