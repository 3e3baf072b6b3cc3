//! Process-wide runtime storage
//!
//! The CRT hooks have fixed C signatures, so they reach the runtime through
//! this one `OnceLock` instead of a context argument.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::OnceLock;

use earlyhook_core::Runtime;

/// The runtime for this process
static RUNTIME: OnceLock<Runtime> = OnceLock::new();

/// Base of this DLL, recorded by `DllMain`
static MODULE_BASE: AtomicUsize = AtomicUsize::new(0);

/// Store the runtime
///
/// Called once from `StartEarlyHook`. Returns error if already initialized.
pub fn init_runtime(runtime: Runtime) -> Result<&'static Runtime, &'static str> {
    RUNTIME
        .set(runtime)
        .map_err(|_| "Runtime already initialized")?;
    RUNTIME.get().ok_or("Runtime not initialized")
}

/// Get the runtime, if `StartEarlyHook` has run
pub fn runtime() -> Option<&'static Runtime> {
    RUNTIME.get()
}

#[cfg_attr(not(windows), allow(dead_code))]
pub fn set_module_base(base: usize) {
    MODULE_BASE.store(base, Ordering::Release);
}

/// Base of this DLL, if `DllMain` saw the process attach
pub fn module_base() -> Option<usize> {
    match MODULE_BASE.load(Ordering::Acquire) {
        0 => None,
        base => Some(base),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_module_base_roundtrip() {
        set_module_base(0x7FF8_1000_0000);
        assert_eq!(module_base(), Some(0x7FF8_1000_0000));
    }
}
