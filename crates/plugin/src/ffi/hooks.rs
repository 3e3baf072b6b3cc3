//! CRT startup hooks
//!
//! `_initterm_e` is the host's first call into the CRT initializer table and
//! triggers phase 1; `_get_narrow_winmain_command_line` is only called once
//! static initialization is done and triggers phase 2. Both always call the
//! real CRT function exactly once.

use std::ffi::{c_char, c_int};
use std::sync::OnceLock;

use earlyhook_core::Runtime;
use earlyhook_engine::LoadedImage;
use earlyhook_sdk::{
    GetNarrowWinMainCommandLineFn, InitTermEFn, Pifv, CRT_RUNTIME_MODULE,
    GET_NARROW_WINMAIN_COMMAND_LINE, INITTERM_E,
};

use crate::globals;

static ORIGINAL_INITTERM_E: OnceLock<InitTermEFn> = OnceLock::new();
static ORIGINAL_GET_COMMAND_LINE: OnceLock<GetNarrowWinMainCommandLineFn> = OnceLock::new();

/// Replacement for `_initterm_e`
unsafe extern "C" fn hook_initterm_e(first: *const Pifv, last: *const Pifv) -> c_int {
    let Some(&original) = ORIGINAL_INITTERM_E.get() else {
        return 0;
    };

    match globals::runtime() {
        Some(runtime) => runtime.preinit_event(|| unsafe { original(first, last) }),
        None => unsafe { original(first, last) },
    }
}

/// Replacement for `_get_narrow_winmain_command_line`
unsafe extern "C" fn hook_get_narrow_winmain_command_line() -> *mut c_char {
    let Some(&original) = ORIGINAL_GET_COMMAND_LINE.get() else {
        return std::ptr::null_mut();
    };

    match globals::runtime() {
        Some(runtime) => runtime.init_event(|| unsafe { original() }),
        None => unsafe { original() },
    }
}

/// Hook one CRT import, publishing the original through `publish` before the
/// slot is rewritten
fn install(
    runtime: &Runtime,
    image: &LoadedImage<'_>,
    symbol: &str,
    replacement: usize,
    publish: impl FnOnce(usize),
) -> bool {
    let pending =
        match runtime.prepare_import_hook(image, CRT_RUNTIME_MODULE, symbol, replacement) {
            Ok(pending) => pending,
            Err(e) => {
                tracing::error!("Couldn't hook {}: {}", symbol, e);
                return false;
            }
        };

    if pending.original() == 0 {
        tracing::error!("Couldn't hook {}: import slot is empty", symbol);
        return false;
    }
    publish(pending.original());

    match runtime.install_hook(pending) {
        Ok(_) => true,
        Err(e) => {
            tracing::error!("Couldn't hook {}: {}", symbol, e);
            false
        }
    }
}

/// Install both startup hooks into the host image
///
/// A hook that cannot be installed leaves its phase to the other event (phase
/// 2 catches phase 1 up) or, failing both, leaves the host unmodified.
pub fn install_startup_hooks(runtime: &Runtime, image: &LoadedImage<'_>) -> (bool, bool) {
    let initterm: unsafe extern "C" fn(*const Pifv, *const Pifv) -> c_int = hook_initterm_e;
    let preinit = install(runtime, image, INITTERM_E, initterm as usize, |original| {
        // SAFETY: the slot holds the CRT's `_initterm_e`
        let original: InitTermEFn = unsafe { std::mem::transmute(original) };
        let _ = ORIGINAL_INITTERM_E.set(original);
    });

    let command_line: unsafe extern "C" fn() -> *mut c_char =
        hook_get_narrow_winmain_command_line;
    let init = install(
        runtime,
        image,
        GET_NARROW_WINMAIN_COMMAND_LINE,
        command_line as usize,
        |original| {
            // SAFETY: the slot holds the CRT's `_get_narrow_winmain_command_line`
            let original: GetNarrowWinMainCommandLineFn = unsafe { std::mem::transmute(original) };
            let _ = ORIGINAL_GET_COMMAND_LINE.set(original);
        },
    );

    if !preinit && !init {
        tracing::error!("No startup hooks installed, extensions will not load");
    }
    (preinit, init)
}

#[cfg(test)]
mod tests {
    use super::*;
    use earlyhook_core::memory::{BufferMemory, MemoryAccess, MemoryAccessExt};
    use earlyhook_core::BootstrapState;
    use earlyhook_engine::synthetic::SyntheticImage;
    use std::sync::atomic::{AtomicUsize, Ordering};

    const BASE: usize = 0x1_4000_0000;

    static INITTERM_CALLS: AtomicUsize = AtomicUsize::new(0);

    unsafe extern "C" fn fake_initterm_e(_first: *const Pifv, _last: *const Pifv) -> c_int {
        INITTERM_CALLS.fetch_add(1, Ordering::SeqCst);
        0
    }

    #[test]
    fn test_startup_hooks_rewrite_slots() {
        let bytes = SyntheticImage::new()
            .import_at(
                CRT_RUNTIME_MODULE,
                &[INITTERM_E, GET_NARROW_WINMAIN_COMMAND_LINE],
                0x2000,
            )
            .build();
        let memory = BufferMemory::new(BASE, bytes.clone());
        let image = LoadedImage::from_bytes(BASE, &bytes).unwrap();

        let fake: unsafe extern "C" fn(*const Pifv, *const Pifv) -> c_int = fake_initterm_e;
        memory
            .write(BASE + 0x2000, &(fake as usize as u64).to_le_bytes())
            .unwrap();

        let runtime = Runtime::new(BASE, Box::new(memory.clone()));
        let (preinit, init) = install_startup_hooks(&runtime, &image);
        assert!(preinit);
        assert!(init);
        assert_eq!(runtime.hook_count(), 2);

        let initterm: unsafe extern "C" fn(*const Pifv, *const Pifv) -> c_int = hook_initterm_e;
        assert_eq!(memory.read_usize(BASE + 0x2000).unwrap(), initterm as usize);

        // No process runtime is installed here, so the hook only passes through
        let hooked: InitTermEFn =
            unsafe { std::mem::transmute(memory.read_usize(BASE + 0x2000).unwrap()) };
        assert_eq!(unsafe { hooked(std::ptr::null(), std::ptr::null()) }, 0);
        assert_eq!(INITTERM_CALLS.load(Ordering::SeqCst), 1);
        assert_eq!(runtime.state(), BootstrapState::NotStarted);
    }

    #[test]
    fn test_missing_imports_are_reported() {
        let bytes = SyntheticImage::new().import("KERNEL32.dll", &["Sleep"]).build();
        let memory = BufferMemory::new(BASE, bytes.clone());
        let image = LoadedImage::from_bytes(BASE, &bytes).unwrap();

        let runtime = Runtime::new(BASE, Box::new(memory));
        assert_eq!(install_startup_hooks(&runtime, &image), (false, false));
        assert_eq!(runtime.hook_count(), 0);
    }
}
