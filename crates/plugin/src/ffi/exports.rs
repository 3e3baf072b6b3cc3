//! C-compatible exports called by the loader and by extensions

use std::ffi::{c_char, c_void, CStr};

use tracing::instrument;

use earlyhook_core::config::offsets_path;
use earlyhook_core::{packed_version, CoreConfig, Offsets, ProcessMemory, Runtime, Stage};
use earlyhook_engine::LoadedImage;

use super::hooks::install_startup_hooks;
use crate::{globals, logging};

/// Extension callback: receives the `user_data` it was registered with
pub type ExtensionCallback = unsafe extern "C" fn(user_data: *mut c_void);

/// Called by the loader once the DLL is mapped into the host
///
/// Installs the two CRT startup hooks; everything else happens from there.
#[no_mangle]
#[allow(non_snake_case)]
#[instrument(skip_all)]
pub extern "C" fn StartEarlyHook() {
    if std::panic::catch_unwind(start).is_err() {
        tracing::error!("Panic during startup, host continues unmodified");
    }
}

fn start() {
    let (config, config_error) = match CoreConfig::load() {
        Ok(config) => (config, None),
        Err(e) => (CoreConfig::default(), Some(e)),
    };

    logging::init(&config);
    tracing::info!("{}", startup_banner(&platform::os_info()));
    if let Some(e) = config_error {
        tracing::warn!("Failed to load config, using defaults: {}", e);
    }

    if config.wait_for_debugger {
        platform::wait_for_debugger();
    }

    let Some(host_base) = platform::host_base() else {
        tracing::error!("Couldn't locate the host image");
        return;
    };

    // SAFETY: the host executable stays mapped for the life of the process
    let image = match unsafe { LoadedImage::from_module(host_base as *const u8) } {
        Ok(image) => image,
        Err(e) => {
            tracing::error!("Host image at {:x} is not readable: {}", host_base, e);
            return;
        }
    };
    tracing::info!("Host image base = {:016X}", image.base());

    let mut runtime =
        Runtime::new(image.base(), Box::new(ProcessMemory::new())).with_config(config);
    if let Some(base) = globals::module_base() {
        runtime = runtime.with_extension_base(base);
    }
    if let Some(offsets) = load_offsets() {
        runtime = runtime.with_offsets(offsets);
    }

    let runtime = match globals::init_runtime(runtime) {
        Ok(runtime) => runtime,
        Err(e) => {
            tracing::error!("{}", e);
            return;
        }
    };

    let (preinit, init) = install_startup_hooks(runtime, &image);
    tracing::info!("Startup hooks installed (preinit: {}, init: {})", preinit, init);
}

fn startup_banner(os: &str) -> String {
    format!(
        "EarlyHook {} starting (runtime version {:08X}, OS {})",
        env!("CARGO_PKG_VERSION"),
        packed_version(),
        os
    )
}

fn load_offsets() -> Option<Offsets> {
    let path = offsets_path().ok()?;
    if !path.exists() {
        return None;
    }

    match Offsets::load_from_file(&path) {
        Ok(offsets) => Some(offsets),
        Err(e) => {
            tracing::warn!("Failed to load {:?}: {}", path, e);
            None
        }
    }
}

/// Register an extension callback for a bootstrap stage
///
/// `stage` is 0 (preload), 1 (load), 2 (load complete) or 3 (post load).
/// Returns false if the stage is unknown, has already run, or the runtime
/// has not started.
///
/// # Safety
/// - `name` must be a valid null-terminated C string or null
/// - `callback` must be safe to call once with `user_data` from any thread
#[no_mangle]
#[instrument(skip_all)]
pub unsafe extern "C" fn earlyhook_register_callback(
    stage: u32,
    name: *const c_char,
    callback: Option<ExtensionCallback>,
    user_data: *mut c_void,
) -> bool {
    let name = if name.is_null() {
        "<unnamed>".to_string()
    } else {
        CStr::from_ptr(name).to_string_lossy().into_owned()
    };

    let Some(stage) = Stage::from_raw(stage) else {
        tracing::warn!("Extension '{}' asked for unknown stage {}", name, stage);
        return false;
    };
    let Some(callback) = callback else {
        tracing::warn!("Extension '{}' registered a null callback", name);
        return false;
    };
    let Some(runtime) = globals::runtime() else {
        tracing::warn!("Extension '{}' registered before the runtime started", name);
        return false;
    };

    let user_data = UserData(user_data);
    runtime
        .register(stage, &name, move |_| {
            let user_data = user_data;
            // SAFETY: the caller promised the callback accepts its user data
            unsafe { callback(user_data.0) }
        })
        .is_ok()
}

/// Runtime version packed as `major << 24 | minor << 16 | patch << 4`
#[no_mangle]
pub extern "C" fn earlyhook_runtime_version() -> u32 {
    packed_version()
}

/// Current bootstrap state (0 = not started ... 4 = init done)
#[no_mangle]
pub extern "C" fn earlyhook_bootstrap_state() -> u32 {
    globals::runtime()
        .map(|runtime| runtime.state() as u32)
        .unwrap_or(0)
}

/// Opaque extension pointer carried into a callback
struct UserData(*mut c_void);

// SAFETY: the pointer is only handed back to the extension that supplied it
unsafe impl Send for UserData {}

#[cfg(windows)]
#[no_mangle]
#[allow(non_snake_case)]
pub extern "system" fn DllMain(
    module: windows::Win32::Foundation::HINSTANCE,
    reason: u32,
    _reserved: *mut c_void,
) -> i32 {
    use windows::Win32::System::SystemServices::DLL_PROCESS_ATTACH;

    if reason == DLL_PROCESS_ATTACH {
        globals::set_module_base(module.0 as usize);
    }
    1
}

#[cfg(windows)]
mod platform {
    use windows::core::PCWSTR;
    use windows::Win32::System::Diagnostics::Debug::IsDebuggerPresent;
    use windows::Win32::System::LibraryLoader::GetModuleHandleW;
    use windows::Win32::System::SystemInformation::{GetVersionExW, OSVERSIONINFOW};
    use windows::Win32::System::Threading::Sleep;

    /// Base of the process executable
    pub fn host_base() -> Option<usize> {
        match unsafe { GetModuleHandleW(PCWSTR::null()) } {
            Ok(module) => Some(module.0 as usize),
            Err(e) => {
                tracing::error!("GetModuleHandleW failed: {}", e);
                None
            }
        }
    }

    /// `major.minor (build)` of the running Windows
    pub fn os_info() -> String {
        let mut info = OSVERSIONINFOW {
            dwOSVersionInfoSize: std::mem::size_of::<OSVERSIONINFOW>() as u32,
            ..Default::default()
        };
        match unsafe { GetVersionExW(&mut info) } {
            Ok(()) => format!(
                "{}.{} ({})",
                info.dwMajorVersion, info.dwMinorVersion, info.dwBuildNumber
            ),
            Err(_) => "unknown".to_string(),
        }
    }

    pub fn wait_for_debugger() {
        tracing::info!("Waiting for debugger");
        while !unsafe { IsDebuggerPresent() }.as_bool() {
            unsafe { Sleep(10) };
        }
        unsafe { Sleep(2000) };
    }
}

#[cfg(not(windows))]
mod platform {
    /// Import hooking needs a PE host
    pub fn host_base() -> Option<usize> {
        tracing::error!("EarlyHook only supports Windows hosts");
        None
    }

    pub fn os_info() -> String {
        std::env::consts::OS.to_string()
    }

    pub fn wait_for_debugger() {
        tracing::warn!("wait_for_debugger is only supported on Windows");
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_version_export() {
        assert_eq!(earlyhook_runtime_version(), packed_version());
    }

    #[test]
    fn test_startup_banner_names_versions_and_os() {
        let banner = startup_banner(&platform::os_info());
        assert!(banner.contains(env!("CARGO_PKG_VERSION")));
        assert!(banner.contains(&format!("{:08X}", packed_version())));
        assert!(banner.ends_with(&format!("OS {})", platform::os_info())));
    }

    #[test]
    fn test_registration_rejected_without_runtime() {
        unsafe extern "C" fn noop(_: *mut c_void) {}

        assert_eq!(earlyhook_bootstrap_state(), 0);
        unsafe {
            assert!(!earlyhook_register_callback(
                9,
                c"bad".as_ptr(),
                Some(noop),
                std::ptr::null_mut()
            ));
            assert!(!earlyhook_register_callback(
                0,
                std::ptr::null(),
                None,
                std::ptr::null_mut()
            ));
            assert!(!earlyhook_register_callback(
                0,
                c"early".as_ptr(),
                Some(noop),
                std::ptr::null_mut()
            ));
        }
    }
}
