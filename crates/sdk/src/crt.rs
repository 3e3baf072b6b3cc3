//! CRT startup imports intercepted by the bootstrap hooks
//!
//! These names must match exactly what the host imports.

use std::ffi::{c_char, c_int};

/// Universal CRT API set the host's startup code imports from
pub const CRT_RUNTIME_MODULE: &str = "api-ms-win-crt-runtime-l1-1-0.dll";

/// Runs the C initializer table; reached before any C++ global constructor
pub const INITTERM_E: &str = "_initterm_e";

/// Fetches the WinMain command line; reached after static initialization
pub const GET_NARROW_WINMAIN_COMMAND_LINE: &str = "_get_narrow_winmain_command_line";

/// `_PIFV`: a C initializer returning zero on success
pub type Pifv = Option<unsafe extern "C" fn() -> c_int>;

/// `_initterm_e(_PIFV* first, _PIFV* last)`
pub type InitTermEFn = unsafe extern "C" fn(*const Pifv, *const Pifv) -> c_int;

/// `_get_narrow_winmain_command_line()`
pub type GetNarrowWinMainCommandLineFn = unsafe extern "C" fn() -> *mut c_char;
