//! C ABI surface
//!
//! - [`exports`] - loader entry point, `DllMain` and extension registration
//! - [`hooks`] - the CRT startup hooks that drive the two bootstrap phases

pub mod exports;
pub mod hooks;
