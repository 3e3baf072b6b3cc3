//! EarlyHook Loader - FFI Layer
//!
//! This crate provides the C ABI boundary between the host process and the
//! Rust runtime. It compiles to a cdylib (.dll) that a loader injects before
//! the host's CRT starts; `StartEarlyHook` then hooks the CRT imports that
//! drive the bootstrap.

pub mod ffi;
mod globals;
mod logging;
