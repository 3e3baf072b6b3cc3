//! EarlyHook SDK - Image and Runtime Type Definitions
//!
//! This crate contains the raw layouts the runtime reads out of a mapped
//! host image. It has no dependencies and compiles quickly, allowing
//! parallel compilation of dependent crates.
//!
//! # Modules
//!
//! - [`pe`] - PE/COFF header, import and export directory layouts
//! - [`rtti`] - MSVC run-time type information layouts
//! - [`crt`] - CRT import names and signatures intercepted at startup

pub mod crt;
pub mod pe;
pub mod rtti;

pub use crt::*;
pub use pe::*;
pub use rtti::*;

/// Marker for plain-old-data layouts that may be read from arbitrary bytes.
///
/// # Safety
/// Implementors must be `#[repr(C)]` (or primitive) types made only of
/// integer fields, so that every bit pattern is a valid value.
pub unsafe trait Pod: Copy + 'static {}

unsafe impl Pod for u8 {}
unsafe impl Pod for u16 {}
unsafe impl Pod for u32 {}
unsafe impl Pod for u64 {}
unsafe impl Pod for i32 {}
unsafe impl Pod for usize {}
