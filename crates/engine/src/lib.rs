//! EarlyHook Engine - Image Inspection and Relocation
//!
//! This crate handles:
//! - Reading a mapped PE image through a bounds-checked view
//! - Resolving import address table slots and exported functions by name
//! - Translating static offsets into runtime addresses
//!
//! # Architecture
//!
//! A [`LoadedImage`] is built once for the host executable, either from the
//! live module base or, in tests, from a [`synthetic`] buffer pretending to
//! live at an arbitrary base. All lookups are pure reads and report
//! malformed data as [`ImageError`] rather than faulting.

pub mod error;
pub mod exports;
pub mod image;
pub mod imports;
pub mod reloc;

#[cfg(any(test, feature = "synthetic"))]
pub mod synthetic;

pub use error::ImageError;
pub use image::{LoadedImage, ThunkWidth};
pub use reloc::{RelocAddr, RelocationManager};
