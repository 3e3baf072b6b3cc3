//! MSVC run-time type information layouts (x64)
//!
//! The word immediately before a vtable's first entry points at a
//! [`RttiCompleteObjectLocator`]. On x64 the locator stores image-relative
//! offsets rather than pointers.

use crate::Pod;

/// Returned when no class name can be recovered from an object
pub const NO_RTTI: &str = "<no rtti>";

/// Decorated class names start with `.?AV`
pub const CLASS_NAME_PREFIX: &[u8] = b".?AV";

/// Decorated struct names start with `.?AU`
pub const STRUCT_NAME_PREFIX: &[u8] = b".?AU";

/// Longest decorated name the resolver will scan for a terminator
pub const MAX_DECORATED_NAME_LEN: usize = 100;

/// _RTTICompleteObjectLocator
#[repr(C)]
#[derive(Debug, Clone, Copy, Default)]
pub struct RttiCompleteObjectLocator {
    pub signature: u32,
    pub offset: u32,
    pub cd_offset: u32,
    /// Image-relative offset of the [`RttiTypeDescriptor`]
    pub type_descriptor: u32,
    /// Image-relative offset of the class hierarchy descriptor
    pub class_descriptor: u32,
}

/// Header of `TypeDescriptor`; the NUL-terminated decorated name follows it.
#[repr(C)]
#[derive(Debug, Clone, Copy, Default)]
pub struct RttiTypeDescriptor {
    pub type_info_vtable: u64,
    pub spare: u64,
}

/// Offset of the decorated name inside a type descriptor
pub const TYPE_DESCRIPTOR_NAME_OFFSET: usize = std::mem::size_of::<RttiTypeDescriptor>();

unsafe impl Pod for RttiCompleteObjectLocator {}
unsafe impl Pod for RttiTypeDescriptor {}
