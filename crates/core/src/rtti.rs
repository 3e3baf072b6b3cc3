//! Class names from MSVC run-time type information
//!
//! Diagnostic only: every pointer on the way is untrusted, so every read goes
//! through [`MemoryAccess::read`] and any failure yields [`NO_RTTI`].

use earlyhook_engine::RelocationManager;
use earlyhook_sdk::{
    RttiCompleteObjectLocator, CLASS_NAME_PREFIX, MAX_DECORATED_NAME_LEN, NO_RTTI,
    STRUCT_NAME_PREFIX, TYPE_DESCRIPTOR_NAME_OFFSET,
};

use crate::memory::{MemoryAccess, MemoryAccessExt, MemoryError};

/// Offset of `type_descriptor` inside the complete object locator
const LOCATOR_TYPE_DESCRIPTOR_OFFSET: usize =
    std::mem::offset_of!(RttiCompleteObjectLocator, type_descriptor);

/// Decorated class name of the polymorphic object at `object`
///
/// Returns the name with its `.?AV`/`.?AU` prefix removed (the trailing
/// `@@` stays), or `"<no rtti>"` if anything along the way is unreadable or
/// malformed.
pub fn class_name_of(
    memory: &dyn MemoryAccess,
    relocs: &RelocationManager,
    object: usize,
) -> String {
    match decorated_name(memory, relocs, object) {
        Some(name) => name,
        None => {
            tracing::trace!("No RTTI for object at {:x}", object);
            NO_RTTI.to_string()
        }
    }
}

fn decorated_name(
    memory: &dyn MemoryAccess,
    relocs: &RelocationManager,
    object: usize,
) -> Option<String> {
    let vtable = memory.read_usize(object).ok()?;
    let locator = memory.read_usize(vtable.checked_sub(8)?).ok()?;

    let type_descriptor = memory
        .read_u32(locator.checked_add(LOCATOR_TYPE_DESCRIPTOR_OFFSET)?)
        .ok()?;
    let descriptor = relocs.resolve(type_descriptor as usize);

    let name = read_bounded(memory, descriptor.checked_add(TYPE_DESCRIPTOR_NAME_OFFSET)?).ok()?;

    let stripped = name
        .strip_prefix(CLASS_NAME_PREFIX)
        .or_else(|| name.strip_prefix(STRUCT_NAME_PREFIX))?;
    if stripped.is_empty() {
        return None;
    }

    Some(String::from_utf8_lossy(stripped).into_owned())
}

/// Read a NUL-terminated string of at most [`MAX_DECORATED_NAME_LEN`] bytes
///
/// Falls back to byte-wise reads when the full window crosses into unmapped
/// memory, so names close to the end of a mapping still resolve.
fn read_bounded(memory: &dyn MemoryAccess, address: usize) -> Result<Vec<u8>, MemoryError> {
    let mut window = [0u8; MAX_DECORATED_NAME_LEN];

    if memory.read(address, &mut window).is_ok() {
        return match window.iter().position(|&b| b == 0) {
            Some(len) => Ok(window[..len].to_vec()),
            None => Err(MemoryError::Unmapped {
                address,
                len: MAX_DECORATED_NAME_LEN,
            }),
        };
    }

    let mut name = Vec::new();
    for offset in 0..MAX_DECORATED_NAME_LEN {
        let mut byte = [0u8; 1];
        memory.read(address + offset, &mut byte)?;
        if byte[0] == 0 {
            return Ok(name);
        }
        name.push(byte[0]);
    }

    Err(MemoryError::Unmapped {
        address,
        len: MAX_DECORATED_NAME_LEN,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::memory::{BufferMemory, ProcessMemory};

    const BASE: usize = 0x1_4000_0000;

    /// Object at +0x100, vtable at +0x208, locator at +0x300, descriptor at +0x400
    fn object_image(name: &[u8], size: usize) -> Vec<u8> {
        let mut bytes = vec![0u8; size];
        bytes[0x100..0x108].copy_from_slice(&((BASE + 0x208) as u64).to_le_bytes());
        bytes[0x200..0x208].copy_from_slice(&((BASE + 0x300) as u64).to_le_bytes());
        bytes[0x300..0x304].copy_from_slice(&1u32.to_le_bytes());
        bytes[0x30C..0x310].copy_from_slice(&0x400u32.to_le_bytes());
        bytes[0x410..0x410 + name.len()].copy_from_slice(name);
        bytes
    }

    fn resolve(bytes: Vec<u8>) -> String {
        let memory = BufferMemory::new(BASE, bytes);
        class_name_of(&memory, &RelocationManager::new(BASE), BASE + 0x100)
    }

    #[test]
    fn test_class_name() {
        assert_eq!(
            resolve(object_image(b".?AVPlayerCharacter@@\0", 0x1000)),
            "PlayerCharacter@@"
        );
    }

    #[test]
    fn test_struct_name() {
        assert_eq!(resolve(object_image(b".?AUSettings@@\0", 0x1000)), "Settings@@");
    }

    #[test]
    fn test_name_near_end_of_mapping() {
        // Descriptor name ends a few bytes before the mapping does
        assert_eq!(resolve(object_image(b".?AVShort@@\0", 0x420)), "Short@@");
    }

    #[test]
    fn test_bad_prefix() {
        assert_eq!(resolve(object_image(b"PlayerCharacter\0", 0x1000)), NO_RTTI);
        assert_eq!(resolve(object_image(b".?AV\0", 0x1000)), NO_RTTI);
    }

    #[test]
    fn test_missing_terminator() {
        let name = [b".?AV".as_slice(), &[b'A'; 120]].concat();
        assert_eq!(resolve(object_image(&name, 0x1000)), NO_RTTI);
    }

    #[test]
    fn test_dangling_pointers() {
        let mut bytes = object_image(b".?AVPlayer@@\0", 0x1000);
        // vtable pointer into nowhere
        bytes[0x100..0x108].copy_from_slice(&0xDEAD_0000u64.to_le_bytes());
        assert_eq!(resolve(bytes), NO_RTTI);

        let memory = BufferMemory::new(BASE, vec![0u8; 0x10]);
        let relocs = RelocationManager::new(BASE);
        assert_eq!(class_name_of(&memory, &relocs, 0), NO_RTTI);
        assert_eq!(class_name_of(&memory, &relocs, BASE), NO_RTTI);
    }

    #[test]
    fn test_live_memory_garbage() {
        let memory = ProcessMemory::new();
        let relocs = RelocationManager::new(0x1_4000_0000);

        assert_eq!(class_name_of(&memory, &relocs, 0), NO_RTTI);
        assert_eq!(class_name_of(&memory, &relocs, 0x10), NO_RTTI);

        // A readable object whose "vtable" is garbage
        let fake_object: [u64; 2] = [0x4141_4141_4141_4141, 0];
        assert_eq!(
            class_name_of(&memory, &relocs, fake_object.as_ptr() as usize),
            NO_RTTI
        );
    }
}
