//! Import address table hooks
//!
//! Replaces the pointer in an IAT slot so the host's calls through that
//! import land in our function. Installation is split in two so the caller
//! can publish the original pointer (usually into a `OnceLock` read by the
//! replacement) before the slot is rewritten.

use earlyhook_engine::{ImageError, LoadedImage};
use slotmap::{new_key_type, SlotMap};

use crate::memory::{MemoryAccess, MemoryAccessExt, MemoryError, Patch, WordWidth};

new_key_type! {
    /// Handle for an installed import hook
    pub struct IatHookKey;
}

/// Error type for hook installation
#[derive(Debug, thiserror::Error)]
pub enum HookError {
    #[error("Failed to resolve import slot: {0}")]
    Unresolved(#[from] ImageError),

    #[error("Import slot {slot:#x} is already hooked")]
    AlreadyHooked { slot: usize },

    #[error("Failed to patch import slot: {0}")]
    Memory(#[from] MemoryError),

    #[error("Replacement must be a non-null function pointer")]
    InvalidReplacement,
}

/// A resolved slot with its original pointer, not yet written
#[derive(Debug, Clone)]
#[must_use = "a pending hook does nothing until installed"]
pub struct PendingHook {
    name: String,
    slot: usize,
    original: usize,
    replacement: usize,
    width: WordWidth,
}

impl PendingHook {
    /// `module!symbol`
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Address of the IAT slot
    pub fn slot(&self) -> usize {
        self.slot
    }

    /// Pointer the slot held when the hook was prepared
    pub fn original(&self) -> usize {
        self.original
    }

    pub fn replacement(&self) -> usize {
        self.replacement
    }
}

/// A committed import hook
#[derive(Debug)]
pub struct HookInstallation {
    pub name: String,
    pub slot: usize,
    pub original: usize,
    pub replacement: usize,
    pub patch: Patch,
}

/// Installed import hooks, one per slot
#[derive(Debug, Default)]
pub struct HookRegistry {
    hooks: SlotMap<IatHookKey, HookInstallation>,
}

impl HookRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Resolve `module!symbol` in `image` and capture the slot's current value
    pub fn prepare(
        &self,
        memory: &dyn MemoryAccess,
        image: &LoadedImage<'_>,
        module: &str,
        symbol: &str,
        replacement: usize,
    ) -> Result<PendingHook, HookError> {
        if replacement == 0 {
            return Err(HookError::InvalidReplacement);
        }

        let slot = image.resolve_import_slot(module, symbol)?;
        tracing::debug!("Resolved {}!{} to slot {:x}", module, symbol, slot);

        if self.is_hooked(slot) {
            return Err(HookError::AlreadyHooked { slot });
        }

        let width = WordWidth::pointer(image.is_wide_architecture()?);
        let original = memory.read_word(slot, width)? as usize;

        // Someone else (or an earlier runtime instance) already points it at us
        if original == replacement {
            return Err(HookError::AlreadyHooked { slot });
        }

        Ok(PendingHook {
            name: format!("{}!{}", module, symbol),
            slot,
            original,
            replacement,
            width,
        })
    }

    /// Write the replacement pointer into the slot
    pub fn install(
        &mut self,
        memory: &dyn MemoryAccess,
        pending: PendingHook,
    ) -> Result<IatHookKey, HookError> {
        if self.is_hooked(pending.slot) {
            return Err(HookError::AlreadyHooked { slot: pending.slot });
        }

        let mut patch = Patch::word(pending.slot, pending.replacement as u64, pending.width);
        if let Err(e) = patch.commit(memory) {
            tracing::error!("Failed to hook {}: {}", pending.name, e);
            return Err(e.into());
        }

        tracing::info!(
            "Hooked {} at {:x} ({:x} -> {:x})",
            pending.name,
            pending.slot,
            pending.original,
            pending.replacement
        );

        Ok(self.hooks.insert(HookInstallation {
            name: pending.name,
            slot: pending.slot,
            original: pending.original,
            replacement: pending.replacement,
            patch,
        }))
    }

    /// Whether any installed hook owns `slot`
    pub fn is_hooked(&self, slot: usize) -> bool {
        self.hooks.values().any(|hook| hook.slot == slot)
    }

    pub fn get(&self, key: IatHookKey) -> Option<&HookInstallation> {
        self.hooks.get(key)
    }

    /// Original pointer of an installed hook
    pub fn original(&self, key: IatHookKey) -> Option<usize> {
        self.hooks.get(key).map(|hook| hook.original)
    }

    pub fn len(&self) -> usize {
        self.hooks.len()
    }

    pub fn is_empty(&self) -> bool {
        self.hooks.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = (IatHookKey, &HookInstallation)> {
        self.hooks.iter()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::memory::{BufferMemory, PatchState};
    use earlyhook_engine::synthetic::SyntheticImage;

    const BASE: usize = 0x1_4000_0000;

    fn setup() -> (Vec<u8>, BufferMemory) {
        let bytes = SyntheticImage::new()
            .import_at("Bar.dll", &["Baz", "Qux"], 0x2000)
            .build();
        let memory = BufferMemory::new(BASE, bytes.clone());
        (bytes, memory)
    }

    #[test]
    fn test_prepare_captures_original() {
        let (bytes, memory) = setup();
        let image = LoadedImage::from_bytes(BASE, &bytes).unwrap();
        let registry = HookRegistry::new();

        let pending = registry
            .prepare(&memory, &image, "bar.dll", "Baz", 0xDEAD_0000)
            .unwrap();

        assert_eq!(pending.slot(), BASE + 0x2000);
        assert_eq!(pending.name(), "bar.dll!Baz");
        let expected = u64::from_le_bytes(bytes[0x2000..0x2008].try_into().unwrap());
        assert_eq!(pending.original(), expected as usize);

        // Nothing written yet
        assert_eq!(memory.snapshot(), bytes);
    }

    #[test]
    fn test_install_rewrites_slot() {
        let (bytes, memory) = setup();
        let image = LoadedImage::from_bytes(BASE, &bytes).unwrap();
        let mut registry = HookRegistry::new();

        let pending = registry
            .prepare(&memory, &image, "Bar.dll", "Qux", 0xDEAD_0000)
            .unwrap();
        let original = pending.original();
        let key = registry.install(&memory, pending).unwrap();

        let snapshot = memory.snapshot();
        assert_eq!(&snapshot[0x2008..0x2010], &0xDEAD_0000u64.to_le_bytes());
        assert_eq!(&snapshot[0x2000..0x2008], &bytes[0x2000..0x2008]);

        let hook = registry.get(key).unwrap();
        assert_eq!(hook.slot, BASE + 0x2008);
        assert_eq!(hook.patch.state(), PatchState::Committed);
        assert_eq!(registry.original(key), Some(original));
        assert_eq!(registry.len(), 1);
    }

    #[test]
    fn test_double_hook_refused() {
        let (bytes, memory) = setup();
        let image = LoadedImage::from_bytes(BASE, &bytes).unwrap();
        let mut registry = HookRegistry::new();

        let first = registry
            .prepare(&memory, &image, "Bar.dll", "Baz", 0xDEAD_0000)
            .unwrap();
        let second = registry
            .prepare(&memory, &image, "Bar.dll", "Baz", 0xBEEF_0000)
            .unwrap();
        registry.install(&memory, first).unwrap();

        assert!(matches!(
            registry.install(&memory, second),
            Err(HookError::AlreadyHooked { slot }) if slot == BASE + 0x2000
        ));
        assert!(matches!(
            registry.prepare(&memory, &image, "Bar.dll", "Baz", 0xBEEF_0000),
            Err(HookError::AlreadyHooked { .. })
        ));
        assert_eq!(registry.len(), 1);
    }

    #[test]
    fn test_slot_already_holding_replacement_refused() {
        let (bytes, memory) = setup();
        let image = LoadedImage::from_bytes(BASE, &bytes).unwrap();
        memory
            .write(BASE + 0x2000, &0xDEAD_0000u64.to_le_bytes())
            .unwrap();

        assert!(matches!(
            HookRegistry::new().prepare(&memory, &image, "Bar.dll", "Baz", 0xDEAD_0000),
            Err(HookError::AlreadyHooked { .. })
        ));
    }

    #[test]
    fn test_unresolved_and_invalid() {
        let (bytes, memory) = setup();
        let image = LoadedImage::from_bytes(BASE, &bytes).unwrap();
        let registry = HookRegistry::new();

        assert!(matches!(
            registry.prepare(&memory, &image, "Bar.dll", "Missing", 0x1000),
            Err(HookError::Unresolved(ImageError::ImportNotFound { .. }))
        ));
        assert!(matches!(
            registry.prepare(&memory, &image, "Bar.dll", "Baz", 0),
            Err(HookError::InvalidReplacement)
        ));
    }

    #[test]
    fn test_protection_failure_is_reported() {
        let (bytes, memory) = setup();
        let image = LoadedImage::from_bytes(BASE, &bytes).unwrap();
        let mut registry = HookRegistry::new();

        let pending = registry
            .prepare(&memory, &image, "Bar.dll", "Baz", 0xDEAD_0000)
            .unwrap();
        memory.deny_protection(true);

        assert!(matches!(
            registry.install(&memory, pending),
            Err(HookError::Memory(MemoryError::Protection { .. }))
        ));
        assert!(registry.is_empty());
        assert_eq!(memory.snapshot(), bytes);
    }

    #[test]
    fn test_narrow_image_writes_four_bytes() {
        let bytes = SyntheticImage::pe32()
            .import_at("Bar.dll", &["Baz", "Qux"], 0x2000)
            .build();
        let memory = BufferMemory::new(0x40_0000, bytes.clone());
        let image = LoadedImage::from_bytes(0x40_0000, &bytes).unwrap();
        let mut registry = HookRegistry::new();

        let pending = registry
            .prepare(&memory, &image, "Bar.dll", "Baz", 0x1234_5678)
            .unwrap();
        registry.install(&memory, pending).unwrap();

        let snapshot = memory.snapshot();
        assert_eq!(&snapshot[0x2000..0x2004], &0x1234_5678u32.to_le_bytes());
        assert_eq!(&snapshot[0x2004..0x2008], &bytes[0x2004..0x2008]);
    }
}
