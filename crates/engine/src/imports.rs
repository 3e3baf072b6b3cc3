//! Import address table lookup

use earlyhook_sdk::{ImageImportDescriptor, IMAGE_DIRECTORY_ENTRY_IMPORT, IMPORT_BY_NAME_NAME_OFFSET};

use crate::error::ImageError;
use crate::image::{LoadedImage, ThunkWidth};

/// Upper bound on descriptors walked when the directory size is unusable
const MAX_IMPORT_DESCRIPTORS: usize = 4096;

/// Upper bound on thunks walked per module
const MAX_THUNKS: usize = 65536;

/// Hint/name RVAs occupy the low 31 bits of a non-ordinal thunk
const HINT_NAME_RVA_MASK: u64 = 0x7FFF_FFFF;

impl LoadedImage<'_> {
    /// Find the IAT slot through which the image calls `module!symbol`
    ///
    /// Module names compare case-insensitively, as the loader does. Symbol
    /// names also compare case-insensitively. Ordinal imports are skipped.
    /// Returns the address of the slot, not the pointer stored in it.
    pub fn resolve_import_slot(&self, module: &str, symbol: &str) -> Result<usize, ImageError> {
        let directory = self.data_directory(IMAGE_DIRECTORY_ENTRY_IMPORT)?;
        if !directory.is_present() {
            return Err(ImageError::MissingDirectory("import"));
        }

        let width = self.thunk_width()?;
        let descriptor_size = std::mem::size_of::<ImageImportDescriptor>();

        // Some linkers under-report the size; the terminator still bounds the walk
        let declared = directory.size as usize / descriptor_size;
        let max_descriptors = if declared == 0 {
            MAX_IMPORT_DESCRIPTORS
        } else {
            declared.min(MAX_IMPORT_DESCRIPTORS)
        };

        for index in 0..max_descriptors {
            let rva = directory.virtual_address as usize + index * descriptor_size;
            let descriptor: ImageImportDescriptor = self.read(rva)?;
            if descriptor.is_terminator() {
                break;
            }

            let name = self.c_str(descriptor.name as usize)?;
            if !name.eq_ignore_ascii_case(module.as_bytes()) {
                continue;
            }

            tracing::debug!(
                "Found import descriptor for {} at RVA {:#x} (IAT {:#x})",
                module,
                rva,
                descriptor.first_thunk
            );

            return self.find_thunk(&descriptor, width, module, symbol);
        }

        Err(ImageError::ImportNotFound {
            module: module.to_string(),
            symbol: symbol.to_string(),
        })
    }

    fn find_thunk(
        &self,
        descriptor: &ImageImportDescriptor,
        width: ThunkWidth,
        module: &str,
        symbol: &str,
    ) -> Result<usize, ImageError> {
        // Unbound images may omit the lookup table; the IAT then holds the names
        let lookup = if descriptor.original_first_thunk != 0 {
            descriptor.original_first_thunk
        } else {
            descriptor.first_thunk
        } as usize;

        for index in 0..MAX_THUNKS {
            let entry = self.read_thunk(lookup + index * width.size(), width)?;
            if entry == 0 {
                break;
            }

            if width.is_ordinal(entry) {
                continue;
            }

            let hint_name = (entry & HINT_NAME_RVA_MASK) as usize;
            let name = self.c_str(hint_name + IMPORT_BY_NAME_NAME_OFFSET as usize)?;
            if name.eq_ignore_ascii_case(symbol.as_bytes()) {
                let rva = descriptor.first_thunk as usize + index * width.size();
                return self.checked_address(rva);
            }
        }

        Err(ImageError::ImportNotFound {
            module: module.to_string(),
            symbol: symbol.to_string(),
        })
    }

    fn read_thunk(&self, rva: usize, width: ThunkWidth) -> Result<u64, ImageError> {
        match width {
            ThunkWidth::Narrow => self.read::<u32>(rva).map(u64::from),
            ThunkWidth::Wide => self.read::<u64>(rva),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::synthetic::{ImportSymbol, SyntheticImage};

    const BASE: usize = 0x1_4000_0000;

    #[test]
    fn test_resolves_slot_address() {
        let bytes = SyntheticImage::new()
            .import_at("Bar.dll", &["Baz"], 0x2000)
            .build();
        let image = LoadedImage::from_bytes(BASE, &bytes).unwrap();

        assert_eq!(image.resolve_import_slot("Bar.dll", "Baz").unwrap(), BASE + 0x2000);
    }

    #[test]
    fn test_module_name_is_case_insensitive() {
        let bytes = SyntheticImage::new()
            .import_at("Bar.dll", &["Baz"], 0x2000)
            .build();
        let image = LoadedImage::from_bytes(BASE, &bytes).unwrap();

        assert_eq!(image.resolve_import_slot("BAR.DLL", "Baz").unwrap(), BASE + 0x2000);
        assert_eq!(image.resolve_import_slot("bar.dll", "Baz").unwrap(), BASE + 0x2000);
    }

    #[test]
    fn test_slots_follow_thunk_order() {
        let bytes = SyntheticImage::new()
            .import("kernel32.dll", &["GetTickCount"])
            .import_at(
                "api-ms-win-crt-runtime-l1-1-0.dll",
                &["_initterm", "_initterm_e", "_get_narrow_winmain_command_line"],
                0x2400,
            )
            .build();
        let image = LoadedImage::from_bytes(BASE, &bytes).unwrap();
        let crt = "api-ms-win-crt-runtime-l1-1-0.dll";

        assert_eq!(image.resolve_import_slot(crt, "_initterm").unwrap(), BASE + 0x2400);
        assert_eq!(image.resolve_import_slot(crt, "_initterm_e").unwrap(), BASE + 0x2408);
        assert_eq!(
            image
                .resolve_import_slot(crt, "_get_narrow_winmain_command_line")
                .unwrap(),
            BASE + 0x2410
        );
        assert!(image.resolve_import_slot("kernel32.dll", "GetTickCount").is_ok());
    }

    #[test]
    fn test_missing_pairs_are_not_found() {
        let bytes = SyntheticImage::new()
            .import_at("Bar.dll", &["Baz"], 0x2000)
            .build();
        let image = LoadedImage::from_bytes(BASE, &bytes).unwrap();

        let err = image.resolve_import_slot("Bar.dll", "Qux").unwrap_err();
        assert!(err.is_not_found());
        let err = image.resolve_import_slot("Other.dll", "Baz").unwrap_err();
        assert!(matches!(err, ImageError::ImportNotFound { .. }));
    }

    #[test]
    fn test_ordinal_imports_are_skipped() {
        let bytes = SyntheticImage::new()
            .import_symbols(
                "ws2_32.dll",
                vec![ImportSymbol::Ordinal(23), ImportSymbol::name("connect")],
                Some(0x2000),
            )
            .build();
        let image = LoadedImage::from_bytes(BASE, &bytes).unwrap();

        assert_eq!(image.resolve_import_slot("ws2_32.dll", "connect").unwrap(), BASE + 0x2008);
    }

    #[test]
    fn test_narrow_thunks() {
        let bytes = SyntheticImage::pe32()
            .import_at("Bar.dll", &["Zip", "Baz"], 0x2000)
            .build();
        let image = LoadedImage::from_bytes(0x40_0000, &bytes).unwrap();

        assert_eq!(image.resolve_import_slot("Bar.dll", "Baz").unwrap(), 0x40_2004);
    }

    #[test]
    fn test_image_without_lookup_table() {
        let bytes = SyntheticImage::new()
            .import_at("Bar.dll", &["One", "Two"], 0x2000)
            .without_lookup_table()
            .build();
        let image = LoadedImage::from_bytes(BASE, &bytes).unwrap();

        assert_eq!(image.resolve_import_slot("Bar.dll", "Two").unwrap(), BASE + 0x2008);
    }

    #[test]
    fn test_image_without_imports() {
        let bytes = SyntheticImage::new().build();
        let image = LoadedImage::from_bytes(BASE, &bytes).unwrap();

        assert_eq!(
            image.resolve_import_slot("Bar.dll", "Baz").unwrap_err(),
            ImageError::MissingDirectory("import")
        );
    }

    #[test]
    fn test_corrupt_name_rva_is_an_error() {
        let mut bytes = SyntheticImage::new()
            .import_at("Bar.dll", &["Baz"], 0x2000)
            .build();
        // First descriptor's Name field points far outside the image
        let name_field = 0x1000 + 12;
        bytes[name_field..name_field + 4].copy_from_slice(&0x00FF_0000u32.to_le_bytes());
        let image = LoadedImage::from_bytes(BASE, &bytes).unwrap();

        assert!(matches!(
            image.resolve_import_slot("Bar.dll", "Baz").unwrap_err(),
            ImageError::OutOfBounds { .. }
        ));
    }

    #[test]
    fn test_descriptor_walk_stops_at_declared_size() {
        use earlyhook_sdk::OPTIONAL64_DATA_DIRECTORY_OFFSET;

        let mut bytes = SyntheticImage::new()
            .import("A.dll", &["One"])
            .import("B.dll", &["Two"])
            .import("C.dll", &["Three"])
            .build();

        // Declare two descriptors and replace the terminator with garbage
        let size_field = 0x80 + 24 + OPTIONAL64_DATA_DIRECTORY_OFFSET
            + IMAGE_DIRECTORY_ENTRY_IMPORT * 8
            + 4;
        bytes[size_field..size_field + 4].copy_from_slice(&40u32.to_le_bytes());
        let terminator = 0x1000 + 3 * 20;
        bytes[terminator..terminator + 20].fill(0xFF);
        let image = LoadedImage::from_bytes(BASE, &bytes).unwrap();

        assert!(image.resolve_import_slot("A.dll", "One").is_ok());
        assert!(image.resolve_import_slot("B.dll", "Two").is_ok());
        assert!(matches!(
            image.resolve_import_slot("C.dll", "Three").unwrap_err(),
            ImageError::ImportNotFound { .. }
        ));
        assert!(matches!(
            image.resolve_import_slot("Missing.dll", "Four").unwrap_err(),
            ImageError::ImportNotFound { .. }
        ));
    }
}
