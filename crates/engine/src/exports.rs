//! Export directory lookup

use std::cmp::Ordering;

use earlyhook_sdk::{ImageDataDirectory, ImageExportDirectory, IMAGE_DIRECTORY_ENTRY_EXPORT};

use crate::error::ImageError;
use crate::image::LoadedImage;

/// Upper bound on the name table size accepted from the directory
const MAX_EXPORT_NAMES: u32 = 1 << 20;

impl LoadedImage<'_> {
    /// Absolute address of the function exported as `symbol`
    ///
    /// Export names are sorted, so this is a binary search; comparison is
    /// case-sensitive.
    pub fn resolve_export(&self, symbol: &str) -> Result<usize, ImageError> {
        let directory = self.data_directory(IMAGE_DIRECTORY_ENTRY_EXPORT)?;
        if !directory.is_present() {
            return Err(ImageError::MissingDirectory("export"));
        }

        let exports: ImageExportDirectory = self.read(directory.virtual_address as usize)?;
        let needle = symbol.as_bytes();

        let mut low = 0usize;
        let mut high = exports.number_of_names.min(MAX_EXPORT_NAMES) as usize;

        while low < high {
            let mid = low + (high - low) / 2;
            let name_rva: u32 = self.read(exports.address_of_names as usize + mid * 4)?;
            let name = self.c_str(name_rva as usize)?;

            match name.cmp(needle) {
                Ordering::Less => low = mid + 1,
                Ordering::Greater => high = mid,
                Ordering::Equal => return self.export_at(&directory, &exports, mid, symbol),
            }
        }

        Err(ImageError::ExportNotFound(symbol.to_string()))
    }

    fn export_at(
        &self,
        directory: &ImageDataDirectory,
        exports: &ImageExportDirectory,
        name_index: usize,
        symbol: &str,
    ) -> Result<usize, ImageError> {
        let ordinals_rva = exports.address_of_name_ordinals as usize + name_index * 2;
        let ordinal: u16 = self.read(ordinals_rva)?;
        if u32::from(ordinal) >= exports.number_of_functions {
            return Err(ImageError::OutOfBounds {
                rva: ordinals_rva,
                len: 2,
                size: self.size(),
            });
        }

        let function_rva: u32 =
            self.read(exports.address_of_functions as usize + ordinal as usize * 4)?;

        if directory.contains(function_rva) {
            let forwarder = self.c_str(function_rva as usize)?;
            return Err(ImageError::ForwardedExport {
                name: symbol.to_string(),
                forwarder: String::from_utf8_lossy(forwarder).into_owned(),
            });
        }

        self.address_of(function_rva)
    }
}
