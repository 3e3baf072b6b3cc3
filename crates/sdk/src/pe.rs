//! PE/COFF layouts
//!
//! Only the parts of the format the runtime walks are described here.
//! Field names follow the Windows SDK headers.

use crate::Pod;

/// `MZ`
pub const IMAGE_DOS_SIGNATURE: u16 = 0x5A4D;

/// `PE\0\0`
pub const IMAGE_NT_SIGNATURE: u32 = 0x0000_4550;

pub const IMAGE_NT_OPTIONAL_HDR32_MAGIC: u16 = 0x010B;
pub const IMAGE_NT_OPTIONAL_HDR64_MAGIC: u16 = 0x020B;

pub const IMAGE_FILE_MACHINE_I386: u16 = 0x014C;
pub const IMAGE_FILE_MACHINE_AMD64: u16 = 0x8664;

pub const IMAGE_DIRECTORY_ENTRY_EXPORT: usize = 0;
pub const IMAGE_DIRECTORY_ENTRY_IMPORT: usize = 1;

pub const IMAGE_ORDINAL_FLAG32: u32 = 0x8000_0000;
pub const IMAGE_ORDINAL_FLAG64: u64 = 0x8000_0000_0000_0000;

/// Size of the `Signature` field that precedes the file header.
pub const NT_SIGNATURE_SIZE: usize = 4;

/// Offset of `SizeOfImage` inside either optional header.
pub const OPTIONAL_SIZE_OF_IMAGE_OFFSET: usize = 56;

/// Offset of `NumberOfRvaAndSizes` in the PE32 optional header.
pub const OPTIONAL32_NUMBER_OF_RVA_OFFSET: usize = 92;

/// Offset of `DataDirectory` in the PE32 optional header.
pub const OPTIONAL32_DATA_DIRECTORY_OFFSET: usize = 96;

/// Offset of `NumberOfRvaAndSizes` in the PE32+ optional header.
pub const OPTIONAL64_NUMBER_OF_RVA_OFFSET: usize = 108;

/// Offset of `DataDirectory` in the PE32+ optional header.
pub const OPTIONAL64_DATA_DIRECTORY_OFFSET: usize = 112;

/// IMAGE_DOS_HEADER
#[repr(C)]
#[derive(Debug, Clone, Copy, Default)]
pub struct ImageDosHeader {
    pub e_magic: u16,
    pub e_cblp: u16,
    pub e_cp: u16,
    pub e_crlc: u16,
    pub e_cparhdr: u16,
    pub e_minalloc: u16,
    pub e_maxalloc: u16,
    pub e_ss: u16,
    pub e_sp: u16,
    pub e_csum: u16,
    pub e_ip: u16,
    pub e_cs: u16,
    pub e_lfarlc: u16,
    pub e_ovno: u16,
    pub e_res: [u16; 4],
    pub e_oemid: u16,
    pub e_oeminfo: u16,
    pub e_res2: [u16; 10],
    pub e_lfanew: i32,
}

/// IMAGE_FILE_HEADER, identical for PE32 and PE32+
#[repr(C)]
#[derive(Debug, Clone, Copy, Default)]
pub struct ImageFileHeader {
    pub machine: u16,
    pub number_of_sections: u16,
    pub time_date_stamp: u32,
    pub pointer_to_symbol_table: u32,
    pub number_of_symbols: u32,
    pub size_of_optional_header: u16,
    pub characteristics: u16,
}

/// IMAGE_DATA_DIRECTORY
#[repr(C)]
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ImageDataDirectory {
    pub virtual_address: u32,
    pub size: u32,
}

impl ImageDataDirectory {
    /// An absent directory has a zero RVA
    pub fn is_present(&self) -> bool {
        self.virtual_address != 0
    }

    /// Whether `rva` falls inside this directory
    pub fn contains(&self, rva: u32) -> bool {
        rva >= self.virtual_address && (rva - self.virtual_address) < self.size
    }
}

/// IMAGE_IMPORT_DESCRIPTOR
#[repr(C)]
#[derive(Debug, Clone, Copy, Default)]
pub struct ImageImportDescriptor {
    /// RVA of the import lookup table (`Characteristics` in older headers)
    pub original_first_thunk: u32,
    pub time_date_stamp: u32,
    pub forwarder_chain: u32,
    /// RVA of the module name
    pub name: u32,
    /// RVA of the import address table
    pub first_thunk: u32,
}

impl ImageImportDescriptor {
    /// The descriptor array ends with an all-zero entry
    pub fn is_terminator(&self) -> bool {
        self.original_first_thunk == 0 && self.name == 0 && self.first_thunk == 0
    }
}

/// IMAGE_EXPORT_DIRECTORY
#[repr(C)]
#[derive(Debug, Clone, Copy, Default)]
pub struct ImageExportDirectory {
    pub characteristics: u32,
    pub time_date_stamp: u32,
    pub major_version: u16,
    pub minor_version: u16,
    pub name: u32,
    pub base: u32,
    pub number_of_functions: u32,
    pub number_of_names: u32,
    pub address_of_functions: u32,
    pub address_of_names: u32,
    pub address_of_name_ordinals: u32,
}

/// Offset of `Name` inside IMAGE_IMPORT_BY_NAME (after the `Hint` field)
pub const IMPORT_BY_NAME_NAME_OFFSET: u32 = 2;

unsafe impl Pod for ImageDosHeader {}
unsafe impl Pod for ImageFileHeader {}
unsafe impl Pod for ImageDataDirectory {}
unsafe impl Pod for ImageImportDescriptor {}
unsafe impl Pod for ImageExportDirectory {}
