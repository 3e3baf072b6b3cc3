//! Synthetic PE images for tests
//!
//! Builds just enough of an image (headers, import and export directories)
//! for the inspector to walk. Layout is fixed so tests can name RVAs:
//!
//! | RVA      | contents                                   |
//! |----------|--------------------------------------------|
//! | `0x0000` | DOS header, NT headers at `0x80`           |
//! | `0x1000` | import descriptors, names, lookup tables   |
//! | `0x2000` | import address tables                      |
//! | `0x3000` | export directory and its tables            |

use earlyhook_sdk::{
    IMAGE_DIRECTORY_ENTRY_EXPORT, IMAGE_DIRECTORY_ENTRY_IMPORT, IMAGE_DOS_SIGNATURE,
    IMAGE_FILE_MACHINE_AMD64, IMAGE_FILE_MACHINE_I386, IMAGE_NT_OPTIONAL_HDR32_MAGIC,
    IMAGE_NT_OPTIONAL_HDR64_MAGIC, IMAGE_NT_SIGNATURE, IMAGE_ORDINAL_FLAG32, IMAGE_ORDINAL_FLAG64,
    OPTIONAL32_DATA_DIRECTORY_OFFSET, OPTIONAL32_NUMBER_OF_RVA_OFFSET,
    OPTIONAL64_DATA_DIRECTORY_OFFSET, OPTIONAL64_NUMBER_OF_RVA_OFFSET,
    OPTIONAL_SIZE_OF_IMAGE_OFFSET,
};

const NT_OFFSET: usize = 0x80;
const OPTIONAL_OFFSET: usize = NT_OFFSET + 4 + 20;
const IMPORT_AREA: usize = 0x1000;
const IAT_AREA: usize = 0x2000;
const EXPORT_AREA: usize = 0x3000;
const DEFAULT_SIZE: usize = 0x4000;

/// One entry of a synthetic import lookup table
#[derive(Debug, Clone)]
pub enum ImportSymbol {
    Name(String),
    Ordinal(u16),
}

impl ImportSymbol {
    pub fn name(name: &str) -> Self {
        ImportSymbol::Name(name.to_string())
    }
}

#[derive(Debug, Clone)]
struct SyntheticImport {
    module: String,
    symbols: Vec<ImportSymbol>,
    iat_rva: Option<u32>,
}

#[derive(Debug, Clone)]
enum ExportTarget {
    Rva(u32),
    Forwarder(String),
}

/// Builder for a minimal mapped PE image
#[derive(Debug, Clone)]
pub struct SyntheticImage {
    wide: bool,
    imports: Vec<SyntheticImport>,
    exports: Vec<(String, ExportTarget)>,
    lookup_table: bool,
    size: usize,
}

impl Default for SyntheticImage {
    fn default() -> Self {
        Self::new()
    }
}

impl SyntheticImage {
    /// AMD64 PE32+ image
    pub fn new() -> Self {
        Self {
            wide: true,
            imports: Vec::new(),
            exports: Vec::new(),
            lookup_table: true,
            size: DEFAULT_SIZE,
        }
    }

    /// i386 PE32 image
    pub fn pe32() -> Self {
        Self {
            wide: false,
            ..Self::new()
        }
    }

    /// Mapped size; must cover the fixed layout
    pub fn size(mut self, size: usize) -> Self {
        self.size = size.max(DEFAULT_SIZE);
        self
    }

    /// Import named symbols, IAT placed after the previous one
    pub fn import(self, module: &str, symbols: &[&str]) -> Self {
        let symbols = symbols.iter().map(|s| ImportSymbol::name(s)).collect();
        self.import_symbols(module, symbols, None)
    }

    /// Import named symbols with the IAT at a fixed RVA
    pub fn import_at(self, module: &str, symbols: &[&str], iat_rva: u32) -> Self {
        let symbols = symbols.iter().map(|s| ImportSymbol::name(s)).collect();
        self.import_symbols(module, symbols, Some(iat_rva))
    }

    /// Import arbitrary lookup entries
    pub fn import_symbols(
        mut self,
        module: &str,
        symbols: Vec<ImportSymbol>,
        iat_rva: Option<u32>,
    ) -> Self {
        self.imports.push(SyntheticImport {
            module: module.to_string(),
            symbols,
            iat_rva,
        });
        self
    }

    /// Leave `OriginalFirstThunk` zero so only the IAT carries names
    pub fn without_lookup_table(mut self) -> Self {
        self.lookup_table = false;
        self
    }

    /// Export `name` at `rva`
    pub fn export(mut self, name: &str, rva: u32) -> Self {
        self.exports.push((name.to_string(), ExportTarget::Rva(rva)));
        self
    }

    /// Export `name` as a forwarder to `target` (e.g. `"NTDLL.RtlAllocateHeap"`)
    pub fn forwarded_export(mut self, name: &str, target: &str) -> Self {
        self.exports
            .push((name.to_string(), ExportTarget::Forwarder(target.to_string())));
        self
    }

    /// Produce the image bytes
    ///
    /// # Panics
    /// Panics if the tables overflow their fixed areas.
    pub fn build(&self) -> Vec<u8> {
        let mut image = Writer(vec![0u8; self.size]);

        image.u16(0, IMAGE_DOS_SIGNATURE);
        image.u32(0x3C, NT_OFFSET as u32);
        image.u32(NT_OFFSET, IMAGE_NT_SIGNATURE);

        let (machine, magic, optional_size) = if self.wide {
            (IMAGE_FILE_MACHINE_AMD64, IMAGE_NT_OPTIONAL_HDR64_MAGIC, 240)
        } else {
            (IMAGE_FILE_MACHINE_I386, IMAGE_NT_OPTIONAL_HDR32_MAGIC, 224)
        };
        image.u16(NT_OFFSET + 4, machine);
        image.u16(NT_OFFSET + 4 + 16, optional_size);
        image.u16(OPTIONAL_OFFSET, magic);
        image.u32(OPTIONAL_OFFSET + OPTIONAL_SIZE_OF_IMAGE_OFFSET, self.size as u32);

        let (count_offset, table_offset) = if self.wide {
            (OPTIONAL64_NUMBER_OF_RVA_OFFSET, OPTIONAL64_DATA_DIRECTORY_OFFSET)
        } else {
            (OPTIONAL32_NUMBER_OF_RVA_OFFSET, OPTIONAL32_DATA_DIRECTORY_OFFSET)
        };
        image.u32(OPTIONAL_OFFSET + count_offset, 16);
        let directories = OPTIONAL_OFFSET + table_offset;

        if !self.imports.is_empty() {
            let (rva, size) = self.write_imports(&mut image);
            image.u32(directories + IMAGE_DIRECTORY_ENTRY_IMPORT * 8, rva);
            image.u32(directories + IMAGE_DIRECTORY_ENTRY_IMPORT * 8 + 4, size);
        }

        if !self.exports.is_empty() {
            let (rva, size) = self.write_exports(&mut image);
            image.u32(directories + IMAGE_DIRECTORY_ENTRY_EXPORT * 8, rva);
            image.u32(directories + IMAGE_DIRECTORY_ENTRY_EXPORT * 8 + 4, size);
        }

        image.0
    }

    fn write_imports(&self, image: &mut Writer) -> (u32, u32) {
        let thunk = if self.wide { 8 } else { 4 };
        let descriptors_size = (self.imports.len() + 1) * 20;
        let mut cursor = IMPORT_AREA + descriptors_size;
        let mut iat_cursor = IAT_AREA;

        for (index, import) in self.imports.iter().enumerate() {
            let descriptor = IMPORT_AREA + index * 20;

            let name_rva = cursor;
            cursor = image.c_str(cursor, &import.module);

            let entries: Vec<u64> = import
                .symbols
                .iter()
                .map(|symbol| match symbol {
                    ImportSymbol::Name(name) => {
                        cursor = align(cursor, 2);
                        let hint_name = cursor;
                        cursor = image.c_str(cursor + 2, name);
                        hint_name as u64
                    }
                    ImportSymbol::Ordinal(ordinal) if self.wide => {
                        IMAGE_ORDINAL_FLAG64 | u64::from(*ordinal)
                    }
                    ImportSymbol::Ordinal(ordinal) => {
                        u64::from(IMAGE_ORDINAL_FLAG32) | u64::from(*ordinal)
                    }
                })
                .collect();

            cursor = align(cursor, 8);
            let lookup_rva = cursor;
            cursor += (entries.len() + 1) * thunk;
            assert!(cursor <= IAT_AREA, "import area overflow");

            let iat_rva = import.iat_rva.map(|rva| rva as usize).unwrap_or(iat_cursor);
            let iat_end = iat_rva + (entries.len() + 1) * thunk;
            assert!(iat_end <= EXPORT_AREA, "import address table overflow");
            iat_cursor = iat_cursor.max(iat_end);

            for (slot, entry) in entries.iter().enumerate() {
                image.thunk(lookup_rva + slot * thunk, *entry, self.wide);
                image.thunk(iat_rva + slot * thunk, *entry, self.wide);
            }

            let original_first_thunk = if self.lookup_table { lookup_rva as u32 } else { 0 };
            image.u32(descriptor, original_first_thunk);
            image.u32(descriptor + 12, name_rva as u32);
            image.u32(descriptor + 16, iat_rva as u32);
        }

        (IMPORT_AREA as u32, descriptors_size as u32)
    }

    fn write_exports(&self, image: &mut Writer) -> (u32, u32) {
        let mut exports = self.exports.clone();
        exports.sort_by(|a, b| a.0.as_bytes().cmp(b.0.as_bytes()));
        let count = exports.len();

        let mut cursor = EXPORT_AREA + 40;
        let module_name = cursor;
        cursor = image.c_str(cursor, "synthetic.exe");

        cursor = align(cursor, 4);
        let functions = cursor;
        cursor += count * 4;
        let names = cursor;
        cursor += count * 4;
        let ordinals = cursor;
        cursor += count * 2;

        let mut pending_forwarders = Vec::new();
        for (index, (name, target)) in exports.iter().enumerate() {
            let name_rva = cursor;
            cursor = image.c_str(cursor, name);
            image.u32(names + index * 4, name_rva as u32);
            image.u16(ordinals + index * 2, index as u16);

            match target {
                ExportTarget::Rva(rva) => image.u32(functions + index * 4, *rva),
                ExportTarget::Forwarder(forwarder) => pending_forwarders.push((index, forwarder)),
            }
        }

        for (index, forwarder) in pending_forwarders {
            image.u32(functions + index * 4, cursor as u32);
            cursor = image.c_str(cursor, forwarder);
        }
        assert!(cursor <= image.0.len(), "export area overflow");

        let directory = EXPORT_AREA;
        image.u32(directory + 12, module_name as u32);
        image.u32(directory + 16, 1);
        image.u32(directory + 20, count as u32);
        image.u32(directory + 24, count as u32);
        image.u32(directory + 28, functions as u32);
        image.u32(directory + 32, names as u32);
        image.u32(directory + 36, ordinals as u32);

        (EXPORT_AREA as u32, (cursor - EXPORT_AREA) as u32)
    }
}

fn align(value: usize, to: usize) -> usize {
    (value + to - 1) & !(to - 1)
}

struct Writer(Vec<u8>);

impl Writer {
    fn bytes(&mut self, offset: usize, bytes: &[u8]) {
        self.0[offset..offset + bytes.len()].copy_from_slice(bytes);
    }

    fn u16(&mut self, offset: usize, value: u16) {
        self.bytes(offset, &value.to_le_bytes());
    }

    fn u32(&mut self, offset: usize, value: u32) {
        self.bytes(offset, &value.to_le_bytes());
    }

    fn thunk(&mut self, offset: usize, value: u64, wide: bool) {
        if wide {
            self.bytes(offset, &value.to_le_bytes());
        } else {
            self.u32(offset, value as u32);
        }
    }

    /// Write a NUL-terminated string and return the offset past it
    fn c_str(&mut self, offset: usize, value: &str) -> usize {
        self.bytes(offset, value.as_bytes());
        self.0[offset + value.len()] = 0;
        offset + value.len() + 1
    }
}
