//! Bounded view over a mapped PE image
//!
//! Every read is checked against the mapped length, so a malformed or
//! partially mapped host image produces an [`ImageError`] instead of a fault.

use std::marker::PhantomData;

use earlyhook_sdk::{
    ImageDataDirectory, ImageDosHeader, ImageFileHeader, Pod, IMAGE_DOS_SIGNATURE,
    IMAGE_FILE_MACHINE_AMD64, IMAGE_NT_OPTIONAL_HDR32_MAGIC, IMAGE_NT_OPTIONAL_HDR64_MAGIC,
    IMAGE_NT_SIGNATURE, IMAGE_ORDINAL_FLAG32, IMAGE_ORDINAL_FLAG64, NT_SIGNATURE_SIZE,
    OPTIONAL32_DATA_DIRECTORY_OFFSET, OPTIONAL32_NUMBER_OF_RVA_OFFSET,
    OPTIONAL64_DATA_DIRECTORY_OFFSET, OPTIONAL64_NUMBER_OF_RVA_OFFSET,
    OPTIONAL_SIZE_OF_IMAGE_OFFSET,
};

use crate::error::ImageError;

/// Bytes read from a live module before `SizeOfImage` is known.
/// The header page of a loaded module is always mapped.
const HEADER_PROBE_SIZE: usize = 0x1000;

/// Longest import/export name accepted before the terminator
pub(crate) const MAX_NAME_LEN: usize = 512;

/// Width of one import thunk entry
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ThunkWidth {
    /// PE32: 4-byte thunks
    Narrow,
    /// PE32+: 8-byte thunks
    Wide,
}

impl ThunkWidth {
    /// Size of one thunk in bytes
    pub fn size(self) -> usize {
        match self {
            ThunkWidth::Narrow => 4,
            ThunkWidth::Wide => 8,
        }
    }

    /// Whether a lookup entry imports by ordinal
    pub fn is_ordinal(self, entry: u64) -> bool {
        match self {
            ThunkWidth::Narrow => entry & IMAGE_ORDINAL_FLAG32 as u64 != 0,
            ThunkWidth::Wide => entry & IMAGE_ORDINAL_FLAG64 != 0,
        }
    }
}

/// A mapped executable image
///
/// `base` is the virtual address the image is mapped at; `data` is where its
/// bytes can actually be read. They coincide for a live module and differ
/// for synthetic images built in a buffer.
#[derive(Debug, Clone, Copy)]
pub struct LoadedImage<'a> {
    base: usize,
    data: *const u8,
    size: usize,
    _marker: PhantomData<&'a [u8]>,
}

// SAFETY: The view is read-only and the underlying image outlives `'a`.
unsafe impl Send for LoadedImage<'_> {}
unsafe impl Sync for LoadedImage<'_> {}

impl<'a> LoadedImage<'a> {
    /// View a byte buffer as an image mapped at `base`
    pub fn from_bytes(base: usize, bytes: &'a [u8]) -> Result<Self, ImageError> {
        if base == 0 {
            return Err(ImageError::NullBase);
        }
        if base.checked_add(bytes.len()).is_none() {
            return Err(ImageError::BaseOverflow { base, size: bytes.len() });
        }

        let image = Self {
            base,
            data: bytes.as_ptr(),
            size: bytes.len(),
            _marker: PhantomData,
        };
        image.nt_offset()?;
        Ok(image)
    }

    /// Base (load) address of the image
    pub fn base(&self) -> usize {
        self.base
    }

    /// Mapped length in bytes
    pub fn size(&self) -> usize {
        self.size
    }

    /// Whether an absolute address falls inside the mapped image
    pub fn contains(&self, address: usize) -> bool {
        address >= self.base && address - self.base < self.size
    }

    /// Absolute address of an RVA
    pub fn address_of(&self, rva: u32) -> Result<usize, ImageError> {
        self.checked_address(rva as usize)
    }

    pub(crate) fn checked_address(&self, rva: usize) -> Result<usize, ImageError> {
        self.base.checked_add(rva).ok_or(ImageError::BaseOverflow {
            base: self.base,
            size: rva,
        })
    }

    /// Read a plain layout at `rva`
    pub fn read<T: Pod>(&self, rva: usize) -> Result<T, ImageError> {
        let len = std::mem::size_of::<T>();
        self.check_range(rva, len)?;
        // SAFETY: range checked above, T is valid for any bit pattern
        Ok(unsafe { std::ptr::read_unaligned(self.data.add(rva) as *const T) })
    }

    /// Borrow the NUL-terminated string at `rva`, without the terminator
    pub fn c_str(&self, rva: usize) -> Result<&'a [u8], ImageError> {
        self.check_range(rva, 1)?;
        let limit = (self.size - rva).min(MAX_NAME_LEN + 1);

        // SAFETY: `limit` bytes starting at `rva` are inside the image
        let bytes = unsafe { std::slice::from_raw_parts(self.data.add(rva), limit) };
        bytes
            .iter()
            .position(|&b| b == 0)
            .map(|end| &bytes[..end])
            .ok_or(ImageError::UnterminatedName(rva))
    }

    fn check_range(&self, rva: usize, len: usize) -> Result<(), ImageError> {
        match rva.checked_add(len) {
            Some(end) if end <= self.size => Ok(()),
            _ => Err(ImageError::OutOfBounds {
                rva,
                len,
                size: self.size,
            }),
        }
    }

    /// Offset of the NT headers, after validating both signatures
    pub(crate) fn nt_offset(&self) -> Result<usize, ImageError> {
        let dos: ImageDosHeader = self.read(0)?;
        if dos.e_magic != IMAGE_DOS_SIGNATURE {
            return Err(ImageError::InvalidDosSignature(dos.e_magic));
        }

        let nt = usize::try_from(dos.e_lfanew).map_err(|_| ImageError::OutOfBounds {
            rva: 0,
            len: 0,
            size: self.size,
        })?;

        let signature: u32 = self.read(nt)?;
        if signature != IMAGE_NT_SIGNATURE {
            return Err(ImageError::InvalidNtSignature(signature));
        }

        Ok(nt)
    }

    fn optional_offset(&self) -> Result<usize, ImageError> {
        Ok(self.nt_offset()? + NT_SIGNATURE_SIZE + std::mem::size_of::<ImageFileHeader>())
    }

    /// The COFF file header
    pub fn file_header(&self) -> Result<ImageFileHeader, ImageError> {
        self.read(self.nt_offset()? + NT_SIGNATURE_SIZE)
    }

    /// `FileHeader.Machine`
    pub fn machine(&self) -> Result<u16, ImageError> {
        Ok(self.file_header()?.machine)
    }

    /// Whether the image targets a 64-bit machine
    ///
    /// Callers use this to pick the width of pointer patches.
    pub fn is_wide_architecture(&self) -> Result<bool, ImageError> {
        Ok(self.machine()? == IMAGE_FILE_MACHINE_AMD64)
    }

    /// Optional header magic, validated to be PE32 or PE32+
    pub fn optional_magic(&self) -> Result<u16, ImageError> {
        let magic: u16 = self.read(self.optional_offset()?)?;
        match magic {
            IMAGE_NT_OPTIONAL_HDR32_MAGIC | IMAGE_NT_OPTIONAL_HDR64_MAGIC => Ok(magic),
            other => Err(ImageError::UnsupportedMagic(other)),
        }
    }

    /// Thunk width implied by the optional header format
    pub fn thunk_width(&self) -> Result<ThunkWidth, ImageError> {
        Ok(match self.optional_magic()? {
            IMAGE_NT_OPTIONAL_HDR64_MAGIC => ThunkWidth::Wide,
            _ => ThunkWidth::Narrow,
        })
    }

    /// `OptionalHeader.SizeOfImage`
    pub fn size_of_image(&self) -> Result<u32, ImageError> {
        self.optional_magic()?;
        self.read(self.optional_offset()? + OPTIONAL_SIZE_OF_IMAGE_OFFSET)
    }

    /// Data directory entry by index
    ///
    /// Indices past `NumberOfRvaAndSizes` report an absent directory.
    pub fn data_directory(&self, index: usize) -> Result<ImageDataDirectory, ImageError> {
        let optional = self.optional_offset()?;
        let (count_offset, table_offset) = match self.optional_magic()? {
            IMAGE_NT_OPTIONAL_HDR64_MAGIC => (
                OPTIONAL64_NUMBER_OF_RVA_OFFSET,
                OPTIONAL64_DATA_DIRECTORY_OFFSET,
            ),
            _ => (
                OPTIONAL32_NUMBER_OF_RVA_OFFSET,
                OPTIONAL32_DATA_DIRECTORY_OFFSET,
            ),
        };

        let count: u32 = self.read(optional + count_offset)?;
        if index >= count as usize {
            return Ok(ImageDataDirectory::default());
        }

        self.read(optional + table_offset + index * std::mem::size_of::<ImageDataDirectory>())
    }
}

impl LoadedImage<'static> {
    /// View a module that is mapped into this process
    ///
    /// Resource-library handles carry flag bits in their low two bits; those
    /// are masked off.
    ///
    /// # Safety
    /// `module` must be the base of a loaded image that stays mapped for the
    /// rest of the process lifetime.
    pub unsafe fn from_module(module: *const u8) -> Result<Self, ImageError> {
        let base = module as usize & !3;
        if base == 0 {
            return Err(ImageError::NullBase);
        }

        let probe = Self {
            base,
            data: base as *const u8,
            size: HEADER_PROBE_SIZE,
            _marker: PhantomData,
        };
        let size = (probe.size_of_image()? as usize).max(HEADER_PROBE_SIZE);
        if base.checked_add(size).is_none() {
            return Err(ImageError::BaseOverflow { base, size });
        }

        let image = Self {
            size,
            ..probe
        };

        tracing::debug!(
            "Mapped image at {:#x} ({:#x} bytes, machine {:#06x})",
            base,
            image.size,
            image.machine()?
        );

        Ok(image)
    }
}
