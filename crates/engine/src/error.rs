//! Error types for image inspection

/// Error type for reading and resolving against a mapped image
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum ImageError {
    /// Image base was null
    #[error("Image base is null")]
    NullBase,

    /// Image would extend past the end of the address space
    #[error("Image at {base:#x} cannot span {size:#x} bytes")]
    BaseOverflow { base: usize, size: usize },

    /// DOS header does not start with `MZ`
    #[error("Invalid DOS signature: {0:#06x}")]
    InvalidDosSignature(u16),

    /// NT headers do not start with `PE\0\0`
    #[error("Invalid NT signature: {0:#010x}")]
    InvalidNtSignature(u32),

    /// Optional header magic is neither PE32 nor PE32+
    #[error("Unsupported optional header magic: {0:#06x}")]
    UnsupportedMagic(u16),

    /// A read would leave the mapped image
    #[error("Read of {len} bytes at RVA {rva:#x} is outside the image ({size:#x} bytes)")]
    OutOfBounds { rva: usize, len: usize, size: usize },

    /// A name string has no terminator within the allowed length
    #[error("Unterminated name at RVA {0:#x}")]
    UnterminatedName(usize),

    /// The requested data directory is absent
    #[error("Image has no {0} directory")]
    MissingDirectory(&'static str),

    /// No import descriptor / thunk matched
    #[error("Import not found: {module}!{symbol}")]
    ImportNotFound { module: String, symbol: String },

    /// No export name matched
    #[error("Export not found: {0}")]
    ExportNotFound(String),

    /// The export is forwarded to another module
    #[error("Export {name} is forwarded to {forwarder}")]
    ForwardedExport { name: String, forwarder: String },
}

impl ImageError {
    /// Whether this is a plain "name not present" result rather than a
    /// malformed image
    pub fn is_not_found(&self) -> bool {
        matches!(
            self,
            ImageError::ImportNotFound { .. }
                | ImageError::ExportNotFound(_)
                | ImageError::MissingDirectory(_)
        )
    }
}
