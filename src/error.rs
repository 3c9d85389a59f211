use thiserror::Error;

/*
 * Header-level failures are fatal and abort parsing. Table-level problems
 * (imports, exports, data directories) are tolerated at the call site: the
 * malformed element is skipped and parsing continues.
 */

#[derive(Debug, Error)]
pub enum ParseError {
    #[error("Invalid DOS signature: {0:#06x}")]
    InvalidDosSignature(u16),

    #[error("Invalid PE signature: {0:#010x}")]
    InvalidPeSignature(u32),

    #[error("Invalid optional header magic: {0:#06x}")]
    InvalidOptionalHeaderMagic(u16),

    #[error("Invalid PE offset")]
    InvalidOffset,

    #[error("Section {name} raw data escapes the image ({end:#x} > {length:#x})")]
    SectionOutOfBounds { name: String, end: u64, length: u64 },

    #[error("Truncated header: {0}")]
    Truncated(#[from] std::io::Error),
}
