//! Error types for the sparsecopy core library.

use std::path::PathBuf;

/// The main error type for sparsecopy operations.
///
/// Every variant is terminal for a conversion run: nothing is retried and
/// nothing is recovered locally.
#[derive(Debug, thiserror::Error)]
pub enum Error {
    /// I/O error with optional path context.
    #[error("I/O error{}: {source}", path.as_ref().map(|p| format!(" at '{}'", p.display())).unwrap_or_default())]
    Io {
        source: std::io::Error,
        path: Option<PathBuf>,
    },

    /// The image is not in a layout this tool accepts (bad magic, wrong
    /// version, a fixed field holding an unexpected value).
    #[error("format error: {message}")]
    Format { message: String },

    /// The image uses a feature that is recognized but not implemented.
    #[error("unsupported: {message}")]
    Unsupported { message: String },

    /// A self-checksummed structure failed verification and no valid
    /// alternate copy exists.
    #[error("checksum mismatch in {structure}: stored {stored:#010x}, computed {computed:#010x}")]
    Checksum {
        structure: &'static str,
        stored: u32,
        computed: u32,
    },

    /// A decoded offset would reach outside the mapped image.
    #[error("invalid table {index}: offset {offset} + length {len} exceeds image size {image_len}")]
    OutOfBounds {
        index: u64,
        offset: u64,
        len: u64,
        image_len: u64,
    },

    /// A batch could not be written because it violates the direct I/O alignment.
    #[error("write of {len} bytes at offset {offset} is not aligned to {alignment} bytes")]
    Unaligned { offset: u64, len: u64, alignment: u64 },

    /// An extent arrived at or before the end of the previous one.
    #[error("extent at offset {offset} precedes previous extent end {previous_end}")]
    OutOfOrder { offset: u64, previous_end: u64 },

    /// A positioned write completed with fewer bytes than requested.
    #[error("short write at offset {offset}: requested {expected} bytes, wrote {written}")]
    ShortWrite {
        offset: u64,
        expected: u64,
        written: u64,
    },

    /// A positioned write failed at the OS level.
    #[error("write of {len} bytes at offset {offset} failed: {source}")]
    Write {
        offset: u64,
        len: u64,
        source: std::io::Error,
    },
}

/// A specialized Result type for sparsecopy operations.
pub type Result<T> = std::result::Result<T, Error>;

impl Error {
    /// Create an I/O error with path context.
    pub fn io(source: std::io::Error, path: impl Into<PathBuf>) -> Self {
        Self::Io {
            source,
            path: Some(path.into()),
        }
    }

    /// Create an I/O error without path context.
    pub fn io_simple(source: std::io::Error) -> Self {
        Self::Io { source, path: None }
    }

    /// Create a format rejection error.
    pub fn format(message: impl Into<String>) -> Self {
        Self::Format {
            message: message.into(),
        }
    }

    /// Create an unsupported-feature error.
    pub fn unsupported(message: impl Into<String>) -> Self {
        Self::Unsupported {
            message: message.into(),
        }
    }

    /// Create a bounds violation for table entry `index`.
    pub fn out_of_bounds(index: u64, offset: u64, len: u64, image_len: u64) -> Self {
        Self::OutOfBounds {
            index,
            offset,
            len,
            image_len,
        }
    }
}

impl From<std::io::Error> for Error {
    fn from(source: std::io::Error) -> Self {
        Self::io_simple(source)
    }
}
