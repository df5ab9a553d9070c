#![forbid(unsafe_code)]
//! Error types for WitnessFS.
//!
//! Defines `WfsError` and a `Result<T>` alias used throughout the
//! workspace. Every error that reaches the API boundary names the section
//! type and byte offset at fault where the format defines one.

use thiserror::Error;
use wfs_types::Cancelled;

/// Unified error type for all WitnessFS operations.
#[derive(Debug, Error)]
pub enum WfsError {
    #[error("not an EWF segment: signature mismatch")]
    NotEwf,

    #[error("malformed {section} section at offset {offset}: {detail}")]
    Malformed {
        section: String,
        offset: u64,
        detail: String,
    },

    #[error(
        "Adler-32 mismatch in {section} section at offset {offset}: stored {stored:#010x}, computed {computed:#010x}"
    )]
    ChecksumFailure {
        section: String,
        offset: u64,
        stored: u32,
        computed: u32,
    },

    #[error("zlib stream rejected at offset {offset}: {detail}")]
    Decompress { offset: u64, detail: String },

    #[error("chunk {chunk} is not covered by the chunk index")]
    MissingChunk { chunk: u64 },

    #[error("read beyond disk extent: {detail}")]
    OutOfRange { detail: String },

    #[error("unsupported: {0}")]
    Unsupported(String),

    #[error("filesystem corrupt: {0}")]
    FilesystemCorrupt(String),

    #[error("operation cancelled")]
    Cancelled,

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

impl WfsError {
    /// Construct a `Malformed` error for a named section.
    pub fn malformed(
        section: impl Into<String>,
        offset: u64,
        detail: impl Into<String>,
    ) -> Self {
        Self::Malformed {
            section: section.into(),
            offset,
            detail: detail.into(),
        }
    }

    /// Construct an `OutOfRange` error.
    pub fn out_of_range(detail: impl Into<String>) -> Self {
        Self::OutOfRange {
            detail: detail.into(),
        }
    }

    /// Construct a "no such entry" error for path lookups.
    ///
    /// The taxonomy has no dedicated not-found kind; lookups map to an
    /// `Io` error with `ErrorKind::NotFound` so callers can match on it.
    pub fn not_found(path: impl AsRef<str>) -> Self {
        Self::Io(std::io::Error::new(
            std::io::ErrorKind::NotFound,
            format!("no such file or directory: {}", path.as_ref()),
        ))
    }

    /// Whether this error is a recoverable checksum failure.
    #[must_use]
    pub fn is_checksum_failure(&self) -> bool {
        matches!(self, Self::ChecksumFailure { .. })
    }
}

impl From<Cancelled> for WfsError {
    fn from(_: Cancelled) -> Self {
        Self::Cancelled
    }
}

/// Result alias using `WfsError`.
pub type Result<T> = std::result::Result<T, WfsError>;
