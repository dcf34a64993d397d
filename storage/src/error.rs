//! Error types for index storage operations

use std::io;
use std::path::PathBuf;
use thiserror::Error;

pub type Result<T> = std::result::Result<T, StorageError>;

#[derive(Error, Debug)]
pub enum StorageError {
    /// I/O errors during file operations
    #[error("I/O error: {0}")]
    Io(#[from] io::Error),

    /// Bincode encoding errors
    #[error("Bincode encoding error: {0}")]
    BincodeEncode(#[from] bincode::error::EncodeError),

    /// Bincode decoding errors
    #[error("Bincode decoding error: {0}")]
    BincodeDecode(#[from] bincode::error::DecodeError),

    /// Compression errors
    #[error("Compression error: {0}")]
    Compression(String),

    /// Invalid magic bytes in file header
    #[error("Invalid file format: expected FDIX magic bytes")]
    InvalidMagic,

    /// Unsupported format version
    #[error("Unsupported format version: {0} (expected {1})")]
    UnsupportedVersion(u16, u16),

    /// Record payload does not match its stored checksum
    #[error("Checksum mismatch in {path:?}: expected {expected:#010x}, got {actual:#010x}")]
    ChecksumMismatch {
        path: PathBuf,
        expected: u32,
        actual: u32,
    },

    /// A length prefix points past the end of the buffer
    #[error("Malformed record at offset {offset}: declared {declared} bytes, {available} available")]
    MalformedRecord {
        offset: usize,
        declared: usize,
        available: usize,
    },

    /// Corrupt index data
    #[error("Corrupt index data: {0}")]
    CorruptData(String),

    /// A decoder rejected its input as an invalid argument
    #[error("Invalid argument: {0}")]
    InvalidArgument(String),

    /// A writer panicked while holding the index lock
    #[error("Index lock poisoned: {0}")]
    Poisoned(String),
}

/// Coarse classification used by fault policies.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FaultKind {
    Io,
    Decode,
    Malformed,
    InvalidArgument,
}

impl StorageError {
    pub const fn kind(&self) -> FaultKind {
        match self {
            Self::Io(_) | Self::Compression(_) => FaultKind::Io,
            Self::BincodeEncode(_)
            | Self::BincodeDecode(_)
            | Self::InvalidMagic
            | Self::UnsupportedVersion(..)
            | Self::CorruptData(_) => FaultKind::Decode,
            Self::ChecksumMismatch { .. } | Self::MalformedRecord { .. } | Self::Poisoned(_) => {
                FaultKind::Malformed
            }
            Self::InvalidArgument(_) => FaultKind::InvalidArgument,
        }
    }
}
