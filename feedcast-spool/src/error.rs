//! Error types for the feedcast-spool crate.

use std::io;

use thiserror::Error;

/// Top-level spool error type.
#[derive(Debug, Error)]
pub enum SpoolError {
    /// I/O operation failed (file read/write/rename/delete).
    #[error("I/O error: {0}")]
    Io(#[from] io::Error),

    /// Metadata sidecar could not be encoded or decoded.
    #[error("Serialization error: {0}")]
    Serialization(#[from] SerializationError),

    /// A publish id or spool file name that cannot be used safely.
    #[error("Invalid spool name: {0}")]
    InvalidName(String),

    /// The spool directory is unusable.
    #[error("Spool validation error: {0}")]
    Validation(#[from] ValidationError),

    /// Another entry already occupies the target file name.
    #[error("Spool entry already exists: {0}")]
    AlreadyExists(String),
}

/// Metadata sidecar encoding errors.
#[derive(Debug, Error)]
pub enum SerializationError {
    #[error("Bincode encode error: {0}")]
    Encode(#[from] bincode::error::EncodeError),

    #[error("Bincode decode error: {0}")]
    Decode(#[from] bincode::error::DecodeError),
}

/// Spool directory validation errors.
#[derive(Debug, Error)]
pub enum ValidationError {
    /// Spool path exists but is not a directory.
    #[error("Spool path is not a directory: {0}")]
    NotDirectory(String),

    /// Spool path contains `..` components.
    #[error("Spool path cannot contain '..' components: {0}")]
    ParentTraversal(String),

    /// Free-disk thresholds are inverted or out of range.
    #[error("Invalid disk thresholds: {0}")]
    InvalidThresholds(String),
}

/// Specialized `Result` type for spool operations.
pub type Result<T> = std::result::Result<T, SpoolError>;

impl From<bincode::error::EncodeError> for SpoolError {
    fn from(e: bincode::error::EncodeError) -> Self {
        Self::Serialization(SerializationError::Encode(e))
    }
}

impl From<bincode::error::DecodeError> for SpoolError {
    fn from(e: bincode::error::DecodeError) -> Self {
        Self::Serialization(SerializationError::Decode(e))
    }
}

impl SpoolError {
    /// `true` when the underlying cause is a missing file.
    #[must_use]
    pub fn is_not_found(&self) -> bool {
        matches!(self, Self::Io(e) if e.kind() == io::ErrorKind::NotFound)
    }
}
