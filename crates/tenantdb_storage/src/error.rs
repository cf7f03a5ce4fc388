//! Error types for storage operations.

use std::io;
use thiserror::Error;

/// Result type for storage operations.
pub type StorageResult<T> = Result<T, StorageError>;

/// Errors that can occur during storage operations.
#[derive(Debug, Error)]
pub enum StorageError {
    /// An I/O error occurred.
    #[error("I/O error: {0}")]
    Io(#[from] io::Error),

    /// Attempted to read beyond the end of storage.
    #[error("read beyond end of storage: offset {offset}, len {len}, size {size}")]
    ReadPastEnd {
        /// The requested read offset.
        offset: u64,
        /// The requested read length.
        len: usize,
        /// The current storage size.
        size: u64,
    },

    /// A journal record failed validation.
    #[error("journal corrupted at offset {offset}: {message}")]
    Corrupted {
        /// Offset of the offending record.
        offset: u64,
        /// Description of the corruption.
        message: String,
    },

    /// A journal record could not be encoded.
    #[error("journal encoding failed: {0}")]
    Encode(String),

    /// Another write transaction is already open on the environment.
    #[error("a write transaction is already active")]
    WriterActive,

    /// A durability write failed earlier; the environment refuses further commits.
    #[error("environment failed: {reason}")]
    Failed {
        /// The original failure, rendered.
        reason: String,
    },

    /// The database directory is locked by another environment.
    #[error("database directory locked: {path}")]
    Locked {
        /// The locked directory.
        path: String,
    },

    /// The environment has been closed.
    #[error("storage is closed")]
    Closed,
}

impl StorageError {
    /// Creates a corruption error.
    pub fn corrupted(offset: u64, message: impl Into<String>) -> Self {
        Self::Corrupted {
            offset,
            message: message.into(),
        }
    }

    /// Creates an environment-failed error.
    pub fn failed(reason: impl Into<String>) -> Self {
        Self::Failed {
            reason: reason.into(),
        }
    }

    /// Returns true if the error means the environment must be reopened.
    #[must_use]
    pub fn is_fatal(&self) -> bool {
        matches!(self, Self::Failed { .. } | Self::Closed)
    }
}
