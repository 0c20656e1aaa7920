//! Error types for mvdb core.

use crate::types::TransactionId;
use std::io;
use std::time::Duration;
use thiserror::Error;

/// Result type for core operations.
pub type CoreResult<T> = Result<T, CoreError>;

/// Broad classification of a [`CoreError`].
///
/// Callers that only need to decide between "retry", "report" and "stop"
/// match on this instead of on individual variants.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorKind {
    /// Row held by another transaction.
    Locked,
    /// Concurrent modification detected.
    WriteConflict,
    /// Checksum mismatch or malformed on-disk data.
    Corruption,
    /// Underlying storage failure.
    Io,
    /// Logic bug; never continue after this.
    Internal,
    /// Misuse of the API (unknown map, closed transaction, ...).
    Usage,
}

/// Errors that can occur in mvdb core operations.
#[derive(Debug, Error)]
pub enum CoreError {
    /// Storage backend error.
    #[error("storage error: {0}")]
    Storage(#[from] mvdb_storage::StorageError),

    /// Value codec error.
    #[error("codec error: {0}")]
    Codec(#[from] mvdb_codec::CodecError),

    /// I/O error.
    #[error("I/O error: {0}")]
    Io(#[from] io::Error),

    /// The row is held by another transaction.
    #[error("row {key} in map {map} is locked by {holder}")]
    Locked {
        /// Map name.
        map: String,
        /// Display form of the key.
        key: String,
        /// Transaction holding the row.
        holder: TransactionId,
    },

    /// Waiting for a row lock exceeded the configured timeout.
    #[error("timed out after {waited:?} waiting for row {key} in map {map} held by {holder}")]
    LockTimeout {
        /// Map name.
        map: String,
        /// Display form of the key.
        key: String,
        /// Transaction holding the row.
        holder: TransactionId,
        /// How long the caller waited.
        waited: Duration,
    },

    /// The row changed underneath the transaction.
    #[error("write conflict on row {key} in map {map}")]
    WriteConflict {
        /// Map name.
        map: String,
        /// Display form of the key.
        key: String,
    },

    /// A page failed validation.
    #[error("page corruption: {message}")]
    PageCorruption {
        /// Description of the corruption.
        message: String,
    },

    /// The redo log is corrupted or invalid.
    #[error("redo log corruption: {message}")]
    LogCorruption {
        /// Description of the corruption.
        message: String,
    },

    /// The manifest is corrupted or has an unsupported format.
    #[error("manifest corruption: {message}")]
    ManifestCorruption {
        /// Description of the corruption.
        message: String,
    },

    /// Checksum mismatch.
    #[error("checksum mismatch: expected {expected:#x}, got {actual:#x}")]
    ChecksumMismatch {
        /// Expected checksum.
        expected: u32,
        /// Actual checksum.
        actual: u32,
    },

    /// An internal invariant was violated.
    #[error("internal invariant violated: {message}")]
    InternalInvariant {
        /// Description of the violated invariant.
        message: String,
    },

    /// Map not found.
    #[error("map not found: {name}")]
    MapNotFound {
        /// Name of the map.
        name: String,
    },

    /// A map was opened with a different value type than it was created with.
    #[error("map {name} is already open with a different value type")]
    MapTypeMismatch {
        /// Name of the map.
        name: String,
    },

    /// Savepoint not found.
    #[error("savepoint not found: {name}")]
    SavepointNotFound {
        /// Name of the savepoint.
        name: String,
    },

    /// The transaction already committed or rolled back.
    #[error("transaction {id} is closed")]
    TransactionClosed {
        /// The transaction id.
        id: TransactionId,
    },

    /// Database is already open or locked.
    #[error("database locked: another process has exclusive access")]
    DatabaseLocked,

    /// Invalid operation.
    #[error("invalid operation: {message}")]
    InvalidOperation {
        /// Description of the invalid operation.
        message: String,
    },

    /// The engine or storage is closed.
    #[error("engine is closed")]
    Closed,
}

impl CoreError {
    /// Creates a page corruption error.
    pub fn page_corruption(message: impl Into<String>) -> Self {
        Self::PageCorruption {
            message: message.into(),
        }
    }

    /// Creates a redo log corruption error.
    pub fn log_corruption(message: impl Into<String>) -> Self {
        Self::LogCorruption {
            message: message.into(),
        }
    }

    /// Creates a manifest corruption error.
    pub fn manifest_corruption(message: impl Into<String>) -> Self {
        Self::ManifestCorruption {
            message: message.into(),
        }
    }

    /// Creates an internal invariant error.
    pub fn internal(message: impl Into<String>) -> Self {
        Self::InternalInvariant {
            message: message.into(),
        }
    }

    /// Creates an invalid operation error.
    pub fn invalid_operation(message: impl Into<String>) -> Self {
        Self::InvalidOperation {
            message: message.into(),
        }
    }

    /// Creates a write conflict error.
    pub fn write_conflict(map: &str, key: &impl std::fmt::Display) -> Self {
        Self::WriteConflict {
            map: map.to_string(),
            key: key.to_string(),
        }
    }

    /// Returns the broad classification of this error.
    pub fn kind(&self) -> ErrorKind {
        match self {
            Self::Locked { .. } | Self::LockTimeout { .. } => ErrorKind::Locked,
            Self::WriteConflict { .. } => ErrorKind::WriteConflict,
            Self::PageCorruption { .. }
            | Self::LogCorruption { .. }
            | Self::ManifestCorruption { .. }
            | Self::ChecksumMismatch { .. }
            | Self::Codec(_) => ErrorKind::Corruption,
            Self::Storage(mvdb_storage::StorageError::Corrupted(_)) => ErrorKind::Corruption,
            Self::Storage(mvdb_storage::StorageError::Locked(_)) | Self::DatabaseLocked => {
                ErrorKind::Usage
            }
            Self::Storage(_) | Self::Io(_) => ErrorKind::Io,
            Self::InternalInvariant { .. } => ErrorKind::Internal,
            Self::MapNotFound { .. }
            | Self::MapTypeMismatch { .. }
            | Self::SavepointNotFound { .. }
            | Self::TransactionClosed { .. }
            | Self::InvalidOperation { .. }
            | Self::Closed => ErrorKind::Usage,
        }
    }

    /// The transaction to wait for before retrying a write that failed
    /// with `Locked`.
    pub fn blocked_on(&self) -> Option<TransactionId> {
        match self {
            Self::Locked { holder, .. } => Some(*holder),
            _ => None,
        }
    }

    /// True for conditions a caller can resolve by retrying the transaction.
    pub fn is_retryable(&self) -> bool {
        matches!(self.kind(), ErrorKind::Locked | ErrorKind::WriteConflict)
    }

    /// True for checksum and format failures.
    pub fn is_corruption(&self) -> bool {
        self.kind() == ErrorKind::Corruption
    }
}
