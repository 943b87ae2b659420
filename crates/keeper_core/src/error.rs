//! Error types for the Keeper repository.

use keeper_storage::{StorageError, Table};
use std::io;
use thiserror::Error;

/// Result type for repository operations.
pub type CoreResult<T> = Result<T, CoreError>;

/// Errors that can occur in repository operations.
#[derive(Debug, Error)]
pub enum CoreError {
    /// Storage engine error. The repository is unavailable.
    #[error("storage error: {0}")]
    Storage(#[from] StorageError),

    /// I/O error outside the storage engine (lock files, version marker).
    #[error("I/O error: {0}")]
    Io(#[from] io::Error),

    /// A value could not be encoded.
    #[error("codec error: {message}")]
    Codec {
        /// Description of the failure.
        message: String,
    },

    /// A stored record could not be decoded.
    #[error("corrupt record in {table} at key {key}: {message}")]
    Corruption {
        /// Table holding the record.
        table: Table,
        /// Hex-encoded key of the record.
        key: String,
        /// Description of the failure.
        message: String,
    },

    /// A write or exclusive lock was attempted on a read-only repository.
    #[error("repository is read-only")]
    ReadOnly,

    /// The exclusive lock is already held through this repository.
    #[error("exclusive lock already held by this repository")]
    AlreadyLocked,

    /// Operation not permitted in the current state.
    #[error("invalid state: {message}")]
    InvalidState {
        /// Description of why the operation is invalid.
        message: String,
    },

    /// A key could not be decoded.
    #[error("invalid key: {message}")]
    InvalidKey {
        /// Description of the problem.
        message: String,
    },

    /// Invalid repository layout or backend revision.
    #[error("invalid repository format: {message}")]
    InvalidFormat {
        /// Description of the format issue.
        message: String,
    },

    /// The repository has been closed.
    #[error("repository is closed")]
    Closed,
}

impl CoreError {
    /// Creates a codec error.
    pub fn codec(message: impl Into<String>) -> Self {
        Self::Codec {
            message: message.into(),
        }
    }

    /// Creates a corruption error for the record at `key`.
    pub fn corruption(table: Table, key: &[u8], message: impl Into<String>) -> Self {
        Self::Corruption {
            table,
            key: hex::encode(key),
            message: message.into(),
        }
    }

    /// Creates an invalid state error.
    pub fn invalid_state(message: impl Into<String>) -> Self {
        Self::InvalidState {
            message: message.into(),
        }
    }

    /// Creates an invalid key error.
    pub fn invalid_key(message: impl Into<String>) -> Self {
        Self::InvalidKey {
            message: message.into(),
        }
    }

    /// Creates an invalid format error.
    pub fn invalid_format(message: impl Into<String>) -> Self {
        Self::InvalidFormat {
            message: message.into(),
        }
    }

    /// Returns true for contract violations that retrying cannot fix.
    #[must_use]
    pub fn is_illegal_state(&self) -> bool {
        matches!(
            self,
            Self::ReadOnly | Self::AlreadyLocked | Self::InvalidState { .. }
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn corruption_reports_hex_key() {
        let err = CoreError::corruption(Table::Blocks, &[0xab, 0x01], "truncated");
        assert_eq!(
            err.to_string(),
            "corrupt record in blocks at key ab01: truncated"
        );
    }

    #[test]
    fn storage_errors_convert() {
        let err: CoreError = StorageError::ReadOnly.into();
        assert!(matches!(err, CoreError::Storage(StorageError::ReadOnly)));
        assert!(!err.is_illegal_state());
        assert!(CoreError::AlreadyLocked.is_illegal_state());
    }
}
