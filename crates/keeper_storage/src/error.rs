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

    /// The embedded LMDB store reported an error.
    #[error("lmdb error: {0}")]
    Lmdb(#[from] heed::Error),

    /// A write was attempted on an engine opened read-only.
    #[error("storage engine is read-only")]
    ReadOnly,

    /// The engine has been closed or its worker thread is gone.
    #[error("storage engine is closed")]
    Closed,

    /// A table required for the operation does not exist.
    #[error("table {0} does not exist")]
    MissingTable(&'static str),
}

impl StorageError {
    /// Returns true if the error is LMDB's "map full" condition.
    ///
    /// This condition is handled inside the engine by growing the map and
    /// replaying the open transaction; it never reaches callers.
    #[must_use]
    pub fn is_map_full(&self) -> bool {
        matches!(self, Self::Lmdb(heed::Error::Mdb(heed::MdbError::MapFull)))
    }
}
