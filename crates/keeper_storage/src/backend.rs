//! Storage engine trait definition.

use crate::error::StorageResult;
use crate::range::{Direction, KeyRange};
use crate::stats::EngineStatsSnapshot;
use crate::table::Table;
use std::fmt;
use std::path::Path;
use std::sync::Arc;

/// A single mutation inside a [`WriteBatch`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum WriteOp {
    /// Inserts or replaces a value.
    Put {
        /// Target table.
        table: Table,
        /// Raw key.
        key: Vec<u8>,
        /// Opaque value bytes.
        value: Vec<u8>,
    },
    /// Removes a key if present.
    Delete {
        /// Target table.
        table: Table,
        /// Raw key.
        key: Vec<u8>,
    },
    /// Removes every entry of a table.
    Clear {
        /// Target table.
        table: Table,
    },
    /// Makes the shadow block table live and empties the old live table.
    SwapBlocks,
}

/// An ordered group of mutations applied as one unit.
///
/// A batch is applied inside the engine's open transaction without any
/// other batch interleaving, so "add a file version and drop its partial
/// upload" lands together or not at all.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct WriteBatch {
    ops: Vec<WriteOp>,
}

impl WriteBatch {
    /// Creates an empty batch.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Appends a put.
    pub fn put(&mut self, table: Table, key: Vec<u8>, value: Vec<u8>) -> &mut Self {
        self.ops.push(WriteOp::Put { table, key, value });
        self
    }

    /// Appends a delete.
    pub fn delete(&mut self, table: Table, key: Vec<u8>) -> &mut Self {
        self.ops.push(WriteOp::Delete { table, key });
        self
    }

    /// Appends a table clear.
    pub fn clear(&mut self, table: Table) -> &mut Self {
        self.ops.push(WriteOp::Clear { table });
        self
    }

    /// Appends a block table swap.
    pub fn swap_blocks(&mut self) -> &mut Self {
        self.ops.push(WriteOp::SwapBlocks);
        self
    }

    /// Appends an already built operation.
    pub fn push(&mut self, op: WriteOp) -> &mut Self {
        self.ops.push(op);
        self
    }

    /// Returns the operations in application order.
    #[must_use]
    pub fn ops(&self) -> &[WriteOp] {
        &self.ops
    }

    /// Returns the number of operations.
    #[must_use]
    pub fn len(&self) -> usize {
        self.ops.len()
    }

    /// Returns true if the batch has no operations.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.ops.is_empty()
    }

    /// Consumes the batch, returning its operations.
    #[must_use]
    pub fn into_ops(self) -> Vec<WriteOp> {
        self.ops
    }
}

impl From<Vec<WriteOp>> for WriteBatch {
    fn from(ops: Vec<WriteOp>) -> Self {
        Self { ops }
    }
}

/// One page of raw entries returned by a scan.
pub type RawEntries = Vec<(Vec<u8>, Vec<u8>)>;

/// An embedded ordered key-value store holding every repository table.
///
/// Engines are **opaque byte stores**: keys and values are bytes, and the
/// engine never interprets entity schemas. Operations are values-in,
/// values-out; transactions are owned by the engine, not by callers.
///
/// # Invariants
///
/// - Keys sort as unsigned bytes, lexicographically.
/// - Reads observe every write applied by earlier calls on the same handle,
///   committed or not.
/// - A [`WriteBatch`] is applied atomically with respect to other batches.
/// - A full store never fails a write: the engine grows and retries.
pub trait StorageEngine: Send + Sync + fmt::Debug {
    /// Reads the value stored under `key`.
    ///
    /// # Errors
    ///
    /// Returns an error if the engine is closed or an I/O error occurs.
    fn get(&self, table: Table, key: &[u8]) -> StorageResult<Option<Vec<u8>>>;

    /// Applies a batch of mutations.
    ///
    /// Returns one flag per operation: for deletes, whether the key existed;
    /// `true` for every other operation.
    ///
    /// # Errors
    ///
    /// Returns [`crate::StorageError::ReadOnly`] on read-only engines, or an
    /// error if the engine is closed or an I/O error occurs.
    fn write(&self, batch: WriteBatch) -> StorageResult<Vec<bool>>;

    /// Returns at most `limit` entries of `range`, visited in `direction`.
    ///
    /// # Errors
    ///
    /// Returns an error if the engine is closed or an I/O error occurs.
    fn scan(
        &self,
        table: Table,
        range: &KeyRange,
        direction: Direction,
        limit: usize,
    ) -> StorageResult<RawEntries>;

    /// Returns the number of entries in a table.
    ///
    /// # Errors
    ///
    /// Returns an error if the engine is closed or an I/O error occurs.
    fn count(&self, table: Table) -> StorageResult<u64>;

    /// Commits the open transaction.
    ///
    /// On read-only engines this refreshes the read snapshot.
    ///
    /// # Errors
    ///
    /// Returns an error if the commit fails.
    fn commit(&self) -> StorageResult<()>;

    /// Commits pending writes and releases the store files.
    ///
    /// Every later call fails with [`crate::StorageError::Closed`].
    ///
    /// # Errors
    ///
    /// Returns an error if the final commit fails.
    fn close(&self) -> StorageResult<()>;

    /// Returns true if the engine rejects writes.
    fn is_read_only(&self) -> bool;

    /// Returns true if committing needs the full cross-process handoff
    /// rather than only the in-process open lock.
    fn commit_requires_exclusive(&self) -> bool {
        false
    }

    /// Returns engine statistics.
    fn stats(&self) -> EngineStatsSnapshot;

    /// Convenience wrapper writing a single value.
    ///
    /// # Errors
    ///
    /// See [`StorageEngine::write`].
    fn put(&self, table: Table, key: &[u8], value: &[u8]) -> StorageResult<()> {
        let mut batch = WriteBatch::new();
        batch.put(table, key.to_vec(), value.to_vec());
        self.write(batch).map(|_| ())
    }

    /// Convenience wrapper deleting a single key; returns whether it existed.
    ///
    /// # Errors
    ///
    /// See [`StorageEngine::write`].
    fn delete(&self, table: Table, key: &[u8]) -> StorageResult<bool> {
        let mut batch = WriteBatch::new();
        batch.delete(table, key.to_vec());
        Ok(self.write(batch)?.first().copied().unwrap_or(false))
    }
}

/// Opens storage engines for a repository directory.
///
/// The repository closes and reopens its engine during cross-process
/// handoff, so it holds a factory rather than a single engine.
pub trait EngineFactory: Send + Sync + fmt::Debug {
    /// Opens an engine whose files live in `path`.
    ///
    /// # Errors
    ///
    /// Returns an error if the store cannot be opened.
    fn open(&self, path: &Path, read_only: bool) -> StorageResult<Arc<dyn StorageEngine>>;

    /// Returns the backend revision recorded in the repository's version marker.
    fn revision(&self) -> &'static str;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn batch_preserves_order() {
        let mut batch = WriteBatch::new();
        batch
            .put(Table::Blocks, b"k".to_vec(), b"v".to_vec())
            .delete(Table::Blocks, b"k".to_vec())
            .swap_blocks();

        assert_eq!(batch.len(), 3);
        assert!(matches!(batch.ops()[0], WriteOp::Put { .. }));
        assert!(matches!(batch.ops()[1], WriteOp::Delete { .. }));
        assert_eq!(batch.ops()[2], WriteOp::SwapBlocks);
    }
}
