//! In-memory storage engine for testing.

use crate::backend::{EngineFactory, RawEntries, StorageEngine, WriteBatch, WriteOp};
use crate::error::{StorageError, StorageResult};
use crate::range::{Direction, KeyRange};
use crate::stats::{EngineStats, EngineStatsSnapshot};
use crate::table::{Table, PHYSICAL_TABLES};
use parking_lot::Mutex;
use std::collections::{BTreeMap, HashMap};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

/// Backend revision written by [`InMemoryFactory`].
pub const MEMORY_REVISION: &str = "memory-1";

#[derive(Debug, Default)]
struct MemoryState {
    tables: HashMap<&'static str, BTreeMap<Vec<u8>, Vec<u8>>>,
    blocks_swapped: bool,
}

impl MemoryState {
    fn table(&self, table: Table) -> Option<&BTreeMap<Vec<u8>, Vec<u8>>> {
        self.tables.get(table.physical(self.blocks_swapped))
    }

    fn table_mut(&mut self, table: Table) -> &mut BTreeMap<Vec<u8>, Vec<u8>> {
        self.tables
            .entry(table.physical(self.blocks_swapped))
            .or_default()
    }
}

/// A storage engine that keeps every table in memory.
///
/// Writes are visible immediately and `commit` only counts. Handles opened
/// through the same [`InMemoryFactory`] for the same path share their data,
/// so closing and reopening behaves like a persistent store.
///
/// # Example
///
/// ```rust
/// use keeper_storage::{InMemoryEngine, StorageEngine, Table};
///
/// let engine = InMemoryEngine::new();
/// engine.put(Table::Blocks, b"hash", b"value").unwrap();
/// assert_eq!(engine.get(Table::Blocks, b"hash").unwrap(), Some(b"value".to_vec()));
/// ```
#[derive(Debug)]
pub struct InMemoryEngine {
    state: Arc<Mutex<MemoryState>>,
    read_only: bool,
    exclusive_commit: bool,
    closed: AtomicBool,
    stats: EngineStats,
}

impl Default for InMemoryEngine {
    fn default() -> Self {
        Self::new()
    }
}

impl InMemoryEngine {
    /// Creates a new empty engine.
    #[must_use]
    pub fn new() -> Self {
        Self::with_state(Arc::default(), false, false)
    }

    fn with_state(state: Arc<Mutex<MemoryState>>, read_only: bool, exclusive_commit: bool) -> Self {
        Self {
            state,
            read_only,
            exclusive_commit,
            closed: AtomicBool::new(false),
            stats: EngineStats::new(0),
        }
    }

    fn ensure_open(&self) -> StorageResult<()> {
        if self.closed.load(Ordering::Acquire) {
            Err(StorageError::Closed)
        } else {
            Ok(())
        }
    }
}

impl StorageEngine for InMemoryEngine {
    fn get(&self, table: Table, key: &[u8]) -> StorageResult<Option<Vec<u8>>> {
        self.ensure_open()?;
        let state = self.state.lock();
        Ok(state.table(table).and_then(|t| t.get(key).cloned()))
    }

    fn write(&self, batch: WriteBatch) -> StorageResult<Vec<bool>> {
        self.ensure_open()?;
        if self.read_only {
            return Err(StorageError::ReadOnly);
        }

        let ops = batch.into_ops();
        let mut state = self.state.lock();
        let mut results = Vec::with_capacity(ops.len());
        for op in &ops {
            let applied = match op {
                WriteOp::Put { table, key, value } => {
                    state.table_mut(*table).insert(key.clone(), value.clone());
                    true
                }
                WriteOp::Delete { table, key } => state.table_mut(*table).remove(key).is_some(),
                WriteOp::Clear { table } => {
                    state.table_mut(*table).clear();
                    true
                }
                WriteOp::SwapBlocks => {
                    state.table_mut(Table::Blocks).clear();
                    state.blocks_swapped = !state.blocks_swapped;
                    true
                }
            };
            results.push(applied);
        }
        self.stats.record_batch(ops.len());
        Ok(results)
    }

    fn scan(
        &self,
        table: Table,
        range: &KeyRange,
        direction: Direction,
        limit: usize,
    ) -> StorageResult<RawEntries> {
        self.ensure_open()?;
        // BTreeMap::range panics on inverted bounds.
        if limit == 0 || range.is_empty() {
            return Ok(Vec::new());
        }

        let state = self.state.lock();
        let Some(map) = state.table(table) else {
            return Ok(Vec::new());
        };
        let iter = map.range::<[u8], _>(range.as_slices());
        let clone = |(k, v): (&Vec<u8>, &Vec<u8>)| (k.clone(), v.clone());
        Ok(match direction {
            Direction::Ascending => iter.take(limit).map(clone).collect(),
            Direction::Descending => iter.rev().take(limit).map(clone).collect(),
        })
    }

    fn count(&self, table: Table) -> StorageResult<u64> {
        self.ensure_open()?;
        let state = self.state.lock();
        Ok(state.table(table).map_or(0, |t| t.len() as u64))
    }

    fn commit(&self) -> StorageResult<()> {
        self.ensure_open()?;
        self.stats.record_commit();
        Ok(())
    }

    fn close(&self) -> StorageResult<()> {
        self.closed.store(true, Ordering::Release);
        Ok(())
    }

    fn is_read_only(&self) -> bool {
        self.read_only
    }

    fn commit_requires_exclusive(&self) -> bool {
        self.exclusive_commit
    }

    fn stats(&self) -> EngineStatsSnapshot {
        self.stats.snapshot()
    }
}

/// Opens [`InMemoryEngine`]s, sharing data between handles of one path.
#[derive(Debug, Default)]
pub struct InMemoryFactory {
    stores: Mutex<HashMap<PathBuf, Arc<Mutex<MemoryState>>>>,
    exclusive_commit: bool,
}

impl InMemoryFactory {
    /// Creates a factory with no stores.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Makes opened engines report that commits need the full handoff.
    #[must_use]
    pub fn exclusive_commit(mut self, exclusive: bool) -> Self {
        self.exclusive_commit = exclusive;
        self
    }
}

impl EngineFactory for InMemoryFactory {
    fn open(&self, path: &Path, read_only: bool) -> StorageResult<Arc<dyn StorageEngine>> {
        let state = {
            let mut stores = self.stores.lock();
            Arc::clone(stores.entry(path.to_path_buf()).or_insert_with(|| {
                let mut state = MemoryState::default();
                for name in PHYSICAL_TABLES {
                    state.tables.insert(name, BTreeMap::new());
                }
                Arc::new(Mutex::new(state))
            }))
        };
        Ok(Arc::new(InMemoryEngine::with_state(
            state,
            read_only,
            self.exclusive_commit,
        )))
    }

    fn revision(&self) -> &'static str {
        MEMORY_REVISION
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;
    use std::ops::Bound;

    #[test]
    fn descending_scan_with_limit() {
        let engine = InMemoryEngine::new();
        for key in [b"a", b"b", b"c"] {
            engine.put(Table::Directories, key, b"x").unwrap();
        }

        let page = engine
            .scan(Table::Directories, &KeyRange::all(), Direction::Descending, 2)
            .unwrap();
        let keys: Vec<_> = page.into_iter().map(|(k, _)| k).collect();
        assert_eq!(keys, vec![b"c".to_vec(), b"b".to_vec()]);
    }

    #[test]
    fn inverted_range_is_empty() {
        let engine = InMemoryEngine::new();
        engine.put(Table::Blocks, b"m", b"x").unwrap();
        let range = KeyRange::new(Bound::Included(b"z".to_vec()), Bound::Excluded(b"a".to_vec()));
        assert!(engine
            .scan(Table::Blocks, &range, Direction::Ascending, 10)
            .unwrap()
            .is_empty());
    }

    #[test]
    fn factory_shares_state_per_path() {
        let factory = InMemoryFactory::new();
        let first = factory.open(Path::new("/repo/a"), false).unwrap();
        first.put(Table::PartialFiles, b"p", b"1").unwrap();
        first.close().unwrap();
        assert!(matches!(first.get(Table::PartialFiles, b"p"), Err(StorageError::Closed)));

        let second = factory.open(Path::new("/repo/a"), true).unwrap();
        assert_eq!(second.get(Table::PartialFiles, b"p").unwrap(), Some(b"1".to_vec()));
        assert!(matches!(
            second.put(Table::PartialFiles, b"p", b"2"),
            Err(StorageError::ReadOnly)
        ));

        let other = factory.open(Path::new("/repo/b"), false).unwrap();
        assert_eq!(other.count(Table::PartialFiles).unwrap(), 0);
    }

    #[test]
    fn swap_blocks_matches_lmdb_semantics() {
        let engine = InMemoryEngine::new();
        engine.put(Table::Blocks, b"old", b"1").unwrap();
        engine.put(Table::BlocksAlternate, b"new", b"2").unwrap();

        let mut batch = WriteBatch::new();
        batch.swap_blocks();
        engine.write(batch).unwrap();

        assert_eq!(engine.get(Table::Blocks, b"new").unwrap(), Some(b"2".to_vec()));
        assert_eq!(engine.count(Table::BlocksAlternate).unwrap(), 0);
    }

    proptest! {
        #[test]
        fn paged_scans_visit_keys_in_byte_order(
            keys in proptest::collection::btree_set(proptest::collection::vec(any::<u8>(), 0..6), 0..40),
            start in proptest::collection::vec(any::<u8>(), 0..3),
            descending in any::<bool>(),
            limit in 1usize..7,
        ) {
            let engine = InMemoryEngine::new();
            for key in &keys {
                engine.put(Table::FileVersions, key, b"v").unwrap();
            }
            let direction = if descending { Direction::Descending } else { Direction::Ascending };
            let full = KeyRange::new(Bound::Included(start.clone()), Bound::Unbounded);

            let mut expected: Vec<_> = keys.iter().filter(|k| **k >= start).cloned().collect();
            if descending {
                expected.reverse();
            }

            let mut seen = Vec::new();
            let mut range = full;
            loop {
                let page = engine.scan(Table::FileVersions, &range, direction, limit).unwrap();
                let done = page.len() < limit;
                if let Some((last, _)) = page.last() {
                    range = range.resume_after(last, direction);
                }
                seen.extend(page.into_iter().map(|(k, _)| k));
                if done {
                    break;
                }
            }
            prop_assert_eq!(seen, expected);
        }
    }
}
