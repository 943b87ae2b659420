//! Typed record access over the storage engine.

use crate::error::{CoreError, CoreResult};
use crate::model::Record;
use crate::value;
use keeper_storage::{Direction, KeyRange, StorageEngine, Table, WriteBatch};
use std::sync::atomic::{AtomicBool, Ordering};
use tracing::warn;

/// One page of decoded records.
#[derive(Debug)]
pub(crate) struct Page<V> {
    /// Records with their raw keys, in scan order.
    pub entries: Vec<(Vec<u8>, V)>,
    /// Raw key to resume after, or `None` when the range is exhausted.
    pub resume: Option<Vec<u8>>,
}

/// Encodes and decodes records against one open engine.
///
/// Constructed per operation while the operation lock is held.
pub(crate) struct Records<'a> {
    engine: &'a dyn StorageEngine,
    corruption: &'a AtomicBool,
}

impl<'a> Records<'a> {
    pub(crate) fn new(engine: &'a dyn StorageEngine, corruption: &'a AtomicBool) -> Self {
        Self { engine, corruption }
    }

    pub(crate) fn engine(&self) -> &'a dyn StorageEngine {
        self.engine
    }

    /// Point read. A record that fails to decode is reported, not skipped.
    pub(crate) fn get<V: Record>(&self, key: &[u8]) -> CoreResult<Option<V>> {
        let Some(bytes) = self.engine.get(V::TABLE, key)? else {
            return Ok(None);
        };
        match value::decode(&bytes) {
            Ok(record) => Ok(Some(record)),
            Err(err) => {
                self.corruption.store(true, Ordering::Release);
                Err(CoreError::corruption(V::TABLE, key, err.to_string()))
            }
        }
    }

    pub(crate) fn contains(&self, table: Table, key: &[u8]) -> CoreResult<bool> {
        Ok(self.engine.get(table, key)?.is_some())
    }

    /// Reads one page of `range`.
    ///
    /// Records that fail to decode are quarantined and left out when
    /// `skip_corrupt` is set; otherwise the first one fails the page.
    pub(crate) fn page<V: Record>(
        &self,
        table: Table,
        range: &KeyRange,
        direction: Direction,
        limit: usize,
        skip_corrupt: bool,
    ) -> CoreResult<Page<V>> {
        let raw = self.engine.scan(table, range, direction, limit)?;
        let resume = if raw.len() >= limit {
            raw.last().map(|(key, _)| key.clone())
        } else {
            None
        };

        let mut entries = Vec::with_capacity(raw.len());
        for (key, bytes) in raw {
            match value::decode::<V>(&bytes) {
                Ok(record) => entries.push((key, record)),
                Err(err) if skip_corrupt => self.quarantine(table, &key, &err)?,
                Err(err) => {
                    self.corruption.store(true, Ordering::Release);
                    return Err(CoreError::corruption(table, &key, err.to_string()));
                }
            }
        }
        Ok(Page { entries, resume })
    }

    /// Reads every record of `range`, page by page.
    pub(crate) fn collect<V: Record>(
        &self,
        range: &KeyRange,
        direction: Direction,
        page_size: usize,
    ) -> CoreResult<Vec<(Vec<u8>, V)>> {
        let mut out = Vec::new();
        let mut range = range.clone();
        loop {
            let page = self.page::<V>(V::TABLE, &range, direction, page_size.max(1), true)?;
            out.extend(page.entries);
            match page.resume {
                Some(last) => range = range.resume_after(&last, direction),
                None => return Ok(out),
            }
        }
    }

    /// Logs a corrupt record, flags the repository and deletes the record
    /// when writable.
    pub(crate) fn quarantine(&self, table: Table, key: &[u8], err: &CoreError) -> CoreResult<()> {
        self.corruption.store(true, Ordering::Release);
        let removed = !self.engine.is_read_only();
        warn!(
            table = %table,
            key = %hex::encode(key),
            error = %err,
            removed,
            "corruption detected in local metadata repository; skipping record"
        );
        if removed {
            self.engine.delete(table, key)?;
        }
        Ok(())
    }

    pub(crate) fn write(&self, batch: WriteBatch) -> CoreResult<Vec<bool>> {
        Ok(self.engine.write(batch)?)
    }
}

/// Appends a put of `record` under its own key.
pub(crate) fn put_record<V: Record>(batch: &mut WriteBatch, record: &V) -> CoreResult<()> {
    put_record_at(batch, V::TABLE, record)
}

/// Appends a put of `record` into `table`, keyed as usual.
pub(crate) fn put_record_at<V: Record>(
    batch: &mut WriteBatch,
    table: Table,
    record: &V,
) -> CoreResult<()> {
    batch.put(table, record.key()?, value::encode(record)?);
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::Block;
    use keeper_storage::{EngineFactory, InMemoryEngine, InMemoryFactory};
    use std::path::Path;

    #[test]
    fn scans_quarantine_corrupt_records() {
        let engine = InMemoryEngine::new();
        let corruption = AtomicBool::new(false);
        let records = Records::new(&engine, &corruption);

        let mut batch = WriteBatch::new();
        put_record(&mut batch, &Block::new("a", "loc", 1)).unwrap();
        put_record(&mut batch, &Block::new("c", "loc", 1)).unwrap();
        batch.put(Table::Blocks, b"b".to_vec(), vec![0x09, 0x09]);
        records.write(batch).unwrap();

        let page = records
            .page::<Block>(Table::Blocks, &KeyRange::all(), Direction::Ascending, 10, true)
            .unwrap();
        let hashes: Vec<_> = page.entries.iter().map(|(_, b)| b.hash.as_str()).collect();
        assert_eq!(hashes, vec!["a", "c"]);
        assert!(page.resume.is_none());
        assert!(corruption.load(Ordering::Acquire));
        assert_eq!(engine.get(Table::Blocks, b"b").unwrap(), None);
    }

    #[test]
    fn read_only_scans_flag_corruption_and_keep_the_record() {
        let factory = InMemoryFactory::new();
        let path = Path::new("/repo");
        let writer = factory.open(path, false).unwrap();
        let mut batch = WriteBatch::new();
        put_record(&mut batch, &Block::new("a", "loc", 1)).unwrap();
        batch.put(Table::Blocks, b"bad".to_vec(), vec![0xee]);
        writer.write(batch).unwrap();
        writer.close().unwrap();

        let reader = factory.open(path, true).unwrap();
        let corruption = AtomicBool::new(false);
        let records = Records::new(&*reader, &corruption);
        let page = records
            .page::<Block>(Table::Blocks, &KeyRange::all(), Direction::Ascending, 10, true)
            .unwrap();

        assert_eq!(page.entries.len(), 1);
        assert_eq!(page.entries[0].1.hash, "a");
        assert!(corruption.load(Ordering::Acquire));
        assert_eq!(reader.count(Table::Blocks).unwrap(), 2);
        assert_eq!(reader.get(Table::Blocks, b"bad").unwrap(), Some(vec![0xee]));
    }

    #[test]
    fn strict_scans_and_point_reads_report_corruption() {
        let engine = InMemoryEngine::new();
        let corruption = AtomicBool::new(false);
        let records = Records::new(&engine, &corruption);
        engine.put(Table::Blocks, b"b", &[0x09]).unwrap();

        assert!(matches!(
            records.get::<Block>(b"b"),
            Err(CoreError::Corruption { .. })
        ));
        assert!(records
            .page::<Block>(Table::Blocks, &KeyRange::all(), Direction::Ascending, 10, false)
            .is_err());
        assert!(engine.get(Table::Blocks, b"b").unwrap().is_some());
    }

    #[test]
    fn collect_pages_through_everything() {
        let engine = InMemoryEngine::new();
        let corruption = AtomicBool::new(false);
        let records = Records::new(&engine, &corruption);
        let mut batch = WriteBatch::new();
        for i in 0..25 {
            put_record(&mut batch, &Block::new(format!("h{i:02}"), "loc", 1)).unwrap();
        }
        records.write(batch).unwrap();

        let all = records
            .collect::<Block>(&KeyRange::all(), Direction::Descending, 4)
            .unwrap();
        assert_eq!(all.len(), 25);
        assert_eq!(all[0].1.hash, "h24");
    }
}
