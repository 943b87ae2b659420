//! Entity operations of the repository.

use super::Repository;
use crate::clock::Timestamp;
use crate::error::{CoreError, CoreResult};
use crate::key::{
    hashed_paths_range, pair_key, pair_prefix, prefix_range, version_key, version_range, PathKey,
    MAX_DIRECT_PATH_LEN, NO_TIMESTAMP,
};
use crate::model::{
    ActivePath, AdditionalBlock, Block, DirectorySnapshot, FilePart, FileVersion, PartialFile,
    PendingSetSchedule, Record, Versioned,
};
use crate::store::{put_record, Records};
use keeper_storage::{Direction, KeyRange, Table, WriteBatch};
use std::collections::btree_map::Entry;
use std::collections::{BTreeMap, BTreeSet, VecDeque};
use std::marker::PhantomData;

/// Page size for point-in-time version lookups.
const LOOKUP_PAGE: usize = 16;

pub(crate) fn latest_version<V: Versioned>(
    records: &Records<'_>,
    path: &str,
    at: Option<Timestamp>,
) -> CoreResult<Option<V>> {
    let mut range = version_range(path, at);
    loop {
        let page = records.page::<V>(V::TABLE, &range, Direction::Descending, LOOKUP_PAGE, true)?;
        // Keys of paths containing NUL can fall inside another path's range.
        if let Some((_, record)) = page.entries.into_iter().find(|(_, r)| r.path() == path) {
            return Ok(Some(record));
        }
        match page.resume {
            Some(last) => range = range.resume_after(&last, Direction::Descending),
            None => return Ok(None),
        }
    }
}

fn all_versions<V: Versioned>(
    records: &Records<'_>,
    path: &str,
    at: Option<Timestamp>,
    page_size: usize,
) -> CoreResult<Vec<V>> {
    Ok(records
        .collect::<V>(&version_range(path, at), Direction::Ascending, page_size)?
        .into_iter()
        .map(|(_, record)| record)
        .filter(|record| record.path() == path)
        .collect())
}

/// Newest version of every path starting with `prefix`.
///
/// Direct paths are read from the prefix's own key range. Hashed paths
/// carry no prefix in their keys, so when any are stored the whole hashed
/// region is read as well; that part costs O(hashed paths), not O(range).
/// Pages are folded as they arrive, keeping one record per path.
fn latest_with_prefix<V: Versioned>(
    records: &Records<'_>,
    prefix: &str,
    direction: Direction,
    page_size: usize,
) -> CoreResult<Vec<V>> {
    let mut latest: BTreeMap<String, V> = BTreeMap::new();
    let mut visit = |record: V| {
        if !record.path().starts_with(prefix) {
            return;
        }
        match latest.entry(record.path().to_owned()) {
            Entry::Vacant(slot) => {
                slot.insert(record);
            }
            Entry::Occupied(mut slot) => {
                if slot.get().added() < record.added() {
                    slot.insert(record);
                }
            }
        }
    };

    if prefix.len() <= MAX_DIRECT_PATH_LEN {
        fold_range(records, prefix_range(prefix.as_bytes()), page_size, &mut visit)?;
    }
    if has_hashed_paths(records, V::TABLE)? {
        fold_range(records, hashed_paths_range(), page_size, &mut visit)?;
    }

    let ordered = latest.into_values();
    Ok(match direction {
        Direction::Ascending => ordered.collect(),
        Direction::Descending => ordered.rev().collect(),
    })
}

fn fold_range<V: Versioned>(
    records: &Records<'_>,
    mut range: KeyRange,
    page_size: usize,
    visit: &mut impl FnMut(V),
) -> CoreResult<()> {
    loop {
        let page = records.page::<V>(V::TABLE, &range, Direction::Ascending, page_size, true)?;
        page.entries.into_iter().for_each(|(_, record)| visit(record));
        match page.resume {
            Some(last) => range = range.resume_after(&last, Direction::Ascending),
            None => return Ok(()),
        }
    }
}

/// Returns true if `table` stores any path under its hash.
fn has_hashed_paths(records: &Records<'_>, table: Table) -> CoreResult<bool> {
    Ok(!records
        .engine()
        .scan(table, &hashed_paths_range(), Direction::Ascending, 1)?
        .is_empty())
}

fn check_timestamp(added: Timestamp) -> CoreResult<()> {
    if added == NO_TIMESTAMP {
        return Err(CoreError::invalid_key("timestamp u64::MAX is reserved"));
    }
    Ok(())
}

impl Repository {
    fn page_size(&self) -> usize {
        self.config().scan_page_size.max(1)
    }

    fn put_one<V: Record>(&self, record: &V) -> CoreResult<()> {
        let mut batch = WriteBatch::new();
        put_record(&mut batch, record)?;
        self.with_writer(|records| records.write(batch).map(|_| ()))
    }

    fn delete_one(&self, table: Table, key: Vec<u8>) -> CoreResult<bool> {
        let mut batch = WriteBatch::new();
        batch.delete(table, key);
        self.with_writer(|records| Ok(records.write(batch)?.first().copied().unwrap_or(false)))
    }

    // ---- file versions ------------------------------------------------

    /// Records a file version and drops the path's partial upload.
    ///
    /// # Errors
    ///
    /// Returns [`CoreError::ReadOnly`] on read-only repositories.
    pub fn put_file_version(&self, version: &FileVersion) -> CoreResult<()> {
        self.put_file_version_with_parts(version, &[])
    }

    /// Records a file version together with its part mappings in one batch.
    ///
    /// # Errors
    ///
    /// Returns [`CoreError::ReadOnly`] on read-only repositories.
    pub fn put_file_version_with_parts(
        &self,
        version: &FileVersion,
        parts: &[FilePart],
    ) -> CoreResult<()> {
        check_timestamp(version.added)?;
        let mut batch = WriteBatch::new();
        put_record(&mut batch, version)?;
        for part in parts {
            put_record(&mut batch, part)?;
        }
        batch.delete(Table::PartialFiles, PathKey::for_path(&version.path).to_bytes());
        self.with_writer(|records| records.write(batch).map(|_| ()))
    }

    /// Returns the most recent version of `path` added at or before `at`,
    /// or the latest version for `None`.
    pub fn file_version(&self, path: &str, at: Option<Timestamp>) -> CoreResult<Option<FileVersion>> {
        self.with_records(|records| latest_version(records, path, at))
    }

    /// Returns the version of `path` added exactly at `added`.
    pub fn file_version_exact(&self, path: &str, added: Timestamp) -> CoreResult<Option<FileVersion>> {
        self.with_records(|records| records.get(&version_key(path, added)))
    }

    /// Returns every version of `path`, oldest first.
    pub fn file_versions(&self, path: &str) -> CoreResult<Vec<FileVersion>> {
        self.with_records(|records| all_versions(records, path, None, self.page_size()))
    }

    /// Returns true if any version of `path` exists.
    pub fn has_file(&self, path: &str) -> CoreResult<bool> {
        Ok(self.file_version(path, None)?.is_some())
    }

    /// Deletes one version; returns whether it existed.
    pub fn delete_file_version(&self, path: &str, added: Timestamp) -> CoreResult<bool> {
        self.delete_one(Table::FileVersions, version_key(path, added))
    }

    /// Returns the latest version of every path starting with `prefix`,
    /// ordered by path.
    pub fn files_with_prefix(&self, prefix: &str, direction: Direction) -> CoreResult<Vec<FileVersion>> {
        self.with_records(|records| latest_with_prefix(records, prefix, direction, self.page_size()))
    }

    // ---- directories ----------------------------------------------------

    /// Records a directory snapshot.
    ///
    /// # Errors
    ///
    /// Returns [`CoreError::ReadOnly`] on read-only repositories.
    pub fn put_directory(&self, snapshot: &DirectorySnapshot) -> CoreResult<()> {
        check_timestamp(snapshot.added)?;
        self.put_one(snapshot)
    }

    /// Returns the most recent snapshot of `path` added at or before `at`,
    /// or the latest snapshot for `None`.
    pub fn directory(&self, path: &str, at: Option<Timestamp>) -> CoreResult<Option<DirectorySnapshot>> {
        self.with_records(|records| latest_version(records, path, at))
    }

    /// Returns every snapshot of `path`, oldest first.
    pub fn directory_versions(&self, path: &str) -> CoreResult<Vec<DirectorySnapshot>> {
        self.with_records(|records| all_versions(records, path, None, self.page_size()))
    }

    /// Returns the union of children over every snapshot of `path` up to
    /// `at`. A deleted snapshot resets the union.
    pub fn directory_children_at(&self, path: &str, at: Option<Timestamp>) -> CoreResult<BTreeSet<String>> {
        let snapshots: Vec<DirectorySnapshot> =
            self.with_records(|records| all_versions(records, path, at, self.page_size()))?;
        let mut children = BTreeSet::new();
        for snapshot in snapshots {
            if snapshot.deleted {
                children.clear();
            } else {
                children.extend(snapshot.children);
            }
        }
        Ok(children)
    }

    /// Deletes one snapshot; returns whether it existed.
    pub fn delete_directory(&self, path: &str, added: Timestamp) -> CoreResult<bool> {
        self.delete_one(Table::Directories, version_key(path, added))
    }

    /// Returns the latest snapshot of every directory starting with
    /// `prefix`, ordered by path.
    pub fn directories_with_prefix(
        &self,
        prefix: &str,
        direction: Direction,
    ) -> CoreResult<Vec<DirectorySnapshot>> {
        self.with_records(|records| latest_with_prefix(records, prefix, direction, self.page_size()))
    }

    // ---- blocks -----------------------------------------------------------

    /// Stores a block.
    pub fn put_block(&self, block: &Block) -> CoreResult<()> {
        self.put_one(block)
    }

    /// Returns the block with content hash `hash`.
    pub fn block(&self, hash: &str) -> CoreResult<Option<Block>> {
        self.with_records(|records| records.get(hash.as_bytes()))
    }

    /// Returns true if a block with content hash `hash` exists.
    pub fn has_block(&self, hash: &str) -> CoreResult<bool> {
        self.with_records(|records| records.contains(Table::Blocks, hash.as_bytes()))
    }

    /// Deletes a block; returns whether it existed.
    pub fn delete_block(&self, hash: &str) -> CoreResult<bool> {
        self.delete_one(Table::Blocks, hash.as_bytes().to_vec())
    }

    // ---- file parts ---------------------------------------------------------

    /// Stores a part mapping.
    pub fn put_file_part(&self, part: &FilePart) -> CoreResult<()> {
        self.put_one(part)
    }

    /// Returns every block mapping of `part_hash`, ordered by block hash.
    pub fn file_parts(&self, part_hash: &str) -> CoreResult<Vec<FilePart>> {
        let range = prefix_range(&pair_prefix(part_hash)?);
        self.with_records(|records| {
            let parts = records.collect::<FilePart>(&range, Direction::Ascending, self.page_size())?;
            Ok(parts.into_iter().map(|(_, part)| part).collect())
        })
    }

    /// Deletes one part mapping; returns whether it existed.
    pub fn delete_file_part(&self, part_hash: &str, block_hash: &str) -> CoreResult<bool> {
        self.delete_one(Table::FileParts, pair_key(part_hash, block_hash.as_bytes())?)
    }

    // ---- active paths ---------------------------------------------------------

    /// Returns the scan state of `path` in backup set `set_id`.
    pub fn active_path(&self, set_id: &str, path: &str) -> CoreResult<Option<ActivePath>> {
        let key = pair_key(set_id, &PathKey::for_path(path).to_bytes())?;
        self.with_records(|records| records.get(&key))
    }

    /// Stores scan state.
    pub fn put_active_path(&self, entry: &ActivePath) -> CoreResult<()> {
        self.put_one(entry)
    }

    /// Deletes scan state; returns whether it existed.
    pub fn delete_active_path(&self, set_id: &str, path: &str) -> CoreResult<bool> {
        let key = pair_key(set_id, &PathKey::for_path(path).to_bytes())?;
        self.delete_one(Table::ActivePaths, key)
    }

    /// Returns every scan state entry of backup set `set_id`.
    pub fn active_paths(&self, set_id: &str) -> CoreResult<Vec<ActivePath>> {
        let range = prefix_range(&pair_prefix(set_id)?);
        self.with_records(|records| {
            let entries = records.collect::<ActivePath>(&range, Direction::Ascending, self.page_size())?;
            Ok(entries.into_iter().map(|(_, entry)| entry).collect())
        })
    }

    /// Deletes every scan state entry of backup set `set_id`; returns how
    /// many were removed.
    pub fn clear_active_paths(&self, set_id: &str) -> CoreResult<usize> {
        let range = prefix_range(&pair_prefix(set_id)?);
        self.with_writer(|records| delete_range(records, Table::ActivePaths, &range, self.page_size()))
    }

    // ---- pending sets -----------------------------------------------------------

    /// Stores a set schedule.
    pub fn put_pending_set(&self, schedule: &PendingSetSchedule) -> CoreResult<()> {
        self.put_one(schedule)
    }

    /// Returns the schedule of `set_id`.
    pub fn pending_set(&self, set_id: &str) -> CoreResult<Option<PendingSetSchedule>> {
        self.with_records(|records| records.get(set_id.as_bytes()))
    }

    /// Returns every set schedule, ordered by set id.
    pub fn pending_sets(&self) -> CoreResult<Vec<PendingSetSchedule>> {
        self.with_records(|records| {
            let all = records.collect::<PendingSetSchedule>(&KeyRange::all(), Direction::Ascending, self.page_size())?;
            Ok(all.into_iter().map(|(_, schedule)| schedule).collect())
        })
    }

    /// Deletes the schedule of `set_id`; returns whether it existed.
    pub fn delete_pending_set(&self, set_id: &str) -> CoreResult<bool> {
        self.delete_one(Table::PendingSets, set_id.as_bytes().to_vec())
    }

    // ---- shares -------------------------------------------------------------------

    /// Stores share-specific block metadata.
    pub fn put_additional_block(&self, block: &AdditionalBlock) -> CoreResult<()> {
        self.put_one(block)
    }

    /// Returns the metadata of `block_hash` for share `public_key`.
    pub fn additional_block(&self, public_key: &str, block_hash: &str) -> CoreResult<Option<AdditionalBlock>> {
        let key = pair_key(public_key, block_hash.as_bytes())?;
        self.with_records(|records| records.get(&key))
    }

    /// Returns every block of share `public_key`.
    pub fn additional_blocks(&self, public_key: &str) -> CoreResult<Vec<AdditionalBlock>> {
        let range = prefix_range(&pair_prefix(public_key)?);
        self.with_records(|records| {
            let blocks = records.collect::<AdditionalBlock>(&range, Direction::Ascending, self.page_size())?;
            Ok(blocks.into_iter().map(|(_, block)| block).collect())
        })
    }

    /// Deletes every block of share `public_key`; returns how many were
    /// removed.
    pub fn remove_share(&self, public_key: &str) -> CoreResult<usize> {
        let range = prefix_range(&pair_prefix(public_key)?);
        self.with_writer(|records| {
            let removed = delete_range(records, Table::AdditionalBlocks, &range, self.page_size())?;
            tracing::info!(removed, "removed share");
            Ok(removed)
        })
    }

    // ---- partial files --------------------------------------------------------------

    /// Stores in-flight upload state.
    pub fn put_partial_file(&self, partial: &PartialFile) -> CoreResult<()> {
        self.put_one(partial)
    }

    /// Returns the in-flight upload of `path`.
    pub fn partial_file(&self, path: &str) -> CoreResult<Option<PartialFile>> {
        let key = PathKey::for_path(path).to_bytes();
        self.with_records(|records| records.get(&key))
    }

    /// Deletes the in-flight upload of `path`; returns whether it existed.
    pub fn delete_partial_file(&self, path: &str) -> CoreResult<bool> {
        self.delete_one(Table::PartialFiles, PathKey::for_path(path).to_bytes())
    }

    // ---- full-table scans -------------------------------------------------------------

    /// Streams every record of `V`'s table in key order.
    ///
    /// Corrupt records are quarantined and skipped unless
    /// [`EntityScan::skip_corrupt`] turns that off.
    pub fn scan<V: Record>(&self, direction: Direction) -> EntityScan<'_, V> {
        self.scan_range(KeyRange::all(), direction)
    }

    /// Streams the records of `V`'s table inside `range`.
    pub fn scan_range<V: Record>(&self, range: KeyRange, direction: Direction) -> EntityScan<'_, V> {
        EntityScan {
            repo: self,
            table: V::TABLE,
            range: Some(range),
            direction,
            skip_corrupt: true,
            page_size: self.page_size(),
            buffer: VecDeque::new(),
            _record: PhantomData,
        }
    }
}

/// Deletes every key of `range`, page by page.
pub(crate) fn delete_range(
    records: &Records<'_>,
    table: Table,
    range: &KeyRange,
    page_size: usize,
) -> CoreResult<usize> {
    let mut removed = 0;
    loop {
        let page = records.engine().scan(table, range, Direction::Ascending, page_size)?;
        if page.is_empty() {
            return Ok(removed);
        }
        let mut batch = WriteBatch::new();
        for (key, _) in page {
            batch.delete(table, key);
        }
        removed += batch.len();
        records.write(batch)?;
    }
}

/// Iterator over the records of one table.
///
/// Each page is fetched under its own acquisition of the operation lock,
/// so other threads interleave between pages. Long-running consumers poll
/// [`EntityScan::is_requested`] and stop early when it turns true.
pub struct EntityScan<'r, V> {
    repo: &'r Repository,
    table: Table,
    range: Option<KeyRange>,
    direction: Direction,
    skip_corrupt: bool,
    page_size: usize,
    buffer: VecDeque<V>,
    _record: PhantomData<V>,
}

impl<V> EntityScan<'_, V> {
    /// Sets whether corrupt records are skipped (the default) or end the
    /// scan with [`CoreError::Corruption`].
    #[must_use]
    pub fn skip_corrupt(mut self, skip: bool) -> Self {
        self.skip_corrupt = skip;
        self
    }

    /// Sets how many records are fetched per page.
    #[must_use]
    pub fn page_size(mut self, size: usize) -> Self {
        self.page_size = size.max(1);
        self
    }

    /// Returns true if another thread is waiting for the operation lock.
    #[must_use]
    pub fn is_requested(&self) -> bool {
        self.repo.is_operation_requested()
    }
}

impl<V: Record> Iterator for EntityScan<'_, V> {
    type Item = CoreResult<V>;

    fn next(&mut self) -> Option<Self::Item> {
        loop {
            if let Some(record) = self.buffer.pop_front() {
                return Some(Ok(record));
            }
            let range = self.range.take()?;
            let page = self.repo.with_records(|records| {
                records.page::<V>(self.table, &range, self.direction, self.page_size, self.skip_corrupt)
            });
            match page {
                Ok(page) => {
                    self.range = page
                        .resume
                        .map(|last| range.resume_after(&last, self.direction));
                    self.buffer.extend(page.entries.into_iter().map(|(_, record)| record));
                }
                Err(err) => return Some(Err(err)),
            }
        }
    }
}
