//! The pending update queue.
//!
//! Change notifications are coalesced into at most one scheduled recheck
//! per path. Two tables hold the queue and always move together:
//!
//! - [`Table::PendingUpdates`]: path hash to [`PendingUpdate`]
//! - [`Table::PendingUpdateQueue`]: (due, path hash) to [`PendingUpdate`],
//!   consumed in due order
//!
//! Every operation here takes the update lock before the operation lock.

use crate::clock::Timestamp;
use crate::error::CoreResult;
use crate::key::{decode_queue_key, path_hash, queue_key, PathKey};
use crate::model::{DirectorySnapshot, FileVersion, PartialFile, PendingUpdate};
use crate::repository::{latest_version, Repository};
use crate::store::{put_record, Records};
use crate::value;
use keeper_storage::{Direction, KeyRange, Table, WriteBatch};
use std::ops::Bound;
use tracing::{debug, trace};

/// What a due-update handler wants done with the entry it was given.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum UpdateDisposition {
    /// Processing finished; drop the entry.
    Done,
    /// Check the path again at the given time.
    Reschedule(Timestamp),
}

/// Most recent known state of `path`: its latest directory snapshot, else
/// its in-flight upload, else its latest file version.
fn last_existing(records: &Records<'_>, path: &str) -> CoreResult<Option<Timestamp>> {
    if let Some(dir) = latest_version::<DirectorySnapshot>(records, path, None)? {
        return Ok(Some(dir.added));
    }
    if let Some(partial) = records.get::<PartialFile>(&PathKey::for_path(path).to_bytes())? {
        return Ok(Some(partial.started));
    }
    Ok(latest_version::<FileVersion>(records, path, None)?.map(|file| file.added))
}

/// Moves `update` to `due`, keeping both tables in step.
fn reschedule(batch: &mut WriteBatch, update: &mut PendingUpdate, due: Timestamp) -> CoreResult<()> {
    let hash = path_hash(&update.path);
    batch.delete(Table::PendingUpdateQueue, queue_key(update.due, &hash));
    update.due = due;
    insert(batch, update)
}

fn insert(batch: &mut WriteBatch, update: &PendingUpdate) -> CoreResult<()> {
    put_record(batch, update)?;
    batch.put(
        Table::PendingUpdateQueue,
        queue_key(update.due, &path_hash(&update.path)),
        value::encode(update)?,
    );
    Ok(())
}

fn remove(batch: &mut WriteBatch, update: &PendingUpdate) {
    let hash = path_hash(&update.path);
    batch.delete(Table::PendingUpdates, hash.to_vec());
    batch.delete(Table::PendingUpdateQueue, queue_key(update.due, &hash));
}

impl Repository {
    /// Records a change notification for `path` and returns when the path
    /// is due for a recheck.
    ///
    /// `interval_ms` is the backup set's minimum re-scan interval. A new
    /// entry is due at `max(now, last_existing + interval_ms)` plus the
    /// configured minimum wait. A repeated notification only pushes an
    /// existing entry later, to `now` plus the minimum wait. A negative
    /// interval schedules the path for `now` unconditionally.
    ///
    /// # Errors
    ///
    /// Returns [`crate::CoreError::ReadOnly`] on read-only repositories.
    pub fn schedule_update(&self, path: &str, interval_ms: i64) -> CoreResult<Timestamp> {
        let _update = self.acquire_update_lock();
        let now = self.now();
        let min_wait = self.config().debounce_min_wait_ms;

        self.with_writer(|records| {
            let existing = records.get::<PendingUpdate>(&path_hash(path))?;
            let mut batch = WriteBatch::new();

            let due = match existing {
                Some(mut update) => {
                    let candidate = if interval_ms < 0 {
                        Some(now)
                    } else {
                        let later = now.saturating_add(min_wait);
                        (later > update.due).then_some(later)
                    };
                    update.last_updated = now;
                    match candidate {
                        Some(due) => reschedule(&mut batch, &mut update, due)?,
                        None => put_record(&mut batch, &update)?,
                    }
                    update.due
                }
                None => {
                    let due = if interval_ms < 0 {
                        now
                    } else {
                        let earliest = last_existing(records, path)?
                            .map_or(now, |last| last.saturating_add(interval_ms.unsigned_abs()));
                        now.max(earliest).saturating_add(min_wait)
                    };
                    insert(
                        &mut batch,
                        &PendingUpdate {
                            path: path.to_owned(),
                            due,
                            last_updated: now,
                        },
                    )?;
                    due
                }
            };

            records.write(batch)?;
            trace!(path, due, "scheduled pending update");
            Ok(due)
        })
    }

    /// Returns the pending update for `path`, if any.
    pub fn pending_update(&self, path: &str) -> CoreResult<Option<PendingUpdate>> {
        let _update = self.acquire_update_lock();
        self.with_records(|records| records.get(&path_hash(path)))
    }

    /// Returns how many paths are queued.
    pub fn pending_update_count(&self) -> CoreResult<u64> {
        let _update = self.acquire_update_lock();
        self.with_records(|records| Ok(records.engine().count(Table::PendingUpdates)?))
    }

    /// Returns the earliest due time in the queue.
    pub fn next_due_update(&self) -> CoreResult<Option<Timestamp>> {
        let _update = self.acquire_update_lock();
        self.with_records(|records| {
            let first = records.engine().scan(
                Table::PendingUpdateQueue,
                &KeyRange::all(),
                Direction::Ascending,
                1,
            )?;
            match first.first() {
                Some((key, _)) => Ok(Some(decode_queue_key(key)?.0)),
                None => Ok(None),
            }
        })
    }

    /// Drops the pending update for `path`; returns whether one existed.
    pub fn remove_pending_update(&self, path: &str) -> CoreResult<bool> {
        let _update = self.acquire_update_lock();
        self.with_writer(|records| {
            let Some(update) = records.get::<PendingUpdate>(&path_hash(path))? else {
                return Ok(false);
            };
            let mut batch = WriteBatch::new();
            remove(&mut batch, &update);
            records.write(batch)?;
            Ok(true)
        })
    }

    /// Hands every entry due by now to `handler`, in due order.
    ///
    /// The handler runs without any repository lock held, so it may call
    /// back into the repository. An entry is dropped or rescheduled after
    /// its handler returns unless a newer notification moved it meanwhile.
    /// Entries rescheduled during this call are not revisited by it.
    ///
    /// Returns how many entries were handled.
    ///
    /// # Errors
    ///
    /// Stops at the first handler or storage error; the failing entry stays
    /// queued.
    pub fn process_due_updates<F>(&self, mut handler: F) -> CoreResult<usize>
    where
        F: FnMut(&PendingUpdate) -> CoreResult<UpdateDisposition>,
    {
        let cutoff = self.now();
        let end = queue_key(cutoff, &[u8::MAX; 32]);
        let mut range = KeyRange::new(Bound::Unbounded, Bound::Included(end));
        let mut handled = 0;

        loop {
            let next = {
                let _update = self.acquire_update_lock();
                self.with_writer(|records| {
                    let page = records.page::<PendingUpdate>(
                        Table::PendingUpdateQueue,
                        &range,
                        Direction::Ascending,
                        1,
                        true,
                    )?;
                    Ok(page.resume.map(|key| (key, page.entries)))
                })?
            };
            let Some((key, entries)) = next else {
                return Ok(handled);
            };
            range = range.resume_after(&key, Direction::Ascending);
            let Some((_, queued)) = entries.into_iter().next() else {
                continue;
            };

            let disposition = handler(&queued)?;
            handled += 1;

            let _update = self.acquire_update_lock();
            self.with_writer(|records| {
                let current = records.get::<PendingUpdate>(&path_hash(&queued.path))?;
                let mut batch = WriteBatch::new();
                match current {
                    Some(mut current) if current.due == queued.due => match disposition {
                        UpdateDisposition::Done => remove(&mut batch, &current),
                        UpdateDisposition::Reschedule(due) => {
                            reschedule(&mut batch, &mut current, due)?;
                        }
                    },
                    Some(_) => debug!(path = %queued.path, "pending update moved while processing"),
                    None => {
                        batch.delete(Table::PendingUpdateQueue, key.clone());
                    }
                }
                records.write(batch)?;
                Ok(())
            })?;
        }
    }
}
