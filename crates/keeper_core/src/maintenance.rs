//! Repair and compaction passes.

use crate::error::{CoreError, CoreResult};
use crate::key::{path_hash, queue_key};
use crate::model::{Block, PendingUpdate, Record};
use crate::repository::Repository;
use crate::store::put_record_at;
use crate::value;
use keeper_storage::{Direction, KeyRange, Table, TempMap, WriteBatch};
use sha2::{Digest, Sha256};
use tracing::{info, warn};

/// Result of [`Repository::rebuild_update_queue`].
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct QueueRepair {
    /// Pending updates examined.
    pub updates: usize,
    /// Queue entries with no matching pending update, removed.
    pub orphaned: usize,
    /// Pending updates missing from the queue, re-inserted.
    pub restored: usize,
}

/// Result of [`Repository::rewrite_blocks`].
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct BlockRewrite {
    /// Blocks carried into the new table.
    pub kept: usize,
    /// Blocks the rewrite dropped.
    pub dropped: usize,
}

impl Repository {
    /// Re-derives the pending update queue from the pending update map.
    ///
    /// The expected queue is sorted in a [`TempMap`] first, so the pass
    /// needs no memory proportional to the queue.
    ///
    /// # Errors
    ///
    /// Returns [`crate::CoreError::ReadOnly`] on read-only repositories.
    pub fn rebuild_update_queue(&self) -> CoreResult<QueueRepair> {
        let _update = self.acquire_update_lock();
        let page_size = self.config().scan_page_size.max(1);

        self.with_writer(|records| {
            let mut repair = QueueRepair::default();
            let mut expected = TempMap::new()?;
            let mut range = KeyRange::all();
            loop {
                let page = records.page::<PendingUpdate>(
                    Table::PendingUpdates,
                    &range,
                    Direction::Ascending,
                    page_size,
                    true,
                )?;
                let mut sorted = Vec::with_capacity(page.entries.len());
                for (_, update) in &page.entries {
                    sorted.push((queue_key(update.due, &path_hash(&update.path)), value::encode(update)?));
                }
                repair.updates += sorted.len();
                expected.insert_all(&sorted)?;
                match page.resume {
                    Some(last) => range = range.resume_after(&last, Direction::Ascending),
                    None => break,
                }
            }

            let engine = records.engine();
            let mut range = KeyRange::all();
            loop {
                let page = engine.scan(Table::PendingUpdateQueue, &range, Direction::Ascending, page_size)?;
                let mut batch = WriteBatch::new();
                for (key, _) in &page {
                    if expected.get(key)?.is_none() {
                        batch.delete(Table::PendingUpdateQueue, key.clone());
                    }
                }
                repair.orphaned += batch.len();
                if !batch.is_empty() {
                    records.write(batch)?;
                }
                match page.last() {
                    Some((last, _)) if page.len() >= page_size => {
                        range = range.resume_after(last, Direction::Ascending);
                    }
                    _ => break,
                }
            }

            let mut range = KeyRange::all();
            loop {
                let page = expected.scan(&range, page_size)?;
                let mut batch = WriteBatch::new();
                for (key, encoded) in &page {
                    if engine.get(Table::PendingUpdateQueue, key)?.is_none() {
                        batch.put(Table::PendingUpdateQueue, key.clone(), encoded.clone());
                    }
                }
                repair.restored += batch.len();
                if !batch.is_empty() {
                    records.write(batch)?;
                }
                match page.last() {
                    Some((last, _)) if page.len() >= page_size => {
                        range = range.resume_after(last, Direction::Ascending);
                    }
                    _ => break,
                }
            }

            if repair.orphaned > 0 || repair.restored > 0 {
                warn!(
                    orphaned = repair.orphaned,
                    restored = repair.restored,
                    "repaired pending update queue"
                );
            }
            Ok(repair)
        })
    }

    /// Compacts the block table.
    ///
    /// Every live block is passed to `rewrite`; the blocks it returns are
    /// written to the alternate table, which then replaces the live table
    /// in one step. The copy runs page by page with `rewrite` called outside
    /// every lock, so the live table stays readable and writable until the
    /// swap. Exclusive access is taken only for the swap, after blocks
    /// written or deleted during the copy are carried over.
    ///
    /// `rewrite` may change anything but the block hash.
    ///
    /// # Errors
    ///
    /// Returns [`CoreError::ReadOnly`] on read-only repositories,
    /// [`CoreError::AlreadyLocked`] when called while this thread holds an
    /// exclusive guard and [`CoreError::InvalidState`] if `rewrite` changes
    /// a hash.
    pub fn rewrite_blocks<F>(&self, mut rewrite: F) -> CoreResult<BlockRewrite>
    where
        F: FnMut(Block) -> Option<Block>,
    {
        if self.is_read_only() {
            return Err(CoreError::ReadOnly);
        }
        let shared = self.shared();
        if shared.is_exclusive() && shared.operation.is_owned_by_current_thread() {
            return Err(CoreError::AlreadyLocked);
        }
        let page_size = self.config().scan_page_size.max(1);

        self.with_writer(|records| {
            let mut clear = WriteBatch::new();
            clear.clear(Table::BlocksAlternate);
            records.write(clear).map(drop)
        })?;

        // Digest of each live value as it was copied, by key.
        let mut copied = TempMap::new()?;
        let mut range = KeyRange::all();
        loop {
            let page = self.with_records(|records| {
                Ok(records
                    .engine()
                    .scan(Table::Blocks, &range, Direction::Ascending, page_size)?)
            })?;
            let resume = match page.last() {
                Some((last, _)) if page.len() >= page_size => Some(last.clone()),
                _ => None,
            };

            let mut batch = WriteBatch::new();
            let mut seen = Vec::with_capacity(page.len());
            for (key, bytes) in page {
                match value::decode::<Block>(&bytes) {
                    Ok(block) => carry(&mut batch, &key, rewrite(block))?,
                    Err(err) => {
                        self.with_writer(|records| records.quarantine(Table::Blocks, &key, &err))?;
                        continue;
                    }
                }
                seen.push((key, digest(&bytes)));
            }
            copied.insert_all(&seen)?;
            if !batch.is_empty() {
                self.with_writer(|records| records.write(batch).map(drop))?;
            }
            match resume {
                Some(last) => range = range.resume_after(&last, Direction::Ascending),
                None => break,
            }
        }

        let _exclusive = self.acquire_exclusive_lock()?;
        self.with_writer(|records| {
            let engine = records.engine();
            let mut late = 0;

            let mut range = KeyRange::all();
            loop {
                let page = engine.scan(Table::Blocks, &range, Direction::Ascending, page_size)?;
                let mut batch = WriteBatch::new();
                for (key, bytes) in &page {
                    if copied.get(key)?.as_deref() == Some(digest(bytes).as_slice()) {
                        continue;
                    }
                    late += 1;
                    match value::decode::<Block>(bytes) {
                        Ok(block) => carry(&mut batch, key, rewrite(block))?,
                        Err(err) => {
                            records.quarantine(Table::Blocks, key, &err)?;
                            batch.delete(Table::BlocksAlternate, key.clone());
                        }
                    }
                }
                if !batch.is_empty() {
                    records.write(batch)?;
                }
                match page.last() {
                    Some((last, _)) if page.len() >= page_size => {
                        range = range.resume_after(last, Direction::Ascending);
                    }
                    _ => break,
                }
            }

            // Blocks deleted from the live table after they were copied.
            let mut range = KeyRange::all();
            loop {
                let page = engine.scan(Table::BlocksAlternate, &range, Direction::Ascending, page_size)?;
                let mut batch = WriteBatch::new();
                for (key, _) in &page {
                    if engine.get(Table::Blocks, key)?.is_none() {
                        batch.delete(Table::BlocksAlternate, key.clone());
                    }
                }
                late += batch.len();
                if !batch.is_empty() {
                    records.write(batch)?;
                }
                match page.last() {
                    Some((last, _)) if page.len() >= page_size => {
                        range = range.resume_after(last, Direction::Ascending);
                    }
                    _ => break,
                }
            }

            let kept = engine.count(Table::BlocksAlternate)?;
            let live = engine.count(Table::Blocks)?;
            let result = BlockRewrite {
                kept: usize::try_from(kept).unwrap_or(usize::MAX),
                dropped: usize::try_from(live.saturating_sub(kept)).unwrap_or(usize::MAX),
            };

            let mut swap = WriteBatch::new();
            swap.swap_blocks();
            records.write(swap)?;
            engine.commit()?;
            info!(kept = result.kept, dropped = result.dropped, late, "rewrote block table");
            Ok(result)
        })
    }
}

/// Queues the outcome of rewriting the live block under `key`.
fn carry(batch: &mut WriteBatch, key: &[u8], rewritten: Option<Block>) -> CoreResult<()> {
    match rewritten {
        Some(block) if block.key()? != key => Err(CoreError::invalid_state(format!(
            "block rewrite changed hash {} to {}",
            String::from_utf8_lossy(key),
            block.hash
        ))),
        Some(block) => put_record_at(batch, Table::BlocksAlternate, &block),
        None => {
            batch.delete(Table::BlocksAlternate, key.to_vec());
            Ok(())
        }
    }
}

fn digest(bytes: &[u8]) -> Vec<u8> {
    Sha256::digest(bytes).to_vec()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::ManualClock;
    use crate::config::RepositoryConfig;
    use keeper_storage::InMemoryFactory;
    use std::sync::{mpsc, Arc};
    use std::thread;
    use std::time::Duration;
    use tempfile::{tempdir, TempDir};

    fn repo() -> (TempDir, Repository) {
        let temp = tempdir().unwrap();
        let repo = Repository::open_with(
            temp.path(),
            RepositoryConfig::default().scan_page_size(2).debounce_min_wait_ms(0),
            Arc::new(InMemoryFactory::new()),
            Arc::new(ManualClock::new(10)),
        )
        .unwrap();
        (temp, repo)
    }

    #[test]
    fn rebuild_repairs_both_directions() {
        let (_temp, repo) = repo();
        for path in ["/a", "/b", "/c"] {
            repo.schedule_update(path, 0).unwrap();
        }
        let lost = queue_key(10, &path_hash("/b"));
        let orphan = queue_key(3, &path_hash("/zzz"));
        repo.with_writer(|records| {
            let mut batch = WriteBatch::new();
            batch.delete(Table::PendingUpdateQueue, lost.clone());
            batch.put(Table::PendingUpdateQueue, orphan.clone(), vec![0]);
            records.write(batch)?;
            Ok(())
        })
        .unwrap();

        let repair = repo.rebuild_update_queue().unwrap();
        assert_eq!(
            repair,
            QueueRepair {
                updates: 3,
                orphaned: 1,
                restored: 1
            }
        );
        assert_eq!(repo.next_due_update().unwrap(), Some(10));
        assert_eq!(repo.rebuild_update_queue().unwrap().restored, 0);
    }

    #[test]
    fn rewrite_swaps_in_filtered_blocks() {
        let (_temp, repo) = repo();
        for i in 0..5 {
            repo.put_block(&Block::new(format!("h{i}"), "old", 1)).unwrap();
        }

        let result = repo
            .rewrite_blocks(|mut block| {
                if block.hash == "h2" {
                    return None;
                }
                block.locations = vec!["new".into()];
                Some(block)
            })
            .unwrap();

        assert_eq!(result, BlockRewrite { kept: 4, dropped: 1 });
        assert!(!repo.has_block("h2").unwrap());
        assert_eq!(repo.block("h0").unwrap().unwrap().locations, vec!["new"]);
        let counts = repo.table_counts().unwrap();
        assert!(counts.contains(&(Table::Blocks, 4)));
        assert!(counts.contains(&(Table::BlocksAlternate, 0)));

        assert!(matches!(
            repo.rewrite_blocks(|mut block| {
                block.hash.push('x');
                Some(block)
            }),
            Err(CoreError::InvalidState { .. })
        ));

        let _guard = repo.acquire_exclusive_lock().unwrap();
        assert!(matches!(repo.rewrite_blocks(Some), Err(CoreError::AlreadyLocked)));
    }

    #[test]
    fn live_blocks_stay_readable_while_rewriting() {
        let (_temp, repo) = repo();
        for i in 0..5 {
            repo.put_block(&Block::new(format!("h{i}"), "old", 1)).unwrap();
        }

        let (started_tx, started_rx) = mpsc::channel();
        let (read_tx, read_rx) = mpsc::channel();
        let mut read_while_rewriting = None;
        thread::scope(|scope| {
            let reader = &repo;
            scope.spawn(move || {
                started_rx.recv().unwrap();
                let _ = read_tx.send(reader.block("h0").unwrap());
            });

            repo.rewrite_blocks(|mut block| {
                if block.hash == "h0" {
                    started_tx.send(()).unwrap();
                    read_while_rewriting = read_rx.recv_timeout(Duration::from_secs(5)).ok();
                }
                block.locations = vec!["new".into()];
                Some(block)
            })
            .unwrap();
        });

        let read = read_while_rewriting.flatten().unwrap();
        assert_eq!(read.locations, vec!["old"]);
        assert_eq!(repo.block("h0").unwrap().unwrap().locations, vec!["new"]);
    }

    #[test]
    fn blocks_changed_during_rewrite_are_carried_into_the_swap() {
        let (_temp, repo) = repo();
        for i in 0..5 {
            repo.put_block(&Block::new(format!("h{i}"), "old", 1)).unwrap();
        }

        let mut first = true;
        let result = repo
            .rewrite_blocks(|mut block| {
                if first {
                    first = false;
                    repo.put_block(&Block::new("h1", "late", 1)).unwrap();
                    repo.put_block(&Block::new("h9", "late", 1)).unwrap();
                    assert!(repo.delete_block("h4").unwrap());
                }
                if block.hash == "h2" {
                    return None;
                }
                block.locations.push("new".into());
                Some(block)
            })
            .unwrap();

        assert_eq!(result, BlockRewrite { kept: 4, dropped: 1 });
        assert_eq!(repo.block("h0").unwrap().unwrap().locations, vec!["old", "new"]);
        assert_eq!(repo.block("h1").unwrap().unwrap().locations, vec!["late", "new"]);
        assert_eq!(repo.block("h9").unwrap().unwrap().locations, vec!["late", "new"]);
        assert!(!repo.has_block("h2").unwrap());
        assert!(!repo.has_block("h4").unwrap());
    }
}
