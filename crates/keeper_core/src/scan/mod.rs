//! Resumable recursive directory scans.
//!
//! An [`ActiveScan`] walks the roots of a [`BackupSet`] depth first and
//! persists one [`ActivePath`] per directory it is inside of. Each entry
//! holds a status slot per child; every resolution is written back before
//! the next child is looked at. When the last slot of a directory resolves,
//! the directory's snapshot is written, its entry removed and its status
//! handed to the parent's slot.
//!
//! A scan stopped at any point (or killed) leaves a set of entries that
//! are both a to-do list and the results so far. The next
//! [`ActiveScan::start`] for the set picks them up, drops the ones the
//! current rules no longer include and marks the rest `unprocessed` until
//! the walk reaches them again.

mod rules;
mod source;

pub use rules::{BackupSet, IncludeRules};
pub use source::{join_path, ScanSource, SourceEntry};

use crate::error::CoreResult;
use crate::key::{pair_key, PathKey};
use crate::model::{ActivePath, ChildStatus, DirectorySnapshot};
use crate::repository::Repository;
use crate::store::put_record;
use keeper_storage::{Table, WriteBatch};
use std::collections::BTreeSet;
use std::io;
use tracing::{debug, info};

/// How a call to [`ActiveScan::run`] ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ScanOutcome {
    /// Every root was walked and no scan state is left.
    Complete,
    /// The stop callback fired; scan state is persisted for resumption.
    Interrupted,
}

/// Counters of one scan run.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ScanStats {
    /// Entries loaded from an earlier run.
    pub resumed: usize,
    /// Loaded entries dropped because the rules no longer include them.
    pub discarded: usize,
    /// Children resolved by this run.
    pub resolved: usize,
    /// Directories completed by this run.
    pub completed: usize,
    /// Directory snapshots written by this run.
    pub snapshots: usize,
}

/// A scan of one backup set.
pub struct ActiveScan<'r, S> {
    repo: &'r Repository,
    set: BackupSet,
    source: S,
    stats: ScanStats,
}

impl<'r, S: ScanSource> ActiveScan<'r, S> {
    /// Prepares a scan, loading the set's persisted state.
    ///
    /// # Errors
    ///
    /// Returns an error if the scan state cannot be read or updated.
    pub fn start(repo: &'r Repository, set: BackupSet, source: S) -> CoreResult<Self> {
        let mut stats = ScanStats::default();
        for mut entry in repo.active_paths(&set.id)? {
            if set.rules.is_included(&entry.path) {
                entry.unprocessed = true;
                repo.put_active_path(&entry)?;
                stats.resumed += 1;
            } else {
                repo.delete_active_path(&set.id, &entry.path)?;
                stats.discarded += 1;
            }
        }
        info!(
            set = %set.id,
            resumed = stats.resumed,
            discarded = stats.discarded,
            "starting scan"
        );
        Ok(Self {
            repo,
            set,
            source,
            stats,
        })
    }

    /// Returns the counters so far.
    #[must_use]
    pub fn stats(&self) -> ScanStats {
        self.stats
    }

    /// Walks the set to completion.
    ///
    /// # Errors
    ///
    /// Returns the first listing, processing or storage error. State
    /// persisted up to that point is kept.
    pub fn run(&mut self) -> CoreResult<ScanOutcome> {
        self.run_with(|| false)
    }

    /// Walks the set, polling `stop` before each child and returning
    /// [`ScanOutcome::Interrupted`] as soon as it answers true.
    ///
    /// # Errors
    ///
    /// See [`ActiveScan::run`].
    pub fn run_with(&mut self, mut stop: impl FnMut() -> bool) -> CoreResult<ScanOutcome> {
        let roots = self.set.rules.roots().to_vec();
        for root in roots {
            if !self.set.rules.is_included(&root) {
                continue;
            }
            if self.visit(&root, &mut stop)?.is_none() {
                info!(set = %self.set.id, resolved = self.stats.resolved, "scan interrupted");
                return Ok(ScanOutcome::Interrupted);
            }
        }

        let stale = self.repo.clear_active_paths(&self.set.id)?;
        info!(
            set = %self.set.id,
            completed = self.stats.completed,
            snapshots = self.stats.snapshots,
            stale,
            "scan complete"
        );
        Ok(ScanOutcome::Complete)
    }

    /// Resolves the directory at `path`; `None` when interrupted.
    fn visit(&mut self, path: &str, stop: &mut dyn FnMut() -> bool) -> CoreResult<Option<ChildStatus>> {
        let mut entry = match self.repo.active_path(&self.set.id, path)? {
            Some(mut entry) => {
                if entry.unprocessed {
                    entry.unprocessed = false;
                    self.repo.put_active_path(&entry)?;
                }
                entry
            }
            None => match self.source.list(path) {
                Ok(children) => {
                    let children = children
                        .into_iter()
                        .map(|child| (child.name, child.directory))
                        .collect();
                    let entry = ActivePath::new(self.set.id.clone(), path, children);
                    self.repo.put_active_path(&entry)?;
                    entry
                }
                Err(err) if err.kind() == io::ErrorKind::NotFound => {
                    debug!(path, "directory vanished during scan");
                    return Ok(Some(ChildStatus::Excluded));
                }
                Err(err) => return Err(err.into()),
            },
        };

        for index in 0..entry.children.len() {
            if entry.children[index].status.is_some() {
                continue;
            }
            if stop() {
                return Ok(None);
            }

            let child_path = join_path(path, &entry.children[index].name);
            let status = if !self.set.rules.is_included(&child_path) {
                ChildStatus::Excluded
            } else if entry.children[index].directory {
                match self.visit(&child_path, stop)? {
                    Some(status) => status,
                    None => return Ok(None),
                }
            } else {
                self.source.process_file(&child_path)?
            };

            entry.children[index].status = Some(status);
            self.repo.put_active_path(&entry)?;
            self.stats.resolved += 1;
        }

        self.complete(&entry).map(Some)
    }

    fn complete(&mut self, entry: &ActivePath) -> CoreResult<ChildStatus> {
        let status = entry.status();
        let snapshot = if status == ChildStatus::Included {
            let children: BTreeSet<String> = entry.snapshot_children().map(str::to_owned).collect();
            let unchanged = self
                .repo
                .directory(&entry.path, None)?
                .is_some_and(|latest| !latest.deleted && latest.children == children);
            (!unchanged).then(|| DirectorySnapshot::new(entry.path.clone(), self.repo.now(), children))
        } else {
            None
        };

        self.repo.finish_active_path(entry, snapshot.as_ref())?;
        self.stats.completed += 1;
        if snapshot.is_some() {
            self.stats.snapshots += 1;
        }
        debug!(path = %entry.path, ?status, snapshot = snapshot.is_some(), "directory complete");
        Ok(status)
    }
}

impl Repository {
    /// Removes a completed directory's scan state and writes its snapshot
    /// in the same batch.
    pub(crate) fn finish_active_path(
        &self,
        entry: &ActivePath,
        snapshot: Option<&DirectorySnapshot>,
    ) -> CoreResult<()> {
        let mut batch = WriteBatch::new();
        if let Some(snapshot) = snapshot {
            put_record(&mut batch, snapshot)?;
        }
        batch.delete(
            Table::ActivePaths,
            pair_key(&entry.set_id, &PathKey::for_path(&entry.path).to_bytes())?,
        );
        self.with_writer(|records| records.write(batch).map(|_| ()))
    }
}
