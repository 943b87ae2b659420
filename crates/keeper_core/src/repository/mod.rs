//! The repository facade.
//!
//! A [`Repository`] owns one repository directory: its process lock, its
//! storage engine and the in-process locks that serialize access to it.
//! Every entity operation takes the operation lock, borrows the open engine
//! and works through typed [`Records`].
//!
//! When another process asks for the directory, the handoff ticker flushes
//! and closes the engine and releases the process lock. The next operation
//! in this process blocks until the directory is handed back, then reopens
//! the engine.

mod access;
mod entities;

pub use access::{AccessGuard, LockKind};
pub use entities::EntityScan;
pub(crate) use entities::latest_version;

use crate::clock::{Clock, SystemClock};
use crate::config::RepositoryConfig;
use crate::dir::RepositoryDir;
use crate::error::{CoreError, CoreResult};
use crate::lock::{ProcessLock, ReentrantLock};
use crate::store::Records;
use access::HandoffTicker;
use keeper_storage::{
    EngineFactory, EngineStatsSnapshot, LmdbFactory, StorageEngine, Table, WriteBatch,
};
use parking_lot::Mutex;
use std::fmt;
use std::path::Path;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tracing::{debug, info};

/// State shared between a repository and its handoff ticker.
pub(crate) struct Shared {
    pub(crate) dir: RepositoryDir,
    pub(crate) config: RepositoryConfig,
    pub(crate) clock: Arc<dyn Clock>,
    factory: Arc<dyn EngineFactory>,
    /// Guards every entity operation.
    pub(crate) operation: ReentrantLock,
    /// Serializes producers and consumers of the pending update queue.
    pub(crate) update: ReentrantLock,
    /// The open lock: guards the engine slot. `None` after a handoff.
    open: Mutex<Option<Arc<dyn StorageEngine>>>,
    process: Mutex<ProcessLock>,
    exclusive: AtomicBool,
    pub(crate) corruption: AtomicBool,
    closed: AtomicBool,
}

impl Shared {
    /// Returns the open engine, reacquiring the directory from another
    /// process if it was handed over. The version marker is checked again
    /// before reopening.
    ///
    /// Callers hold the operation lock.
    pub(crate) fn engine(&self) -> CoreResult<Arc<dyn StorageEngine>> {
        if self.closed.load(Ordering::Acquire) {
            return Err(CoreError::Closed);
        }
        let mut slot = self.open.lock();
        if let Some(engine) = slot.as_ref() {
            return Ok(Arc::clone(engine));
        }

        let mut process = self.process.lock();
        process.acquire()?;
        // Another process may have migrated the store while it held it.
        if let Err(err) = self.dir.check_version(self.factory.revision(), self.config.read_only) {
            process.release()?;
            return Err(err);
        }
        drop(process);
        let engine = self
            .factory
            .open(&self.dir.store_path(), self.config.read_only)?;
        debug!(path = %self.dir.path().display(), "reopened repository store");
        *slot = Some(Arc::clone(&engine));
        Ok(engine)
    }

    pub(crate) fn is_exclusive(&self) -> bool {
        self.exclusive.load(Ordering::Acquire)
    }

    /// Hands the directory to a waiting process if one is asking and this
    /// process has held it long enough.
    pub(crate) fn yield_if_requested(&self) -> CoreResult<()> {
        if self.closed.load(Ordering::Acquire) || self.exclusive.load(Ordering::Acquire) {
            return Ok(());
        }
        {
            let process = self.process.lock();
            let held_long_enough = process
                .held_for()
                .is_some_and(|held| held >= self.config.handoff_min_hold);
            if !held_long_enough || !process.handoff_requested()? {
                return Ok(());
            }
        }

        let _operation = self.operation.lock();
        if self.closed.load(Ordering::Acquire) || self.exclusive.load(Ordering::Acquire) {
            return Ok(());
        }
        let mut slot = self.open.lock();
        let mut process = self.process.lock();
        if !process.is_held() || !process.handoff_requested()? {
            return Ok(());
        }

        let closed = slot.take().map_or(Ok(()), |engine| engine.close());
        process.release()?;
        closed?;
        info!(path = %self.dir.path().display(), "yielded repository to waiting process");
        Ok(())
    }
}

/// A crash-consistent metadata repository in one directory.
///
/// # Thread Safety
///
/// `Repository` is `Send + Sync`. Entity operations from different threads
/// are serialized by the operation lock; each runs as one unit against the
/// store's shared transaction.
///
/// # Example
///
/// ```rust,no_run
/// use keeper_core::{FileVersion, Repository, RepositoryConfig};
///
/// let repo = Repository::open("backup-meta", RepositoryConfig::default())?;
/// repo.put_file_version(&FileVersion::new("/a/b.txt", 100, 10))?;
/// let latest = repo.file_version("/a/b.txt", None)?;
/// assert_eq!(latest.map(|v| v.length), Some(10));
/// repo.close()?;
/// # Ok::<(), keeper_core::CoreError>(())
/// ```
pub struct Repository {
    shared: Arc<Shared>,
    ticker: Mutex<Option<HandoffTicker>>,
}

impl fmt::Debug for Repository {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Repository")
            .field("path", &self.shared.dir.path())
            .field("read_only", &self.shared.config.read_only)
            .field("closed", &self.shared.closed.load(Ordering::Relaxed))
            .finish()
    }
}

impl Repository {
    /// Opens the repository in `path` backed by LMDB.
    ///
    /// Blocks while another process holds the directory, after asking it to
    /// hand over.
    ///
    /// # Errors
    ///
    /// Returns an error if the directory is missing (and may not be
    /// created), the backend revision does not match, or the store cannot
    /// be opened.
    pub fn open(path: impl AsRef<Path>, config: RepositoryConfig) -> CoreResult<Self> {
        let factory = Arc::new(LmdbFactory::new(config.engine.clone()));
        Self::open_with(path, config, factory, Arc::new(SystemClock))
    }

    /// Opens the repository with an explicit engine factory and clock.
    ///
    /// # Errors
    ///
    /// See [`Repository::open`].
    pub fn open_with(
        path: impl AsRef<Path>,
        config: RepositoryConfig,
        factory: Arc<dyn EngineFactory>,
        clock: Arc<dyn Clock>,
    ) -> CoreResult<Self> {
        let path = path.as_ref();
        let dir = RepositoryDir::open(path, config.create_if_missing && !config.read_only)?;

        let mut process = ProcessLock::new(&dir, config.read_only);
        process.acquire()?;
        dir.check_version(factory.revision(), config.read_only)?;
        let engine = factory.open(&dir.store_path(), config.read_only)?;

        info!(
            path = %path.display(),
            read_only = config.read_only,
            revision = factory.revision(),
            "opened repository"
        );

        let poll_interval = config.lock_poll_interval;
        let shared = Arc::new(Shared {
            dir,
            config,
            clock,
            factory,
            operation: ReentrantLock::new("operation"),
            update: ReentrantLock::new("update"),
            open: Mutex::new(Some(engine)),
            process: Mutex::new(process),
            exclusive: AtomicBool::new(false),
            corruption: AtomicBool::new(false),
            closed: AtomicBool::new(false),
        });
        let ticker = HandoffTicker::spawn(Arc::downgrade(&shared), poll_interval)?;

        Ok(Self {
            shared,
            ticker: Mutex::new(Some(ticker)),
        })
    }

    /// Returns the repository directory.
    #[must_use]
    pub fn path(&self) -> &Path {
        self.shared.dir.path()
    }

    /// Returns true if the repository was opened read-only.
    #[must_use]
    pub fn is_read_only(&self) -> bool {
        self.shared.config.read_only
    }

    /// Returns the configuration the repository was opened with.
    #[must_use]
    pub fn config(&self) -> &RepositoryConfig {
        &self.shared.config
    }

    /// Returns true once any corrupt record has been found.
    #[must_use]
    pub fn corruption_detected(&self) -> bool {
        self.shared.corruption.load(Ordering::Acquire)
    }

    /// Returns true if another thread is waiting for the operation lock.
    ///
    /// Long-running callers poll this and stop early so the waiting thread
    /// can run.
    #[must_use]
    pub fn is_operation_requested(&self) -> bool {
        self.shared.operation.is_requested()
    }

    pub(crate) fn shared(&self) -> &Shared {
        &self.shared
    }

    pub(crate) fn now(&self) -> crate::clock::Timestamp {
        self.shared.clock.now()
    }

    /// Runs `f` against the open store under the operation lock.
    pub(crate) fn with_records<T>(
        &self,
        f: impl FnOnce(&Records<'_>) -> CoreResult<T>,
    ) -> CoreResult<T> {
        let _operation = self.shared.operation.lock();
        let engine = self.shared.engine()?;
        let records = Records::new(&*engine, &self.shared.corruption);
        f(&records)
    }

    /// Like [`Repository::with_records`], failing on read-only repositories.
    pub(crate) fn with_writer<T>(
        &self,
        f: impl FnOnce(&Records<'_>) -> CoreResult<T>,
    ) -> CoreResult<T> {
        if self.is_read_only() {
            return Err(CoreError::ReadOnly);
        }
        self.with_records(f)
    }

    /// Commits pending writes.
    ///
    /// Takes the full operation lock only when the engine's commit needs
    /// exclusive access; otherwise the open lock alone suffices.
    ///
    /// # Errors
    ///
    /// Returns an error if the commit fails.
    pub fn commit(&self) -> CoreResult<()> {
        if self.shared.closed.load(Ordering::Acquire) {
            return Err(CoreError::Closed);
        }
        let requires_exclusive = match self.shared.open.lock().as_ref() {
            Some(engine) => engine.commit_requires_exclusive(),
            None => return Ok(()),
        };

        if requires_exclusive {
            let _operation = self.shared.operation.lock();
            self.shared.engine()?.commit()?;
        } else if let Some(engine) = self.shared.open.lock().as_ref() {
            engine.commit()?;
        }
        Ok(())
    }

    /// Deletes every record in every table.
    ///
    /// # Errors
    ///
    /// Returns [`CoreError::ReadOnly`] on read-only repositories.
    pub fn clear(&self) -> CoreResult<()> {
        self.with_writer(|records| {
            let mut batch = WriteBatch::new();
            for table in Table::ALL {
                batch.clear(table);
            }
            records.write(batch)?;
            records.engine().commit()?;
            info!(path = %self.path().display(), "cleared repository");
            Ok(())
        })
    }

    /// Returns the number of records in each table.
    ///
    /// # Errors
    ///
    /// Returns an error if the store cannot be read.
    pub fn table_counts(&self) -> CoreResult<Vec<(Table, u64)>> {
        self.with_records(|records| {
            Table::ALL
                .iter()
                .map(|&table| -> CoreResult<(Table, u64)> { Ok((table, records.engine().count(table)?)) })
                .collect()
        })
    }

    /// Returns statistics of the open engine.
    ///
    /// # Errors
    ///
    /// Returns an error if the repository is closed.
    pub fn engine_stats(&self) -> CoreResult<EngineStatsSnapshot> {
        self.with_records(|records| Ok(records.engine().stats()))
    }

    /// Flushes and closes the store and releases the directory.
    ///
    /// Later operations fail with [`CoreError::Closed`]. Closing twice is a
    /// no-op.
    ///
    /// # Errors
    ///
    /// Returns an error if the final commit fails.
    pub fn close(&self) -> CoreResult<()> {
        if self.shared.closed.swap(true, Ordering::AcqRel) {
            return Ok(());
        }
        if let Some(mut ticker) = self.ticker.lock().take() {
            ticker.stop();
        }

        let _operation = self.shared.operation.lock();
        let engine = self.shared.open.lock().take();
        let closed = engine.map_or(Ok(()), |engine| engine.close());
        self.shared.process.lock().release()?;
        closed?;
        info!(path = %self.path().display(), "closed repository");
        Ok(())
    }
}

impl Drop for Repository {
    fn drop(&mut self) {
        if let Err(err) = self.close() {
            tracing::error!(%err, path = %self.path().display(), "failed to close repository");
        }
    }
}
