//! Scoped access guards and the cross-process handoff ticker.

use super::{Repository, Shared};
use crate::error::{CoreError, CoreResult};
use crate::lock::ReentrantGuard;
use parking_lot::{Condvar, Mutex};
use std::sync::atomic::Ordering;
use std::sync::{Arc, Weak};
use std::thread::{self, JoinHandle};
use std::time::Duration;
use tracing::{debug, error, warn};

/// Which locks an [`AccessGuard`] holds.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LockKind {
    /// The operation lock.
    Operation,
    /// The update queue lock.
    Update,
    /// Update and operation locks plus this process's hold on the
    /// directory, which the handoff ticker will not give up.
    Exclusive,
}

/// A scoped hold on repository locks, released on drop.
///
/// Obtained from [`Repository::acquire_operation_lock`],
/// [`Repository::acquire_update_lock`] or
/// [`Repository::acquire_exclusive_lock`]. Guards are reentrant on the
/// thread that holds them and are not `Send`.
///
/// A thread holding an operation guard must not touch the pending update
/// queue: the update lock is always taken before the operation lock.
pub struct AccessGuard<'a> {
    shared: &'a Shared,
    kind: LockKind,
    operation: Option<ReentrantGuard<'a>>,
    update: Option<ReentrantGuard<'a>>,
}

impl AccessGuard<'_> {
    /// Returns which locks the guard holds.
    #[must_use]
    pub fn kind(&self) -> LockKind {
        self.kind
    }

    /// Returns true if another thread is waiting for the operation lock.
    #[must_use]
    pub fn is_requested(&self) -> bool {
        self.shared.operation.is_requested()
    }
}

impl Drop for AccessGuard<'_> {
    fn drop(&mut self) {
        if self.kind == LockKind::Exclusive {
            if let Some(engine) = self.shared.open.lock().as_ref() {
                if let Err(err) = engine.commit() {
                    error!(%err, "commit on exclusive lock release failed");
                }
            }
            self.shared.exclusive.store(false, Ordering::Release);
            debug!("released exclusive repository lock");
        }
        self.operation.take();
        self.update.take();
    }
}

impl Repository {
    /// Takes the operation lock for the life of the guard.
    pub fn acquire_operation_lock(&self) -> AccessGuard<'_> {
        let shared = self.shared();
        AccessGuard {
            shared,
            kind: LockKind::Operation,
            operation: Some(shared.operation.lock()),
            update: None,
        }
    }

    /// Takes the pending update queue lock for the life of the guard.
    pub fn acquire_update_lock(&self) -> AccessGuard<'_> {
        let shared = self.shared();
        AccessGuard {
            shared,
            kind: LockKind::Update,
            operation: None,
            update: Some(shared.update.lock()),
        }
    }

    /// Takes exclusive access: every in-process lock, and the directory is
    /// held against other processes until the guard drops. Dropping the
    /// guard commits.
    ///
    /// # Errors
    ///
    /// Returns [`CoreError::ReadOnly`] on read-only repositories and
    /// [`CoreError::AlreadyLocked`] if this repository already holds an
    /// exclusive guard.
    pub fn acquire_exclusive_lock(&self) -> CoreResult<AccessGuard<'_>> {
        if self.is_read_only() {
            return Err(CoreError::ReadOnly);
        }
        let shared = self.shared();
        let update = shared.update.lock();
        let operation = shared.operation.lock();
        if shared.exclusive.swap(true, Ordering::AcqRel) {
            return Err(CoreError::AlreadyLocked);
        }

        let guard = AccessGuard {
            shared,
            kind: LockKind::Exclusive,
            operation: Some(operation),
            update: Some(update),
        };
        // Reacquires the directory if it was handed over.
        shared.engine()?;
        debug!(path = %self.path().display(), "acquired exclusive repository lock");
        Ok(guard)
    }
}

/// Background thread that yields the directory to waiting processes.
pub(crate) struct HandoffTicker {
    stop: Arc<(Mutex<bool>, Condvar)>,
    handle: Option<JoinHandle<()>>,
}

impl HandoffTicker {
    pub(crate) fn spawn(shared: Weak<Shared>, interval: Duration) -> CoreResult<Self> {
        let stop = Arc::new((Mutex::new(false), Condvar::new()));
        let thread_stop = Arc::clone(&stop);
        let handle = thread::Builder::new()
            .name("keeper-handoff".into())
            .spawn(move || loop {
                {
                    let (stopped, signal) = &*thread_stop;
                    let mut stopped = stopped.lock();
                    if !*stopped {
                        signal.wait_for(&mut stopped, interval);
                    }
                    if *stopped {
                        break;
                    }
                }
                let Some(shared) = shared.upgrade() else {
                    break;
                };
                if let Err(err) = shared.yield_if_requested() {
                    warn!(%err, "repository handoff failed");
                }
            })?;
        Ok(Self {
            stop,
            handle: Some(handle),
        })
    }

    pub(crate) fn stop(&mut self) {
        let (stopped, signal) = &*self.stop;
        *stopped.lock() = true;
        signal.notify_all();
        if let Some(handle) = self.handle.take() {
            if handle.join().is_err() {
                error!("repository handoff thread panicked");
            }
        }
    }
}

impl Drop for HandoffTicker {
    fn drop(&mut self) {
        self.stop();
    }
}

#[cfg(test)]
mod tests {
    use crate::clock::SystemClock;
    use crate::config::RepositoryConfig;
    use crate::error::CoreError;
    use crate::model::Block;
    use crate::repository::{LockKind, Repository};
    use keeper_storage::InMemoryFactory;
    use std::sync::Arc;
    use tempfile::tempdir;

    fn repo(read_only: bool) -> (tempfile::TempDir, Repository) {
        let temp = tempdir().unwrap();
        let factory = Arc::new(InMemoryFactory::new());
        let repo = Repository::open_with(
            temp.path(),
            RepositoryConfig::default().read_only(read_only),
            factory,
            Arc::new(SystemClock),
        )
        .unwrap();
        (temp, repo)
    }

    #[test]
    fn second_exclusive_lock_is_rejected() {
        let (_temp, repo) = repo(false);
        let guard = repo.acquire_exclusive_lock().unwrap();
        assert_eq!(guard.kind(), LockKind::Exclusive);
        assert!(matches!(
            repo.acquire_exclusive_lock(),
            Err(CoreError::AlreadyLocked)
        ));

        repo.put_block(&Block::new("h", "loc", 1)).unwrap();
        drop(guard);
        assert!(repo.engine_stats().unwrap().commits >= 1);
        assert!(repo.acquire_exclusive_lock().is_ok());
    }

    #[test]
    fn exclusive_lock_on_read_only_repository_fails() {
        let (_temp, repo) = repo(true);
        assert!(matches!(
            repo.acquire_exclusive_lock(),
            Err(CoreError::ReadOnly)
        ));
    }

    #[test]
    fn guards_are_reentrant_on_their_thread() {
        let (_temp, repo) = repo(false);
        let _update = repo.acquire_update_lock();
        let guard = repo.acquire_operation_lock();
        assert!(!guard.is_requested());
        repo.put_block(&Block::new("h", "loc", 1)).unwrap();
        assert!(repo.has_block("h").unwrap());
    }
}
