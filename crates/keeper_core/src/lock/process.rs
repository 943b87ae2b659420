//! Cross-process access to a repository directory.
//!
//! Two advisory locks coordinate processes:
//!
//! 1. A process wanting access tries `LOCK` without blocking.
//! 2. If `LOCK` is busy it takes `LOCK.request`, which signals intent, then
//!    blocks on `LOCK` and drops `LOCK.request` once it has it.
//! 3. The holder polls `LOCK.request`; finding it held, it flushes, closes
//!    the store and releases `LOCK`.
//!
//! Read-only processes take `LOCK` shared and follow the same steps.

use crate::dir::RepositoryDir;
use crate::error::CoreResult;
use fs2::FileExt;
use std::fs::{File, OpenOptions};
use std::io;
use std::path::{Path, PathBuf};
use std::time::{Duration, Instant};
use tracing::{debug, info};

/// This process's hold on a repository's main lock.
#[derive(Debug)]
pub struct ProcessLock {
    lock_path: PathBuf,
    request_path: PathBuf,
    shared: bool,
    main: Option<File>,
    acquired_at: Option<Instant>,
}

impl ProcessLock {
    /// Creates an unheld lock for `dir`; `shared` for read-only access.
    #[must_use]
    pub fn new(dir: &RepositoryDir, shared: bool) -> Self {
        Self {
            lock_path: dir.lock_path(),
            request_path: dir.request_path(),
            shared,
            main: None,
            acquired_at: None,
        }
    }

    /// Returns true while this process holds the main lock.
    #[must_use]
    pub fn is_held(&self) -> bool {
        self.main.is_some()
    }

    /// Returns how long the main lock has been held.
    #[must_use]
    pub fn held_for(&self) -> Option<Duration> {
        self.acquired_at.map(|at| at.elapsed())
    }

    /// Acquires the main lock, requesting a handoff and blocking if another
    /// process holds it.
    pub fn acquire(&mut self) -> CoreResult<()> {
        if self.main.is_some() {
            return Ok(());
        }

        let main = open_lock_file(&self.lock_path)?;
        match self.try_lock_main(&main) {
            Ok(()) => {}
            Err(err) if is_contended(&err) => {
                info!(
                    path = %self.lock_path.display(),
                    "repository in use by another process; waiting for handoff"
                );
                let request = open_lock_file(&self.request_path)?;
                FileExt::lock_exclusive(&request)?;
                let locked = self.lock_main(&main);
                FileExt::unlock(&request)?;
                locked?;
                info!(path = %self.lock_path.display(), "repository handed over");
            }
            Err(err) => return Err(err.into()),
        }

        debug!(path = %self.lock_path.display(), shared = self.shared, "acquired repository lock");
        self.main = Some(main);
        self.acquired_at = Some(Instant::now());
        Ok(())
    }

    /// Releases the main lock.
    pub fn release(&mut self) -> CoreResult<()> {
        self.acquired_at = None;
        if let Some(main) = self.main.take() {
            FileExt::unlock(&main)?;
            debug!(path = %self.lock_path.display(), "released repository lock");
        }
        Ok(())
    }

    /// Returns true if another process holds the request lock.
    pub fn handoff_requested(&self) -> CoreResult<bool> {
        let request = open_lock_file(&self.request_path)?;
        match FileExt::try_lock_exclusive(&request) {
            Ok(()) => {
                FileExt::unlock(&request)?;
                Ok(false)
            }
            Err(err) if is_contended(&err) => Ok(true),
            Err(err) => Err(err.into()),
        }
    }

    fn try_lock_main(&self, main: &File) -> io::Result<()> {
        if self.shared {
            FileExt::try_lock_shared(main)
        } else {
            FileExt::try_lock_exclusive(main)
        }
    }

    fn lock_main(&self, main: &File) -> io::Result<()> {
        if self.shared {
            FileExt::lock_shared(main)
        } else {
            FileExt::lock_exclusive(main)
        }
    }
}

impl Drop for ProcessLock {
    fn drop(&mut self) {
        let _ = self.release();
    }
}

fn open_lock_file(path: &Path) -> io::Result<File> {
    OpenOptions::new()
        .read(true)
        .write(true)
        .create(true)
        .truncate(false)
        .open(path)
}

fn is_contended(err: &io::Error) -> bool {
    err.kind() == io::ErrorKind::WouldBlock
        || err.raw_os_error() == fs2::lock_contended_error().raw_os_error()
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::mpsc;
    use std::thread;
    use tempfile::tempdir;

    #[test]
    fn second_holder_waits_for_release() {
        let temp = tempdir().unwrap();
        let dir = RepositoryDir::open(temp.path(), true).unwrap();

        let mut first = ProcessLock::new(&dir, false);
        first.acquire().unwrap();
        assert!(first.is_held());
        assert!(!first.handoff_requested().unwrap());

        let (tx, rx) = mpsc::channel();
        let second_dir = dir.clone();
        let handle = thread::spawn(move || {
            let mut second = ProcessLock::new(&second_dir, false);
            second.acquire().unwrap();
            tx.send(()).unwrap();
            second.release().unwrap();
        });

        while !first.handoff_requested().unwrap() {
            thread::sleep(Duration::from_millis(5));
        }
        assert!(rx.try_recv().is_err());

        first.release().unwrap();
        rx.recv_timeout(Duration::from_secs(10)).unwrap();
        handle.join().unwrap();
    }

    #[test]
    fn readers_share_the_lock() {
        let temp = tempdir().unwrap();
        let dir = RepositoryDir::open(temp.path(), true).unwrap();

        let mut a = ProcessLock::new(&dir, true);
        let mut b = ProcessLock::new(&dir, true);
        a.acquire().unwrap();
        b.acquire().unwrap();
        assert!(a.is_held() && b.is_held());
        assert!(!a.handoff_requested().unwrap());
    }
}
