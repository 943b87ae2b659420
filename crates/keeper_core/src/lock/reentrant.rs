//! Reentrant in-process locks that report waiting threads.

use parking_lot::{ReentrantMutex, ReentrantMutexGuard};
use std::sync::atomic::{AtomicUsize, Ordering};

/// A reentrant lock that knows whether another thread is waiting for it.
///
/// Long-running holders poll [`ReentrantLock::is_requested`] and release
/// the lock voluntarily so higher-priority work can run.
#[derive(Debug)]
pub struct ReentrantLock {
    name: &'static str,
    mutex: ReentrantMutex<()>,
    waiting: AtomicUsize,
}

/// Guard returned by [`ReentrantLock::lock`]. Not `Send`: it must be dropped
/// on the thread that acquired it.
pub type ReentrantGuard<'a> = ReentrantMutexGuard<'a, ()>;

impl ReentrantLock {
    /// Creates an unlocked lock; `name` appears in trace output.
    #[must_use]
    pub fn new(name: &'static str) -> Self {
        Self {
            name,
            mutex: ReentrantMutex::new(()),
            waiting: AtomicUsize::new(0),
        }
    }

    /// Acquires the lock, blocking while another thread holds it.
    pub fn lock(&self) -> ReentrantGuard<'_> {
        if let Some(guard) = self.mutex.try_lock() {
            return guard;
        }
        tracing::trace!(lock = self.name, "waiting for lock");
        self.waiting.fetch_add(1, Ordering::SeqCst);
        let guard = self.mutex.lock();
        self.waiting.fetch_sub(1, Ordering::SeqCst);
        guard
    }

    /// Acquires the lock only if it is free or held by this thread.
    pub fn try_lock(&self) -> Option<ReentrantGuard<'_>> {
        self.mutex.try_lock()
    }

    /// Returns true if some thread is blocked waiting for the lock.
    #[must_use]
    pub fn is_requested(&self) -> bool {
        self.waiting.load(Ordering::SeqCst) > 0
    }

    /// Returns true if the current thread holds the lock.
    #[must_use]
    pub fn is_owned_by_current_thread(&self) -> bool {
        self.mutex.is_owned_by_current_thread()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;
    use std::thread;
    use std::time::Duration;

    #[test]
    fn same_thread_reenters() {
        let lock = ReentrantLock::new("test");
        let outer = lock.lock();
        let inner = lock.lock();
        assert!(lock.is_owned_by_current_thread());
        drop(inner);
        drop(outer);
        assert!(!lock.is_owned_by_current_thread());
    }

    #[test]
    fn waiting_thread_is_reported() {
        let lock = Arc::new(ReentrantLock::new("test"));
        let guard = lock.lock();
        assert!(!lock.is_requested());

        let contender = Arc::clone(&lock);
        let handle = thread::spawn(move || {
            let _guard = contender.lock();
        });

        while !lock.is_requested() {
            thread::sleep(Duration::from_millis(1));
        }
        assert!(lock.try_lock().is_some());
        drop(guard);
        handle.join().unwrap();
        assert!(!lock.is_requested());
    }
}
