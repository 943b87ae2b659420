//! Process-wide set of open repositories.

use crate::clock::{Clock, SystemClock};
use crate::config::RepositoryConfig;
use crate::error::CoreResult;
use crate::repository::Repository;
use keeper_storage::{EngineFactory, LmdbFactory};
use parking_lot::Mutex;
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tracing::{debug, error};

/// Hands out one shared [`Repository`] per directory.
///
/// Opening the same directory twice from one process would make the
/// process queue behind its own lock, so components share repositories
/// through a registry created at startup and closed at teardown.
pub struct RepositoryRegistry {
    config: RepositoryConfig,
    factory: Arc<dyn EngineFactory>,
    clock: Arc<dyn Clock>,
    open: Mutex<HashMap<PathBuf, Arc<Repository>>>,
}

impl RepositoryRegistry {
    /// Creates a registry opening LMDB repositories with `config`.
    #[must_use]
    pub fn new(config: RepositoryConfig) -> Self {
        let factory = Arc::new(LmdbFactory::new(config.engine.clone()));
        Self::with_factory(config, factory, Arc::new(SystemClock))
    }

    /// Creates a registry with an explicit engine factory and clock.
    #[must_use]
    pub fn with_factory(
        config: RepositoryConfig,
        factory: Arc<dyn EngineFactory>,
        clock: Arc<dyn Clock>,
    ) -> Self {
        Self {
            config,
            factory,
            clock,
            open: Mutex::new(HashMap::new()),
        }
    }

    /// Returns the open repository in `path`, opening it if needed.
    ///
    /// # Errors
    ///
    /// See [`Repository::open`].
    pub fn open(&self, path: impl AsRef<Path>) -> CoreResult<Arc<Repository>> {
        let path = path.as_ref();
        let mut open = self.open.lock();
        if let Ok(key) = path.canonicalize() {
            if let Some(repo) = open.get(&key) {
                return Ok(Arc::clone(repo));
            }
        }

        let repo = Arc::new(Repository::open_with(
            path,
            self.config.clone(),
            Arc::clone(&self.factory),
            Arc::clone(&self.clock),
        )?);
        let key = path.canonicalize()?;
        debug!(path = %key.display(), "registered repository");
        open.insert(key, Arc::clone(&repo));
        Ok(repo)
    }

    /// Returns the repository in `path` if it is open.
    #[must_use]
    pub fn get(&self, path: impl AsRef<Path>) -> Option<Arc<Repository>> {
        let key = path.as_ref().canonicalize().ok()?;
        self.open.lock().get(&key).cloned()
    }

    /// Closes and forgets the repository in `path`; returns whether it was
    /// open.
    ///
    /// # Errors
    ///
    /// Returns an error if closing fails.
    pub fn close(&self, path: impl AsRef<Path>) -> CoreResult<bool> {
        let Ok(key) = path.as_ref().canonicalize() else {
            return Ok(false);
        };
        let Some(repo) = self.open.lock().remove(&key) else {
            return Ok(false);
        };
        repo.close()?;
        Ok(true)
    }

    /// Closes every repository.
    ///
    /// # Errors
    ///
    /// Returns the first close error after attempting them all.
    pub fn close_all(&self) -> CoreResult<()> {
        let drained: Vec<_> = self.open.lock().drain().collect();
        let mut first_error = None;
        for (path, repo) in drained {
            if let Err(err) = repo.close() {
                error!(%err, path = %path.display(), "failed to close repository");
                first_error.get_or_insert(err);
            }
        }
        first_error.map_or(Ok(()), Err)
    }

    /// Returns how many repositories are open.
    #[must_use]
    pub fn len(&self) -> usize {
        self.open.lock().len()
    }

    /// Returns true if no repository is open.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.open.lock().is_empty()
    }
}

impl Drop for RepositoryRegistry {
    fn drop(&mut self) {
        let _ = self.close_all();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::CoreError;
    use keeper_storage::InMemoryFactory;
    use tempfile::tempdir;

    fn registry() -> RepositoryRegistry {
        RepositoryRegistry::with_factory(
            RepositoryConfig::default(),
            Arc::new(InMemoryFactory::new()),
            Arc::new(SystemClock),
        )
    }

    #[test]
    fn same_directory_shares_one_repository() {
        let temp = tempdir().unwrap();
        let registry = registry();
        let a = registry.open(temp.path().join("repo")).unwrap();
        let b = registry
            .open(temp.path().join("repo").join("..").join("repo"))
            .unwrap();
        assert!(Arc::ptr_eq(&a, &b));
        assert_eq!(registry.len(), 1);
        assert!(registry.get(temp.path().join("repo")).is_some());
    }

    #[test]
    fn close_all_closes_every_repository() {
        let temp = tempdir().unwrap();
        let registry = registry();
        let a = registry.open(temp.path().join("a")).unwrap();
        registry.open(temp.path().join("b")).unwrap();

        registry.close_all().unwrap();
        assert!(registry.is_empty());
        assert!(matches!(a.has_block("h"), Err(CoreError::Closed)));
        assert!(!registry.close(temp.path().join("a")).unwrap());
    }
}
