//! Test fixtures and repository helpers.
//!
//! Provides repositories in temporary directories, driven by a manual
//! clock, and a tracing initialiser for test output.

use keeper_core::{ManualClock, Repository, RepositoryConfig, Timestamp};
use keeper_storage::{EngineConfig, InMemoryFactory, LmdbFactory};
use std::path::Path;
use std::sync::Arc;
use tempfile::TempDir;
use tracing_subscriber::EnvFilter;

/// Time every fixture clock starts at.
pub const START_TIME: Timestamp = 1_000_000;

/// A test repository with automatic cleanup.
pub struct TestRepository {
    /// The repository instance.
    pub repo: Repository,
    /// The clock the repository reads.
    pub clock: Arc<ManualClock>,
    /// The temporary directory (kept alive to prevent cleanup).
    _temp_dir: TempDir,
}

impl TestRepository {
    /// Creates a repository over the in-memory engine.
    pub fn memory() -> Self {
        Self::memory_with(RepositoryConfig::default())
    }

    /// Creates a repository over the in-memory engine with `config`.
    pub fn memory_with(config: RepositoryConfig) -> Self {
        let temp_dir = TempDir::new().expect("Failed to create temp directory");
        let clock = Arc::new(ManualClock::new(START_TIME));
        let repo = Repository::open_with(
            temp_dir.path().join("repo"),
            config,
            Arc::new(InMemoryFactory::new()),
            clock.clone(),
        )
        .expect("Failed to open in-memory repository");
        Self {
            repo,
            clock,
            _temp_dir: temp_dir,
        }
    }

    /// Creates a repository over LMDB.
    pub fn lmdb() -> Self {
        Self::lmdb_with(RepositoryConfig::default())
    }

    /// Creates a repository over LMDB with `config`.
    pub fn lmdb_with(config: RepositoryConfig) -> Self {
        let temp_dir = TempDir::new().expect("Failed to create temp directory");
        let clock = Arc::new(ManualClock::new(START_TIME));
        let repo = open_lmdb(&temp_dir.path().join("repo"), config, clock.clone());
        Self {
            repo,
            clock,
            _temp_dir: temp_dir,
        }
    }

    /// Returns the repository directory.
    pub fn path(&self) -> &Path {
        self.repo.path()
    }
}

impl std::ops::Deref for TestRepository {
    type Target = Repository;

    fn deref(&self) -> &Self::Target {
        &self.repo
    }
}

/// Opens an LMDB repository in `path` driven by `clock`.
pub fn open_lmdb(path: &Path, config: RepositoryConfig, clock: Arc<ManualClock>) -> Repository {
    let factory = Arc::new(LmdbFactory::new(config.engine.clone()));
    Repository::open_with(path, config, factory, clock).expect("Failed to open LMDB repository")
}

/// Engine settings that make growth and commits happen within small tests.
pub fn small_engine_config() -> EngineConfig {
    EngineConfig::default()
        .map_size(1 << 20)
        .growth_increment(1 << 20)
        .growth_check_interval(50)
        .safety_margin(64 * 1024)
        .max_uncommitted_writes(500)
}

/// Runs a test with a temporary in-memory repository.
///
/// # Example
///
/// ```rust,ignore
/// use keeper_testkit::with_temp_repo;
///
/// #[test]
/// fn my_test() {
///     with_temp_repo(|repo| {
///         assert!(!repo.has_block("h").unwrap());
///     });
/// }
/// ```
pub fn with_temp_repo<F, R>(f: F) -> R
where
    F: FnOnce(&TestRepository) -> R,
{
    let repo = TestRepository::memory();
    f(&repo)
}

/// Installs a test subscriber honouring `RUST_LOG`. Safe to call from
/// every test.
pub fn init_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env())
        .with_test_writer()
        .try_init();
}

#[cfg(test)]
mod tests {
    use super::*;
    use keeper_core::Block;

    #[test]
    fn fixtures_open_working_repositories() {
        init_tracing();
        with_temp_repo(|repo| {
            repo.put_block(&Block::new("h", "loc", 1)).unwrap();
            assert!(repo.has_block("h").unwrap());
        });

        let lmdb = TestRepository::lmdb_with(RepositoryConfig::default().engine(small_engine_config()));
        lmdb.put_block(&Block::new("h", "loc", 1)).unwrap();
        assert!(lmdb.path().join("VERSION").exists());
    }
}
