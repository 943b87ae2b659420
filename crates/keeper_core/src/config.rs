//! Repository configuration.

use keeper_storage::EngineConfig;
use std::time::Duration;

/// Configuration for opening a repository.
#[derive(Debug, Clone)]
pub struct RepositoryConfig {
    /// Whether to create the repository directory if it doesn't exist.
    pub create_if_missing: bool,

    /// Open for reading only, sharing the directory with other readers.
    pub read_only: bool,

    /// Settings for the LMDB engine.
    pub engine: EngineConfig,

    /// How often the handoff ticker checks for a waiting process.
    pub lock_poll_interval: Duration,

    /// Minimum time to keep access after (re)acquiring it before yielding
    /// to a waiting process.
    pub handoff_min_hold: Duration,

    /// Delay added to every pending update's due time, in milliseconds.
    pub debounce_min_wait_ms: u64,

    /// Entries fetched per round trip by entity scans.
    pub scan_page_size: usize,
}

impl Default for RepositoryConfig {
    fn default() -> Self {
        Self {
            create_if_missing: true,
            read_only: false,
            engine: EngineConfig::default(),
            lock_poll_interval: Duration::from_secs(1),
            handoff_min_hold: Duration::from_millis(500),
            debounce_min_wait_ms: 5_000,
            scan_page_size: 256,
        }
    }
}

impl RepositoryConfig {
    /// Creates a new configuration with default values.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Sets whether to create the repository if missing.
    #[must_use]
    pub const fn create_if_missing(mut self, value: bool) -> Self {
        self.create_if_missing = value;
        self
    }

    /// Sets read-only mode.
    #[must_use]
    pub const fn read_only(mut self, value: bool) -> Self {
        self.read_only = value;
        self
    }

    /// Replaces the engine settings.
    #[must_use]
    pub fn engine(mut self, engine: EngineConfig) -> Self {
        self.engine = engine;
        self
    }

    /// Sets the handoff poll interval.
    #[must_use]
    pub const fn lock_poll_interval(mut self, interval: Duration) -> Self {
        self.lock_poll_interval = interval;
        self
    }

    /// Sets the minimum hold time before yielding.
    #[must_use]
    pub const fn handoff_min_hold(mut self, hold: Duration) -> Self {
        self.handoff_min_hold = hold;
        self
    }

    /// Sets the debounce minimum wait.
    #[must_use]
    pub const fn debounce_min_wait_ms(mut self, wait: u64) -> Self {
        self.debounce_min_wait_ms = wait;
        self
    }

    /// Sets the scan page size.
    #[must_use]
    pub const fn scan_page_size(mut self, size: usize) -> Self {
        self.scan_page_size = size;
        self
    }
}
