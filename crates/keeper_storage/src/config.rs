//! Engine configuration.

use std::time::Duration;

const MIB: usize = 1024 * 1024;

/// Configuration for the LMDB engine.
#[derive(Debug, Clone)]
pub struct EngineConfig {
    /// Map size used when the store is first opened.
    pub map_size: usize,

    /// Bytes added to the map each time it grows.
    pub growth_increment: usize,

    /// Estimate usage after this many mutations.
    pub growth_check_interval: u64,

    /// Headroom kept free below the map size.
    pub safety_margin: usize,

    /// Multiplier applied to the usage estimate to account for page
    /// fragmentation and serialization overhead.
    pub overhead_factor: f64,

    /// Commit the shared transaction at least this often.
    pub max_commit_interval: Duration,

    /// Commit once this many mutations are pending.
    pub max_uncommitted_writes: usize,

    /// Maximum number of named sub-databases.
    pub max_tables: u32,

    /// Capacity of the worker's command queue.
    pub queue_capacity: usize,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            map_size: 64 * MIB,
            growth_increment: 64 * MIB,
            growth_check_interval: 1000,
            safety_margin: 4 * MIB,
            overhead_factor: 1.6,
            max_commit_interval: Duration::from_secs(60),
            max_uncommitted_writes: 10_000,
            max_tables: 16,
            queue_capacity: 64,
        }
    }
}

impl EngineConfig {
    /// Creates a new configuration with default values.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Sets the initial map size.
    #[must_use]
    pub const fn map_size(mut self, bytes: usize) -> Self {
        self.map_size = bytes;
        self
    }

    /// Sets the growth increment.
    #[must_use]
    pub const fn growth_increment(mut self, bytes: usize) -> Self {
        self.growth_increment = bytes;
        self
    }

    /// Sets how many mutations pass between usage estimates.
    #[must_use]
    pub const fn growth_check_interval(mut self, writes: u64) -> Self {
        self.growth_check_interval = writes;
        self
    }

    /// Sets the safety margin.
    #[must_use]
    pub const fn safety_margin(mut self, bytes: usize) -> Self {
        self.safety_margin = bytes;
        self
    }

    /// Sets the maximum time between commits.
    #[must_use]
    pub const fn max_commit_interval(mut self, interval: Duration) -> Self {
        self.max_commit_interval = interval;
        self
    }

    /// Sets the maximum number of uncommitted mutations.
    #[must_use]
    pub const fn max_uncommitted_writes(mut self, writes: usize) -> Self {
        self.max_uncommitted_writes = writes;
        self
    }

    /// Returns the usable capacity of a map of `map_size` bytes.
    #[must_use]
    pub(crate) fn capacity(&self, map_size: usize) -> usize {
        map_size.saturating_sub(self.safety_margin)
    }
}
