//! Engine statistics.

use std::sync::atomic::{AtomicU64, Ordering};

/// Counters maintained by a storage engine.
///
/// All counters are atomic and can be read while the engine is working.
#[derive(Debug, Default)]
pub struct EngineStats {
    /// Number of write batches applied.
    batches: AtomicU64,
    /// Number of individual mutations applied.
    writes: AtomicU64,
    /// Number of successful commits.
    commits: AtomicU64,
    /// Number of times the map was enlarged.
    growths: AtomicU64,
    /// Current map size in bytes.
    map_size: AtomicU64,
}

impl EngineStats {
    /// Creates zeroed statistics for a map of `map_size` bytes.
    #[must_use]
    pub fn new(map_size: u64) -> Self {
        let stats = Self::default();
        stats.map_size.store(map_size, Ordering::Relaxed);
        stats
    }

    pub(crate) fn record_batch(&self, ops: usize) {
        self.batches.fetch_add(1, Ordering::Relaxed);
        self.writes.fetch_add(ops as u64, Ordering::Relaxed);
    }

    pub(crate) fn record_commit(&self) {
        self.commits.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn record_growth(&self, new_size: u64) {
        self.growths.fetch_add(1, Ordering::Relaxed);
        self.map_size.store(new_size, Ordering::Relaxed);
    }

    /// Takes a point-in-time copy of the counters.
    #[must_use]
    pub fn snapshot(&self) -> EngineStatsSnapshot {
        EngineStatsSnapshot {
            batches: self.batches.load(Ordering::Relaxed),
            writes: self.writes.load(Ordering::Relaxed),
            commits: self.commits.load(Ordering::Relaxed),
            growths: self.growths.load(Ordering::Relaxed),
            map_size: self.map_size.load(Ordering::Relaxed),
        }
    }
}

/// A snapshot of [`EngineStats`].
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct EngineStatsSnapshot {
    /// Write batches applied.
    pub batches: u64,
    /// Individual mutations applied.
    pub writes: u64,
    /// Successful commits.
    pub commits: u64,
    /// Map enlargements.
    pub growths: u64,
    /// Current map size in bytes.
    pub map_size: u64,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn counters_accumulate() {
        let stats = EngineStats::new(1024);
        stats.record_batch(3);
        stats.record_batch(2);
        stats.record_commit();
        stats.record_growth(2048);

        let snap = stats.snapshot();
        assert_eq!(snap.batches, 2);
        assert_eq!(snap.writes, 5);
        assert_eq!(snap.commits, 1);
        assert_eq!(snap.growths, 1);
        assert_eq!(snap.map_size, 2048);
    }
}
