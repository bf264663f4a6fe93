//! Maintenance scheduling.
//!
//! The [`Compactor`] decides, from a document's operation counters, when to
//! snapshot, how much of the operation log a snapshot makes redundant, and
//! when to run tombstone collection. It keeps running totals of what it
//! scheduled.

use serde::{Deserialize, Serialize};

/// Configuration for the compactor.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct CompactionConfig {
    /// Operations between snapshots. The log keeps twice this many.
    pub snapshot_interval: u64,

    /// Operations between tombstone collection runs.
    pub gc_interval: u64,
}

impl Default for CompactionConfig {
    fn default() -> Self {
        CompactionConfig {
            snapshot_interval: 100,
            gc_interval: 250,
        }
    }
}

/// What is due for a document right now.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct CompactionPlan {
    pub snapshot: bool,
    /// Delete logged operations with `sequence <= truncate_up_to`.
    pub truncate_up_to: Option<u64>,
    pub collect_garbage: bool,
}

impl CompactionPlan {
    pub fn is_empty(&self) -> bool {
        !self.snapshot && self.truncate_up_to.is_none() && !self.collect_garbage
    }
}

/// Statistics about scheduled maintenance.
#[derive(Clone, Debug, Default)]
pub struct CompactionStats {
    pub snapshots_created: u64,
    pub operations_truncated: u64,
    pub gc_runs: u64,
    pub tombstones_collected: u64,
}

/// Schedules snapshots, log truncation and tombstone collection.
#[derive(Clone, Debug, Default)]
pub struct Compactor {
    config: CompactionConfig,
    stats: CompactionStats,
}

impl Compactor {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_config(config: CompactionConfig) -> Self {
        Compactor {
            config,
            stats: CompactionStats::default(),
        }
    }

    pub fn config(&self) -> &CompactionConfig {
        &self.config
    }

    pub fn stats(&self) -> &CompactionStats {
        &self.stats
    }

    /// Whether enough operations accumulated since the last snapshot.
    pub fn should_snapshot(&self, operation_count: u64, last_snapshot_count: u64) -> bool {
        self.config.snapshot_interval > 0
            && operation_count.saturating_sub(last_snapshot_count) >= self.config.snapshot_interval
    }

    /// Highest log sequence made redundant by a snapshot at `operation_count`.
    ///
    /// The newest `2 * snapshot_interval` operations are always retained.
    pub fn truncation_point(&self, operation_count: u64) -> Option<u64> {
        let retained = self.config.snapshot_interval.checked_mul(2)?;
        if retained == 0 || operation_count < retained {
            return None;
        }
        Some(operation_count - retained).filter(|&up_to| up_to > 0)
    }

    /// Whether a collection run is due.
    pub fn should_collect(&self, operation_count: u64, last_gc_count: u64) -> bool {
        self.config.gc_interval > 0
            && operation_count.saturating_sub(last_gc_count) >= self.config.gc_interval
    }

    /// Everything due for a document with these counters.
    pub fn plan(&self, operation_count: u64, last_snapshot_count: u64, last_gc_count: u64) -> CompactionPlan {
        let snapshot = self.should_snapshot(operation_count, last_snapshot_count);
        CompactionPlan {
            snapshot,
            truncate_up_to: if snapshot {
                self.truncation_point(operation_count)
            } else {
                None
            },
            collect_garbage: self.should_collect(operation_count, last_gc_count),
        }
    }

    pub fn record_snapshot(&mut self) {
        self.stats.snapshots_created += 1;
    }

    pub fn record_truncation(&mut self, removed: u64) {
        self.stats.operations_truncated += removed;
    }

    pub fn record_gc(&mut self, removed: usize) {
        self.stats.gc_runs += 1;
        self.stats.tombstones_collected += removed as u64;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn compactor(snapshot_interval: u64, gc_interval: u64) -> Compactor {
        Compactor::with_config(CompactionConfig {
            snapshot_interval,
            gc_interval,
        })
    }

    #[test]
    fn test_snapshot_schedule() {
        let c = compactor(100, 250);
        assert!(!c.should_snapshot(99, 0));
        assert!(c.should_snapshot(100, 0));
        assert!(!c.should_snapshot(150, 100));
        assert!(c.should_snapshot(230, 100));
    }

    #[test]
    fn test_truncation_keeps_two_intervals() {
        let c = compactor(200, 250);
        assert_eq!(c.truncation_point(200), None);
        assert_eq!(c.truncation_point(400), None);
        assert_eq!(c.truncation_point(600), Some(200));
        assert_eq!(c.truncation_point(1000), Some(600));
    }

    #[test]
    fn test_plan() {
        let c = compactor(100, 250);
        assert!(c.plan(50, 0, 0).is_empty());
        assert_eq!(
            c.plan(300, 200, 0),
            CompactionPlan {
                snapshot: true,
                truncate_up_to: Some(100),
                collect_garbage: true,
            }
        );
        assert_eq!(
            c.plan(260, 200, 250),
            CompactionPlan::default()
        );
    }

    #[test]
    fn test_zero_intervals_disable() {
        let c = compactor(0, 0);
        assert!(c.plan(10_000, 0, 0).is_empty());
    }

    #[test]
    fn test_stats() {
        let mut c = Compactor::new();
        c.record_snapshot();
        c.record_truncation(40);
        c.record_gc(3);
        c.record_gc(0);
        assert_eq!(c.stats().snapshots_created, 1);
        assert_eq!(c.stats().operations_truncated, 40);
        assert_eq!(c.stats().gc_runs, 2);
        assert_eq!(c.stats().tombstones_collected, 3);
    }
}
