//! # quire-compaction
//!
//! Bounded history for Quire documents.
//!
//! This crate provides:
//! - Snapshots: full document state at an operation count, digest-checked
//! - Stability monitoring: the minimum observed version across replicas,
//!   which gates tombstone collection
//! - Compaction scheduling: when to snapshot, truncate the log and collect
//!
//! ## Example
//!
//! ```rust
//! use quire_compaction::{Compactor, CompactionConfig, Snapshot};
//! use quire_text::Replica;
//!
//! let mut replica = Replica::new("A");
//! replica.insert(0, "hello").unwrap();
//!
//! let compactor = Compactor::with_config(CompactionConfig {
//!     snapshot_interval: 5,
//!     gc_interval: 10,
//! });
//! assert!(compactor.should_snapshot(5, 0));
//!
//! let snapshot = Snapshot::capture("doc", 5, replica.document(), "server").unwrap();
//! assert_eq!(snapshot.restore().unwrap().text(), "hello");
//! ```

mod compactor;
mod snapshot;
mod stability;

pub use compactor::{CompactionConfig, CompactionPlan, CompactionStats, Compactor};
pub use snapshot::{Snapshot, SnapshotError, SNAPSHOT_VERSION};
pub use stability::{
    FrontierUpdate, StabilityConfig, StabilityMonitor, StabilityState, StabilityStats,
};
