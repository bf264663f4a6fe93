//! Stability monitoring for tombstone collection.
//!
//! The monitor tracks the vector clock each connected replica has reported
//! and derives the minimum observed version: the component-wise minimum of
//! those clocks. Anything it covers has reached every tracked replica.
//!
//! A replica that stops reporting would pin the minimum forever, so peers
//! whose last report is older than [`StabilityConfig::max_frontier_age`] are
//! left out of the computation.

use quire_core::VectorClock;
use serde::{Deserialize, Serialize};
use std::collections::{HashMap, HashSet};

/// A replica's reported frontier.
#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct FrontierUpdate {
    pub peer_id: String,
    pub vector_clock: VectorClock,
    /// Milliseconds since the Unix epoch.
    pub timestamp: u64,
}

/// Delivery state of a clock across tracked peers.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum StabilityState {
    /// No tracked peer has it.
    Pending,

    /// Some but not all peers have it.
    Partial {
        delivered_to: HashSet<String>,
        pending_for: HashSet<String>,
    },

    /// Every tracked peer has it.
    Stable,

    /// No peers tracked.
    Unknown,
}

/// Configuration for stability monitoring.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct StabilityConfig {
    /// Minimum number of fresh peers before anything counts as stable.
    pub min_peers_for_stability: usize,

    /// Age in milliseconds after which a peer's frontier is ignored.
    /// `None` keeps every peer until it is removed.
    pub max_frontier_age: Option<u64>,
}

impl Default for StabilityConfig {
    fn default() -> Self {
        StabilityConfig {
            min_peers_for_stability: 1,
            max_frontier_age: Some(10 * 60 * 1000),
        }
    }
}

/// Tracks peer frontiers and computes the minimum observed version.
#[derive(Clone, Debug, Default)]
pub struct StabilityMonitor {
    peer_frontiers: HashMap<String, VectorClock>,
    last_update: HashMap<String, u64>,
    config: StabilityConfig,
}

impl StabilityMonitor {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_config(config: StabilityConfig) -> Self {
        StabilityMonitor {
            config,
            ..Self::default()
        }
    }

    pub fn config(&self) -> &StabilityConfig {
        &self.config
    }

    /// Record a peer's frontier. Frontiers only move forward.
    pub fn update_peer_frontier(&mut self, update: FrontierUpdate) {
        self.peer_frontiers
            .entry(update.peer_id.clone())
            .or_default()
            .merge(&update.vector_clock);
        let last = self.last_update.entry(update.peer_id).or_insert(0);
        *last = (*last).max(update.timestamp);
    }

    /// Refresh a peer's timestamp without changing its frontier.
    pub fn touch(&mut self, peer_id: &str, timestamp: u64) {
        if let Some(last) = self.last_update.get_mut(peer_id) {
            *last = (*last).max(timestamp);
        }
    }

    pub fn remove_peer(&mut self, peer_id: &str) {
        self.peer_frontiers.remove(peer_id);
        self.last_update.remove(peer_id);
    }

    pub fn tracked_peers(&self) -> Vec<&String> {
        self.peer_frontiers.keys().collect()
    }

    pub fn peer_count(&self) -> usize {
        self.peer_frontiers.len()
    }

    pub fn peer_frontier(&self, peer_id: &str) -> Option<&VectorClock> {
        self.peer_frontiers.get(peer_id)
    }

    fn is_stale(&self, peer_id: &str, now: u64) -> bool {
        match (self.config.max_frontier_age, self.last_update.get(peer_id)) {
            (Some(max_age), Some(&updated)) => now.saturating_sub(updated) > max_age,
            _ => false,
        }
    }

    /// Peers whose last report is older than the configured age.
    pub fn stale_peers(&self, now: u64) -> Vec<String> {
        self.peer_frontiers
            .keys()
            .filter(|peer| self.is_stale(peer, now))
            .cloned()
            .collect()
    }

    /// Stop tracking stale peers.
    pub fn gc_stale_peers(&mut self, now: u64) -> Vec<String> {
        let stale = self.stale_peers(now);
        for peer_id in &stale {
            self.remove_peer(peer_id);
        }
        stale
    }

    fn fresh_frontiers(&self, now: u64) -> impl Iterator<Item = (&String, &VectorClock)> + '_ {
        self.peer_frontiers
            .iter()
            .filter(move |(peer, _)| !self.is_stale(peer, now))
    }

    /// Component-wise minimum over fresh peers.
    ///
    /// `None` when fewer fresh peers than `min_peers_for_stability` remain.
    pub fn minimum_observed_version(&self, now: u64) -> Option<VectorClock> {
        let fresh: Vec<&VectorClock> = self.fresh_frontiers(now).map(|(_, c)| c).collect();
        if fresh.is_empty() || fresh.len() < self.config.min_peers_for_stability {
            return None;
        }
        VectorClock::meet(fresh)
    }

    /// Whether operation `(site, counter)` reached every fresh peer.
    pub fn is_operation_stable(&self, site: &str, counter: u64, now: u64) -> bool {
        self.minimum_observed_version(now)
            .is_some_and(|mov| mov.contains(site, counter))
    }

    pub fn stability_state(&self, clock: &VectorClock, now: u64) -> StabilityState {
        let mut delivered_to = HashSet::new();
        let mut pending_for = HashSet::new();
        for (peer, frontier) in self.fresh_frontiers(now) {
            if frontier.dominates(clock) {
                delivered_to.insert(peer.clone());
            } else {
                pending_for.insert(peer.clone());
            }
        }

        match (delivered_to.is_empty(), pending_for.is_empty()) {
            (true, true) => StabilityState::Unknown,
            (false, true) => StabilityState::Stable,
            (true, false) => StabilityState::Pending,
            (false, false) => StabilityState::Partial {
                delivered_to,
                pending_for,
            },
        }
    }

    pub fn stats(&self, now: u64) -> StabilityStats {
        let stable_operations = self
            .minimum_observed_version(now)
            .map(|mov| mov.total_operations())
            .unwrap_or(0);
        StabilityStats {
            peer_count: self.peer_frontiers.len(),
            stale_peers: self.stale_peers(now).len(),
            stable_operations,
        }
    }
}

/// Statistics about stability.
#[derive(Clone, Debug)]
pub struct StabilityStats {
    pub peer_count: usize,
    pub stale_peers: usize,
    pub stable_operations: u64,
}
