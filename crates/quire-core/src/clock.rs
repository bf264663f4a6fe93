//! Vector clocks and applied-operation sets.
//!
//! A [`VectorClock`] summarizes causal progress by tracking the highest
//! counter applied for each site. It is what replicas exchange to ask for
//! missing operations, and what the minimum observed version is computed from.
//!
//! A [`DotSet`] remembers exactly which operations were applied. Operations
//! from one site can arrive out of counter order (offline replay, retries),
//! and a max-only clock would mistake the late, lower counter for a duplicate.

use crate::id::OpId;
use crate::lattice::Lattice;
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, BTreeSet};

/// A single entry in a vector clock.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ClockEntry {
    pub site_id: String,
    pub counter: u64,
}

/// Highest applied counter per site.
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct VectorClock {
    entries: BTreeMap<String, u64>,
}

impl VectorClock {
    /// Create an empty vector clock.
    pub fn new() -> Self {
        VectorClock {
            entries: BTreeMap::new(),
        }
    }

    /// Create a vector clock from `(site, counter)` pairs.
    pub fn from_entries(entries: impl IntoIterator<Item = (String, u64)>) -> Self {
        VectorClock {
            entries: entries.into_iter().filter(|(_, c)| *c > 0).collect(),
        }
    }

    /// Counter for a site, 0 when the site is unknown.
    pub fn get(&self, site: &str) -> u64 {
        self.entries.get(site).copied().unwrap_or(0)
    }

    /// Move a site's entry forward to `counter`.
    ///
    /// Returns false (and leaves the clock untouched) when the entry is
    /// already at or past `counter`.
    pub fn advance(&mut self, site: &str, counter: u64) -> bool {
        if counter <= self.get(site) {
            return false;
        }
        self.entries.insert(site.to_string(), counter);
        true
    }

    /// Advance the entry for an operation id.
    pub fn observe(&mut self, id: &OpId) -> bool {
        self.advance(&id.site, id.counter)
    }

    /// Whether `(site, counter)` is at or below this clock.
    pub fn contains(&self, site: &str, counter: u64) -> bool {
        self.get(site) >= counter
    }

    /// Whether an operation id is at or below this clock.
    pub fn covers(&self, id: &OpId) -> bool {
        self.contains(&id.site, id.counter)
    }

    /// True if for every site, `self[site] >= other[site]`.
    pub fn dominates(&self, other: &VectorClock) -> bool {
        other
            .entries
            .iter()
            .all(|(site, &counter)| self.get(site) >= counter)
    }

    /// Neither clock dominates the other.
    pub fn is_concurrent_with(&self, other: &VectorClock) -> bool {
        !self.dominates(other) && !other.dominates(self)
    }

    /// Component-wise max, in place.
    pub fn merge(&mut self, other: &VectorClock) {
        for (site, &counter) in &other.entries {
            let current = self.entries.entry(site.clone()).or_insert(0);
            *current = (*current).max(counter);
        }
    }

    /// Component-wise max without modifying self.
    pub fn merged_with(&self, other: &VectorClock) -> VectorClock {
        let mut result = self.clone();
        result.merge(other);
        result
    }

    /// Component-wise min. A site missing from either side counts as 0 and is
    /// therefore absent from the result.
    pub fn min_with(&self, other: &VectorClock) -> VectorClock {
        let entries = self
            .entries
            .iter()
            .filter_map(|(site, &counter)| {
                let min = counter.min(other.get(site));
                (min > 0).then(|| (site.clone(), min))
            })
            .collect();
        VectorClock { entries }
    }

    /// Component-wise min over any number of clocks; `None` for an empty input.
    pub fn meet<'a>(clocks: impl IntoIterator<Item = &'a VectorClock>) -> Option<VectorClock> {
        clocks.into_iter().fold(None, |acc, clock| match acc {
            None => Some(clock.clone()),
            Some(acc) => Some(acc.min_with(clock)),
        })
    }

    /// Per-site ranges present in self but not in other, as
    /// `(site, first_missing, last)`.
    pub fn diff(&self, other: &VectorClock) -> Vec<(String, u64, u64)> {
        self.entries
            .iter()
            .filter_map(|(site, &counter)| {
                let theirs = other.get(site);
                (counter > theirs).then(|| (site.clone(), theirs + 1, counter))
            })
            .collect()
    }

    /// Highest counter across all sites.
    pub fn max_counter(&self) -> u64 {
        self.entries.values().copied().max().unwrap_or(0)
    }

    /// Sum of all entries.
    pub fn total_operations(&self) -> u64 {
        self.entries.values().sum()
    }

    pub fn iter(&self) -> impl Iterator<Item = (&String, &u64)> {
        self.entries.iter()
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn to_entries(&self) -> Vec<ClockEntry> {
        self.entries
            .iter()
            .map(|(site_id, &counter)| ClockEntry {
                site_id: site_id.clone(),
                counter,
            })
            .collect()
    }

    pub fn from_entry_list(entries: Vec<ClockEntry>) -> Self {
        Self::from_entries(entries.into_iter().map(|e| (e.site_id, e.counter)))
    }
}

impl Lattice for VectorClock {
    fn bottom() -> Self {
        VectorClock::new()
    }

    fn join(&self, other: &Self) -> Self {
        self.merged_with(other)
    }
}

/// Exact set of applied operation ids.
///
/// Stored as a contiguous frontier per site plus the sparse dots above it;
/// the sparse part folds into the frontier as gaps fill.
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct DotSet {
    frontier: BTreeMap<String, u64>,
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    cloud: BTreeMap<String, BTreeSet<u64>>,
}

impl DotSet {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn contains(&self, id: &OpId) -> bool {
        if id.counter <= self.frontier.get(&id.site).copied().unwrap_or(0) {
            return true;
        }
        self.cloud
            .get(&id.site)
            .is_some_and(|dots| dots.contains(&id.counter))
    }

    /// Record a dot. Returns false if it was already present.
    pub fn insert(&mut self, id: &OpId) -> bool {
        if id.counter == 0 || self.contains(id) {
            return false;
        }

        let frontier = self.frontier.entry(id.site.clone()).or_insert(0);
        if id.counter == *frontier + 1 {
            *frontier = id.counter;
            if let Some(dots) = self.cloud.get_mut(&id.site) {
                while dots.remove(&(*frontier + 1)) {
                    *frontier += 1;
                }
                if dots.is_empty() {
                    self.cloud.remove(&id.site);
                }
            }
        } else {
            self.cloud
                .entry(id.site.clone())
                .or_default()
                .insert(id.counter);
        }
        true
    }

    /// The contiguous part as a vector clock.
    pub fn frontier(&self) -> VectorClock {
        VectorClock::from_entries(self.frontier.iter().map(|(s, &c)| (s.clone(), c)))
    }

    /// Number of out-of-order dots not yet folded into the frontier.
    pub fn gap_count(&self) -> usize {
        self.cloud.values().map(BTreeSet::len).sum()
    }

    pub fn is_empty(&self) -> bool {
        self.frontier.values().all(|&c| c == 0) && self.cloud.is_empty()
    }
}
