//! Operation and unit identifiers.

use serde::{Deserialize, Serialize};
use std::cmp::Ordering;
use std::fmt;

/// Replica identifier.
pub type SiteId = String;

/// Globally unique identity of an operation, and of the unit an insert creates.
///
/// Ordered by `counter` first and `site` second. The same order is used to
/// place concurrent inserts (higher sorts later) and to break
/// last-writer-wins ties (higher wins).
#[derive(Clone, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct OpId {
    /// The replica that authored the operation.
    pub site: SiteId,
    /// Per-site sequence number.
    pub counter: u64,
}

impl OpId {
    pub fn new(site: impl Into<SiteId>, counter: u64) -> Self {
        Self {
            site: site.into(),
            counter,
        }
    }
}

impl PartialOrd for OpId {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for OpId {
    fn cmp(&self, other: &Self) -> Ordering {
        self.counter
            .cmp(&other.counter)
            .then_with(|| self.site.cmp(&other.site))
    }
}

impl fmt::Display for OpId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.site, self.counter)
    }
}
