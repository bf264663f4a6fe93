//! Service configuration.

use quire_compaction::CompactionConfig;
use serde::{Deserialize, Serialize};
use std::time::Duration;
use ulid::Ulid;

/// Configuration for a [`DocumentService`](crate::DocumentService).
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct ServiceConfig {
    /// Identity of this server on the distribution channel.
    pub server_id: String,
    /// Operations between snapshots.
    pub snapshot_interval: u64,
    /// Operations between tombstone collection runs.
    pub gc_interval: u64,
    /// How long a session with no connections is kept before teardown.
    pub teardown_grace: Duration,
    /// Client sessions silent for longer than this are left out of the
    /// minimum observed version. `None` waits for every connected client.
    pub stale_session_after: Option<Duration>,
}

impl Default for ServiceConfig {
    fn default() -> Self {
        Self {
            server_id: Ulid::new().to_string(),
            snapshot_interval: 100,
            gc_interval: 250,
            teardown_grace: Duration::from_secs(30),
            stale_session_after: Some(Duration::from_secs(10 * 60)),
        }
    }
}

impl ServiceConfig {
    pub fn builder() -> ServiceConfigBuilder {
        ServiceConfigBuilder::new()
    }

    pub fn compaction(&self) -> CompactionConfig {
        CompactionConfig {
            snapshot_interval: self.snapshot_interval,
            gc_interval: self.gc_interval,
        }
    }
}

/// Builder for [`ServiceConfig`].
pub struct ServiceConfigBuilder {
    config: ServiceConfig,
}

impl ServiceConfigBuilder {
    pub fn new() -> Self {
        Self {
            config: ServiceConfig::default(),
        }
    }

    pub fn server_id(mut self, id: impl Into<String>) -> Self {
        self.config.server_id = id.into();
        self
    }

    pub fn snapshot_interval(mut self, operations: u64) -> Self {
        self.config.snapshot_interval = operations;
        self
    }

    pub fn gc_interval(mut self, operations: u64) -> Self {
        self.config.gc_interval = operations;
        self
    }

    pub fn teardown_grace(mut self, grace: Duration) -> Self {
        self.config.teardown_grace = grace;
        self
    }

    pub fn stale_session_after(mut self, after: Option<Duration>) -> Self {
        self.config.stale_session_after = after;
        self
    }

    pub fn build(self) -> ServiceConfig {
        self.config
    }
}

impl Default for ServiceConfigBuilder {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults() {
        let config = ServiceConfig::default();
        assert_eq!(config.snapshot_interval, 100);
        assert_eq!(config.gc_interval, 250);
        assert_eq!(config.teardown_grace, Duration::from_secs(30));
        assert_eq!(config.server_id.len(), 26);
    }

    #[test]
    fn test_builder() {
        let config = ServiceConfig::builder()
            .server_id("server-1")
            .snapshot_interval(200)
            .gc_interval(50)
            .teardown_grace(Duration::from_millis(10))
            .stale_session_after(None)
            .build();

        assert_eq!(config.server_id, "server-1");
        assert_eq!(config.compaction().snapshot_interval, 200);
        assert_eq!(config.compaction().gc_interval, 50);
        assert!(config.stale_session_after.is_none());
    }

    #[test]
    fn test_distinct_server_ids() {
        assert_ne!(
            ServiceConfig::default().server_id,
            ServiceConfig::default().server_id
        );
    }
}
