//! Persistence contract and the in-memory store.

use crate::error::StoreError;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use parking_lot::RwLock;
use quire_compaction::{FrontierUpdate, Snapshot, StabilityConfig, StabilityMonitor};
use quire_core::{OpId, VectorClock};
use quire_text::Operation;
use serde::{Deserialize, Serialize};
use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

/// Persisted document metadata.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DocumentRecord {
    pub id: String,
    pub title: String,
    /// Operations applied as of the last record update.
    pub operation_count: u64,
    /// Minimum observed version at the last collection run.
    pub minimum_observed_version: Option<VectorClock>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl DocumentRecord {
    pub fn new(id: impl Into<String>, title: impl Into<String>) -> Self {
        let now = Utc::now();
        Self {
            id: id.into(),
            title: title.into(),
            operation_count: 0,
            minimum_observed_version: None,
            created_at: now,
            updated_at: now,
        }
    }
}

/// An operation in a document's persisted log.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct StoredOperation {
    /// 1-based position in the log. Never reused, even after compaction.
    pub sequence: u64,
    pub operation: Operation,
}

/// A replica's registration on a document.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ClientSession {
    pub document_id: String,
    pub client_id: String,
    pub site_id: String,
    /// What the replica is known to have observed.
    pub vector_clock: VectorClock,
    pub connected: bool,
    pub last_seen: DateTime<Utc>,
}

impl ClientSession {
    pub fn new(
        document_id: impl Into<String>,
        client_id: impl Into<String>,
        site_id: impl Into<String>,
        vector_clock: VectorClock,
    ) -> Self {
        Self {
            document_id: document_id.into(),
            client_id: client_id.into(),
            site_id: site_id.into(),
            vector_clock,
            connected: true,
            last_seen: Utc::now(),
        }
    }
}

/// Durable storage for documents, their operation logs, snapshots and
/// client sessions.
#[async_trait]
pub trait DocumentStore: Send + Sync + 'static {
    async fn create_document(&self, id: &str, title: &str) -> Result<DocumentRecord, StoreError>;

    async fn get_document(&self, id: &str) -> Result<Option<DocumentRecord>, StoreError>;

    async fn update_document(&self, record: DocumentRecord) -> Result<(), StoreError>;

    /// Append an operation. Returns `false` if `(document, site, counter)`
    /// was already stored.
    async fn insert_operation(
        &self,
        document_id: &str,
        operation: &Operation,
    ) -> Result<bool, StoreError>;

    /// Logged operations not covered by `clock`, in log order.
    async fn operations_after(
        &self,
        document_id: &str,
        clock: &VectorClock,
    ) -> Result<Vec<StoredOperation>, StoreError>;

    async fn all_operations(&self, document_id: &str) -> Result<Vec<StoredOperation>, StoreError>;

    async fn create_snapshot(&self, snapshot: Snapshot) -> Result<(), StoreError>;

    async fn latest_snapshot(&self, document_id: &str) -> Result<Option<Snapshot>, StoreError>;

    /// Insert or replace a client session.
    async fn register_client(&self, session: ClientSession) -> Result<(), StoreError>;

    /// Merge `clock` into the client's observed clock and refresh `last_seen`.
    async fn update_client_clock(
        &self,
        document_id: &str,
        client_id: &str,
        clock: &VectorClock,
    ) -> Result<(), StoreError>;

    async fn disconnect_client(&self, document_id: &str, client_id: &str) -> Result<(), StoreError>;

    /// Component-wise minimum of the connected clients' clocks, leaving out
    /// sessions silent for longer than `stale_after`. `None` when no client
    /// qualifies.
    async fn minimum_observed_version(
        &self,
        document_id: &str,
        stale_after: Option<Duration>,
    ) -> Result<Option<VectorClock>, StoreError>;

    async fn update_minimum_observed_version(
        &self,
        document_id: &str,
        mov: &VectorClock,
    ) -> Result<(), StoreError>;

    /// Delete logged operations with `sequence <= up_to_sequence`.
    /// Returns how many were removed.
    async fn compact_operations(
        &self,
        document_id: &str,
        up_to_sequence: u64,
    ) -> Result<u64, StoreError>;
}

/// Per-document data held by [`MemoryStore`].
struct DocumentData {
    record: DocumentRecord,
    operations: Vec<StoredOperation>,
    /// Every id ever inserted, so retries stay idempotent after compaction.
    keys: HashSet<OpId>,
    last_sequence: u64,
    snapshots: Vec<Snapshot>,
    clients: HashMap<String, ClientSession>,
}

impl DocumentData {
    fn new(record: DocumentRecord) -> Self {
        Self {
            record,
            operations: Vec::new(),
            keys: HashSet::new(),
            last_sequence: 0,
            snapshots: Vec::new(),
            clients: HashMap::new(),
        }
    }
}

/// Snapshots kept per document by [`MemoryStore`].
const RETAINED_SNAPSHOTS: usize = 2;

fn millis(at: DateTime<Utc>) -> u64 {
    at.timestamp_millis().max(0) as u64
}

/// In-memory [`DocumentStore`] for tests and simulation.
///
/// Writes can be made to fail with [`MemoryStore::set_failing`].
#[derive(Default)]
pub struct MemoryStore {
    documents: RwLock<HashMap<String, DocumentData>>,
    failing: AtomicBool,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Make every write fail with [`StoreError::Unavailable`].
    pub fn set_failing(&self, failing: bool) {
        self.failing.store(failing, Ordering::SeqCst);
    }

    fn check_writable(&self) -> Result<(), StoreError> {
        if self.failing.load(Ordering::SeqCst) {
            return Err(StoreError::Unavailable("injected failure".to_string()));
        }
        Ok(())
    }

    /// Number of operations currently in a document's log.
    pub fn operation_count(&self, document_id: &str) -> usize {
        self.documents
            .read()
            .get(document_id)
            .map_or(0, |d| d.operations.len())
    }

    pub fn snapshot_count(&self, document_id: &str) -> usize {
        self.documents
            .read()
            .get(document_id)
            .map_or(0, |d| d.snapshots.len())
    }

    pub fn client_session(&self, document_id: &str, client_id: &str) -> Option<ClientSession> {
        self.documents
            .read()
            .get(document_id)
            .and_then(|d| d.clients.get(client_id).cloned())
    }

    fn with_document<R>(
        &self,
        document_id: &str,
        f: impl FnOnce(&DocumentData) -> R,
    ) -> Result<R, StoreError> {
        let documents = self.documents.read();
        let data = documents
            .get(document_id)
            .ok_or_else(|| StoreError::NotFound(document_id.to_string()))?;
        Ok(f(data))
    }

    fn with_document_mut<R>(
        &self,
        document_id: &str,
        f: impl FnOnce(&mut DocumentData) -> Result<R, StoreError>,
    ) -> Result<R, StoreError> {
        self.check_writable()?;
        let mut documents = self.documents.write();
        let data = documents
            .get_mut(document_id)
            .ok_or_else(|| StoreError::NotFound(document_id.to_string()))?;
        f(data)
    }
}

#[async_trait]
impl DocumentStore for MemoryStore {
    async fn create_document(&self, id: &str, title: &str) -> Result<DocumentRecord, StoreError> {
        self.check_writable()?;
        let mut documents = self.documents.write();
        if documents.contains_key(id) {
            return Err(StoreError::AlreadyExists(id.to_string()));
        }
        let record = DocumentRecord::new(id, title);
        documents.insert(id.to_string(), DocumentData::new(record.clone()));
        Ok(record)
    }

    async fn get_document(&self, id: &str) -> Result<Option<DocumentRecord>, StoreError> {
        Ok(self.documents.read().get(id).map(|d| d.record.clone()))
    }

    async fn update_document(&self, record: DocumentRecord) -> Result<(), StoreError> {
        self.with_document_mut(&record.id.clone(), |data| {
            data.record = DocumentRecord {
                updated_at: Utc::now(),
                ..record
            };
            Ok(())
        })
    }

    async fn insert_operation(
        &self,
        document_id: &str,
        operation: &Operation,
    ) -> Result<bool, StoreError> {
        self.with_document_mut(document_id, |data| {
            if !data.keys.insert(operation.id()) {
                return Ok(false);
            }
            data.last_sequence += 1;
            data.operations.push(StoredOperation {
                sequence: data.last_sequence,
                operation: operation.clone(),
            });
            Ok(true)
        })
    }

    async fn operations_after(
        &self,
        document_id: &str,
        clock: &VectorClock,
    ) -> Result<Vec<StoredOperation>, StoreError> {
        self.with_document(document_id, |data| {
            data.operations
                .iter()
                .filter(|stored| !clock.covers(&stored.operation.id()))
                .cloned()
                .collect()
        })
    }

    async fn all_operations(&self, document_id: &str) -> Result<Vec<StoredOperation>, StoreError> {
        self.with_document(document_id, |data| data.operations.clone())
    }

    async fn create_snapshot(&self, snapshot: Snapshot) -> Result<(), StoreError> {
        let document_id = snapshot.document_id.clone();
        self.with_document_mut(&document_id, |data| {
            data.snapshots.push(snapshot);
            data.snapshots.sort_by_key(|s| s.operation_count);
            let excess = data.snapshots.len().saturating_sub(RETAINED_SNAPSHOTS);
            data.snapshots.drain(..excess);
            Ok(())
        })
    }

    async fn latest_snapshot(&self, document_id: &str) -> Result<Option<Snapshot>, StoreError> {
        self.with_document(document_id, |data| data.snapshots.last().cloned())
    }

    async fn register_client(&self, session: ClientSession) -> Result<(), StoreError> {
        let document_id = session.document_id.clone();
        self.with_document_mut(&document_id, |data| {
            data.clients.insert(session.client_id.clone(), session);
            Ok(())
        })
    }

    async fn update_client_clock(
        &self,
        document_id: &str,
        client_id: &str,
        clock: &VectorClock,
    ) -> Result<(), StoreError> {
        self.with_document_mut(document_id, |data| {
            let client = data
                .clients
                .get_mut(client_id)
                .ok_or_else(|| StoreError::UnknownClient {
                    document_id: document_id.to_string(),
                    client_id: client_id.to_string(),
                })?;
            client.vector_clock.merge(clock);
            client.last_seen = Utc::now();
            Ok(())
        })
    }

    async fn disconnect_client(&self, document_id: &str, client_id: &str) -> Result<(), StoreError> {
        self.with_document_mut(document_id, |data| {
            if let Some(client) = data.clients.get_mut(client_id) {
                client.connected = false;
                client.last_seen = Utc::now();
            }
            Ok(())
        })
    }

    async fn minimum_observed_version(
        &self,
        document_id: &str,
        stale_after: Option<Duration>,
    ) -> Result<Option<VectorClock>, StoreError> {
        self.with_document(document_id, |data| {
            let mut monitor = StabilityMonitor::with_config(StabilityConfig {
                min_peers_for_stability: 1,
                max_frontier_age: stale_after.map(|d| d.as_millis() as u64),
            });
            for client in data.clients.values().filter(|c| c.connected) {
                monitor.update_peer_frontier(FrontierUpdate {
                    peer_id: client.client_id.clone(),
                    vector_clock: client.vector_clock.clone(),
                    timestamp: millis(client.last_seen),
                });
            }
            monitor.minimum_observed_version(millis(Utc::now()))
        })
    }

    async fn update_minimum_observed_version(
        &self,
        document_id: &str,
        mov: &VectorClock,
    ) -> Result<(), StoreError> {
        self.with_document_mut(document_id, |data| {
            data.record.minimum_observed_version = Some(mov.clone());
            data.record.updated_at = Utc::now();
            Ok(())
        })
    }

    async fn compact_operations(
        &self,
        document_id: &str,
        up_to_sequence: u64,
    ) -> Result<u64, StoreError> {
        self.with_document_mut(document_id, |data| {
            let before = data.operations.len();
            data.operations.retain(|stored| stored.sequence > up_to_sequence);
            Ok((before - data.operations.len()) as u64)
        })
    }
}
