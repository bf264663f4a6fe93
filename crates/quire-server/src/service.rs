//! The document service.
//!
//! One [`DocumentService`] runs per server process. It keeps a live
//! [`DocumentSession`] for every document with connected clients, applies
//! client operations to it, fans them out to the other clients and to
//! peer servers, and persists them. Snapshots, log truncation and tombstone
//! collection are driven from the per-document operation count.
//!
//! Locks are always taken in the order loading map, sessions map, session
//! state, and none of them is held across an `.await`.

use crate::config::ServiceConfig;
use crate::connection::{Connection, ServerMessage};
use crate::distribution::{DistributedOperation, Distribution, DistributionHandler};
use crate::error::{Result, ServiceError};
use crate::session::{broadcast, ClientConnection, DocumentSession, JoinedDocument};
use crate::store::{ClientSession, DocumentRecord, DocumentStore};
use futures::future::{BoxFuture, FutureExt, Shared};
use parking_lot::Mutex;
use quire_compaction::{CompactionStats, Compactor, Snapshot};
use quire_core::VectorClock;
use quire_text::{CrdtDocument, Operation};
use std::collections::HashMap;
use std::sync::{Arc, Weak};
use tracing::{debug, info, warn};

type LoadFuture = Shared<BoxFuture<'static, Result<Arc<DocumentSession>>>>;

struct Inner {
    config: ServiceConfig,
    store: Arc<dyn DocumentStore>,
    distribution: Arc<dyn Distribution>,
    sessions: Mutex<HashMap<String, Arc<DocumentSession>>>,
    /// Session loads in flight, shared by every caller asking for the same document.
    loading: Mutex<HashMap<String, LoadFuture>>,
    compactor: Mutex<Compactor>,
}

/// Hosts live documents for connected clients.
///
/// Cheap to clone; clones share the same sessions.
#[derive(Clone)]
pub struct DocumentService {
    inner: Arc<Inner>,
}

impl DocumentService {
    pub fn new(
        config: ServiceConfig,
        store: Arc<dyn DocumentStore>,
        distribution: Arc<dyn Distribution>,
    ) -> Self {
        let compactor = Compactor::with_config(config.compaction());
        Self {
            inner: Arc::new(Inner {
                config,
                store,
                distribution,
                sessions: Mutex::new(HashMap::new()),
                loading: Mutex::new(HashMap::new()),
                compactor: Mutex::new(compactor),
            }),
        }
    }

    pub fn server_id(&self) -> &str {
        &self.inner.config.server_id
    }

    pub fn config(&self) -> &ServiceConfig {
        &self.inner.config
    }

    /// The live session for a document, if one is loaded.
    pub fn session(&self, document_id: &str) -> Option<Arc<DocumentSession>> {
        self.inner.sessions.lock().get(document_id).cloned()
    }

    /// Ids of every document with a live session.
    pub fn live_documents(&self) -> Vec<String> {
        let mut ids: Vec<String> = self.inner.sessions.lock().keys().cloned().collect();
        ids.sort();
        ids
    }

    pub fn compaction_stats(&self) -> CompactionStats {
        self.inner.compactor.lock().stats().clone()
    }

    pub async fn create_document(&self, document_id: &str, title: &str) -> Result<DocumentRecord> {
        let record = self.inner.store.create_document(document_id, title).await?;
        info!(document_id, title, "Created document");
        Ok(record)
    }

    /// Attach a client to a document, loading its session if needed.
    ///
    /// The client is sent the full document state, then any logged
    /// operations its `last_seen` clock does not cover.
    pub async fn join_document(
        &self,
        document_id: &str,
        client_id: &str,
        site_id: &str,
        connection: Arc<dyn Connection>,
        last_seen: Option<&VectorClock>,
    ) -> Result<JoinedDocument> {
        let observed = last_seen.cloned().unwrap_or_default();
        loop {
            let session = self.get_or_load_session(document_id).await?;
            self.inner
                .store
                .register_client(ClientSession::new(
                    document_id,
                    client_id,
                    site_id,
                    observed.clone(),
                ))
                .await?;

            let state = {
                let mut state = session.state.lock();
                if state.closed {
                    None
                } else {
                    if let Some(teardown) = state.teardown.take() {
                        teardown.abort();
                        debug!(document_id, "Cancelled session teardown");
                    }
                    state.connections.insert(
                        client_id.to_string(),
                        ClientConnection {
                            site_id: site_id.to_string(),
                            connection: Arc::clone(&connection),
                            observed: observed.clone(),
                        },
                    );
                    Some(state.document.to_state())
                }
            };
            let Some(state) = state else {
                debug!(document_id, client_id, "Session closed during join, retrying");
                continue;
            };

            if let Err(e) = connection.send(ServerMessage::State {
                document_id: document_id.to_string(),
                state: state.clone(),
            }) {
                warn!(document_id, client_id, error = %e, "Failed to send document state");
            }

            let missing_operations = match last_seen {
                Some(clock) => self
                    .inner
                    .store
                    .operations_after(document_id, clock)
                    .await?
                    .into_iter()
                    .map(|stored| stored.operation)
                    .collect(),
                None => Vec::new(),
            };
            if !missing_operations.is_empty() {
                if let Err(e) = connection.send(ServerMessage::Missing {
                    document_id: document_id.to_string(),
                    operations: missing_operations.clone(),
                }) {
                    warn!(document_id, client_id, error = %e, "Failed to send missing operations");
                }
            }

            info!(
                document_id,
                client_id,
                site_id,
                missing = missing_operations.len(),
                "Client joined"
            );
            return Ok(JoinedDocument {
                session,
                state,
                missing_operations,
            });
        }
    }

    /// Detach a client. The session is torn down after the grace period
    /// if no client rejoins.
    pub async fn leave_document(&self, document_id: &str, client_id: &str) -> Result<()> {
        let session = self
            .session(document_id)
            .ok_or_else(|| ServiceError::SessionNotFound(document_id.to_string()))?;

        let now_empty = {
            let mut state = session.state.lock();
            if state.connections.remove(client_id).is_none() {
                return Err(client_not_found(document_id, client_id));
            }
            state.connections.is_empty()
        };

        if let Err(e) = self.inner.store.disconnect_client(document_id, client_id).await {
            warn!(document_id, client_id, error = %e, "Failed to record disconnect");
        }
        info!(document_id, client_id, "Client left");

        if now_empty {
            self.schedule_teardown(&session);
        }
        Ok(())
    }

    /// Apply an operation authored by a connected client.
    ///
    /// Returns `Ok(false)` for a duplicate. New operations are broadcast to
    /// the other clients before persistence is attempted; persistence and
    /// distribution failures are logged and do not fail the call.
    pub async fn apply_operation(
        &self,
        document_id: &str,
        client_id: &str,
        operation: Operation,
    ) -> Result<bool> {
        let session = self
            .session(document_id)
            .ok_or_else(|| ServiceError::SessionNotFound(document_id.to_string()))?;
        let op_id = operation.id();

        let (recipients, observed, snapshot, plan) = {
            let mut state = session.state.lock();
            if !state.connections.contains_key(client_id) {
                return Err(client_not_found(document_id, client_id));
            }

            match state.document.apply_operation(&operation) {
                Ok(true) => {}
                Ok(false) => {
                    debug!(document_id, client_id, op = %op_id, "Duplicate operation");
                    return Ok(false);
                }
                Err(e) => {
                    warn!(document_id, client_id, op = %op_id, error = %e, "Rejected operation");
                    return Err(e.into());
                }
            }

            state.operation_count += 1;
            let observed = match state.connections.get_mut(client_id) {
                Some(client) => {
                    client.observed.observe(&op_id);
                    client.observed.clone()
                }
                None => VectorClock::new(),
            };

            let plan = self.inner.compactor.lock().plan(
                state.operation_count,
                state.last_snapshot_count,
                state.last_gc_count,
            );
            let snapshot = if plan.snapshot {
                match Snapshot::capture(
                    document_id,
                    state.operation_count,
                    &state.document,
                    self.server_id(),
                ) {
                    Ok(snapshot) => {
                        state.last_snapshot_count = state.operation_count;
                        Some(snapshot)
                    }
                    Err(e) => {
                        warn!(document_id, error = %e, "Failed to capture snapshot");
                        None
                    }
                }
            } else {
                None
            };
            if plan.collect_garbage {
                state.last_gc_count = state.operation_count;
            }

            (state.recipients(Some(client_id)), observed, snapshot, plan)
        };

        let delivered = broadcast(
            document_id,
            &recipients,
            &ServerMessage::Operation {
                document_id: document_id.to_string(),
                operation: operation.clone(),
            },
        );
        debug!(document_id, client_id, op = %op_id, kind = operation.kind_name(), delivered, "Applied operation");

        let store = &self.inner.store;
        if let Err(e) = store.insert_operation(document_id, &operation).await {
            warn!(document_id, op = %op_id, error = %e, "Failed to persist operation");
        }
        if let Err(e) = store.update_client_clock(document_id, client_id, &observed).await {
            warn!(document_id, client_id, error = %e, "Failed to record client clock");
        }
        if let Err(e) = self
            .inner
            .distribution
            .publish(DistributedOperation {
                document_id: document_id.to_string(),
                origin_server: self.server_id().to_string(),
                operation,
            })
            .await
        {
            warn!(document_id, op = %op_id, error = %e, "Failed to publish operation");
        }

        if let Some(snapshot) = snapshot {
            if let Err(e) = self
                .persist_snapshot(document_id, snapshot, plan.truncate_up_to)
                .await
            {
                warn!(document_id, error = %e, "Failed to persist snapshot");
            }
        }
        if plan.collect_garbage {
            self.spawn_collection(session);
        }

        Ok(true)
    }

    /// Operations a client is missing relative to `clock`, in log order.
    ///
    /// `clock` is also recorded as observed by the client.
    pub async fn sync_client(
        &self,
        document_id: &str,
        client_id: &str,
        clock: &VectorClock,
    ) -> Result<Vec<Operation>> {
        if self.inner.store.get_document(document_id).await?.is_none() {
            return Err(ServiceError::DocumentNotFound(document_id.to_string()));
        }
        let operations: Vec<Operation> = self
            .inner
            .store
            .operations_after(document_id, clock)
            .await?
            .into_iter()
            .map(|stored| stored.operation)
            .collect();

        if let Some(session) = self.session(document_id) {
            if let Some(client) = session.state.lock().connections.get_mut(client_id) {
                client.observed.merge(clock);
            }
        }
        if let Err(e) = self
            .inner
            .store
            .update_client_clock(document_id, client_id, clock)
            .await
        {
            warn!(document_id, client_id, error = %e, "Failed to record client clock");
        }

        debug!(document_id, client_id, missing = operations.len(), "Synced client");
        Ok(operations)
    }

    /// Run tombstone collection now. `Ok(None)` if a run is already in
    /// progress or no client qualifies for the minimum observed version.
    pub async fn collect_garbage(&self, document_id: &str) -> Result<Option<usize>> {
        let session = self
            .session(document_id)
            .ok_or_else(|| ServiceError::SessionNotFound(document_id.to_string()))?;
        self.run_collection(&session).await
    }

    /// Capture and persist a snapshot of a live document.
    pub async fn snapshot_now(&self, document_id: &str) -> Result<Snapshot> {
        let session = self
            .session(document_id)
            .ok_or_else(|| ServiceError::SessionNotFound(document_id.to_string()))?;
        let snapshot = {
            let mut state = session.state.lock();
            let snapshot = Snapshot::capture(
                document_id,
                state.operation_count,
                &state.document,
                self.server_id(),
            )?;
            state.last_snapshot_count = state.operation_count;
            snapshot
        };
        let truncate_up_to = self
            .inner
            .compactor
            .lock()
            .truncation_point(snapshot.operation_count);
        self.persist_snapshot(document_id, snapshot.clone(), truncate_up_to)
            .await?;
        Ok(snapshot)
    }

    /// Apply an operation delivered by a peer server and fan it out to the
    /// local clients. It is neither persisted nor republished.
    pub fn handle_distributed_operation(&self, message: DistributedOperation) -> bool {
        if message.origin_server == self.inner.config.server_id {
            return false;
        }
        let document_id = message.document_id.as_str();
        let Some(session) = self.session(document_id) else {
            debug!(document_id, "No session for distributed operation");
            return false;
        };
        let op_id = message.operation.id();

        let recipients = {
            let mut state = session.state.lock();
            if state.closed {
                return false;
            }
            match state.document.apply_operation(&message.operation) {
                Ok(true) => {}
                Ok(false) => return false,
                Err(e) => {
                    warn!(
                        document_id,
                        origin = %message.origin_server,
                        op = %op_id,
                        error = %e,
                        "Rejected distributed operation"
                    );
                    return false;
                }
            }
            state.operation_count += 1;
            state.recipients(None)
        };

        let delivered = broadcast(
            document_id,
            &recipients,
            &ServerMessage::Operation {
                document_id: document_id.to_string(),
                operation: message.operation,
            },
        );
        debug!(document_id, origin = %message.origin_server, op = %op_id, delivered, "Applied distributed operation");
        true
    }

    /// Persist every live session and drop them.
    pub async fn shutdown(&self) {
        let sessions: Vec<(String, Arc<DocumentSession>)> =
            self.inner.sessions.lock().drain().collect();

        for (document_id, session) in sessions {
            let snapshot = {
                let mut state = session.state.lock();
                state.closed = true;
                if let Some(teardown) = state.teardown.take() {
                    teardown.abort();
                }
                Snapshot::capture(
                    &document_id,
                    state.operation_count,
                    &state.document,
                    self.server_id(),
                )
            };
            match snapshot {
                Ok(snapshot) => {
                    if let Err(e) = self.persist_snapshot(&document_id, snapshot, None).await {
                        warn!(document_id, error = %e, "Failed to persist session on shutdown");
                    }
                }
                Err(e) => warn!(document_id, error = %e, "Failed to capture snapshot"),
            }
            if let Err(e) = self.inner.distribution.unsubscribe(&document_id).await {
                warn!(document_id, error = %e, "Failed to unsubscribe");
            }
        }
        info!(server_id = self.server_id(), "Document service stopped");
    }

    async fn get_or_load_session(&self, document_id: &str) -> Result<Arc<DocumentSession>> {
        let load = {
            let mut loading = self.inner.loading.lock();
            if let Some(session) = self.inner.sessions.lock().get(document_id) {
                return Ok(Arc::clone(session));
            }
            match loading.get(document_id) {
                Some(load) => load.clone(),
                None => {
                    let service = self.clone();
                    let id = document_id.to_string();
                    let load = async move {
                        let result = service.load_session(&id).await;
                        {
                            let mut loading = service.inner.loading.lock();
                            if let Ok(session) = &result {
                                service
                                    .inner
                                    .sessions
                                    .lock()
                                    .insert(id.clone(), Arc::clone(session));
                            }
                            loading.remove(&id);
                        }
                        if result.is_ok() {
                            service.subscribe(&id).await;
                        }
                        result
                    }
                    .boxed()
                    .shared();
                    loading.insert(document_id.to_string(), load.clone());
                    load
                }
            }
        };
        load.await
    }

    /// Rebuild a document from its latest snapshot and the operations
    /// logged after it.
    async fn load_session(&self, document_id: &str) -> Result<Arc<DocumentSession>> {
        let store = &self.inner.store;
        let record = store
            .get_document(document_id)
            .await?
            .ok_or_else(|| ServiceError::DocumentNotFound(document_id.to_string()))?;

        let (mut document, base_count, operations) = match store.latest_snapshot(document_id).await? {
            Some(snapshot) => {
                let document = snapshot.restore()?;
                let operations = store
                    .operations_after(document_id, &snapshot.state.applied.frontier())
                    .await?;
                (document, snapshot.operation_count, operations)
            }
            None => (
                CrdtDocument::new(),
                0,
                store.all_operations(document_id).await?,
            ),
        };

        let mut replayed = 0;
        for stored in &operations {
            if document.apply_operation(&stored.operation)? {
                replayed += 1;
            }
        }
        let operation_count = record.operation_count.max(base_count + replayed);

        info!(
            document_id,
            operation_count,
            from_snapshot = base_count > 0,
            replayed,
            "Loaded document session"
        );
        Ok(Arc::new(DocumentSession::new(
            document_id,
            document,
            operation_count,
            base_count,
        )))
    }

    async fn subscribe(&self, document_id: &str) {
        let inner: Weak<Inner> = Arc::downgrade(&self.inner);
        let handler: DistributionHandler = Arc::new(move |message| {
            if let Some(inner) = inner.upgrade() {
                DocumentService { inner }.handle_distributed_operation(message);
            }
        });
        if let Err(e) = self.inner.distribution.subscribe(document_id, handler).await {
            warn!(document_id, error = %e, "Failed to subscribe to distribution");
        }
    }

    /// Store a snapshot, bring the document record up to date and drop the
    /// log prefix it makes redundant. Nothing is truncated unless the
    /// snapshot was stored.
    async fn persist_snapshot(
        &self,
        document_id: &str,
        snapshot: Snapshot,
        truncate_up_to: Option<u64>,
    ) -> Result<()> {
        let store = &self.inner.store;
        let operation_count = snapshot.operation_count;
        store.create_snapshot(snapshot).await?;
        self.inner.compactor.lock().record_snapshot();

        if let Some(mut record) = store.get_document(document_id).await? {
            record.operation_count = record.operation_count.max(operation_count);
            store.update_document(record).await?;
        }

        if let Some(up_to) = truncate_up_to {
            let removed = store.compact_operations(document_id, up_to).await?;
            self.inner.compactor.lock().record_truncation(removed);
            debug!(document_id, up_to, removed, "Truncated operation log");
        }
        info!(document_id, operation_count, "Stored snapshot");
        Ok(())
    }

    fn spawn_collection(&self, session: Arc<DocumentSession>) {
        let service = self.clone();
        tokio::spawn(async move {
            if let Err(e) = service.run_collection(&session).await {
                warn!(document_id = session.document_id(), error = %e, "Tombstone collection failed");
            }
        });
    }

    async fn run_collection(&self, session: &Arc<DocumentSession>) -> Result<Option<usize>> {
        let document_id = session.document_id();
        let Some(_guard) = session.try_begin_gc() else {
            debug!(document_id, "Collection already running");
            return Ok(None);
        };

        let store = &self.inner.store;
        let Some(mov) = store
            .minimum_observed_version(document_id, self.inner.config.stale_session_after)
            .await?
        else {
            debug!(document_id, "No fresh clients, skipping collection");
            return Ok(None);
        };

        let removed = session.state.lock().document.garbage_collect_tombstones(&mov);
        store.update_minimum_observed_version(document_id, &mov).await?;
        self.inner.compactor.lock().record_gc(removed);
        info!(document_id, removed, "Collected tombstones");
        Ok(Some(removed))
    }

    fn schedule_teardown(&self, session: &Arc<DocumentSession>) {
        let service = self.clone();
        let document_id = session.document_id().to_string();
        let grace = self.inner.config.teardown_grace;
        let handle = tokio::spawn(async move {
            tokio::time::sleep(grace).await;
            if let Err(e) = service.teardown(&document_id).await {
                warn!(document_id, error = %e, "Session teardown failed");
            }
        });

        let mut state = session.state.lock();
        if !state.connections.is_empty() || state.closed {
            handle.abort();
            return;
        }
        if let Some(previous) = state.teardown.replace(handle) {
            previous.abort();
        }
        debug!(document_id = session.document_id(), ?grace, "Scheduled session teardown");
    }

    /// Persist and drop a session that has had no clients for the whole
    /// grace period.
    async fn teardown(&self, document_id: &str) -> Result<()> {
        let Some(session) = self.session(document_id) else {
            return Ok(());
        };
        let snapshot = {
            let state = session.state.lock();
            if !state.connections.is_empty() || state.closed {
                return Ok(());
            }
            Snapshot::capture(
                document_id,
                state.operation_count,
                &state.document,
                self.server_id(),
            )?
        };
        self.persist_snapshot(document_id, snapshot, None).await?;

        {
            let mut sessions = self.inner.sessions.lock();
            let mut state = session.state.lock();
            if !state.connections.is_empty() || state.closed {
                return Ok(());
            }
            state.closed = true;
            // This task's own handle.
            state.teardown = None;
            if sessions
                .get(document_id)
                .is_some_and(|live| Arc::ptr_eq(live, &session))
            {
                sessions.remove(document_id);
            }
        }

        if let Err(e) = self.inner.distribution.unsubscribe(document_id).await {
            warn!(document_id, error = %e, "Failed to unsubscribe");
        }
        if self.inner.sessions.lock().contains_key(document_id) {
            self.subscribe(document_id).await;
        }
        info!(document_id, "Session torn down");
        Ok(())
    }
}

fn client_not_found(document_id: &str, client_id: &str) -> ServiceError {
    ServiceError::ClientNotFound {
        document_id: document_id.to_string(),
        client_id: client_id.to_string(),
    }
}
