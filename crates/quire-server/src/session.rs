//! Live document sessions.

use crate::connection::{Connection, ServerMessage};
use parking_lot::Mutex;
use quire_core::VectorClock;
use quire_text::{CrdtDocument, CrdtState};
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tokio::task::JoinHandle;
use tracing::debug;

/// A replica attached to a session.
pub(crate) struct ClientConnection {
    pub(crate) site_id: String,
    pub(crate) connection: Arc<dyn Connection>,
    /// Everything this client is known to have observed.
    pub(crate) observed: VectorClock,
}

pub(crate) struct SessionState {
    pub(crate) document: CrdtDocument,
    pub(crate) connections: HashMap<String, ClientConnection>,
    /// Operations applied to the document over its lifetime.
    pub(crate) operation_count: u64,
    pub(crate) last_snapshot_count: u64,
    pub(crate) last_gc_count: u64,
    pub(crate) teardown: Option<JoinHandle<()>>,
    /// Set once the session has been removed from the service.
    pub(crate) closed: bool,
}

impl SessionState {
    /// Every connection except `exclude`.
    pub(crate) fn recipients(&self, exclude: Option<&str>) -> Vec<(String, Arc<dyn Connection>)> {
        self.connections
            .iter()
            .filter(|(client_id, _)| Some(client_id.as_str()) != exclude)
            .map(|(client_id, c)| (client_id.clone(), Arc::clone(&c.connection)))
            .collect()
    }
}

/// The in-memory state of one document on this server.
pub struct DocumentSession {
    document_id: String,
    pub(crate) state: Mutex<SessionState>,
    gc_running: AtomicBool,
}

impl DocumentSession {
    pub(crate) fn new(
        document_id: impl Into<String>,
        document: CrdtDocument,
        operation_count: u64,
        last_snapshot_count: u64,
    ) -> Self {
        Self {
            document_id: document_id.into(),
            state: Mutex::new(SessionState {
                document,
                connections: HashMap::new(),
                operation_count,
                last_snapshot_count,
                last_gc_count: operation_count,
                teardown: None,
                closed: false,
            }),
            gc_running: AtomicBool::new(false),
        }
    }

    pub fn document_id(&self) -> &str {
        &self.document_id
    }

    pub fn text(&self) -> String {
        self.state.lock().document.text()
    }

    pub fn to_state(&self) -> CrdtState {
        self.state.lock().document.to_state()
    }

    pub fn vector_clock(&self) -> VectorClock {
        self.state.lock().document.vector_clock().clone()
    }

    pub fn operation_count(&self) -> u64 {
        self.state.lock().operation_count
    }

    pub fn connection_count(&self) -> usize {
        self.state.lock().connections.len()
    }

    pub fn tombstone_count(&self) -> usize {
        self.state.lock().document.tombstone_count()
    }

    pub fn pending_count(&self) -> usize {
        self.state.lock().document.pending_count()
    }

    pub fn client_ids(&self) -> Vec<String> {
        self.state.lock().connections.keys().cloned().collect()
    }

    /// The site a connected client edits as.
    pub fn site_of(&self, client_id: &str) -> Option<String> {
        self.state
            .lock()
            .connections
            .get(client_id)
            .map(|c| c.site_id.clone())
    }

    /// What a connected client is known to have observed.
    pub fn observed_clock(&self, client_id: &str) -> Option<VectorClock> {
        self.state
            .lock()
            .connections
            .get(client_id)
            .map(|c| c.observed.clone())
    }

    pub fn has_pending_teardown(&self) -> bool {
        self.state.lock().teardown.is_some()
    }

    pub fn is_closed(&self) -> bool {
        self.state.lock().closed
    }

    /// Claim the collection slot. `None` if a run is already in progress.
    pub(crate) fn try_begin_gc(self: &Arc<Self>) -> Option<GcGuard> {
        self.gc_running
            .compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
            .ok()
            .map(|_| GcGuard {
                session: Arc::clone(self),
            })
    }

    pub fn is_collecting(&self) -> bool {
        self.gc_running.load(Ordering::Acquire)
    }
}

/// Releases the collection slot on drop.
pub(crate) struct GcGuard {
    session: Arc<DocumentSession>,
}

impl Drop for GcGuard {
    fn drop(&mut self) {
        self.session.gc_running.store(false, Ordering::Release);
    }
}

/// Deliver `message` to each recipient; failures only cost that recipient.
pub(crate) fn broadcast(
    document_id: &str,
    recipients: &[(String, Arc<dyn Connection>)],
    message: &ServerMessage,
) -> usize {
    let mut delivered = 0;
    for (client_id, connection) in recipients {
        match connection.send(message.clone()) {
            Ok(()) => delivered += 1,
            Err(e) => debug!(document_id, client_id = %client_id, error = %e, "Dropped message"),
        }
    }
    delivered
}

/// Returned by [`DocumentService::join_document`](crate::DocumentService::join_document).
pub struct JoinedDocument {
    pub session: Arc<DocumentSession>,
    /// Document state at the moment of joining.
    pub state: CrdtState,
    /// Logged operations the client's last seen clock does not cover.
    pub missing_operations: Vec<quire_text::Operation>,
}
