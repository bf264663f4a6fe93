//! Error types for the document service.

use quire_compaction::SnapshotError;
use quire_text::DocumentError;
use thiserror::Error;

/// Persistence failures.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum StoreError {
    #[error("Document not found: {0}")]
    NotFound(String),

    #[error("Document already exists: {0}")]
    AlreadyExists(String),

    #[error("Client {client_id} not registered for {document_id}")]
    UnknownClient {
        document_id: String,
        client_id: String,
    },

    #[error("Store unavailable: {0}")]
    Unavailable(String),
}

/// Cross-server pub/sub failures.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum DistributionError {
    #[error("Publish failed: {0}")]
    PublishFailed(String),

    #[error("Subscribe failed: {0}")]
    SubscribeFailed(String),
}

/// Failures delivering to a client connection.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum TransportError {
    #[error("Connection closed")]
    Closed,

    #[error("Send failed: {0}")]
    SendFailed(String),
}

/// Errors surfaced by [`DocumentService`](crate::DocumentService).
///
/// `Clone` so a single failed session load can be handed to every caller
/// waiting on it.
#[derive(Error, Debug, Clone)]
pub enum ServiceError {
    #[error("Document not found: {0}")]
    DocumentNotFound(String),

    #[error("No live session for document: {0}")]
    SessionNotFound(String),

    #[error("Client {client_id} is not connected to {document_id}")]
    ClientNotFound {
        document_id: String,
        client_id: String,
    },

    #[error(transparent)]
    Document(#[from] DocumentError),

    #[error(transparent)]
    Store(#[from] StoreError),

    #[error(transparent)]
    Distribution(#[from] DistributionError),

    #[error(transparent)]
    Snapshot(#[from] SnapshotError),
}

pub type Result<T> = std::result::Result<T, ServiceError>;
