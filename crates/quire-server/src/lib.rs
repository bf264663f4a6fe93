//! # quire-server
//!
//! Server side of collaborative Quire documents.
//!
//! A [`DocumentService`] keeps one live [`DocumentSession`] per open
//! document. It applies operations from connected clients, fans them out to
//! the other clients and to peer servers through a [`Distribution`]
//! channel, persists them in a [`DocumentStore`], and keeps history bounded
//! with snapshots, log truncation and tombstone collection.
//!
//! ## Example
//!
//! ```rust
//! use quire_server::prelude::*;
//! use std::sync::Arc;
//!
//! # tokio_test::block_on(async {
//! let store = Arc::new(MemoryStore::new());
//! let bus = MemoryBus::new();
//! let config = ServiceConfig::builder().server_id("server-1").build();
//! let service = DocumentService::new(config, store, bus.endpoint("server-1"));
//!
//! service.create_document("notes", "Meeting notes").await.unwrap();
//! let (connection, _messages) = ChannelConnection::channel();
//! service
//!     .join_document("notes", "client-1", "alice", connection, None)
//!     .await
//!     .unwrap();
//!
//! let op = Operation::insert("alice", 1, None, "Hi");
//! assert!(service.apply_operation("notes", "client-1", op).await.unwrap());
//! assert_eq!(service.session("notes").unwrap().text(), "Hi");
//! # });
//! ```

mod config;
mod connection;
mod distribution;
mod error;
mod service;
mod session;
mod store;

pub use config::{ServiceConfig, ServiceConfigBuilder};
pub use connection::{ChannelConnection, Connection, ServerMessage};
pub use distribution::{
    DistributedOperation, Distribution, DistributionHandler, MemoryBus, MemoryDistribution,
};
pub use error::{DistributionError, Result, ServiceError, StoreError, TransportError};
pub use service::DocumentService;
pub use session::{DocumentSession, JoinedDocument};
pub use store::{ClientSession, DocumentRecord, DocumentStore, MemoryStore, StoredOperation};

/// Common imports for hosting documents.
pub mod prelude {
    pub use crate::{
        ChannelConnection, Connection, DocumentService, DocumentStore, MemoryBus, MemoryStore,
        ServerMessage, ServiceConfig, ServiceError,
    };
    pub use quire_core::VectorClock;
    pub use quire_text::Operation;
}
