//! Client connections.

use crate::error::TransportError;
use quire_text::{CrdtState, Operation};
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use tokio::sync::mpsc;

/// Messages the server pushes to a connected replica.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "camelCase", rename_all_fields = "camelCase")]
pub enum ServerMessage {
    /// Full document state, sent on join.
    State {
        document_id: String,
        state: CrdtState,
    },
    /// Operations the replica has not seen.
    Missing {
        document_id: String,
        operations: Vec<Operation>,
    },
    /// An operation applied by another replica.
    Operation {
        document_id: String,
        operation: Operation,
    },
}

/// A replica connection the service can push to.
pub trait Connection: Send + Sync {
    fn send(&self, message: ServerMessage) -> Result<(), TransportError>;
}

/// Connection backed by an unbounded tokio channel.
pub struct ChannelConnection {
    tx: mpsc::UnboundedSender<ServerMessage>,
}

impl ChannelConnection {
    /// A connection and the receiving end of its messages.
    pub fn channel() -> (Arc<Self>, mpsc::UnboundedReceiver<ServerMessage>) {
        let (tx, rx) = mpsc::unbounded_channel();
        (Arc::new(Self { tx }), rx)
    }

    pub fn is_closed(&self) -> bool {
        self.tx.is_closed()
    }
}

impl Connection for ChannelConnection {
    fn send(&self, message: ServerMessage) -> Result<(), TransportError> {
        self.tx.send(message).map_err(|_| TransportError::Closed)
    }
}
