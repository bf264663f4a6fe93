//! Cross-server operation distribution.

use crate::error::DistributionError;
use async_trait::async_trait;
use parking_lot::RwLock;
use quire_text::Operation;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;

/// An operation published by one server for the others.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DistributedOperation {
    pub document_id: String,
    /// Server that applied and published the operation.
    pub origin_server: String,
    pub operation: Operation,
}

/// Callback invoked for each operation delivered on a subscribed document.
pub type DistributionHandler = Arc<dyn Fn(DistributedOperation) + Send + Sync>;

/// Pub/sub channel between servers hosting the same documents.
#[async_trait]
pub trait Distribution: Send + Sync + 'static {
    async fn publish(&self, message: DistributedOperation) -> Result<(), DistributionError>;

    /// Register `handler` for a document, replacing any earlier one.
    async fn subscribe(
        &self,
        document_id: &str,
        handler: DistributionHandler,
    ) -> Result<(), DistributionError>;

    async fn unsubscribe(&self, document_id: &str) -> Result<(), DistributionError>;
}

type Subscribers = HashMap<String, HashMap<String, DistributionHandler>>;

/// In-process hub connecting [`MemoryDistribution`] endpoints.
#[derive(Default)]
pub struct MemoryBus {
    /// document id -> server id -> handler
    subscribers: RwLock<Subscribers>,
    published: AtomicU64,
}

impl MemoryBus {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    /// An endpoint on this bus for `server_id`.
    pub fn endpoint(self: &Arc<Self>, server_id: impl Into<String>) -> Arc<MemoryDistribution> {
        Arc::new(MemoryDistribution {
            bus: Arc::clone(self),
            server_id: server_id.into(),
            failing: AtomicBool::new(false),
        })
    }

    /// Total messages published on the bus.
    pub fn published(&self) -> u64 {
        self.published.load(Ordering::SeqCst)
    }

    pub fn subscriber_count(&self, document_id: &str) -> usize {
        self.subscribers
            .read()
            .get(document_id)
            .map_or(0, HashMap::len)
    }

    fn deliver(&self, message: DistributedOperation) {
        self.published.fetch_add(1, Ordering::SeqCst);
        let handlers: Vec<DistributionHandler> = {
            let subscribers = self.subscribers.read();
            match subscribers.get(&message.document_id) {
                Some(servers) => servers
                    .iter()
                    .filter(|(server, _)| **server != message.origin_server)
                    .map(|(_, handler)| Arc::clone(handler))
                    .collect(),
                None => return,
            }
        };

        for handler in handlers {
            handler(message.clone());
        }
    }
}

/// One server's view of a [`MemoryBus`].
pub struct MemoryDistribution {
    bus: Arc<MemoryBus>,
    server_id: String,
    failing: AtomicBool,
}

impl MemoryDistribution {
    pub fn server_id(&self) -> &str {
        &self.server_id
    }

    /// Make publish and subscribe fail.
    pub fn set_failing(&self, failing: bool) {
        self.failing.store(failing, Ordering::SeqCst);
    }

    fn is_failing(&self) -> bool {
        self.failing.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl Distribution for MemoryDistribution {
    async fn publish(&self, message: DistributedOperation) -> Result<(), DistributionError> {
        if self.is_failing() {
            return Err(DistributionError::PublishFailed("injected failure".to_string()));
        }
        self.bus.deliver(message);
        Ok(())
    }

    async fn subscribe(
        &self,
        document_id: &str,
        handler: DistributionHandler,
    ) -> Result<(), DistributionError> {
        if self.is_failing() {
            return Err(DistributionError::SubscribeFailed("injected failure".to_string()));
        }
        self.bus
            .subscribers
            .write()
            .entry(document_id.to_string())
            .or_default()
            .insert(self.server_id.clone(), handler);
        Ok(())
    }

    async fn unsubscribe(&self, document_id: &str) -> Result<(), DistributionError> {
        let mut subscribers = self.bus.subscribers.write();
        if let Some(servers) = subscribers.get_mut(document_id) {
            servers.remove(&self.server_id);
            if servers.is_empty() {
                subscribers.remove(document_id);
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use parking_lot::Mutex;

    fn recorder() -> (DistributionHandler, Arc<Mutex<Vec<DistributedOperation>>>) {
        let seen = Arc::new(Mutex::new(Vec::new()));
        let sink = Arc::clone(&seen);
        let handler: DistributionHandler = Arc::new(move |msg| sink.lock().push(msg));
        (handler, seen)
    }

    fn message(origin: &str) -> DistributedOperation {
        DistributedOperation {
            document_id: "doc".into(),
            origin_server: origin.into(),
            operation: Operation::insert("A", 1, None, "x"),
        }
    }

    #[tokio::test]
    async fn test_publish_skips_origin() {
        let bus = MemoryBus::new();
        let s1 = bus.endpoint("s1");
        let s2 = bus.endpoint("s2");
        let (h1, seen1) = recorder();
        let (h2, seen2) = recorder();
        s1.subscribe("doc", h1).await.unwrap();
        s2.subscribe("doc", h2).await.unwrap();

        s1.publish(message("s1")).await.unwrap();

        assert!(seen1.lock().is_empty());
        assert_eq!(seen2.lock().len(), 1);
        assert_eq!(bus.published(), 1);
    }

    #[tokio::test]
    async fn test_unsubscribe() {
        let bus = MemoryBus::new();
        let s1 = bus.endpoint("s1");
        let s2 = bus.endpoint("s2");
        let (h2, seen2) = recorder();
        s2.subscribe("doc", h2).await.unwrap();
        assert_eq!(bus.subscriber_count("doc"), 1);

        s2.unsubscribe("doc").await.unwrap();
        s1.publish(message("s1")).await.unwrap();

        assert!(seen2.lock().is_empty());
        assert_eq!(bus.subscriber_count("doc"), 0);
    }

    #[tokio::test]
    async fn test_failing_endpoint() {
        let bus = MemoryBus::new();
        let s1 = bus.endpoint("s1");
        s1.set_failing(true);
        assert!(matches!(
            s1.publish(message("s1")).await,
            Err(DistributionError::PublishFailed(_))
        ));
        assert_eq!(bus.published(), 0);
    }

    #[test]
    fn test_message_json_shape() {
        let value = serde_json::to_value(message("s1")).unwrap();
        assert_eq!(value["originServer"], "s1");
        assert_eq!(value["operation"]["type"], "insert");
    }
}
