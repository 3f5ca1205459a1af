use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;
use beacon_core::{ConnectionId, OutboundMessage, Principal, Target};

use crate::router::BroadcastRouter;

/// Application-level handler for one inbound topic.
///
/// Invoked by the inbound reader with the sending connection's identity and
/// principal. Handlers may publish through the router they captured at
/// construction.
#[async_trait]
pub trait MessageHandler: Send + Sync {
    async fn handle(&self, from: &ConnectionId, principal: &Principal, payload: serde_json::Value);
}

/// Immutable topic -> handler mapping, built once before the hub starts.
/// A fixed map sidesteps any race on a mutable dispatch table.
pub struct HandlerMap {
    inner: HashMap<String, Arc<dyn MessageHandler>>,
}

impl HandlerMap {
    pub fn builder() -> HandlerMapBuilder {
        HandlerMapBuilder {
            inner: HashMap::new(),
        }
    }

    pub fn get(&self, topic: &str) -> Option<&Arc<dyn MessageHandler>> {
        self.inner.get(topic)
    }

    pub fn len(&self) -> usize {
        self.inner.len()
    }

    pub fn is_empty(&self) -> bool {
        self.inner.is_empty()
    }
}

pub struct HandlerMapBuilder {
    inner: HashMap<String, Arc<dyn MessageHandler>>,
}

impl HandlerMapBuilder {
    /// Register a handler for a topic. A duplicate topic keeps the first
    /// registration and logs the conflict.
    pub fn register(mut self, topic: impl Into<String>, handler: Arc<dyn MessageHandler>) -> Self {
        let topic = topic.into();
        if self.inner.contains_key(&topic) {
            tracing::error!(topic = %topic, "handler for topic already registered, keeping first");
            return self;
        }
        self.inner.insert(topic, handler);
        self
    }

    pub fn build(self) -> HandlerMap {
        HandlerMap { inner: self.inner }
    }
}

/// Fans the sender's payload out to every connection.
pub struct BroadcastHandler {
    router: Arc<BroadcastRouter>,
}

impl BroadcastHandler {
    pub fn new(router: Arc<BroadcastRouter>) -> Self {
        Self { router }
    }
}

#[async_trait]
impl MessageHandler for BroadcastHandler {
    async fn handle(&self, from: &ConnectionId, principal: &Principal, payload: serde_json::Value) {
        let message = OutboundMessage::new(
            "broadcast",
            serde_json::json!({
                "from": principal.subject,
                "payload": payload,
            }),
        );
        let delivered = self.router.publish(message, Target::Broadcast);
        tracing::debug!(from = %from, delivered = delivered, "broadcast dispatched");
    }
}

/// Sends the payload to one recipient named in `payload.to`.
/// An absent recipient is skipped, matching broadcast semantics.
pub struct DirectHandler {
    router: Arc<BroadcastRouter>,
}

impl DirectHandler {
    pub fn new(router: Arc<BroadcastRouter>) -> Self {
        Self { router }
    }
}

#[async_trait]
impl MessageHandler for DirectHandler {
    async fn handle(&self, from: &ConnectionId, principal: &Principal, payload: serde_json::Value) {
        let Some(to) = payload.get("to").and_then(|v| v.as_str()) else {
            tracing::warn!(from = %from, "direct message missing 'to' field, dropping");
            return;
        };
        let target = Target::Direct {
            id: ConnectionId::from_raw(to),
        };
        let message = OutboundMessage::new(
            "direct",
            serde_json::json!({
                "from": principal.subject,
                "payload": payload.get("payload").cloned().unwrap_or(serde_json::Value::Null),
            }),
        );
        self.router.publish(message, target);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::connection::Connection;
    use crate::registry::ConnectionRegistry;
    use beacon_core::InstanceId;
    use std::sync::atomic::{AtomicUsize, Ordering};

    struct CountingHandler {
        calls: AtomicUsize,
    }

    #[async_trait]
    impl MessageHandler for CountingHandler {
        async fn handle(&self, _: &ConnectionId, _: &Principal, _: serde_json::Value) {
            self.calls.fetch_add(1, Ordering::Relaxed);
        }
    }

    fn setup() -> (Arc<ConnectionRegistry>, Arc<BroadcastRouter>) {
        let registry = Arc::new(ConnectionRegistry::new());
        let router = Arc::new(BroadcastRouter::new(
            Arc::clone(&registry),
            InstanceId::new(),
        ));
        (registry, router)
    }

    fn registered(registry: &ConnectionRegistry, id: &str) -> Arc<Connection> {
        let conn = Arc::new(Connection::new(
            ConnectionId::from_raw(id),
            Principal::new("alice"),
            8,
        ));
        conn.activate();
        registry.add(Arc::clone(&conn)).unwrap();
        conn
    }

    #[tokio::test]
    async fn map_dispatches_by_topic() {
        let handler = Arc::new(CountingHandler {
            calls: AtomicUsize::new(0),
        });
        let map = HandlerMap::builder()
            .register("ping", Arc::clone(&handler) as Arc<dyn MessageHandler>)
            .build();

        let found = map.get("ping").unwrap();
        found
            .handle(
                &ConnectionId::new(),
                &Principal::new("alice"),
                serde_json::Value::Null,
            )
            .await;

        assert_eq!(handler.calls.load(Ordering::Relaxed), 1);
        assert!(map.get("unknown").is_none());
    }

    #[tokio::test]
    async fn duplicate_registration_keeps_first() {
        let first = Arc::new(CountingHandler {
            calls: AtomicUsize::new(0),
        });
        let second = Arc::new(CountingHandler {
            calls: AtomicUsize::new(0),
        });
        let map = HandlerMap::builder()
            .register("chat", Arc::clone(&first) as Arc<dyn MessageHandler>)
            .register("chat", Arc::clone(&second) as Arc<dyn MessageHandler>)
            .build();

        assert_eq!(map.len(), 1);
        map.get("chat")
            .unwrap()
            .handle(
                &ConnectionId::new(),
                &Principal::new("alice"),
                serde_json::Value::Null,
            )
            .await;

        assert_eq!(first.calls.load(Ordering::Relaxed), 1);
        assert_eq!(second.calls.load(Ordering::Relaxed), 0);
    }

    #[tokio::test]
    async fn broadcast_handler_fans_out_with_sender() {
        let (registry, router) = setup();
        let c1 = registered(&registry, "conn_1");
        let c2 = registered(&registry, "conn_2");

        let handler = BroadcastHandler::new(router);
        handler
            .handle(
                c1.id(),
                &Principal::new("alice"),
                serde_json::json!({"text": "hi"}),
            )
            .await;

        let delivered = c2.queue().recv().await.unwrap();
        assert_eq!(delivered.topic, "broadcast");
        assert_eq!(delivered.payload["from"], "alice");
        assert_eq!(delivered.payload["payload"]["text"], "hi");
        assert_eq!(c1.queue().len(), 1); // sender receives its own broadcast
    }

    #[tokio::test]
    async fn direct_handler_targets_only_addressee() {
        let (registry, router) = setup();
        let c1 = registered(&registry, "conn_1");
        let c2 = registered(&registry, "conn_2");

        let handler = DirectHandler::new(router);
        handler
            .handle(
                c1.id(),
                &Principal::new("alice"),
                serde_json::json!({"to": "conn_2", "payload": "psst"}),
            )
            .await;

        assert_eq!(c1.queue().len(), 0);
        let delivered = c2.queue().recv().await.unwrap();
        assert_eq!(delivered.topic, "direct");
        assert_eq!(delivered.payload["payload"], "psst");
    }

    #[tokio::test]
    async fn direct_handler_tolerates_absent_recipient() {
        let (registry, router) = setup();
        let c1 = registered(&registry, "conn_1");

        let handler = DirectHandler::new(router);
        handler
            .handle(
                c1.id(),
                &Principal::new("alice"),
                serde_json::json!({"to": "conn_gone", "payload": "lost"}),
            )
            .await;

        assert_eq!(c1.queue().len(), 0);
    }

    #[tokio::test]
    async fn direct_handler_drops_malformed_payload() {
        let (registry, router) = setup();
        let c1 = registered(&registry, "conn_1");

        let handler = DirectHandler::new(router);
        handler
            .handle(c1.id(), &Principal::new("alice"), serde_json::json!({}))
            .await;

        assert_eq!(c1.queue().len(), 0);
    }
}
