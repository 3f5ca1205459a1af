use std::collections::HashMap;

use async_trait::async_trait;
use bytes::Bytes;
use futures::StreamExt;
use parking_lot::Mutex;
use tokio::sync::broadcast;
use tokio_stream::wrappers::errors::BroadcastStreamRecvError;
use tokio_stream::wrappers::BroadcastStream;
use tracing::warn;

use crate::bus::{BusError, BusStream, MessageBus};

const DEFAULT_CAPACITY: usize = 256;

/// In-process bus over per-subject broadcast channels.
///
/// Gives a single-process deployment (or a test) the same relay code path as
/// a real bus. A subscriber that falls behind its channel capacity loses the
/// lagged messages, matching the bus's no-delivery-guarantee contract.
pub struct InMemoryBus {
    subjects: Mutex<HashMap<String, broadcast::Sender<Bytes>>>,
    capacity: usize,
}

impl InMemoryBus {
    pub fn new() -> Self {
        Self::with_capacity(DEFAULT_CAPACITY)
    }

    pub fn with_capacity(capacity: usize) -> Self {
        Self {
            subjects: Mutex::new(HashMap::new()),
            capacity,
        }
    }

    fn sender(&self, subject: &str) -> broadcast::Sender<Bytes> {
        let mut subjects = self.subjects.lock();
        subjects
            .entry(subject.to_owned())
            .or_insert_with(|| broadcast::channel(self.capacity).0)
            .clone()
    }
}

impl Default for InMemoryBus {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl MessageBus for InMemoryBus {
    async fn publish(&self, subject: &str, payload: Bytes) -> Result<(), BusError> {
        // A publish with no subscribers is not an error on a pub/sub channel.
        let _ = self.sender(subject).send(payload);
        Ok(())
    }

    async fn subscribe(&self, subject: &str) -> Result<BusStream, BusError> {
        let rx = self.sender(subject).subscribe();
        let stream = BroadcastStream::new(rx).filter_map(|item| async move {
            match item {
                Ok(payload) => Some(payload),
                Err(BroadcastStreamRecvError::Lagged(skipped)) => {
                    warn!(skipped = skipped, "bus subscriber lagged, dropped messages");
                    None
                }
            }
        });
        Ok(stream.boxed())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn subscriber_receives_published_payload() {
        let bus = InMemoryBus::new();
        let mut sub = bus.subscribe("updates").await.unwrap();

        bus.publish("updates", Bytes::from_static(b"hello"))
            .await
            .unwrap();

        let payload = sub.next().await.unwrap();
        assert_eq!(&payload[..], b"hello");
    }

    #[tokio::test]
    async fn publish_without_subscribers_succeeds() {
        let bus = InMemoryBus::new();
        bus.publish("updates", Bytes::from_static(b"unheard"))
            .await
            .unwrap();
    }

    #[tokio::test]
    async fn publish_before_subscribe_is_not_delivered() {
        let bus = InMemoryBus::new();
        bus.publish("updates", Bytes::from_static(b"early"))
            .await
            .unwrap();

        let mut sub = bus.subscribe("updates").await.unwrap();
        bus.publish("updates", Bytes::from_static(b"late"))
            .await
            .unwrap();

        let payload = sub.next().await.unwrap();
        assert_eq!(&payload[..], b"late");
    }

    #[tokio::test]
    async fn multiple_subscribers_each_receive() {
        let bus = InMemoryBus::new();
        let mut a = bus.subscribe("updates").await.unwrap();
        let mut b = bus.subscribe("updates").await.unwrap();

        bus.publish("updates", Bytes::from_static(b"fanout"))
            .await
            .unwrap();

        assert_eq!(&a.next().await.unwrap()[..], b"fanout");
        assert_eq!(&b.next().await.unwrap()[..], b"fanout");
    }

    #[tokio::test]
    async fn subjects_are_isolated() {
        let bus = InMemoryBus::new();
        let mut a = bus.subscribe("a").await.unwrap();

        bus.publish("b", Bytes::from_static(b"other"))
            .await
            .unwrap();
        bus.publish("a", Bytes::from_static(b"mine")).await.unwrap();

        assert_eq!(&a.next().await.unwrap()[..], b"mine");
    }
}
