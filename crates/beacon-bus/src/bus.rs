use async_trait::async_trait;
use bytes::Bytes;
use futures::stream::BoxStream;

/// Stream of raw payloads delivered for a subscription.
pub type BusStream = BoxStream<'static, Bytes>;

#[derive(Clone, Debug, thiserror::Error)]
pub enum BusError {
    #[error("bus connect failed: {0}")]
    Connect(String),
    #[error("bus publish failed: {0}")]
    Publish(String),
    #[error("bus subscribe failed: {0}")]
    Subscribe(String),
}

/// A shared publish/subscribe channel joining all hub instances.
///
/// No acknowledgment and no ordering guarantee across publishers; the relay
/// layers its own origin tagging and reconnect handling on top. The stream
/// returned by `subscribe` ends when the underlying transport drops the
/// subscription, which the caller treats as a disconnect.
#[async_trait]
pub trait MessageBus: Send + Sync {
    async fn publish(&self, subject: &str, payload: Bytes) -> Result<(), BusError>;

    async fn subscribe(&self, subject: &str) -> Result<BusStream, BusError>;
}
