use std::time::Duration;

use async_nats::ConnectOptions;
use async_trait::async_trait;
use bytes::Bytes;
use futures::StreamExt;
use tracing::info;

use crate::bus::{BusError, BusStream, MessageBus};

/// Ping interval for keep-alive.
const DEFAULT_PING_INTERVAL: Duration = Duration::from_secs(120);

/// Fail fast if the bus isn't reachable; the relay owns retry policy.
const CONNECT_TIMEOUT: Duration = Duration::from_secs(5);

/// NATS-backed shared bus.
pub struct NatsBus {
    client: async_nats::Client,
}

impl NatsBus {
    /// Connect to a NATS server. `name` identifies this client in server logs.
    pub async fn connect(url: &str, name: &str) -> Result<Self, BusError> {
        info!(url = url, "connecting to bus");

        let client = ConnectOptions::new()
            .name(name)
            .ping_interval(DEFAULT_PING_INTERVAL)
            .connection_timeout(CONNECT_TIMEOUT)
            .connect(url)
            .await
            .map_err(|e| BusError::Connect(e.to_string()))?;

        info!(url = url, "bus connected");
        Ok(Self { client })
    }

    /// Flush pending publishes to the server.
    pub async fn flush(&self) -> Result<(), BusError> {
        self.client
            .flush()
            .await
            .map_err(|e| BusError::Publish(e.to_string()))
    }
}

#[async_trait]
impl MessageBus for NatsBus {
    async fn publish(&self, subject: &str, payload: Bytes) -> Result<(), BusError> {
        self.client
            .publish(subject.to_string(), payload)
            .await
            .map_err(|e| BusError::Publish(e.to_string()))
    }

    async fn subscribe(&self, subject: &str) -> Result<BusStream, BusError> {
        let subscriber = self
            .client
            .subscribe(subject.to_string())
            .await
            .map_err(|e| BusError::Subscribe(e.to_string()))?;

        Ok(subscriber.map(|msg| msg.payload).boxed())
    }
}
