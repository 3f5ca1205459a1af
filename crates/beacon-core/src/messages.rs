use bytes::Bytes;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::ids::{ConnectionId, InstanceId};

/// Routing selector for an outbound message.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum Target {
    /// Every connection present in the registry snapshot.
    Broadcast,
    /// The listed connections; ids absent from the snapshot are skipped.
    Subset { ids: Vec<ConnectionId> },
    /// A single connection; absent id is skipped.
    Direct { id: ConnectionId },
}

impl Target {
    /// Whether this selector is eligible for cross-instance forwarding.
    /// Direct sends address a connection that lives on exactly one instance,
    /// so relaying them would never find a second recipient.
    pub fn is_relayable(&self) -> bool {
        matches!(self, Self::Broadcast | Self::Subset { .. })
    }
}

/// Application-level payload written to a client, in its wire form:
/// `{"topic": ..., "payload": ...}` as a JSON text frame.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct OutboundMessage {
    pub topic: String,
    pub payload: serde_json::Value,
}

impl OutboundMessage {
    pub fn new(topic: impl Into<String>, payload: serde_json::Value) -> Self {
        Self {
            topic: topic.into(),
            payload,
        }
    }

    pub fn to_text(&self) -> Result<String, serde_json::Error> {
        serde_json::to_string(self)
    }
}

/// A decoded frame received from a client: `{"topic": ..., "payload": ...}`.
#[derive(Clone, Debug, Deserialize)]
pub struct InboundFrame {
    pub topic: String,
    #[serde(default)]
    pub payload: serde_json::Value,
}

/// The first frame of every connection: `{"token": ...}`.
#[derive(Clone, Debug, Deserialize)]
pub struct AuthRequest {
    pub token: String,
}

/// Wire form of a broadcast as published on the shared bus.
///
/// `origin` lets receiving instances drop their own publications — the local
/// fan-out already happened before the envelope left the process.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct RelayEnvelope {
    pub origin: InstanceId,
    pub target: Target,
    pub message: OutboundMessage,
    pub published_at: DateTime<Utc>,
}

impl RelayEnvelope {
    pub fn new(origin: InstanceId, target: Target, message: OutboundMessage) -> Self {
        Self {
            origin,
            target,
            message,
            published_at: Utc::now(),
        }
    }

    pub fn is_from(&self, instance: &InstanceId) -> bool {
        &self.origin == instance
    }

    pub fn to_bytes(&self) -> Result<Bytes, serde_json::Error> {
        serde_json::to_vec(self).map(Bytes::from)
    }

    pub fn from_bytes(bytes: &[u8]) -> Result<Self, serde_json::Error> {
        serde_json::from_slice(bytes)
    }
}
