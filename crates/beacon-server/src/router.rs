use std::collections::HashMap;
use std::sync::Arc;

use beacon_core::{ConnectionId, HubError, InstanceId, OutboundMessage, RelayEnvelope, Target};
use tokio::sync::mpsc;

use crate::registry::ConnectionRegistry;

/// Fans one message out to the connections a selector matches.
///
/// Fan-out is snapshot-based: the registry is copied at call time, so
/// connections joining mid-publish are excluded and a slow recipient never
/// blocks the others. When a relay is attached, broadcast and subset
/// publishes are also forwarded to the bus for other instances.
pub struct BroadcastRouter {
    registry: Arc<ConnectionRegistry>,
    instance: InstanceId,
    relay_tx: Option<mpsc::Sender<RelayEnvelope>>,
}

impl BroadcastRouter {
    pub fn new(registry: Arc<ConnectionRegistry>, instance: InstanceId) -> Self {
        Self {
            registry,
            instance,
            relay_tx: None,
        }
    }

    pub fn with_relay(mut self, relay_tx: mpsc::Sender<RelayEnvelope>) -> Self {
        self.relay_tx = Some(relay_tx);
        self
    }

    pub fn instance(&self) -> &InstanceId {
        &self.instance
    }

    /// Deliver `message` to every connection `target` matches, and forward
    /// relayable targets to the bus. Returns the local enqueue count.
    ///
    /// Never fails: absent recipients are skipped and relay unavailability
    /// only degrades cross-instance visibility.
    pub fn publish(&self, message: OutboundMessage, target: Target) -> usize {
        let delivered = self.fan_out(&message, &target);
        if target.is_relayable() {
            self.forward_to_relay(message, target);
        }
        delivered
    }

    /// Local-only fan-out, used when re-injecting envelopes received from
    /// the bus. Never re-publishes, so a broadcast cannot loop between
    /// instances.
    pub fn publish_local(&self, message: &OutboundMessage, target: &Target) -> usize {
        self.fan_out(message, target)
    }

    /// Single-target send that reports an absent recipient, for callers
    /// that need the distinction. Broadcast paths use `publish` instead.
    pub fn send_direct(
        &self,
        id: &ConnectionId,
        message: OutboundMessage,
    ) -> Result<(), HubError> {
        match self.registry.lookup(id) {
            Some(connection) => {
                connection.enqueue(message);
                Ok(())
            }
            None => Err(HubError::NotFound(id.clone())),
        }
    }

    fn fan_out(&self, message: &OutboundMessage, target: &Target) -> usize {
        match target {
            Target::Broadcast => {
                let mut delivered = 0;
                for connection in self.registry.snapshot() {
                    if connection.enqueue(message.clone()) {
                        delivered += 1;
                    }
                }
                delivered
            }
            Target::Subset { ids } => {
                let snapshot: HashMap<ConnectionId, _> = self
                    .registry
                    .snapshot()
                    .into_iter()
                    .map(|c| (c.id().clone(), c))
                    .collect();
                let mut delivered = 0;
                for id in ids {
                    // A recipient that disconnected between selection and
                    // dispatch is not a caller error.
                    if let Some(connection) = snapshot.get(id) {
                        if connection.enqueue(message.clone()) {
                            delivered += 1;
                        }
                    }
                }
                delivered
            }
            Target::Direct { id } => match self.registry.lookup(id) {
                Some(connection) if connection.enqueue(message.clone()) => 1,
                _ => 0,
            },
        }
    }

    fn forward_to_relay(&self, message: OutboundMessage, target: Target) {
        let Some(relay_tx) = &self.relay_tx else {
            return;
        };
        let envelope = RelayEnvelope::new(self.instance.clone(), target, message);
        if relay_tx.try_send(envelope).is_err() {
            // Relay stalled or gone; local delivery already happened.
            tracing::debug!("relay channel unavailable, dropping envelope");
        }
    }
}
