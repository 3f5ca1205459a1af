use std::sync::Arc;
use std::time::Duration;

use beacon_bus::{BusStream, ExponentialBackoff, MessageBus};
use beacon_core::{InstanceId, RelayEnvelope};
use futures::StreamExt;
use tokio::sync::{mpsc, watch};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::router::BroadcastRouter;

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum RelayState {
    Disconnected,
    Connecting,
    Subscribed,
}

impl RelayState {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Disconnected => "disconnected",
            Self::Connecting => "connecting",
            Self::Subscribed => "subscribed",
        }
    }
}

/// Bridges the local router and the shared bus.
///
/// Subscribes to one subject and reconnects with bounded backoff when the
/// subscription drops. Envelopes published by this instance come back tagged
/// with our own origin and are suppressed; everything else is re-injected
/// through the router's local-only path so a broadcast never loops between
/// instances. Bus trouble degrades cross-instance delivery and nothing else:
/// local publishes keep working and are never blocked or failed by the relay.
pub struct Relay {
    bus: Arc<dyn MessageBus>,
    subject: String,
    instance: InstanceId,
    router: Arc<BroadcastRouter>,
    outbound: mpsc::Receiver<RelayEnvelope>,
    outbound_open: bool,
    state: watch::Sender<RelayState>,
    cancel: CancellationToken,
    backoff: ExponentialBackoff,
}

impl Relay {
    pub fn new(
        bus: Arc<dyn MessageBus>,
        subject: impl Into<String>,
        instance: InstanceId,
        router: Arc<BroadcastRouter>,
        outbound: mpsc::Receiver<RelayEnvelope>,
        cancel: CancellationToken,
    ) -> Self {
        let (state, _) = watch::channel(RelayState::Disconnected);
        Self {
            bus,
            subject: subject.into(),
            instance,
            router,
            outbound,
            outbound_open: true,
            state,
            cancel,
            backoff: ExponentialBackoff::default(),
        }
    }

    pub fn with_backoff(mut self, backoff: ExponentialBackoff) -> Self {
        self.backoff = backoff;
        self
    }

    /// Observe the relay's connection state. Take before spawning `run`.
    pub fn state_rx(&self) -> watch::Receiver<RelayState> {
        self.state.subscribe()
    }

    pub async fn run(mut self) {
        loop {
            if self.cancel.is_cancelled() {
                break;
            }
            self.state.send_replace(RelayState::Connecting);

            let subscribed = tokio::select! {
                _ = self.cancel.cancelled() => break,
                result = self.bus.subscribe(&self.subject) => result,
            };

            match subscribed {
                Ok(stream) => {
                    self.state.send_replace(RelayState::Subscribed);
                    self.backoff.reset();
                    info!(subject = %self.subject, "relay subscribed");

                    if self.pump(stream).await {
                        break;
                    }
                    self.state.send_replace(RelayState::Disconnected);
                    warn!(subject = %self.subject, "relay subscription lost");
                }
                Err(err) => {
                    self.state.send_replace(RelayState::Disconnected);
                    warn!(error = %err, "relay subscribe failed");
                }
            }

            let delay = self.backoff.next_delay();
            debug!(delay_ms = delay.as_millis() as u64, "relay reconnect backoff");
            if self.wait_backoff(delay).await {
                break;
            }
        }

        self.state.send_replace(RelayState::Disconnected);
        info!("relay stopped");
    }

    /// Run the subscribed loop. Returns true if cancelled.
    async fn pump(&mut self, mut stream: BusStream) -> bool {
        loop {
            tokio::select! {
                _ = self.cancel.cancelled() => return true,
                envelope = self.outbound.recv(), if self.outbound_open => {
                    match envelope {
                        Some(envelope) => self.publish(envelope).await,
                        None => self.outbound_open = false,
                    }
                }
                item = stream.next() => {
                    match item {
                        Some(bytes) => self.deliver(&bytes),
                        None => return false,
                    }
                }
            }
        }
    }

    async fn publish(&self, envelope: RelayEnvelope) {
        let bytes = match envelope.to_bytes() {
            Ok(bytes) => bytes,
            Err(err) => {
                warn!(error = %err, "failed to encode relay envelope, dropping");
                return;
            }
        };
        if let Err(err) = self.bus.publish(&self.subject, bytes).await {
            // Bus unreachable degrades cross-instance delivery only; the
            // original local broadcast already succeeded.
            warn!(error = %err, "relay publish failed, dropping envelope");
        }
    }

    fn deliver(&self, bytes: &[u8]) {
        let envelope = match RelayEnvelope::from_bytes(bytes) {
            Ok(envelope) => envelope,
            Err(err) => {
                warn!(error = %err, "malformed relay envelope, dropping");
                return;
            }
        };
        if envelope.is_from(&self.instance) {
            // Already fanned out locally before it reached the bus.
            return;
        }
        let delivered = self
            .router
            .publish_local(&envelope.message, &envelope.target);
        debug!(origin = %envelope.origin, delivered = delivered, "relayed broadcast delivered");
    }

    /// Wait out the reconnect delay. Outbound envelopes arriving while
    /// disconnected are dropped — buffering them would reorder
    /// cross-instance delivery after reconnect. Returns true if cancelled.
    async fn wait_backoff(&mut self, delay: Duration) -> bool {
        let sleep = tokio::time::sleep(delay);
        tokio::pin!(sleep);
        loop {
            tokio::select! {
                _ = self.cancel.cancelled() => return true,
                _ = &mut sleep => return false,
                envelope = self.outbound.recv(), if self.outbound_open => {
                    match envelope {
                        Some(_) => debug!("relay disconnected, dropping outbound envelope"),
                        None => self.outbound_open = false,
                    }
                }
            }
        }
    }
}
