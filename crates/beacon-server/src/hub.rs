use std::sync::Arc;
use std::time::Duration;

use beacon_bus::MessageBus;
use beacon_core::InstanceId;
use parking_lot::Mutex;
use tokio::sync::{mpsc, watch};
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

use crate::registry::ConnectionRegistry;
use crate::relay::{Relay, RelayState};
use crate::router::BroadcastRouter;

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum HubState {
    Stopped,
    Starting,
    Running,
    Draining,
}

impl HubState {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Stopped => "stopped",
            Self::Starting => "starting",
            Self::Running => "running",
            Self::Draining => "draining",
        }
    }
}

pub struct HubConfig {
    pub instance: InstanceId,
    pub relay_subject: String,
    /// Bound of the router -> relay envelope channel.
    pub relay_queue: usize,
    /// A connection silent for this long is force-closed by the sweep.
    pub liveness_timeout: Duration,
    pub sweep_interval: Duration,
}

impl Default for HubConfig {
    fn default() -> Self {
        Self {
            instance: InstanceId::new(),
            relay_subject: "beacon.broadcast".to_owned(),
            relay_queue: 256,
            liveness_timeout: Duration::from_secs(90),
            sweep_interval: Duration::from_secs(60),
        }
    }
}

/// Owns the registry, router and background tasks of one hub instance.
///
/// Constructed fresh per instance — nothing here is ambient, so tests can
/// run several independent hubs in one process.
pub struct Hub {
    registry: Arc<ConnectionRegistry>,
    router: Arc<BroadcastRouter>,
    state: watch::Sender<HubState>,
    cancel: CancellationToken,
    relay_state: Option<watch::Receiver<RelayState>>,
    tasks: Mutex<Vec<tokio::task::JoinHandle<()>>>,
}

impl Hub {
    /// Build the hub and spawn its background tasks. A configured bus is
    /// best-effort: the relay keeps retrying in the background and the hub
    /// runs local-only until it connects.
    pub fn start(config: HubConfig, bus: Option<Arc<dyn MessageBus>>) -> Arc<Self> {
        let (state, _) = watch::channel(HubState::Starting);
        let cancel = CancellationToken::new();
        let registry = Arc::new(ConnectionRegistry::new());
        let mut tasks = Vec::new();

        let (router, relay_state) = match bus {
            Some(bus) => {
                let (relay_tx, relay_rx) = mpsc::channel(config.relay_queue);
                let router = Arc::new(
                    BroadcastRouter::new(Arc::clone(&registry), config.instance.clone())
                        .with_relay(relay_tx),
                );
                let relay = Relay::new(
                    bus,
                    config.relay_subject.clone(),
                    config.instance.clone(),
                    Arc::clone(&router),
                    relay_rx,
                    cancel.child_token(),
                );
                let relay_state = relay.state_rx();
                tasks.push(tokio::spawn(relay.run()));
                (router, Some(relay_state))
            }
            None => {
                info!("no bus configured, hub runs local-only");
                let router = Arc::new(BroadcastRouter::new(
                    Arc::clone(&registry),
                    config.instance.clone(),
                ));
                (router, None)
            }
        };

        tasks.push(tokio::spawn(sweep_loop(
            Arc::clone(&registry),
            config.sweep_interval,
            config.liveness_timeout,
            cancel.child_token(),
        )));

        state.send_replace(HubState::Running);
        info!(instance = %config.instance, "hub running");

        Arc::new(Self {
            registry,
            router,
            state,
            cancel,
            relay_state,
            tasks: Mutex::new(tasks),
        })
    }

    pub fn registry(&self) -> &Arc<ConnectionRegistry> {
        &self.registry
    }

    pub fn router(&self) -> &Arc<BroadcastRouter> {
        &self.router
    }

    pub fn state(&self) -> HubState {
        *self.state.borrow()
    }

    pub fn is_running(&self) -> bool {
        self.state() == HubState::Running
    }

    pub fn relay_state(&self) -> Option<RelayState> {
        self.relay_state.as_ref().map(|rx| *rx.borrow())
    }

    /// Relay state for the health surface; "none" in local-only mode.
    pub fn relay_state_name(&self) -> &'static str {
        match self.relay_state() {
            Some(state) => state.as_str(),
            None => "none",
        }
    }

    /// Drain every connection's outbound queue for up to `timeout`, then
    /// force-close what remains, stop the relay and sweep, and tear down
    /// the registry. Idempotent: a second call observes a non-running state
    /// and returns immediately.
    pub async fn stop(&self, timeout: Duration) {
        let mut draining = false;
        self.state.send_if_modified(|state| {
            if *state == HubState::Running {
                *state = HubState::Draining;
                draining = true;
                true
            } else {
                false
            }
        });
        if !draining {
            return;
        }

        let connections = self.registry.snapshot();
        info!(connections = connections.len(), "hub draining");
        for conn in &connections {
            conn.begin_drain();
        }

        let drained = tokio::time::timeout(timeout, async {
            for conn in &connections {
                conn.wait_closed().await;
            }
        })
        .await;

        if drained.is_err() {
            let remaining = self.registry.snapshot();
            warn!(
                remaining = remaining.len(),
                "drain deadline expired, force-closing"
            );
            for conn in remaining {
                conn.force_close();
            }
        }

        self.cancel.cancel();
        for task in self.tasks.lock().drain(..) {
            if tokio::time::timeout(Duration::from_secs(1), task).await.is_err() {
                warn!("background task did not stop in time");
            }
        }
        self.registry.clear();
        self.state.send_replace(HubState::Stopped);
        info!("hub stopped");
    }
}

/// Force-close connections that stopped answering pings. Runs until the hub
/// stops; closing goes through the connection's own cancellation path, so a
/// dead peer is cleaned up exactly like a broken transport.
async fn sweep_loop(
    registry: Arc<ConnectionRegistry>,
    interval: Duration,
    liveness_timeout: Duration,
    cancel: CancellationToken,
) {
    let mut ticker = tokio::time::interval(interval);
    ticker.tick().await; // consume first immediate tick

    loop {
        tokio::select! {
            _ = cancel.cancelled() => break,
            _ = ticker.tick() => {
                let mut closed = 0usize;
                for conn in registry.snapshot() {
                    if !conn.is_alive(liveness_timeout) {
                        info!(connection = %conn.id(), "force-closing unresponsive connection");
                        conn.force_close();
                        closed += 1;
                    }
                }
                if closed > 0 {
                    info!(closed = closed, "liveness sweep");
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::connection::Connection;
    use beacon_bus::InMemoryBus;
    use beacon_core::{ConnectionId, OutboundMessage, Principal, Target};
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::time::Instant;

    fn msg() -> OutboundMessage {
        OutboundMessage::new("test", serde_json::Value::Null)
    }

    fn register(hub: &Hub, id: &str) -> Arc<Connection> {
        let conn = Arc::new(Connection::new(
            ConnectionId::from_raw(id),
            Principal::new("alice"),
            32,
        ));
        conn.activate();
        hub.registry().add(Arc::clone(&conn)).unwrap();
        conn
    }

    /// Stand-in for the socket task: consumes the queue with a fixed write
    /// delay, exits on drain or cancellation, then deregisters.
    fn fake_socket(
        conn: Arc<Connection>,
        registry: Arc<ConnectionRegistry>,
        write_delay: Duration,
        written: Arc<AtomicUsize>,
    ) -> tokio::task::JoinHandle<()> {
        tokio::spawn(async move {
            let cancel = conn.cancel_token();
            loop {
                tokio::select! {
                    _ = cancel.cancelled() => break,
                    message = conn.queue().recv() => match message {
                        Some(_) => {
                            tokio::time::sleep(write_delay).await;
                            written.fetch_add(1, Ordering::Relaxed);
                        }
                        None => break,
                    }
                }
            }
            conn.mark_closed();
            registry.remove(conn.id());
        })
    }

    /// A socket whose transport write never completes.
    fn stalled_socket(
        conn: Arc<Connection>,
        registry: Arc<ConnectionRegistry>,
    ) -> tokio::task::JoinHandle<()> {
        tokio::spawn(async move {
            conn.cancel_token().cancelled().await;
            conn.mark_closed();
            registry.remove(conn.id());
        })
    }

    #[tokio::test]
    async fn starts_running_in_local_only_mode() {
        let hub = Hub::start(HubConfig::default(), None);
        assert!(hub.is_running());
        assert_eq!(hub.relay_state_name(), "none");
        hub.stop(Duration::from_millis(100)).await;
    }

    #[tokio::test]
    async fn stop_is_idempotent() {
        let hub = Hub::start(HubConfig::default(), None);
        hub.stop(Duration::from_millis(100)).await;
        assert_eq!(hub.state(), HubState::Stopped);

        // Second call observes Stopped and returns immediately.
        let start = Instant::now();
        hub.stop(Duration::from_secs(10)).await;
        assert!(start.elapsed() < Duration::from_millis(100));
        assert_eq!(hub.state(), HubState::Stopped);
    }

    #[tokio::test]
    async fn stop_flushes_queued_messages_within_timeout() {
        let hub = Hub::start(HubConfig::default(), None);
        let conn = register(&hub, "conn_1");
        let written = Arc::new(AtomicUsize::new(0));
        let socket = fake_socket(
            Arc::clone(&conn),
            Arc::clone(hub.registry()),
            Duration::from_millis(10),
            Arc::clone(&written),
        );

        for _ in 0..3 {
            assert!(conn.enqueue(msg()));
        }

        hub.stop(Duration::from_secs(2)).await;

        assert_eq!(written.load(Ordering::Relaxed), 3);
        assert_eq!(hub.state(), HubState::Stopped);
        assert!(hub.registry().is_empty());
        socket.await.unwrap();
    }

    #[tokio::test]
    async fn stop_force_closes_stalled_connection_at_deadline() {
        let hub = Hub::start(HubConfig::default(), None);
        let conn = register(&hub, "conn_1");
        let socket = stalled_socket(Arc::clone(&conn), Arc::clone(hub.registry()));
        conn.enqueue(msg());

        let start = Instant::now();
        hub.stop(Duration::from_millis(100)).await;

        assert!(
            start.elapsed() < Duration::from_secs(3),
            "stop did not return promptly: {:?}",
            start.elapsed()
        );
        assert_eq!(hub.state(), HubState::Stopped);
        assert!(hub.registry().is_empty());
        socket.await.unwrap();
    }

    #[tokio::test]
    async fn disconnect_of_one_connection_leaves_others_untouched() {
        let hub = Hub::start(HubConfig::default(), None);
        let written = Arc::new(AtomicUsize::new(0));
        let c1 = register(&hub, "conn_1");
        let c2 = register(&hub, "conn_2");
        let s1 = fake_socket(
            Arc::clone(&c1),
            Arc::clone(hub.registry()),
            Duration::ZERO,
            Arc::clone(&written),
        );
        let _s2 = fake_socket(
            Arc::clone(&c2),
            Arc::clone(hub.registry()),
            Duration::ZERO,
            Arc::clone(&written),
        );

        c1.force_close();
        s1.await.unwrap();

        assert!(hub.registry().lookup(c1.id()).is_none());
        assert!(hub.registry().lookup(c2.id()).is_some());
        assert_eq!(hub.router().publish(msg(), Target::Broadcast), 1);

        hub.stop(Duration::from_millis(200)).await;
    }

    #[tokio::test]
    async fn hub_with_bus_reaches_subscribed_relay() {
        let bus = Arc::new(InMemoryBus::new());
        let hub = Hub::start(HubConfig::default(), Some(bus));

        let deadline = Instant::now() + Duration::from_secs(2);
        while hub.relay_state_name() != "subscribed" {
            assert!(Instant::now() < deadline, "relay never subscribed");
            tokio::time::sleep(Duration::from_millis(10)).await;
        }

        hub.stop(Duration::from_millis(100)).await;
        assert_eq!(hub.relay_state_name(), "disconnected");
    }
}
