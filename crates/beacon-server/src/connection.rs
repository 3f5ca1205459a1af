use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

use beacon_core::{ConnectionId, OutboundMessage, Principal};
use tokio::sync::watch;
use tokio_util::sync::CancellationToken;

use crate::queue::OutboundQueue;

/// Lifecycle of a connection. Transitions are monotonic.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ConnectionState {
    Connecting,
    Active,
    Closing,
    Closed,
}

impl ConnectionState {
    fn rank(self) -> u8 {
        match self {
            Self::Connecting => 0,
            Self::Active => 1,
            Self::Closing => 2,
            Self::Closed => 3,
        }
    }

    pub fn as_str(self) -> &'static str {
        match self {
            Self::Connecting => "connecting",
            Self::Active => "active",
            Self::Closing => "closing",
            Self::Closed => "closed",
        }
    }
}

/// One live client session: identity, authenticated principal, outbound
/// queue, and the cancellation token its reader/writer loops observe.
///
/// Owned by the registry; the loops hold an `Arc` only while they run.
pub struct Connection {
    id: ConnectionId,
    principal: Principal,
    queue: OutboundQueue,
    state: watch::Sender<ConnectionState>,
    cancel: CancellationToken,
    last_pong: AtomicU64,
}

impl Connection {
    pub fn new(id: ConnectionId, principal: Principal, queue_capacity: usize) -> Self {
        let (state, _) = watch::channel(ConnectionState::Connecting);
        Self {
            id,
            principal,
            queue: OutboundQueue::new(queue_capacity),
            state,
            cancel: CancellationToken::new(),
            last_pong: AtomicU64::new(now_secs()),
        }
    }

    pub fn id(&self) -> &ConnectionId {
        &self.id
    }

    pub fn principal(&self) -> &Principal {
        &self.principal
    }

    pub fn queue(&self) -> &OutboundQueue {
        &self.queue
    }

    pub fn state(&self) -> ConnectionState {
        *self.state.borrow()
    }

    /// Append to the outbound queue. Once the connection is closing or
    /// closed this silently drops the message: a broadcast must not fail
    /// because one recipient is gone.
    pub fn enqueue(&self, message: OutboundMessage) -> bool {
        match self.state() {
            ConnectionState::Connecting | ConnectionState::Active => self.queue.push(message),
            ConnectionState::Closing | ConnectionState::Closed => false,
        }
    }

    pub fn activate(&self) {
        self.transition(ConnectionState::Active);
    }

    /// Stop accepting new outbound messages; the writer flushes the rest
    /// and closes cleanly.
    pub fn begin_drain(&self) {
        self.queue.close();
        self.transition(ConnectionState::Closing);
    }

    /// Cancel both loops immediately, abandoning queued messages.
    pub fn force_close(&self) {
        self.queue.close();
        self.transition(ConnectionState::Closing);
        self.cancel.cancel();
    }

    /// Final transition, made by the socket task once both loops exited.
    pub fn mark_closed(&self) {
        self.queue.close();
        self.transition(ConnectionState::Closed);
    }

    fn transition(&self, to: ConnectionState) {
        self.state.send_if_modified(|current| {
            if to.rank() > current.rank() {
                *current = to;
                true
            } else {
                false
            }
        });
    }

    pub fn cancel_token(&self) -> CancellationToken {
        self.cancel.clone()
    }

    /// Resolves once the connection reaches `Closed`.
    pub async fn wait_closed(&self) {
        let mut rx = self.state.subscribe();
        let _ = rx.wait_for(|s| *s == ConnectionState::Closed).await;
    }

    pub fn record_pong(&self) {
        self.last_pong.store(now_secs(), Ordering::Relaxed);
    }

    pub fn is_alive(&self, timeout: Duration) -> bool {
        let last = self.last_pong.load(Ordering::Relaxed);
        now_secs().saturating_sub(last) < timeout.as_secs()
    }
}

fn now_secs() -> u64 {
    std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .unwrap_or_default()
        .as_secs()
}

#[cfg(test)]
mod tests {
    use super::*;

    fn conn() -> Connection {
        Connection::new(ConnectionId::new(), Principal::new("alice"), 8)
    }

    fn msg() -> OutboundMessage {
        OutboundMessage::new("test", serde_json::Value::Null)
    }

    #[test]
    fn starts_connecting_then_activates() {
        let c = conn();
        assert_eq!(c.state(), ConnectionState::Connecting);
        c.activate();
        assert_eq!(c.state(), ConnectionState::Active);
    }

    #[test]
    fn transitions_never_go_backwards() {
        let c = conn();
        c.mark_closed();
        c.activate();
        assert_eq!(c.state(), ConnectionState::Closed);
    }

    #[test]
    fn enqueue_while_active() {
        let c = conn();
        c.activate();
        assert!(c.enqueue(msg()));
        assert_eq!(c.queue().len(), 1);
    }

    #[test]
    fn enqueue_after_drain_is_silent_drop() {
        let c = conn();
        c.activate();
        c.begin_drain();
        assert_eq!(c.state(), ConnectionState::Closing);
        assert!(!c.enqueue(msg()));
        assert_eq!(c.queue().len(), 0);
    }

    #[tokio::test]
    async fn drain_keeps_queued_messages_available() {
        let c = conn();
        c.activate();
        c.enqueue(msg());
        c.enqueue(msg());
        c.begin_drain();

        assert!(c.queue().recv().await.is_some());
        assert!(c.queue().recv().await.is_some());
        assert!(c.queue().recv().await.is_none());
    }

    #[test]
    fn force_close_cancels_loops() {
        let c = conn();
        c.activate();
        let token = c.cancel_token();
        assert!(!token.is_cancelled());
        c.force_close();
        assert!(token.is_cancelled());
        assert_eq!(c.state(), ConnectionState::Closing);
    }

    #[tokio::test]
    async fn wait_closed_resolves_on_mark_closed() {
        let c = std::sync::Arc::new(conn());
        let waiter = {
            let c = std::sync::Arc::clone(&c);
            tokio::spawn(async move { c.wait_closed().await })
        };

        tokio::time::sleep(std::time::Duration::from_millis(10)).await;
        c.mark_closed();

        tokio::time::timeout(std::time::Duration::from_secs(1), waiter)
            .await
            .expect("wait_closed did not resolve")
            .unwrap();
    }

    #[test]
    fn pong_tracking() {
        let c = conn();
        assert!(c.is_alive(Duration::from_secs(60)));
        c.last_pong.store(0, Ordering::Relaxed);
        assert!(!c.is_alive(Duration::from_secs(60)));
        c.record_pong();
        assert!(c.is_alive(Duration::from_secs(60)));
    }
}
