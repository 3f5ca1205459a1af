use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};

use beacon_core::OutboundMessage;
use parking_lot::Mutex;
use tokio::sync::Notify;

/// Bounded multi-producer, single-consumer queue of pending outbound
/// messages for one connection.
///
/// Producers never wait: when the queue is full the oldest unsent message is
/// dropped and counted, so a stalled client cannot slow down broadcast or any
/// other connection. After `close()` pushes become silent no-ops and the
/// consumer drains what remains before observing end-of-queue.
pub struct OutboundQueue {
    inner: Mutex<VecDeque<OutboundMessage>>,
    capacity: usize,
    notify: Notify,
    closed: AtomicBool,
    dropped: AtomicU64,
}

impl OutboundQueue {
    pub fn new(capacity: usize) -> Self {
        Self {
            inner: Mutex::new(VecDeque::with_capacity(capacity.max(1))),
            capacity: capacity.max(1),
            notify: Notify::new(),
            closed: AtomicBool::new(false),
            dropped: AtomicU64::new(0),
        }
    }

    /// Append a message. Returns false if it was dropped (queue closed).
    /// On overflow the oldest queued message is evicted instead.
    pub fn push(&self, message: OutboundMessage) -> bool {
        if self.closed.load(Ordering::Acquire) {
            return false;
        }

        {
            let mut queue = self.inner.lock();
            if queue.len() >= self.capacity {
                queue.pop_front();
                let total = self.dropped.fetch_add(1, Ordering::Relaxed) + 1;
                tracing::warn!(
                    dropped_total = total,
                    "outbound queue full, dropping oldest message"
                );
            }
            queue.push_back(message);
        }

        self.notify.notify_one();
        true
    }

    /// Wait for the next message in FIFO order. Returns `None` once the
    /// queue has been closed and fully drained.
    pub async fn recv(&self) -> Option<OutboundMessage> {
        loop {
            let notified = self.notify.notified();

            if let Some(message) = self.inner.lock().pop_front() {
                return Some(message);
            }
            if self.closed.load(Ordering::Acquire) {
                return None;
            }

            notified.await;
        }
    }

    /// Stop accepting pushes. Queued messages stay available to `recv`.
    pub fn close(&self) {
        self.closed.store(true, Ordering::Release);
        // Single consumer, so one permit is enough to wake it.
        self.notify.notify_one();
    }

    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::Acquire)
    }

    pub fn len(&self) -> usize {
        self.inner.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.inner.lock().is_empty()
    }

    /// Messages evicted by overflow since creation.
    pub fn dropped_total(&self) -> u64 {
        self.dropped.load(Ordering::Relaxed)
    }
}
