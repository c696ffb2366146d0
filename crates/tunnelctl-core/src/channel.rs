//! A bounded, single-consumer queue that drops the oldest pending item on
//! overflow instead of blocking the producer.
//!
//! This is the endpoint watcher's delivery policy to the reconciler: a
//! stale event is harmless since the next one supersedes it, so losing
//! an old one is preferable to the watcher stalling on a slow consumer.
//! The request channel, by contrast, uses ordinary `tokio::sync::mpsc`
//! backpressure, since a dropped `Create`/`Delete` would be a correctness
//! bug, not just staleness.

use std::collections::VecDeque;
use std::sync::atomic::{
    AtomicBool,
    AtomicU64,
    Ordering,
};
use std::sync::{
    Arc,
    Mutex,
};

use tokio::sync::Notify;
use tracing::warn;

struct Shared<T> {
    queue: Mutex<VecDeque<T>>,
    capacity: usize,
    notify: Notify,
    dropped: AtomicU64,
    closed: AtomicBool,
}

pub struct DroppingSender<T> {
    inner: Arc<Shared<T>>,
}

pub struct DroppingReceiver<T> {
    inner: Arc<Shared<T>>,
}

pub fn bounded_dropping<T>(capacity: usize) -> (DroppingSender<T>, DroppingReceiver<T>) {
    let inner = Arc::new(Shared {
        queue: Mutex::new(VecDeque::with_capacity(capacity)),
        capacity,
        notify: Notify::new(),
        dropped: AtomicU64::new(0),
        closed: AtomicBool::new(false),
    });
    (
        DroppingSender {
            inner: inner.clone(),
        },
        DroppingReceiver { inner },
    )
}

impl<T> DroppingSender<T> {
    /// Push an item, dropping the oldest queued item if the buffer is at
    /// capacity. Logs the drop so a consumer falling behind is visible
    /// in the logs rather than silently losing events.
    pub fn send(&self, item: T) {
        let mut queue = self.inner.queue.lock().expect("reaper queue lock poisoned");
        if queue.len() >= self.inner.capacity {
            queue.pop_front();
            let total = self.inner.dropped.fetch_add(1, Ordering::Relaxed) + 1;
            warn!(
                total_dropped = total,
                "reaper channel at capacity, dropped oldest pending endpoint event"
            );
        }
        queue.push_back(item);
        drop(queue);
        self.inner.notify.notify_one();
    }
}

impl<T> Drop for DroppingSender<T> {
    fn drop(&mut self) {
        self.inner.closed.store(true, Ordering::SeqCst);
        self.inner.notify.notify_waiters();
    }
}

impl<T> DroppingReceiver<T> {
    /// Waits for an item, or returns `None` once every sender has been
    /// dropped and the queue has drained.
    pub async fn recv(&mut self) -> Option<T> {
        loop {
            {
                let mut queue = self.inner.queue.lock().expect("reaper queue lock poisoned");
                if let Some(item) = queue.pop_front() {
                    return Some(item);
                }
                if self.inner.closed.load(Ordering::SeqCst) {
                    return None;
                }
            }
            self.inner.notify.notified().await;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn overflow_drops_oldest() {
        let (tx, mut rx) = bounded_dropping::<u32>(2);
        tx.send(1);
        tx.send(2);
        tx.send(3); // drops 1

        assert_eq!(rx.recv().await, Some(2));
        assert_eq!(rx.recv().await, Some(3));
    }

    #[tokio::test]
    async fn recv_returns_none_after_sender_dropped() {
        let (tx, mut rx) = bounded_dropping::<u32>(4);
        tx.send(42);
        drop(tx);

        assert_eq!(rx.recv().await, Some(42));
        assert_eq!(rx.recv().await, None);
    }
}
