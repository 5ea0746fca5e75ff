//! Streaming broadcaster.
//!
//! Fans out delta batches to registered subscriber channels. The registry
//! has its own lock, disjoint from the data-cache lock, so producers never
//! hold both. Delivery is strictly non-blocking: a subscriber whose bounded
//! buffer is full loses the batch; a subscriber whose handle was cancelled
//! or dropped is deregistered lazily on the next delivery attempt. There is
//! no delivery guarantee and no backpressure on producers.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use tokio::sync::mpsc::{self, error::TrySendError};
use tokio::sync::Mutex;
use uuid::Uuid;

/// Opaque handle returned by [`Broadcaster::subscribe`]. Cancelling (or
/// dropping) it marks the subscriber for lazy removal.
#[derive(Debug)]
pub struct Subscription {
    id: Uuid,
    cancelled: Arc<AtomicBool>,
}

impl Subscription {
    pub fn id(&self) -> Uuid {
        self.id
    }

    /// Mark this subscription as cancelled. Removal happens on the next
    /// delivery attempt.
    pub fn cancel(&self) {
        self.cancelled.store(true, Ordering::Relaxed);
    }
}

impl Drop for Subscription {
    fn drop(&mut self) {
        self.cancel();
    }
}

struct Entry<T> {
    tx: mpsc::Sender<Vec<T>>,
    cancelled: Arc<AtomicBool>,
}

/// Subscriber registry keyed by subscription token.
pub struct Broadcaster<T> {
    subscribers: Mutex<HashMap<Uuid, Entry<T>>>,
}

impl<T: Clone> Broadcaster<T> {
    pub fn new() -> Self {
        Self {
            subscribers: Mutex::new(HashMap::new()),
        }
    }

    /// Register a delivery channel and return its handle.
    pub async fn subscribe(&self, tx: mpsc::Sender<Vec<T>>) -> Subscription {
        let id = Uuid::new_v4();
        let cancelled = Arc::new(AtomicBool::new(false));
        self.subscribers.lock().await.insert(
            id,
            Entry {
                tx,
                cancelled: cancelled.clone(),
            },
        );
        Subscription { id, cancelled }
    }

    /// Deliver a batch to every live subscriber. Cancelled subscribers are
    /// removed; full buffers drop the batch for that subscriber only.
    pub async fn send(&self, batch: &[T]) {
        if batch.is_empty() {
            return;
        }
        let mut subscribers = self.subscribers.lock().await;
        subscribers.retain(|id, entry| {
            if entry.cancelled.load(Ordering::Relaxed) {
                tracing::trace!(subscriber = %id, "Removing cancelled subscriber");
                return false;
            }
            match entry.tx.try_send(batch.to_vec()) {
                Ok(()) => true,
                Err(TrySendError::Full(_)) => {
                    tracing::debug!(
                        subscriber = %id,
                        batch_len = batch.len(),
                        "Subscriber buffer full, dropping batch"
                    );
                    true
                }
                Err(TrySendError::Closed(_)) => {
                    tracing::trace!(subscriber = %id, "Removing closed subscriber");
                    false
                }
            }
        });
    }

    /// Number of registered subscribers, including not-yet-pruned ones.
    pub async fn subscriber_count(&self) -> usize {
        self.subscribers.lock().await.len()
    }
}

impl<T: Clone> Default for Broadcaster<T> {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::SUBSCRIBER_CHANNEL_CAPACITY;

    #[tokio::test]
    async fn test_delivery_to_live_subscriber() {
        let b = Broadcaster::new();
        let (tx, mut rx) = mpsc::channel(SUBSCRIBER_CHANNEL_CAPACITY);
        let _sub = b.subscribe(tx).await;

        b.send(&[1u32, 2, 3]).await;
        assert_eq!(rx.recv().await.unwrap(), vec![1, 2, 3]);
    }

    #[tokio::test]
    async fn test_cancelled_subscriber_removed_on_next_delivery() {
        let b = Broadcaster::new();
        let (tx1, mut rx1) = mpsc::channel(4);
        let (tx2, mut rx2) = mpsc::channel(4);
        let sub1 = b.subscribe(tx1).await;
        let _sub2 = b.subscribe(tx2).await;

        sub1.cancel();
        b.send(&[7u32]).await;

        assert_eq!(b.subscriber_count().await, 1);
        assert!(rx1.try_recv().is_err());
        // The other subscriber is unaffected
        assert_eq!(rx2.recv().await.unwrap(), vec![7]);
        drop(rx1);
    }

    #[tokio::test]
    async fn test_dropped_handle_cancels() {
        let b = Broadcaster::new();
        let (tx, _rx) = mpsc::channel(4);
        let sub = b.subscribe(tx).await;
        drop(sub);

        b.send(&[1u32]).await;
        assert_eq!(b.subscriber_count().await, 0);
    }

    #[tokio::test]
    async fn test_full_buffer_drops_batch_without_removal() {
        let b = Broadcaster::new();
        let (tx, mut rx) = mpsc::channel(1);
        let _sub = b.subscribe(tx).await;

        b.send(&[1u32]).await;
        b.send(&[2u32]).await; // buffer full, silently dropped

        assert_eq!(rx.recv().await.unwrap(), vec![1]);
        assert!(rx.try_recv().is_err());
        assert_eq!(b.subscriber_count().await, 1);
    }

    #[tokio::test]
    async fn test_empty_batch_is_not_delivered() {
        let b: Broadcaster<u32> = Broadcaster::new();
        let (tx, mut rx) = mpsc::channel(4);
        let _sub = b.subscribe(tx).await;
        b.send(&[]).await;
        assert!(rx.try_recv().is_err());
    }
}
