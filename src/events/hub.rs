//! Subscriber fan-out for chain events
//!
//! Each subscriber owns a bounded queue. Publishing never waits on a
//! subscriber: a full queue drops that event for that subscriber only, and a
//! closed queue is pruned.

use crate::config::DEFAULT_SUBSCRIBER_CAPACITY;
use crate::core::{ChainHeader, ReorgEvent};
use futures::Stream;
use std::collections::HashMap;
use std::pin::Pin;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::task::{Context, Poll};
use tokio::sync::mpsc::{self, error::TrySendError};
use tokio::sync::Mutex;

/// Handle identifying one subscription
pub type SubscriptionId = u64;

/// Receiving end of a subscription
#[derive(Debug)]
pub struct Subscription<T> {
    id: SubscriptionId,
    receiver: mpsc::Receiver<T>,
}

impl<T> Subscription<T> {
    pub fn id(&self) -> SubscriptionId {
        self.id
    }

    /// Wait for the next event; `None` once unsubscribed
    pub async fn recv(&mut self) -> Option<T> {
        self.receiver.recv().await
    }

    /// Next queued event, if any
    pub fn try_recv(&mut self) -> Option<T> {
        self.receiver.try_recv().ok()
    }
}

impl<T> Stream for Subscription<T> {
    type Item = T;

    fn poll_next(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<T>> {
        self.receiver.poll_recv(cx)
    }
}

#[derive(Debug)]
struct Subscriber<T> {
    sender: mpsc::Sender<T>,
    dropped: u64,
}

/// Delivery counts of one publish
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct PublishStats {
    pub delivered: usize,
    pub dropped: usize,
    pub pruned: usize,
}

/// One event kind with its subscribers
#[derive(Debug)]
pub struct Topic<T> {
    name: &'static str,
    capacity: usize,
    next_id: AtomicU64,
    subscribers: Mutex<HashMap<SubscriptionId, Subscriber<T>>>,
}

impl<T: Clone> Topic<T> {
    pub fn new(name: &'static str, capacity: usize) -> Self {
        Self {
            name,
            capacity: capacity.max(1),
            next_id: AtomicU64::new(1),
            subscribers: Mutex::new(HashMap::new()),
        }
    }

    pub async fn subscribe(&self) -> Subscription<T> {
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        let (sender, receiver) = mpsc::channel(self.capacity);
        self.subscribers
            .lock()
            .await
            .insert(id, Subscriber { sender, dropped: 0 });
        log::debug!("New {} subscriber {}", self.name, id);
        Subscription { id, receiver }
    }

    /// Remove a subscriber; unknown ids are ignored
    pub async fn unsubscribe(&self, id: SubscriptionId) -> bool {
        self.subscribers.lock().await.remove(&id).is_some()
    }

    /// Offer `event` to every subscriber without blocking
    pub async fn publish(&self, event: T) -> PublishStats {
        let mut stats = PublishStats::default();
        let mut subscribers = self.subscribers.lock().await;

        subscribers.retain(|id, subscriber| match subscriber.sender.try_send(event.clone()) {
            Ok(()) => {
                stats.delivered += 1;
                true
            }
            Err(TrySendError::Full(_)) => {
                subscriber.dropped += 1;
                stats.dropped += 1;
                log::warn!(
                    "{} subscriber {} is full, dropped {} events so far",
                    self.name,
                    id,
                    subscriber.dropped
                );
                true
            }
            Err(TrySendError::Closed(_)) => {
                stats.pruned += 1;
                log::debug!("Pruned closed {} subscriber {}", self.name, id);
                false
            }
        });
        stats
    }

    pub async fn subscriber_count(&self) -> usize {
        self.subscribers.lock().await.len()
    }

    /// Events dropped for a subscriber because its queue was full
    pub async fn dropped_count(&self, id: SubscriptionId) -> Option<u64> {
        self.subscribers.lock().await.get(&id).map(|s| s.dropped)
    }
}

/// Tip and reorg subscriptions of one chain
#[derive(Debug)]
pub struct SubscriptionHub {
    pub tips: Topic<Arc<ChainHeader>>,
    pub reorgs: Topic<Arc<ReorgEvent>>,
}

impl SubscriptionHub {
    pub fn new(capacity: usize) -> Self {
        Self {
            tips: Topic::new("tip", capacity),
            reorgs: Topic::new("reorg", capacity),
        }
    }
}

impl Default for SubscriptionHub {
    fn default() -> Self {
        Self::new(DEFAULT_SUBSCRIBER_CAPACITY)
    }
}
