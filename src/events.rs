//! In-process publish/subscribe.
//!
//! Each [`Subscription`] owns a small bounded channel. [`EventBus::publish`]
//! never blocks: a subscriber whose buffer is full simply misses that event.
//! There is no replay; a subscriber only sees events published after it
//! subscribed. Order is preserved within one subscriber's channel.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Weak};

use parking_lot::RwLock;
use tokio::sync::mpsc;
use tokio::sync::mpsc::error::TrySendError;

use crate::models::Event;

/// Per-subscriber buffer size.
pub const SUBSCRIBER_CAPACITY: usize = 10;

type Registry = RwLock<HashMap<String, Vec<(u64, mpsc::Sender<Event>)>>>;

/// Cheaply cloneable handle to a shared subscriber registry.
#[derive(Clone, Default)]
pub struct EventBus {
    registry: Arc<Registry>,
    next_id: Arc<AtomicU64>,
}

impl EventBus {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register interest in one event type.
    pub fn subscribe(&self, kind: &str) -> Subscription {
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        let (tx, rx) = mpsc::channel(SUBSCRIBER_CAPACITY);
        self.registry
            .write()
            .entry(kind.to_string())
            .or_default()
            .push((id, tx));
        tracing::debug!(kind, subscription = id, "subscribed");
        Subscription {
            id,
            kind: kind.to_string(),
            receiver: rx,
            registry: Arc::downgrade(&self.registry),
        }
    }

    /// Deliver `event` to every current subscriber of its type.
    pub fn publish(&self, event: Event) {
        let registry = self.registry.read();
        let Some(subscribers) = registry.get(&event.kind) else {
            return;
        };
        for (id, tx) in subscribers {
            match tx.try_send(event.clone()) {
                Ok(()) => {}
                Err(TrySendError::Full(_)) => {
                    tracing::debug!(kind = %event.kind, subscription = id, "subscriber buffer full, event dropped");
                }
                Err(TrySendError::Closed(_)) => {}
            }
        }
    }

    /// Number of live subscriptions for `kind`.
    pub fn subscriber_count(&self, kind: &str) -> usize {
        self.registry.read().get(kind).map_or(0, Vec::len)
    }
}

/// A registered listener. Unregisters itself on [`close`](Subscription::close) or drop.
pub struct Subscription {
    id: u64,
    kind: String,
    receiver: mpsc::Receiver<Event>,
    registry: Weak<Registry>,
}

impl Subscription {
    pub fn id(&self) -> u64 {
        self.id
    }

    pub fn kind(&self) -> &str {
        &self.kind
    }

    /// Wait for the next event. Returns `None` once the bus is gone.
    pub async fn recv(&mut self) -> Option<Event> {
        self.receiver.recv().await
    }

    /// Take the next buffered event without waiting.
    pub fn try_recv(&mut self) -> Option<Event> {
        self.receiver.try_recv().ok()
    }

    pub fn close(self) {
        // Drop does the unregistering.
    }

    fn unregister(&self) {
        let Some(registry) = self.registry.upgrade() else {
            return;
        };
        let mut registry = registry.write();
        if let Some(subscribers) = registry.get_mut(&self.kind) {
            subscribers.retain(|(id, _)| *id != self.id);
            if subscribers.is_empty() {
                registry.remove(&self.kind);
            }
        }
    }
}

impl Drop for Subscription {
    fn drop(&mut self) {
        self.unregister();
    }
}
