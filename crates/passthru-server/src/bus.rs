//! Process-wide event fan-out.
//!
//! Each subscriber gets its own bounded queue. Publishing never waits: a
//! subscriber whose queue is full misses the event.

use std::collections::HashMap;
use std::sync::Arc;

use parking_lot::RwLock;
use passthru_core::{RelayEvent, SessionId};
use tokio::sync::mpsc;
use tracing::{debug, warn};

/// Per-subscriber queue depth used by the server.
pub const DEFAULT_SUBSCRIBER_CAPACITY: usize = 256;

/// Fan-out of [`RelayEvent`]s to `/event` observers and subscribed relay
/// clients, keyed by session id.
pub struct EventBus {
    subscribers: RwLock<HashMap<SessionId, mpsc::Sender<Arc<RelayEvent>>>>,
    capacity: usize,
}

impl EventBus {
    /// `capacity` bounds each subscriber's queue, not the bus.
    pub fn new(capacity: usize) -> Self {
        Self {
            subscribers: RwLock::new(HashMap::new()),
            capacity: capacity.max(1),
        }
    }

    /// Deliver `event` to every current subscriber. Returns how many
    /// queues accepted it.
    pub fn publish(&self, event: RelayEvent) -> usize {
        let kind = event.kind;
        let event = Arc::new(event);
        let subs = self.subscribers.read();
        if subs.is_empty() {
            return 0;
        }
        let mut delivered = 0;
        for (id, tx) in subs.iter() {
            match tx.try_send(event.clone()) {
                Ok(()) => delivered += 1,
                Err(mpsc::error::TrySendError::Full(_)) => {
                    warn!(subscriber = %id, event = %kind, "subscriber queue full, dropping event");
                }
                Err(mpsc::error::TrySendError::Closed(_)) => {
                    debug!(subscriber = %id, event = %kind, "subscriber gone");
                }
            }
        }
        debug!(event = %kind, recipients = delivered, "event published");
        delivered
    }

    /// Open a queue for `id`. Events published from now on are delivered
    /// to it until [`Self::unsubscribe`] or the receiver is dropped.
    ///
    /// `None` if `id` is already subscribed.
    pub fn subscribe(&self, id: &SessionId) -> Option<mpsc::Receiver<Arc<RelayEvent>>> {
        let mut subs = self.subscribers.write();
        if subs.contains_key(id) {
            return None;
        }
        let (tx, rx) = mpsc::channel(self.capacity);
        let _ = subs.insert(id.clone(), tx);
        debug!(subscriber = %id, "subscribed to events");
        Some(rx)
    }

    /// Drop `id`'s queue. Returns whether `id` was subscribed.
    pub fn unsubscribe(&self, id: &SessionId) -> bool {
        self.subscribers.write().remove(id).is_some()
    }

    /// Whether `id` currently has a queue.
    pub fn is_subscribed(&self, id: &SessionId) -> bool {
        self.subscribers.read().contains_key(id)
    }

    /// Number of live queues, as shown on `/health`.
    pub fn subscriber_count(&self) -> usize {
        self.subscribers.read().len()
    }
}

impl Default for EventBus {
    fn default() -> Self {
        Self::new(DEFAULT_SUBSCRIBER_CAPACITY)
    }
}
