//! Topic-keyed, in-process publish/subscribe for domain events.
//!
//! Producers (status-change call sites) publish a JSON payload to a topic;
//! every listener registered on that topic is invoked synchronously, in
//! registration order. A listener that returns an error or panics is logged
//! and skipped, the rest still run and the publisher never sees the failure.
//!
//! # Topics
//!
//! | Topic | Payload |
//! |---|---|
//! | [`Topic::DrumStatus`] | `{drumId, newStatus}` |
//! | [`Topic::OrderUpdate`] | `{orderId, drumId, newQuantityReceived}` |
//!
//! Arbitrary string topics are accepted as well; [`Topic`] only names the
//! ones the bridge itself routes.
//!
//! # Lifetime
//!
//! [`EventBus::subscribe`] returns a [`Subscription`]. Dropping it (or
//! calling [`Subscription::unsubscribe`]) removes exactly that listener, so
//! tying the subscription to a connection's lifetime keeps the bus from
//! holding on to dead consumers.

use std::collections::HashMap;
use std::panic::{AssertUnwindSafe, catch_unwind};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError, Weak};

use scanbridge_types::{BridgeError, DomainEvent};
use serde_json::Value;
use tracing::{debug, warn};

/// Topics routed by the bridge.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Topic {
    /// Drum status transitions.
    DrumStatus,
    /// Received-quantity changes on an order.
    OrderUpdate,
}

impl Topic {
    pub fn as_str(&self) -> &'static str {
        match self {
            Topic::DrumStatus => DomainEvent::DRUM_STATUS_TOPIC,
            Topic::OrderUpdate => DomainEvent::ORDER_UPDATE_TOPIC,
        }
    }
}

impl AsRef<str> for Topic {
    fn as_ref(&self) -> &str {
        self.as_str()
    }
}

type Listener = Arc<dyn Fn(&Value) -> Result<(), BridgeError> + Send + Sync>;

struct ListenerEntry {
    id: u64,
    listener: Listener,
}

#[derive(Default)]
struct BusInner {
    topics: Mutex<HashMap<String, Vec<ListenerEntry>>>,
    next_id: AtomicU64,
}

impl BusInner {
    fn lock(&self) -> MutexGuard<'_, HashMap<String, Vec<ListenerEntry>>> {
        self.topics.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn remove(&self, topic: &str, id: u64) -> bool {
        let mut topics = self.lock();
        let Some(listeners) = topics.get_mut(topic) else {
            return false;
        };
        let before = listeners.len();
        listeners.retain(|entry| entry.id != id);
        let removed = listeners.len() != before;
        if listeners.is_empty() {
            topics.remove(topic);
        }
        removed
    }
}

/// Shared event bus. Clone it cheaply – all clones share the same listener
/// table.
#[derive(Clone, Default)]
pub struct EventBus {
    inner: Arc<BusInner>,
}

impl EventBus {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register `listener` on `topic`.
    pub fn subscribe<F>(&self, topic: impl AsRef<str>, listener: F) -> Subscription
    where
        F: Fn(&Value) -> Result<(), BridgeError> + Send + Sync + 'static,
    {
        let topic = topic.as_ref().to_string();
        let id = self.inner.next_id.fetch_add(1, Ordering::Relaxed);
        self.inner
            .lock()
            .entry(topic.clone())
            .or_default()
            .push(ListenerEntry {
                id,
                listener: Arc::new(listener),
            });
        debug!(topic = %topic, listener_id = id, "listener subscribed");

        Subscription {
            bus: Arc::downgrade(&self.inner),
            topic,
            id,
            active: AtomicBool::new(true),
        }
    }

    /// Invoke every listener on `topic` with `payload`.
    ///
    /// Returns the number of listeners that handled the payload without
    /// error. Listeners run outside the bus lock, so a listener may itself
    /// subscribe or unsubscribe.
    pub fn publish(&self, topic: impl AsRef<str>, payload: &Value) -> usize {
        let topic = topic.as_ref();
        let listeners: Vec<(u64, Listener)> = match self.inner.lock().get(topic) {
            Some(entries) => entries
                .iter()
                .map(|e| (e.id, Arc::clone(&e.listener)))
                .collect(),
            None => Vec::new(),
        };

        let mut handled = 0;
        for (id, listener) in listeners {
            match catch_unwind(AssertUnwindSafe(|| listener(payload))) {
                Ok(Ok(())) => handled += 1,
                Ok(Err(e)) => {
                    warn!(topic = %topic, listener_id = id, error = %e, "listener failed");
                }
                Err(_) => {
                    warn!(topic = %topic, listener_id = id, "listener panicked");
                }
            }
        }
        debug!(topic = %topic, handled, "event published");
        handled
    }

    /// Publish a typed domain event on the topic it belongs to.
    pub fn publish_event(&self, event: &DomainEvent) -> Result<usize, BridgeError> {
        let payload = event.to_json()?;
        Ok(self.publish(event.topic(), &payload))
    }

    pub fn listener_count(&self, topic: impl AsRef<str>) -> usize {
        self.inner
            .lock()
            .get(topic.as_ref())
            .map_or(0, Vec::len)
    }
}

/// Capability to remove one listener. Dropping it unsubscribes.
#[must_use = "dropping a Subscription unsubscribes the listener immediately"]
pub struct Subscription {
    bus: Weak<BusInner>,
    topic: String,
    id: u64,
    active: AtomicBool,
}

impl Subscription {
    pub fn topic(&self) -> &str {
        &self.topic
    }

    /// Remove the listener. Only the first call has an effect; it returns
    /// `true` if the listener was still registered.
    pub fn unsubscribe(&self) -> bool {
        if !self.active.swap(false, Ordering::AcqRel) {
            return false;
        }
        let Some(bus) = self.bus.upgrade() else {
            return false;
        };
        let removed = bus.remove(&self.topic, self.id);
        if removed {
            debug!(topic = %self.topic, listener_id = self.id, "listener unsubscribed");
        }
        removed
    }

    pub fn is_active(&self) -> bool {
        self.active.load(Ordering::Acquire)
    }
}

impl Drop for Subscription {
    fn drop(&mut self) {
        self.unsubscribe();
    }
}

impl std::fmt::Debug for Subscription {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Subscription")
            .field("topic", &self.topic)
            .field("id", &self.id)
            .field("active", &self.is_active())
            .finish()
    }
}
