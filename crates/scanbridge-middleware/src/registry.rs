//! [`SubscriberRegistry`] – the live set of scan-feed subscribers.
//!
//! Every subscriber is a bounded [`mpsc`] sender of [`Outbound`] frames plus
//! the liveness bookkeeping used by the health monitor. All mutation goes
//! through one mutex, so registration, removal, broadcast snapshots and probe
//! sweeps never observe a half-applied change.
//!
//! Transports do not touch the subscriber record directly: they hold a
//! [`SubscriberHandle`], report pongs through it, and drop it when the
//! connection ends, which removes the subscriber.

use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use chrono::{DateTime, Utc};
use scanbridge_types::{Envelope, LinkStatus, SubscriberId};
use tokio::sync::mpsc;
use tracing::{debug, info, warn};
use uuid::Uuid;

/// Default per-subscriber send buffer, in frames.
pub const DEFAULT_SEND_BUFFER: usize = 64;

/// A frame queued for one subscriber's transport.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Outbound {
    /// Application text frame.
    Text(String),
    /// Transport-level liveness probe.
    Ping,
}

struct Subscriber {
    id: SubscriberId,
    sender: mpsc::Sender<Outbound>,
    awaiting_pong: bool,
    missed_probes: u32,
    connected_at: DateTime<Utc>,
}

/// Read-only view of one subscriber.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SubscriberInfo {
    pub id: SubscriberId,
    pub awaiting_pong: bool,
    pub connected_at: DateTime<Utc>,
}

/// Send capability captured by [`SubscriberRegistry::snapshot`].
#[derive(Debug, Clone)]
pub struct SubscriberSlot {
    pub id: SubscriberId,
    pub sender: mpsc::Sender<Outbound>,
}

/// Result of one probe sweep.
#[derive(Debug, Default)]
pub struct Sweep {
    /// Subscribers removed for missing too many probes.
    pub evicted: Vec<SubscriberId>,
    /// Subscribers that must now be pinged.
    pub to_probe: Vec<SubscriberSlot>,
}

/// Registry of connected scan-feed subscribers.
pub struct SubscriberRegistry {
    subscribers: Mutex<Vec<Subscriber>>,
    send_buffer: usize,
}

impl Default for SubscriberRegistry {
    fn default() -> Self {
        Self::new(DEFAULT_SEND_BUFFER)
    }
}

impl SubscriberRegistry {
    /// Create an empty registry whose [`connect`](Self::connect) channels
    /// buffer up to `send_buffer` frames per subscriber.
    pub fn new(send_buffer: usize) -> Self {
        Self {
            subscribers: Mutex::new(Vec::new()),
            send_buffer: send_buffer.max(1),
        }
    }

    fn lock(&self) -> MutexGuard<'_, Vec<Subscriber>> {
        self.subscribers.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Register a subscriber reached through `sender` and return its
    /// identity.
    ///
    /// Always succeeds. The `connected` status frame is queued before the
    /// subscriber becomes visible to broadcasts, so it is always the first
    /// frame the subscriber sees.
    pub fn register(&self, sender: mpsc::Sender<Outbound>) -> SubscriberId {
        let id = Uuid::new_v4();
        let mut subscribers = self.lock();

        match Envelope::status(LinkStatus::Connected).to_wire_text() {
            Ok(text) => {
                if let Err(e) = sender.try_send(Outbound::Text(text)) {
                    debug!(subscriber_id = %id, error = %e, "initial status frame not queued");
                }
            }
            Err(e) => warn!(error = %e, "cannot render initial status frame"),
        }

        subscribers.push(Subscriber {
            id,
            sender,
            awaiting_pong: false,
            missed_probes: 0,
            connected_at: Utc::now(),
        });
        info!(subscriber_id = %id, subscribers = subscribers.len(), "subscriber registered");
        id
    }

    /// Create a channel, register its sending half, and return a handle that
    /// removes the subscriber when dropped together with the receiving half
    /// the transport drains.
    pub fn connect(self: &Arc<Self>) -> (SubscriberHandle, mpsc::Receiver<Outbound>) {
        let (tx, rx) = mpsc::channel(self.send_buffer);
        let id = self.register(tx);
        let handle = SubscriberHandle {
            id,
            registry: Arc::clone(self),
        };
        (handle, rx)
    }

    /// Remove a subscriber. Returns `true` only for the call that actually
    /// removed it; later calls are no-ops.
    pub fn remove(&self, id: SubscriberId) -> bool {
        let mut subscribers = self.lock();
        let Some(pos) = subscribers.iter().position(|s| s.id == id) else {
            return false;
        };
        subscribers.remove(pos);
        info!(subscriber_id = %id, subscribers = subscribers.len(), "subscriber removed");
        true
    }

    /// Ordered copy of every subscriber's send capability, in registration
    /// order.
    pub fn snapshot(&self) -> Vec<SubscriberSlot> {
        self.lock()
            .iter()
            .map(|s| SubscriberSlot {
                id: s.id,
                sender: s.sender.clone(),
            })
            .collect()
    }

    /// Record a probe answer. Returns `false` for unknown subscribers.
    pub fn mark_alive(&self, id: SubscriberId) -> bool {
        let mut subscribers = self.lock();
        match subscribers.iter_mut().find(|s| s.id == id) {
            Some(sub) => {
                sub.awaiting_pong = false;
                sub.missed_probes = 0;
                true
            }
            None => false,
        }
    }

    /// One health-check pass, applied atomically.
    ///
    /// A subscriber still awaiting a pong from the previous pass has missed a
    /// probe; once it has missed `miss_threshold` probes it is removed.
    /// Every remaining subscriber is marked as awaiting a pong and returned
    /// in [`Sweep::to_probe`].
    pub fn sweep(&self, miss_threshold: u32) -> Sweep {
        let threshold = miss_threshold.max(1);
        let mut subscribers = self.lock();
        let mut sweep = Sweep::default();

        subscribers.retain_mut(|sub| {
            if sub.awaiting_pong {
                sub.missed_probes += 1;
            }
            if sub.missed_probes >= threshold {
                sweep.evicted.push(sub.id);
                return false;
            }
            sub.awaiting_pong = true;
            sweep.to_probe.push(SubscriberSlot {
                id: sub.id,
                sender: sub.sender.clone(),
            });
            true
        });
        sweep
    }

    pub fn len(&self) -> usize {
        self.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.lock().is_empty()
    }

    pub fn contains(&self, id: SubscriberId) -> bool {
        self.lock().iter().any(|s| s.id == id)
    }

    pub fn info(&self, id: SubscriberId) -> Option<SubscriberInfo> {
        self.lock().iter().find(|s| s.id == id).map(|s| SubscriberInfo {
            id: s.id,
            awaiting_pong: s.awaiting_pong,
            connected_at: s.connected_at,
        })
    }
}

/// A transport's claim on its registry entry. Dropping it removes the
/// subscriber.
pub struct SubscriberHandle {
    id: SubscriberId,
    registry: Arc<SubscriberRegistry>,
}

impl SubscriberHandle {
    pub fn id(&self) -> SubscriberId {
        self.id
    }

    /// Report a pong (or any equivalent proof of life).
    pub fn mark_alive(&self) -> bool {
        self.registry.mark_alive(self.id)
    }

    /// `false` once the subscriber has been evicted or removed.
    pub fn is_registered(&self) -> bool {
        self.registry.contains(self.id)
    }
}

impl Drop for SubscriberHandle {
    fn drop(&mut self) {
        self.registry.remove(self.id);
    }
}

impl std::fmt::Debug for SubscriberHandle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SubscriberHandle").field("id", &self.id).finish()
    }
}
