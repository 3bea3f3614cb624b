//! `scanbridge-middleware` – distribution core of the scan bridge.
//!
//! Moves scan records and domain events from their producers to connected
//! clients without caring what the payloads mean.
//!
//! # Modules
//!
//! - [`registry`] – [`SubscriberRegistry`], the single synchronised set of
//!   live scan-feed subscribers.
//! - [`hub`] – [`BroadcastHub`], best-effort fan-out of envelopes.
//! - [`health`] – [`HealthMonitor`], ping/pong eviction of dead subscribers.
//! - [`bus`] – [`EventBus`], topic-keyed listener dispatch for domain events.
//! - [`sse`] – [`SseFrame`] encoding and the per-connection [`EventStream`].

pub mod bus;
pub mod health;
pub mod hub;
pub mod registry;
pub mod sse;

pub use bus::{EventBus, Subscription, Topic};
pub use health::{HealthConfig, HealthMonitor, ProbeReport};
pub use hub::BroadcastHub;
pub use registry::{
    DEFAULT_SEND_BUFFER, Outbound, SubscriberHandle, SubscriberInfo, SubscriberRegistry,
    SubscriberSlot, Sweep,
};
pub use sse::{DEFAULT_STREAM_BUFFER, EventStream, SseFrame};
