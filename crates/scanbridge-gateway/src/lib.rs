//! `scanbridge-gateway` – network surface of the scan bridge.
//!
//! Boots one TCP listener (default port `9000`) that:
//!
//! 1. **Streams** scan records to WebSocket clients. Each client is a
//!    subscriber in the shared [`SubscriberRegistry`]; it receives the
//!    `{"type":"status","status":"connected"}` frame on connect, then every
//!    envelope the [`BroadcastHub`] publishes, and answers liveness pings.
//!
//! 2. **Streams** domain events as server-sent events on
//!    `GET /api/drums/sse` and `GET /api/orders/sse`, each backed by an
//!    [`EventBus`] listener that lives exactly as long as the request. The
//!    scanner link does not publish domain events; whatever embeds the
//!    gateway publishes them on the bus handed to [`GatewayServer::new`]
//!    (also reachable through [`GatewayServer::bus`]).
//!
//! 3. **Reports** link state and subscriber count on `GET /healthz`.
//!
//! # Usage
//!
//! ```rust,no_run
//! use std::sync::Arc;
//! use scanbridge_gateway::GatewayServer;
//! use scanbridge_middleware::{EventBus, SubscriberRegistry};
//! use scanbridge_types::LinkState;
//! use tokio::sync::watch;
//!
//! #[tokio::main]
//! async fn main() -> Result<(), scanbridge_types::BridgeError> {
//!     let (_state_tx, state_rx) = watch::channel(LinkState::Closed);
//!     GatewayServer::new(Arc::new(SubscriberRegistry::default()), EventBus::new(), state_rx)
//!         .run()
//!         .await
//! }
//! ```
//!
//! [`SubscriberRegistry`]: scanbridge_middleware::SubscriberRegistry
//! [`BroadcastHub`]: scanbridge_middleware::BroadcastHub
//! [`EventBus`]: scanbridge_middleware::EventBus

pub mod http;
pub mod server;

pub use server::{DEFAULT_PORT, GatewayServer};
