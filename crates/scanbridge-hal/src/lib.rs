//! `scanbridge-hal` – the device side of the scan bridge.
//!
//! Owns the single upstream link to the barcode scanner and turns its byte
//! stream into records without interpreting them.
//!
//! # Modules
//!
//! - [`config`] – immutable [`LinkConfig`] / [`BackoffConfig`].
//! - [`codec`] – [`RecordCodec`], delimiter framing with malformed-record
//!   detection.
//! - [`connection`] – the [`LinkConnection`] seam and the serial/TCP
//!   [`FramedConnection`].
//! - [`backoff`] – capped exponential [`Backoff`].
//! - [`timer`] – the [`Sleeper`] abstraction used for reconnect delays.
//! - [`supervisor`] – [`LinkSupervisor`], the reconnect state machine.

pub mod backoff;
pub mod codec;
pub mod config;
pub mod connection;
pub mod supervisor;
pub mod timer;

pub use backoff::Backoff;
pub use codec::{Frame, MalformedRecord, RecordCodec};
pub use config::{BackoffConfig, LinkConfig};
pub use connection::{FramedConnection, LinkConnection, LinkTarget};
pub use supervisor::LinkSupervisor;
pub use timer::{Sleeper, TokioSleeper};
