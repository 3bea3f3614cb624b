//! [`LinkSupervisor`] – keeps exactly one logical link to the scanner alive.
//!
//! The supervisor is the only code that opens or closes the device. It runs
//! as a single task and moves through an explicit state machine:
//!
//! ```text
//! Closed ──open──▶ Opening ──ok──▶ Open ──read error / hang-up──▶ ReconnectPending
//!                     │                                               │
//!                     └──────────────fail──────────────▶──────────────┤
//!                     ▲                                               │
//!                     └────────────────timer elapsed──────────────────┘
//! any ──shutdown──▶ Draining ──▶ Closed (terminal)
//! ```
//!
//! Every record read while `Open` is handed to the [`LinkSink`] untouched.
//! Connectivity changes are announced once per transition as
//! [`LinkStatus::Connected`] / [`LinkStatus::Error`]. Reopen attempts never
//! give up: after the configured number of failures the outage is logged at
//! error level and retries continue at the capped interval.
//!
//! Each call to [`LinkSupervisor::step`] performs one transition, so the
//! state machine can be exercised without real timers by injecting a
//! [`Sleeper`].

use std::sync::Arc;
use std::time::Duration;

use scanbridge_types::{LinkSink, LinkState, LinkStatus};
use tokio::sync::watch;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::backoff::Backoff;
use crate::codec::Frame;
use crate::config::BackoffConfig;
use crate::connection::LinkConnection;
use crate::timer::{Sleeper, TokioSleeper};

/// Reconnecting owner of a [`LinkConnection`].
pub struct LinkSupervisor<C: LinkConnection> {
    connection: C,
    backoff: Backoff,
    sink: Arc<dyn LinkSink>,
    sleeper: Arc<dyn Sleeper>,
    state: LinkState,
    state_tx: watch::Sender<LinkState>,
    announced: Option<LinkStatus>,
    pending_delay: Duration,
    cancel: CancellationToken,
    finished: bool,
}

impl<C: LinkConnection> LinkSupervisor<C> {
    pub fn new(connection: C, backoff: BackoffConfig, sink: Arc<dyn LinkSink>) -> Self {
        let (state_tx, _) = watch::channel(LinkState::Closed);
        Self {
            connection,
            backoff: Backoff::new(backoff),
            sink,
            sleeper: Arc::new(TokioSleeper),
            state: LinkState::Closed,
            state_tx,
            announced: None,
            pending_delay: Duration::ZERO,
            cancel: CancellationToken::new(),
            finished: false,
        }
    }

    /// Replace the timer used for reconnect delays (builder-style).
    pub fn with_sleeper(mut self, sleeper: Arc<dyn Sleeper>) -> Self {
        self.sleeper = sleeper;
        self
    }

    /// Share an externally owned shutdown token (builder-style).
    pub fn with_cancellation(mut self, cancel: CancellationToken) -> Self {
        self.cancel = cancel;
        self
    }

    pub fn state(&self) -> LinkState {
        self.state
    }

    /// Observe state transitions. This is the only way other components
    /// learn the link state.
    pub fn watch_state(&self) -> watch::Receiver<LinkState> {
        self.state_tx.subscribe()
    }

    /// Token that, once cancelled, drives the supervisor to `Closed`.
    pub fn shutdown_token(&self) -> CancellationToken {
        self.cancel.clone()
    }

    pub fn shutdown(&self) {
        self.cancel.cancel();
    }

    /// `true` once the supervisor has drained and will do nothing further.
    pub fn is_finished(&self) -> bool {
        self.finished
    }

    /// Delay that will elapse before the next reopen attempt.
    pub fn pending_delay(&self) -> Duration {
        self.pending_delay
    }

    /// Begin opening the device. No-op while already `Open` or `Opening`, or
    /// after shutdown.
    pub async fn open(&mut self) {
        if self.finished || matches!(self.state, LinkState::Open | LinkState::Opening) {
            return;
        }
        self.attempt_open().await;
    }

    /// Drive the supervisor until shutdown.
    pub async fn run(mut self) {
        info!(device = %self.connection.device(), "link supervisor started");
        while !self.finished {
            self.step().await;
        }
        info!(device = %self.connection.device(), "link supervisor stopped");
    }

    /// Perform one state transition and return the resulting state.
    pub async fn step(&mut self) -> LinkState {
        if self.finished {
            return self.state;
        }
        if self.cancel.is_cancelled() && self.state != LinkState::Draining {
            self.transition(LinkState::Draining);
        }

        match self.state {
            LinkState::Closed => self.open().await,
            LinkState::Opening => self.attempt_open().await,
            LinkState::Open => self.read_one().await,
            LinkState::ReconnectPending => self.wait_then_reopen().await,
            LinkState::Draining => self.drain().await,
        }
        self.state
    }

    async fn attempt_open(&mut self) {
        self.transition(LinkState::Opening);

        let result = tokio::select! {
            _ = self.cancel.cancelled() => None,
            result = self.connection.open() => Some(result),
        };

        match result {
            None => self.transition(LinkState::Draining),
            Some(Ok(())) => {
                self.transition(LinkState::Open);
                self.backoff.reset();
                info!(device = %self.connection.device(), "device link open");
                self.announce(LinkStatus::Connected);
            }
            Some(Err(e)) => {
                warn!(
                    device = %self.connection.device(),
                    attempt = self.backoff.attempt() + 1,
                    error = %e,
                    "failed to open device link"
                );
                self.connection.close().await;
                self.announce(LinkStatus::Error);
                self.schedule_reconnect();
            }
        }
    }

    async fn read_one(&mut self) {
        let next = tokio::select! {
            _ = self.cancel.cancelled() => None,
            frame = self.connection.next_frame() => Some(frame),
        };

        match next {
            None => self.transition(LinkState::Draining),
            Some(Some(Ok(Frame::Record(record)))) => {
                debug!(device = %self.connection.device(), record = %record, "record received");
                self.sink.on_record(record);
            }
            Some(Some(Ok(Frame::Malformed(reason)))) => {
                warn!(device = %self.connection.device(), ?reason, "dropping malformed record");
            }
            Some(Some(Err(e))) => {
                warn!(device = %self.connection.device(), error = %e, "device read failed");
                self.link_lost().await;
            }
            Some(None) => {
                info!(device = %self.connection.device(), "device closed the link");
                self.link_lost().await;
            }
        }
    }

    async fn wait_then_reopen(&mut self) {
        let delay = self.pending_delay;
        let cancelled = tokio::select! {
            _ = self.cancel.cancelled() => true,
            _ = self.sleeper.sleep(delay) => false,
        };
        if cancelled {
            self.transition(LinkState::Draining);
        } else {
            self.attempt_open().await;
        }
    }

    async fn drain(&mut self) {
        self.connection.close().await;
        self.transition(LinkState::Closed);
        self.finished = true;
    }

    async fn link_lost(&mut self) {
        self.connection.close().await;
        self.announce(LinkStatus::Error);
        self.schedule_reconnect();
    }

    fn schedule_reconnect(&mut self) {
        self.pending_delay = self.backoff.next_delay();
        self.transition(LinkState::ReconnectPending);

        if self.backoff.should_report() {
            error!(
                device = %self.connection.device(),
                attempts = self.backoff.attempt(),
                "device still unreachable; retrying at capped interval"
            );
        }
        debug!(
            device = %self.connection.device(),
            delay_ms = self.pending_delay.as_millis() as u64,
            "reopen scheduled"
        );
    }

    fn announce(&mut self, status: LinkStatus) {
        if self.announced == Some(status) {
            return;
        }
        self.announced = Some(status);
        self.sink.on_status(status);
    }

    fn transition(&mut self, next: LinkState) {
        if self.state == next {
            return;
        }
        debug!(from = %self.state, to = %next, "link state transition");
        self.state = next;
        self.state_tx.send_replace(next);
    }
}
