//! [`HealthMonitor`] – evicts subscribers whose transport died silently.
//!
//! One recurring timer task drives the whole registry. Each tick runs
//! [`SubscriberRegistry::sweep`]: subscribers that left the previous probe
//! unanswered are evicted, every survivor is marked as awaiting a pong and
//! gets a [`Outbound::Ping`]. Pongs are reported by the transport through
//! [`SubscriberHandle::mark_alive`](crate::registry::SubscriberHandle::mark_alive),
//! outside the tick.
//!
//! With the default miss threshold of one, a dead subscriber is gone after at
//! most two probe intervals.

use std::sync::Arc;
use std::time::Duration;

use tokio::task::JoinHandle;
use tokio::time::{MissedTickBehavior, interval_at};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::registry::{Outbound, SubscriberRegistry};

/// Probe cadence and eviction policy.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct HealthConfig {
    pub interval: Duration,
    /// Unanswered probes tolerated before eviction (minimum 1).
    pub miss_threshold: u32,
}

impl Default for HealthConfig {
    fn default() -> Self {
        Self {
            interval: Duration::from_secs(30),
            miss_threshold: 1,
        }
    }
}

/// Outcome of a single [`HealthMonitor::tick`].
#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct ProbeReport {
    /// Subscribers removed during this tick, either for missing probes or
    /// because the ping could not be queued.
    pub evicted: usize,
    /// Subscribers successfully pinged.
    pub probed: usize,
}

pub struct HealthMonitor {
    registry: Arc<SubscriberRegistry>,
    config: HealthConfig,
    cancel: CancellationToken,
}

impl HealthMonitor {
    pub fn new(registry: Arc<SubscriberRegistry>, config: HealthConfig) -> Self {
        Self {
            registry,
            config,
            cancel: CancellationToken::new(),
        }
    }

    /// Stop the loop when `token` is cancelled.
    pub fn with_cancellation(mut self, token: CancellationToken) -> Self {
        self.cancel = token;
        self
    }

    pub fn config(&self) -> HealthConfig {
        self.config
    }

    /// Run one probe pass.
    pub fn tick(&self) -> ProbeReport {
        let sweep = self.registry.sweep(self.config.miss_threshold);
        let mut report = ProbeReport {
            evicted: sweep.evicted.len(),
            probed: 0,
        };
        for id in &sweep.evicted {
            warn!(subscriber_id = %id, "subscriber missed liveness probe; evicted");
        }

        for slot in sweep.to_probe {
            match slot.sender.try_send(Outbound::Ping) {
                Ok(()) => report.probed += 1,
                Err(e) => {
                    debug!(subscriber_id = %slot.id, error = %e, "ping not queued; dropping subscriber");
                    if self.registry.remove(slot.id) {
                        report.evicted += 1;
                    }
                }
            }
        }
        debug!(probed = report.probed, evicted = report.evicted, "health tick");
        report
    }

    /// Tick every interval until cancelled. The first probe goes out one full
    /// interval after start.
    pub async fn run(self) {
        let period = self.config.interval;
        let mut timer = interval_at(tokio::time::Instant::now() + period, period);
        timer.set_missed_tick_behavior(MissedTickBehavior::Delay);
        info!(interval_ms = period.as_millis() as u64, "health monitor started");

        loop {
            tokio::select! {
                () = self.cancel.cancelled() => {
                    info!("health monitor shutting down");
                    return;
                }
                _ = timer.tick() => {
                    self.tick();
                }
            }
        }
    }

    pub fn spawn(self) -> JoinHandle<()> {
        tokio::spawn(self.run())
    }
}
