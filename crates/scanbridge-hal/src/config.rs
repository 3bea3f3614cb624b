//! Immutable link parameters, built once at process start.

use std::time::Duration;

/// Reconnect backoff parameters.
#[derive(Debug, Clone, PartialEq)]
pub struct BackoffConfig {
    /// Delay before the first reopen attempt.
    pub base: Duration,
    /// Growth factor applied per consecutive failure.
    pub multiplier: f64,
    /// Upper bound on any single delay.
    pub cap: Duration,
    /// Fraction in `[0, 1]` by which a delay may be randomly shortened.
    pub jitter: f64,
    /// Consecutive failures after which the outage is reported at error
    /// level. Retrying continues regardless; `None` never reports.
    pub report_after_attempts: Option<u32>,
}

impl Default for BackoffConfig {
    fn default() -> Self {
        Self {
            base: Duration::from_secs(1),
            multiplier: 2.0,
            cap: Duration::from_secs(30),
            jitter: 0.0,
            report_after_attempts: Some(10),
        }
    }
}

/// Everything needed to open and frame the device link.
#[derive(Debug, Clone, PartialEq)]
pub struct LinkConfig {
    /// Serial device path (`/dev/ttyUSB0`, `COM3`) or `tcp://host:port` for a
    /// serial-over-TCP server.
    pub device: String,
    pub baud_rate: u32,
    /// Single byte terminating each record.
    pub delimiter: u8,
    /// Records longer than this are discarded as malformed.
    pub max_record_len: usize,
    pub backoff: BackoffConfig,
}

impl Default for LinkConfig {
    fn default() -> Self {
        Self {
            device: "/dev/ttyUSB0".to_string(),
            baud_rate: 9600,
            delimiter: b'\r',
            max_record_len: 1024,
            backoff: BackoffConfig::default(),
        }
    }
}
