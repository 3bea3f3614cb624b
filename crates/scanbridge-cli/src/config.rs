//! Process configuration – reads/writes `~/.scanbridge/config.toml`.
//!
//! Loaded once at start-up and converted into the immutable [`LinkConfig`]
//! and [`HealthConfig`]; nothing is reconfigured at runtime.

use std::fs;
use std::net::{IpAddr, SocketAddr};
use std::path::{Path, PathBuf};
use std::time::Duration;

use scanbridge_hal::{BackoffConfig, LinkConfig};
use scanbridge_middleware::HealthConfig;
use scanbridge_types::BridgeError;
use serde::{Deserialize, Serialize};

/// Persisted configuration stored in `~/.scanbridge/config.toml`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Config {
    /// Serial device path, or `tcp://host:port` for serial-over-TCP.
    #[serde(default = "default_device")]
    pub device: String,

    #[serde(default = "default_baud_rate")]
    pub baud_rate: u32,

    /// Record terminator; must be a single byte.
    #[serde(default = "default_delimiter")]
    pub delimiter: String,

    #[serde(default = "default_max_record_len")]
    pub max_record_len: usize,

    #[serde(default = "default_reconnect_base_ms")]
    pub reconnect_base_ms: u64,

    #[serde(default = "default_reconnect_multiplier")]
    pub reconnect_multiplier: f64,

    #[serde(default = "default_reconnect_cap_ms")]
    pub reconnect_cap_ms: u64,

    /// Fraction in `[0, 1]` by which reconnect delays may be shortened.
    #[serde(default)]
    pub reconnect_jitter: f64,

    /// Consecutive failed reopens before the outage is logged as an error.
    /// `0` disables the report.
    #[serde(default = "default_report_after_attempts")]
    pub report_after_attempts: u32,

    #[serde(default = "default_probe_interval_secs")]
    pub probe_interval_secs: u64,

    #[serde(default = "default_probe_miss_threshold")]
    pub probe_miss_threshold: u32,

    /// Frames buffered per subscriber before it is dropped as too slow.
    #[serde(default = "default_send_buffer")]
    pub send_buffer: usize,

    #[serde(default = "default_port")]
    pub port: u16,

    #[serde(default = "default_bind_address")]
    pub bind_address: String,
}

fn default_device() -> String {
    "/dev/ttyUSB0".to_string()
}
fn default_baud_rate() -> u32 {
    9600
}
fn default_delimiter() -> String {
    "\r".to_string()
}
fn default_max_record_len() -> usize {
    1024
}
fn default_reconnect_base_ms() -> u64 {
    1000
}
fn default_reconnect_multiplier() -> f64 {
    2.0
}
fn default_reconnect_cap_ms() -> u64 {
    30_000
}
fn default_report_after_attempts() -> u32 {
    10
}
fn default_probe_interval_secs() -> u64 {
    30
}
fn default_probe_miss_threshold() -> u32 {
    1
}
fn default_send_buffer() -> usize {
    scanbridge_middleware::DEFAULT_SEND_BUFFER
}
fn default_port() -> u16 {
    scanbridge_gateway::DEFAULT_PORT
}
fn default_bind_address() -> String {
    "0.0.0.0".to_string()
}

impl Default for Config {
    fn default() -> Self {
        Self {
            device: default_device(),
            baud_rate: default_baud_rate(),
            delimiter: default_delimiter(),
            max_record_len: default_max_record_len(),
            reconnect_base_ms: default_reconnect_base_ms(),
            reconnect_multiplier: default_reconnect_multiplier(),
            reconnect_cap_ms: default_reconnect_cap_ms(),
            reconnect_jitter: 0.0,
            report_after_attempts: default_report_after_attempts(),
            probe_interval_secs: default_probe_interval_secs(),
            probe_miss_threshold: default_probe_miss_threshold(),
            send_buffer: default_send_buffer(),
            port: default_port(),
            bind_address: default_bind_address(),
        }
    }
}

impl Config {
    /// Reject values the bridge cannot run with.
    pub fn validate(&self) -> Result<(), BridgeError> {
        let invalid = |msg: String| -> Result<(), BridgeError> { Err(BridgeError::Config(msg)) };

        if self.device.trim().is_empty() {
            return invalid("device must not be empty".to_string());
        }
        if self.baud_rate == 0 {
            return invalid("baud_rate must be positive".to_string());
        }
        if self.delimiter.len() != 1 {
            return invalid(format!(
                "delimiter must be exactly one byte, got {:?}",
                self.delimiter
            ));
        }
        if self.max_record_len == 0 {
            return invalid("max_record_len must be positive".to_string());
        }
        if self.reconnect_base_ms == 0 {
            return invalid("reconnect_base_ms must be positive".to_string());
        }
        if self.reconnect_multiplier.is_nan() || self.reconnect_multiplier < 1.0 {
            return invalid(format!(
                "reconnect_multiplier must be at least 1.0, got {}",
                self.reconnect_multiplier
            ));
        }
        if self.reconnect_cap_ms < self.reconnect_base_ms {
            return invalid(format!(
                "reconnect_cap_ms ({}) is below reconnect_base_ms ({})",
                self.reconnect_cap_ms, self.reconnect_base_ms
            ));
        }
        if !(0.0..=1.0).contains(&self.reconnect_jitter) {
            return invalid(format!(
                "reconnect_jitter must be within [0, 1], got {}",
                self.reconnect_jitter
            ));
        }
        if self.probe_interval_secs == 0 {
            return invalid("probe_interval_secs must be positive".to_string());
        }
        if self.probe_miss_threshold == 0 {
            return invalid("probe_miss_threshold must be positive".to_string());
        }
        if self.send_buffer == 0 {
            return invalid("send_buffer must be positive".to_string());
        }
        self.bind_ip()?;
        Ok(())
    }

    fn bind_ip(&self) -> Result<IpAddr, BridgeError> {
        self.bind_address.parse().map_err(|e| {
            BridgeError::Config(format!("invalid bind_address {:?}: {e}", self.bind_address))
        })
    }

    pub fn link_config(&self) -> Result<LinkConfig, BridgeError> {
        self.validate()?;
        Ok(LinkConfig {
            device: self.device.clone(),
            baud_rate: self.baud_rate,
            delimiter: self.delimiter.as_bytes()[0],
            max_record_len: self.max_record_len,
            backoff: BackoffConfig {
                base: Duration::from_millis(self.reconnect_base_ms),
                multiplier: self.reconnect_multiplier,
                cap: Duration::from_millis(self.reconnect_cap_ms),
                jitter: self.reconnect_jitter,
                report_after_attempts: (self.report_after_attempts > 0)
                    .then_some(self.report_after_attempts),
            },
        })
    }

    pub fn health_config(&self) -> HealthConfig {
        HealthConfig {
            interval: Duration::from_secs(self.probe_interval_secs),
            miss_threshold: self.probe_miss_threshold,
        }
    }

    pub fn listen_addr(&self) -> Result<SocketAddr, BridgeError> {
        Ok(SocketAddr::new(self.bind_ip()?, self.port))
    }
}

/// Return `$SCANBRIDGE_CONFIG`, or `~/.scanbridge/config.toml`.
pub fn config_path() -> PathBuf {
    if let Ok(path) = std::env::var("SCANBRIDGE_CONFIG") {
        return PathBuf::from(path);
    }
    config_path_for_home(
        &std::env::var("HOME")
            .or_else(|_| std::env::var("USERPROFILE"))
            .unwrap_or_else(|_| ".".to_string()),
    )
}

/// Build the config path relative to the given home directory.
pub(crate) fn config_path_for_home(home: &str) -> PathBuf {
    PathBuf::from(home).join(".scanbridge").join("config.toml")
}

/// Load the config from [`config_path`], falling back to defaults when the
/// file is absent. Environment overrides are applied in both cases.
pub fn load() -> Result<Config, BridgeError> {
    let mut cfg = load_from(&config_path())?.unwrap_or_default();
    apply_env_overrides(&mut cfg);
    Ok(cfg)
}

/// Load the config from a specific path. Returns `None` if the file does
/// not exist.
pub(crate) fn load_from(path: &Path) -> Result<Option<Config>, BridgeError> {
    if !path.exists() {
        return Ok(None);
    }
    let raw = fs::read_to_string(path).map_err(|e| {
        BridgeError::Config(format!("failed to read config at {}: {e}", path.display()))
    })?;
    let cfg = toml::from_str(&raw)
        .map_err(|e| BridgeError::Config(format!("failed to parse config: {e}")))?;
    Ok(Some(cfg))
}

/// Apply `SCANBRIDGE_*` environment variable overrides to `cfg`.
///
/// | Variable | Config field |
/// |---|---|
/// | `SCANBRIDGE_DEVICE` | `device` |
/// | `SCANBRIDGE_BAUD_RATE` | `baud_rate` |
/// | `SCANBRIDGE_PORT` | `port` |
/// | `SCANBRIDGE_PROBE_INTERVAL_SECS` | `probe_interval_secs` |
///
/// Values that do not parse are ignored.
pub fn apply_env_overrides(cfg: &mut Config) {
    apply_overrides(cfg, |key| std::env::var(key).ok());
}

fn apply_overrides(cfg: &mut Config, lookup: impl Fn(&str) -> Option<String>) {
    if let Some(v) = lookup("SCANBRIDGE_DEVICE") {
        cfg.device = v;
    }
    if let Some(v) = lookup("SCANBRIDGE_BAUD_RATE")
        && let Ok(baud) = v.parse::<u32>()
    {
        cfg.baud_rate = baud;
    }
    if let Some(v) = lookup("SCANBRIDGE_PORT")
        && let Ok(port) = v.parse::<u16>()
    {
        cfg.port = port;
    }
    if let Some(v) = lookup("SCANBRIDGE_PROBE_INTERVAL_SECS")
        && let Ok(secs) = v.parse::<u64>()
    {
        cfg.probe_interval_secs = secs;
    }
}

/// Save the config to [`config_path`].
pub fn save(cfg: &Config) -> Result<PathBuf, BridgeError> {
    let path = config_path();
    save_to(cfg, &path)?;
    Ok(path)
}

/// Save the config to a specific path, creating parent directories.
pub(crate) fn save_to(cfg: &Config, path: &Path) -> Result<(), BridgeError> {
    if let Some(parent) = path.parent() {
        fs::create_dir_all(parent).map_err(|e| {
            BridgeError::Config(format!("failed to create config directory: {e}"))
        })?;
    }
    let raw = toml::to_string_pretty(cfg)
        .map_err(|e| BridgeError::Config(format!("failed to serialize config: {e}")))?;
    fs::write(path, raw).map_err(|e| {
        BridgeError::Config(format!("failed to write config at {}: {e}", path.display()))
    })
}
