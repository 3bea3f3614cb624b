//! Capped exponential backoff for link reopen attempts.
//!
//! `delay(n) = min(base * multiplier^n, cap)`, optionally shortened by up to
//! `jitter * delay` so several supervisors restarting together do not retry in
//! lock-step. Jitter only ever shortens a delay, so `cap` is a hard ceiling.

use std::time::Duration;

use crate::config::BackoffConfig;

/// Tracks consecutive failures and yields the next reopen delay.
#[derive(Debug, Clone)]
pub struct Backoff {
    config: BackoffConfig,
    attempt: u32,
}

impl Backoff {
    pub fn new(config: BackoffConfig) -> Self {
        Self { config, attempt: 0 }
    }

    /// Number of consecutive failures recorded since the last reset.
    pub fn attempt(&self) -> u32 {
        self.attempt
    }

    pub fn config(&self) -> &BackoffConfig {
        &self.config
    }

    /// Delay for the current attempt, then advance the attempt counter.
    pub fn next_delay(&mut self) -> Duration {
        let delay = self.delay_for_attempt(self.attempt);
        self.attempt = self.attempt.saturating_add(1);
        delay
    }

    /// Return to the base delay after a successful open.
    pub fn reset(&mut self) {
        self.attempt = 0;
    }

    /// Delay for a given 0-indexed attempt.
    pub fn delay_for_attempt(&self, attempt: u32) -> Duration {
        let base_ns = self.config.base.as_nanos() as f64;
        let cap_ns = self.config.cap.as_nanos() as f64;
        // Exponents past 64 are already far beyond any sane cap.
        let exponent = attempt.min(64) as i32;
        let capped_ns = (base_ns * self.config.multiplier.powi(exponent)).min(cap_ns);

        let jittered_ns = if self.config.jitter > 0.0 {
            let fraction: f64 = rand::random();
            capped_ns * (1.0 - fraction * self.config.jitter.min(1.0))
        } else {
            capped_ns
        };

        Duration::from_nanos(jittered_ns.max(0.0).round() as u64)
    }

    /// True exactly once per outage: when the failure count first reaches the
    /// configured report threshold.
    pub fn should_report(&self) -> bool {
        self.config
            .report_after_attempts
            .is_some_and(|limit| limit > 0 && self.attempt == limit)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn config(base_ms: u64, multiplier: f64, cap_ms: u64) -> BackoffConfig {
        BackoffConfig {
            base: Duration::from_millis(base_ms),
            multiplier,
            cap: Duration::from_millis(cap_ms),
            jitter: 0.0,
            report_after_attempts: Some(3),
        }
    }

    #[test]
    fn sequence_grows_geometrically_then_holds_at_cap() {
        let mut backoff = Backoff::new(config(100, 2.0, 1000));
        let delays: Vec<u64> = (0..7).map(|_| backoff.next_delay().as_millis() as u64).collect();
        assert_eq!(delays, vec![100, 200, 400, 800, 1000, 1000, 1000]);
    }

    #[test]
    fn reset_restarts_from_base() {
        let mut backoff = Backoff::new(config(100, 3.0, 10_000));
        backoff.next_delay();
        backoff.next_delay();
        assert_eq!(backoff.attempt(), 2);
        backoff.reset();
        assert_eq!(backoff.attempt(), 0);
        assert_eq!(backoff.next_delay(), Duration::from_millis(100));
    }

    #[test]
    fn jitter_never_exceeds_cap() {
        let mut cfg = config(100, 2.0, 500);
        cfg.jitter = 0.5;
        let mut backoff = Backoff::new(cfg);
        for _ in 0..50 {
            let delay = backoff.next_delay();
            assert!(delay <= Duration::from_millis(500), "delay {delay:?} exceeds cap");
        }
    }

    #[test]
    fn jitter_only_shortens_by_configured_fraction() {
        let mut cfg = config(1000, 2.0, 1000);
        cfg.jitter = 0.25;
        let backoff = Backoff::new(cfg);
        for _ in 0..200 {
            let delay = backoff.delay_for_attempt(3);
            assert!(delay >= Duration::from_millis(750), "delay {delay:?} below floor");
            assert!(delay <= Duration::from_millis(1000), "delay {delay:?} above cap");
        }
    }

    #[test]
    fn huge_attempt_counts_stay_at_cap() {
        let backoff = Backoff::new(config(100, 2.0, 1000));
        assert_eq!(backoff.delay_for_attempt(u32::MAX), Duration::from_millis(1000));
    }

    #[test]
    fn report_fires_once_at_threshold() {
        let mut backoff = Backoff::new(config(10, 2.0, 100));
        let mut reports = 0;
        for _ in 0..10 {
            backoff.next_delay();
            if backoff.should_report() {
                reports += 1;
            }
        }
        assert_eq!(reports, 1);
    }
}
