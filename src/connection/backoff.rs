//! Exponential Backoff
//!
//! Reconnection delays with exponential growth, a cap, and optional jitter.

use crate::config::RetryConfig;
use std::time::Duration;

/// Stateful backoff schedule for one retry sequence
#[derive(Clone, Debug)]
pub struct Backoff {
    config: RetryConfig,
    attempt: u32,
}

impl Backoff {
    pub fn new(config: RetryConfig) -> Self {
        Self { config, attempt: 0 }
    }

    /// Calculate the next retry delay, or `None` once `max_attempts` is exhausted
    pub fn next_delay(&mut self) -> Option<Duration> {
        self.attempt = self.attempt.saturating_add(1);

        if self.config.max_attempts > 0 && self.attempt > self.config.max_attempts {
            return None;
        }

        let capped = capped_delay(
            self.config.initial_delay(),
            self.config.multiplier,
            self.attempt - 1,
            self.config.max_delay(),
        );

        // Apply jitter
        let capped_ms = capped.as_millis() as f64;
        let jitter_range = capped_ms * self.config.jitter.clamp(0.0, 1.0);
        let jitter = (rand_jitter() * 2.0 - 1.0) * jitter_range;
        Some(Duration::from_millis((capped_ms + jitter).max(0.0) as u64))
    }

    /// Reset retry counter
    pub fn reset(&mut self) {
        self.attempt = 0;
    }

    /// Get current attempt count
    pub fn attempt_count(&self) -> u32 {
        self.attempt
    }

    /// Human readable limit, for log lines
    pub fn limit_label(&self) -> String {
        if self.config.max_attempts == 0 {
            "∞".to_string()
        } else {
            self.config.max_attempts.to_string()
        }
    }
}

/// `min(base * multiplier^exponent, cap)` without jitter
pub fn capped_delay(base: Duration, multiplier: f64, exponent: u32, cap: Duration) -> Duration {
    let exponent = exponent.min(i32::MAX as u32) as i32;
    let raw = base.as_millis() as f64 * multiplier.powi(exponent);
    let capped = raw.min(cap.as_millis() as f64);
    if !capped.is_finite() || capped < 0.0 {
        return cap;
    }
    Duration::from_millis(capped as u64)
}

/// Simple pseudo-random jitter (0.0 - 1.0)
fn rand_jitter() -> f64 {
    use std::time::SystemTime;
    let nanos = SystemTime::now()
        .duration_since(SystemTime::UNIX_EPOCH)
        .map(|d| d.subsec_nanos())
        .unwrap_or(0);
    (nanos % 1000) as f64 / 1000.0
}
