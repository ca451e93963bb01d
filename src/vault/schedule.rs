//! Validation backoff schedule.
//!
//! After the n-th consecutive failure the next probe is allowed
//! `min(base * multiplier^(n-1), cap)` later; after a success the status is
//! trusted for the cache TTL.

use crate::config::VaultConfig;
use crate::connection::capped_delay;
use chrono::{DateTime, Utc};
use std::time::Duration;

#[derive(Clone, Debug, PartialEq)]
pub struct ValidationSchedule {
    pub base: Duration,
    pub multiplier: f64,
    pub cap: Duration,
    pub cache_ttl: Duration,
}

impl ValidationSchedule {
    pub fn from_config(config: &VaultConfig) -> Self {
        Self {
            base: Duration::from_millis(config.validation_base_ms),
            multiplier: config.validation_multiplier,
            cap: Duration::from_millis(config.validation_cap_ms),
            cache_ttl: config.validation_cache_ttl(),
        }
    }

    /// Delay imposed after `consecutive_failures` failures in a row
    pub fn failure_delay(&self, consecutive_failures: u32) -> Duration {
        if consecutive_failures == 0 {
            return Duration::ZERO;
        }
        capped_delay(self.base, self.multiplier, consecutive_failures - 1, self.cap)
    }

    pub fn next_after_failure(&self, now: DateTime<Utc>, consecutive_failures: u32) -> DateTime<Utc> {
        now + to_chrono(self.failure_delay(consecutive_failures))
    }

    pub fn next_after_success(&self, now: DateTime<Utc>) -> DateTime<Utc> {
        now + to_chrono(self.cache_ttl)
    }
}

impl Default for ValidationSchedule {
    fn default() -> Self {
        Self::from_config(&VaultConfig::default())
    }
}

fn to_chrono(duration: Duration) -> chrono::Duration {
    chrono::Duration::from_std(duration).unwrap_or(chrono::Duration::MAX)
}
