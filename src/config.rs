//! Suite Configuration
//!
//! TOML configuration file with environment overrides. The core consumes these
//! values; it never writes the file.

use crate::constants::*;
use crate::error::Result;
use crate::helpers::default_config_path;
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;
use tracing::info;

/// Top-level configuration
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct SuiteConfig {
    /// Key-value store connection
    pub store: StoreConfig,
    /// Reconnect backoff
    pub retry: RetryConfig,
    /// Credential vault
    pub vault: VaultConfig,
    /// Optional directory for rolling log files
    pub log_dir: Option<PathBuf>,
}

/// Key-value store configuration
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct StoreConfig {
    /// Store URL (e.g., "redis://:password@localhost:6379/0")
    pub url: String,
    /// Key namespace prefix
    pub namespace: String,
    /// Maximum concurrent in-flight store operations
    pub pool_size: usize,
    /// Default per-operation timeout in milliseconds
    pub op_timeout_ms: u64,
}

impl Default for StoreConfig {
    fn default() -> Self {
        Self {
            url: DEFAULT_STORE_URL.to_string(),
            namespace: DEFAULT_NAMESPACE.to_string(),
            pool_size: DEFAULT_POOL_SIZE,
            op_timeout_ms: DEFAULT_OP_TIMEOUT_MS,
        }
    }
}

impl StoreConfig {
    pub fn op_timeout(&self) -> Duration {
        Duration::from_millis(self.op_timeout_ms)
    }
}

/// Retry configuration for connection recovery
#[derive(Clone, Debug, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct RetryConfig {
    /// Initial delay before first retry (ms)
    pub initial_delay_ms: u64,
    /// Maximum delay between retries (ms)
    pub max_delay_ms: u64,
    /// Multiplier for exponential backoff
    pub multiplier: f64,
    /// Jitter factor (0.0 - 1.0) to randomize delays
    pub jitter: f64,
    /// Maximum number of retry attempts (0 = unlimited)
    pub max_attempts: u32,
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            initial_delay_ms: RETRY_INITIAL_DELAY_MS,
            max_delay_ms: RETRY_MAX_DELAY_MS,
            multiplier: RETRY_MULTIPLIER,
            jitter: RETRY_JITTER,
            max_attempts: 0, // Unlimited
        }
    }
}

impl RetryConfig {
    pub fn initial_delay(&self) -> Duration {
        Duration::from_millis(self.initial_delay_ms)
    }

    pub fn max_delay(&self) -> Duration {
        Duration::from_millis(self.max_delay_ms)
    }
}

/// Credential vault configuration
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct VaultConfig {
    /// Master-key reference (`env:NAME`, `file:/path`, `base64:<key>`)
    pub master_key: String,
    /// Delay after the first validation failure (ms)
    pub validation_base_ms: u64,
    /// Growth factor per additional consecutive failure
    pub validation_multiplier: f64,
    /// Upper bound of the validation delay (ms)
    pub validation_cap_ms: u64,
    /// How long a successful validation is trusted before probing again
    pub validation_cache_ttl_secs: u64,
    /// How long `validate` waits for the external probe (ms)
    pub probe_timeout_ms: u64,
    /// Reload-and-retry attempts on CAS conflicts
    pub cas_attempts: u32,
}

impl Default for VaultConfig {
    fn default() -> Self {
        Self {
            master_key: format!("env:{ENV_MASTER_KEY}"),
            validation_base_ms: VALIDATION_BASE_MS,
            validation_multiplier: VALIDATION_MULTIPLIER,
            validation_cap_ms: VALIDATION_CAP_MS,
            validation_cache_ttl_secs: VALIDATION_CACHE_TTL_SECS,
            probe_timeout_ms: PROBE_TIMEOUT_MS,
            cas_attempts: CAS_RETRY_ATTEMPTS,
        }
    }
}

impl VaultConfig {
    pub fn probe_timeout(&self) -> Duration {
        Duration::from_millis(self.probe_timeout_ms)
    }

    pub fn validation_cache_ttl(&self) -> Duration {
        Duration::from_secs(self.validation_cache_ttl_secs)
    }
}

impl SuiteConfig {
    /// Load configuration from `path`, or from the platform config dir when `None`.
    ///
    /// A missing file yields defaults. Environment overrides are applied last.
    pub fn load(path: Option<&Path>) -> Result<Self> {
        let path = match path {
            Some(p) => p.to_path_buf(),
            None => default_config_path()?,
        };

        let mut config = if path.exists() {
            info!("Loading configuration from {}", path.display());
            Self::from_toml(&std::fs::read_to_string(&path)?)?
        } else {
            info!("No configuration at {}, using defaults", path.display());
            Self::default()
        };

        config.apply_env(|name| std::env::var(name).ok());
        Ok(config)
    }

    /// Parse configuration from TOML text
    pub fn from_toml(content: &str) -> Result<Self> {
        if content.trim().is_empty() {
            return Ok(Self::default());
        }
        Ok(toml::from_str(content)?)
    }

    /// Apply environment overrides using `lookup` to read variables
    pub fn apply_env(&mut self, lookup: impl Fn(&str) -> Option<String>) {
        if let Some(url) = lookup(ENV_STORE_URL) {
            self.store.url = url;
        }
        if let Some(namespace) = lookup(ENV_NAMESPACE) {
            self.store.namespace = namespace;
        }
        if lookup(ENV_MASTER_KEY).is_some() {
            self.vault.master_key = format!("env:{ENV_MASTER_KEY}");
        }
    }
}
