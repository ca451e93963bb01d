//! Default Tunables
//!
//! Centralized defaults used when the configuration file leaves a value unset.

/// Store defaults
pub const DEFAULT_STORE_URL: &str = "redis://127.0.0.1:6379";
pub const DEFAULT_NAMESPACE: &str = "suite";
pub const DEFAULT_POOL_SIZE: usize = 4;
pub const DEFAULT_OP_TIMEOUT_MS: u64 = 30_000;

/// Retry configuration
pub const RETRY_INITIAL_DELAY_MS: u64 = 1000;
pub const RETRY_MAX_DELAY_MS: u64 = 60000;
pub const RETRY_MULTIPLIER: f64 = 2.0;
pub const RETRY_JITTER: f64 = 0.1;

/// Credential validation schedule
pub const VALIDATION_BASE_MS: u64 = 1000;
pub const VALIDATION_MULTIPLIER: f64 = 2.0;
pub const VALIDATION_CAP_MS: u64 = 60_000;
pub const VALIDATION_CACHE_TTL_SECS: u64 = 300;
pub const PROBE_TIMEOUT_MS: u64 = 10_000;

/// Attempts for reload-and-retry loops around compare-and-swap saves
pub const CAS_RETRY_ATTEMPTS: u32 = 5;

/// Buffered events per in-memory channel before slow subscribers lag
pub const CHANNEL_CAPACITY: usize = 1024;

/// Keys fetched per SCAN page when listing records
pub const SCAN_PAGE_SIZE: u32 = 100;

/// Environment overrides
pub const ENV_STORE_URL: &str = "SUITE_STORE_URL";
pub const ENV_MASTER_KEY: &str = "SUITE_MASTER_KEY";
pub const ENV_NAMESPACE: &str = "SUITE_NAMESPACE";

/// Configuration file name inside the platform config dir
pub const CONFIG_FILE_NAME: &str = "suite.toml";

/// Interval of the background store health probe
pub const HEALTH_CHECK_INTERVAL_SECS: u64 = 15;
