//! Worker configuration
//!
//! Every tunable is read from a `KEEL_*` environment variable with a default
//! from [`crate::constants`]. Constructors take a variable lookup so tests can
//! supply a map instead of mutating the process environment.

use crate::billing::PriceTable;
use crate::constants::{DEFAULT_CACHE_KEY_PREFIX, DEFAULT_LEASE_BACKEND, DEFAULT_REDIS_TIMEOUT_MS};
use crate::db::DbConfig;
use crate::jobs::SweepConfig;
use crate::telemetry::TelemetryConfig;
use keel_core::{CacheConfig, ConfigError, LockConfig};
use std::fmt;
use std::str::FromStr;
use std::time::Duration;

/// Environment variable lookup.
pub type Vars<'a> = &'a dyn Fn(&str) -> Option<String>;

/// Look up `key` and parse it, falling back to `default` when unset or
/// unparseable.
pub(crate) fn parse_or<T: FromStr>(vars: Vars<'_>, key: &str, default: T) -> T {
    vars(key).and_then(|s| s.trim().parse().ok()).unwrap_or(default)
}

pub(crate) fn flag_or(vars: Vars<'_>, key: &str, default: bool) -> bool {
    vars(key)
        .map(|s| !matches!(s.trim().to_lowercase().as_str(), "false" | "0" | "no" | "off"))
        .unwrap_or(default)
}

pub(crate) fn millis_or(vars: Vars<'_>, key: &str, default: Duration) -> Duration {
    vars(key)
        .and_then(|s| s.trim().parse::<u64>().ok())
        .map(Duration::from_millis)
        .unwrap_or(default)
}

/// Comma separated list; blank entries are dropped.
pub(crate) fn list(vars: Vars<'_>, key: &str) -> Vec<String> {
    vars(key)
        .map(|s| {
            s.split(',')
                .map(str::trim)
                .filter(|s| !s.is_empty())
                .map(str::to_string)
                .collect()
        })
        .unwrap_or_default()
}

fn process_env(key: &str) -> Option<String> {
    std::env::var(key).ok()
}

// ============================================================================
// LEASE BACKEND
// ============================================================================

/// Where leases live, chosen once at startup.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LeaseBackend {
    /// Shared Redis node(s); quorum mode when more than one URL is given.
    Redis,
    /// In-process map. Only safe for a single instance.
    Local,
    /// No lease store: every coordinated operation runs unprotected.
    Disabled,
}

impl LeaseBackend {
    pub fn as_str(&self) -> &'static str {
        match self {
            LeaseBackend::Redis => "redis",
            LeaseBackend::Local => "local",
            LeaseBackend::Disabled => "disabled",
        }
    }
}

impl FromStr for LeaseBackend {
    type Err = ConfigError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_lowercase().as_str() {
            "redis" => Ok(LeaseBackend::Redis),
            "local" | "memory" => Ok(LeaseBackend::Local),
            "disabled" | "none" | "off" => Ok(LeaseBackend::Disabled),
            other => Err(ConfigError::InvalidValue {
                field: "KEEL_LEASE_BACKEND".to_string(),
                value: other.to_string(),
                reason: "expected redis, local or disabled".to_string(),
            }),
        }
    }
}

impl fmt::Display for LeaseBackend {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Lease store selection and connection settings.
#[derive(Debug, Clone)]
pub struct LeaseConfig {
    pub backend: LeaseBackend,
    /// One URL per independent node.
    pub redis_urls: Vec<String>,
    /// Connection and response timeout.
    pub timeout: Duration,
    /// Prefix for cache entries stored next to the leases.
    pub cache_key_prefix: String,
}

impl LeaseConfig {
    /// # Environment Variables
    /// - `KEEL_LEASE_BACKEND`: `redis`, `local` or `disabled` (default: redis)
    /// - `KEEL_REDIS_URL`: comma separated node URLs, required for `redis`
    /// - `KEEL_REDIS_TIMEOUT_MS`: connection and response timeout (default: 2000)
    /// - `KEEL_CACHE_KEY_PREFIX`: cache entry prefix (default: `keel:`)
    pub fn from_vars(vars: Vars<'_>) -> Result<Self, ConfigError> {
        let backend: LeaseBackend = vars("KEEL_LEASE_BACKEND")
            .unwrap_or_else(|| DEFAULT_LEASE_BACKEND.to_string())
            .parse()?;
        let redis_urls = list(vars, "KEEL_REDIS_URL");
        if backend == LeaseBackend::Redis && redis_urls.is_empty() {
            return Err(ConfigError::MissingRequired {
                field: "KEEL_REDIS_URL".to_string(),
            });
        }
        Ok(Self {
            backend,
            redis_urls,
            timeout: millis_or(
                vars,
                "KEEL_REDIS_TIMEOUT_MS",
                Duration::from_millis(DEFAULT_REDIS_TIMEOUT_MS),
            ),
            cache_key_prefix: vars("KEEL_CACHE_KEY_PREFIX")
                .unwrap_or_else(|| DEFAULT_CACHE_KEY_PREFIX.to_string()),
        })
    }
}

// ============================================================================
// LOCK AND CACHE TUNING
// ============================================================================

/// # Environment Variables
/// - `KEEL_LOCK_RETRY_COUNT` (default: 3)
/// - `KEEL_LOCK_RETRY_DELAY_MS` (default: 100)
/// - `KEEL_LOCK_RETRY_JITTER_MS` (default: 100)
/// - `KEEL_LOCK_DRIFT_FACTOR` (default: 0.01)
/// - `KEEL_LOCK_EXTENSION_THRESHOLD_MS` (default: 500)
/// - `KEEL_LOCK_AUTO_EXTEND` (default: true)
/// - `KEEL_LOCK_KEY_PREFIX` (default: `lock:`)
pub fn lock_config_from_vars(vars: Vars<'_>) -> Result<LockConfig, ConfigError> {
    let defaults = LockConfig::default();
    let config = LockConfig {
        retry_count: parse_or(vars, "KEEL_LOCK_RETRY_COUNT", defaults.retry_count),
        retry_delay: millis_or(vars, "KEEL_LOCK_RETRY_DELAY_MS", defaults.retry_delay),
        retry_jitter: millis_or(vars, "KEEL_LOCK_RETRY_JITTER_MS", defaults.retry_jitter),
        drift_factor: parse_or(vars, "KEEL_LOCK_DRIFT_FACTOR", defaults.drift_factor),
        extension_threshold: millis_or(
            vars,
            "KEEL_LOCK_EXTENSION_THRESHOLD_MS",
            defaults.extension_threshold,
        ),
        auto_extend: flag_or(vars, "KEEL_LOCK_AUTO_EXTEND", defaults.auto_extend),
        key_prefix: vars("KEEL_LOCK_KEY_PREFIX").unwrap_or(defaults.key_prefix),
    };
    config.validate()?;
    Ok(config)
}

/// # Environment Variables
/// - `KEEL_CACHE_REFRESH_LOCK_TTL_MS` (default: 10000)
/// - `KEEL_CACHE_REFRESH_LOCK_PREFIX` (default: `refresh-`)
/// - `KEEL_CACHE_REFRESH_POLL_MS` (default: 50)
pub fn cache_config_from_vars(vars: Vars<'_>) -> CacheConfig {
    let defaults = CacheConfig::default();
    CacheConfig {
        refresh_lock_ttl: millis_or(
            vars,
            "KEEL_CACHE_REFRESH_LOCK_TTL_MS",
            defaults.refresh_lock_ttl,
        ),
        refresh_lock_prefix: vars("KEEL_CACHE_REFRESH_LOCK_PREFIX")
            .unwrap_or(defaults.refresh_lock_prefix),
        refresh_poll_interval: millis_or(
            vars,
            "KEEL_CACHE_REFRESH_POLL_MS",
            defaults.refresh_poll_interval,
        ),
    }
}

// ============================================================================
// WORKER CONFIG
// ============================================================================

/// Everything the worker process needs to start.
#[derive(Debug, Clone)]
pub struct WorkerConfig {
    pub db: DbConfig,
    pub lease: LeaseConfig,
    pub lock: LockConfig,
    pub cache: CacheConfig,
    pub sweep: SweepConfig,
    pub telemetry: TelemetryConfig,
    pub prices: PriceTable,
}

impl WorkerConfig {
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::from_vars(&process_env)
    }

    pub fn from_vars(vars: Vars<'_>) -> Result<Self, ConfigError> {
        Ok(Self {
            db: DbConfig::from_vars(vars),
            lease: LeaseConfig::from_vars(vars)?,
            lock: lock_config_from_vars(vars)?,
            cache: cache_config_from_vars(vars),
            sweep: SweepConfig::from_vars(vars)?,
            telemetry: TelemetryConfig::from_vars(vars),
            prices: PriceTable::from_vars(vars),
        })
    }
}
