//! Configuration types

use crate::ConfigError;
use serde::{Deserialize, Serialize};
use std::time::Duration;

/// Default number of retries after the first acquisition attempt.
pub const DEFAULT_LOCK_RETRY_COUNT: u32 = 3;
/// Default base delay between acquisition attempts.
pub const DEFAULT_LOCK_RETRY_DELAY_MS: u64 = 100;
/// Default upper bound of the random jitter added to each delay.
pub const DEFAULT_LOCK_RETRY_JITTER_MS: u64 = 100;
/// Default clock drift allowance, as a fraction of the TTL.
pub const DEFAULT_LOCK_DRIFT_FACTOR: f64 = 0.01;
/// Default remaining-life threshold below which a held lease is extended.
pub const DEFAULT_LOCK_EXTENSION_THRESHOLD_MS: u64 = 500;
/// Default namespace for lock keys.
pub const DEFAULT_LOCK_KEY_PREFIX: &str = "lock:";

/// Default TTL of the lock guarding a cache refresh.
pub const DEFAULT_CACHE_REFRESH_LOCK_TTL_MS: u64 = 10_000;
/// Default name prefix of the lock guarding a cache refresh.
pub const DEFAULT_CACHE_REFRESH_LOCK_PREFIX: &str = "refresh-";
/// Default interval at which a caller that lost the refresh race re-reads
/// the cache while the winner computes.
pub const DEFAULT_CACHE_REFRESH_POLL_MS: u64 = 50;

/// Tuning for the distributed lock.
///
/// Backoff and drift values are policy, tuned per deployment.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LockConfig {
    /// Retries after the first attempt.
    pub retry_count: u32,
    /// Base delay before each retry.
    pub retry_delay: Duration,
    /// Random jitter added on top of `retry_delay`, drawn from `0..=retry_jitter`.
    pub retry_jitter: Duration,
    /// Fraction of the TTL reserved for clock drift between store nodes.
    pub drift_factor: f64,
    /// Extend the lease once its remaining life drops below this.
    pub extension_threshold: Duration,
    /// Whether held leases are extended automatically while the protected
    /// operation runs.
    pub auto_extend: bool,
    /// Prefix applied to every lock name.
    pub key_prefix: String,
}

impl Default for LockConfig {
    fn default() -> Self {
        Self {
            retry_count: DEFAULT_LOCK_RETRY_COUNT,
            retry_delay: Duration::from_millis(DEFAULT_LOCK_RETRY_DELAY_MS),
            retry_jitter: Duration::from_millis(DEFAULT_LOCK_RETRY_JITTER_MS),
            drift_factor: DEFAULT_LOCK_DRIFT_FACTOR,
            extension_threshold: Duration::from_millis(DEFAULT_LOCK_EXTENSION_THRESHOLD_MS),
            auto_extend: true,
            key_prefix: DEFAULT_LOCK_KEY_PREFIX.to_string(),
        }
    }
}

impl LockConfig {
    pub fn with_retry_count(mut self, retry_count: u32) -> Self {
        self.retry_count = retry_count;
        self
    }

    pub fn with_retry_delay(mut self, delay: Duration, jitter: Duration) -> Self {
        self.retry_delay = delay;
        self.retry_jitter = jitter;
        self
    }

    pub fn with_drift_factor(mut self, drift_factor: f64) -> Self {
        self.drift_factor = drift_factor;
        self
    }

    pub fn with_extension_threshold(mut self, threshold: Duration) -> Self {
        self.extension_threshold = threshold;
        self
    }

    pub fn with_auto_extend(mut self, auto_extend: bool) -> Self {
        self.auto_extend = auto_extend;
        self
    }

    pub fn with_key_prefix(mut self, prefix: impl Into<String>) -> Self {
        self.key_prefix = prefix.into();
        self
    }

    /// Store key for a logical lock name.
    pub fn namespaced(&self, name: &str) -> String {
        format!("{}{}", self.key_prefix, name)
    }

    /// Worst-case time spent sleeping between attempts.
    pub fn max_retry_window(&self) -> Duration {
        (self.retry_delay + self.retry_jitter) * self.retry_count
    }

    /// Drift allowance for a lease of `ttl`: `ttl * drift_factor` plus 2ms
    /// for store-side expiry precision.
    pub fn drift_for(&self, ttl: Duration) -> Duration {
        ttl.mul_f64(self.drift_factor) + Duration::from_millis(2)
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if !(0.0..1.0).contains(&self.drift_factor) {
            return Err(ConfigError::InvalidValue {
                field: "drift_factor".to_string(),
                value: self.drift_factor.to_string(),
                reason: "must be in [0, 1)".to_string(),
            });
        }
        if self.key_prefix.is_empty() {
            return Err(ConfigError::InvalidValue {
                field: "key_prefix".to_string(),
                value: String::new(),
                reason: "must not be empty".to_string(),
            });
        }
        Ok(())
    }
}

/// Tuning for the read-through cache.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CacheConfig {
    /// TTL of the lock held while one caller recomputes a missing entry.
    pub refresh_lock_ttl: Duration,
    /// Prefix of the refresh lock name; the cache key is appended.
    pub refresh_lock_prefix: String,
    /// How often a caller waiting on another instance's refresh re-reads
    /// the cache. The wait itself is bounded by `refresh_lock_ttl`.
    pub refresh_poll_interval: Duration,
}

impl Default for CacheConfig {
    fn default() -> Self {
        Self {
            refresh_lock_ttl: Duration::from_millis(DEFAULT_CACHE_REFRESH_LOCK_TTL_MS),
            refresh_lock_prefix: DEFAULT_CACHE_REFRESH_LOCK_PREFIX.to_string(),
            refresh_poll_interval: Duration::from_millis(DEFAULT_CACHE_REFRESH_POLL_MS),
        }
    }
}

impl CacheConfig {
    pub fn with_refresh_lock_ttl(mut self, ttl: Duration) -> Self {
        self.refresh_lock_ttl = ttl;
        self
    }

    pub fn with_refresh_poll_interval(mut self, interval: Duration) -> Self {
        self.refresh_poll_interval = interval;
        self
    }

    /// Lock name guarding the refresh of `cache_key`.
    pub fn refresh_lock_name(&self, cache_key: &str) -> String {
        format!("{}{}", self.refresh_lock_prefix, cache_key)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_lock_config_defaults() {
        let config = LockConfig::default();
        assert_eq!(config.retry_count, 3);
        assert_eq!(config.namespaced("cleanup-session"), "lock:cleanup-session");
        assert_eq!(config.max_retry_window(), Duration::from_millis(600));
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_drift_for_ttl() {
        let config = LockConfig::default();
        assert_eq!(config.drift_for(Duration::from_secs(10)), Duration::from_millis(102));
    }

    #[test]
    fn test_lock_config_validation() {
        let bad_drift = LockConfig::default().with_drift_factor(1.5);
        assert!(matches!(
            bad_drift.validate(),
            Err(ConfigError::InvalidValue { ref field, .. }) if field == "drift_factor"
        ));

        let bad_prefix = LockConfig::default().with_key_prefix("");
        assert!(bad_prefix.validate().is_err());
    }

    #[test]
    fn test_refresh_lock_name() {
        let config = CacheConfig::default();
        assert_eq!(config.refresh_lock_name("summary:42"), "refresh-summary:42");
    }
}
