//! Cache backend trait and entry types.

use async_trait::async_trait;
use keel_core::{StoreResult, Timestamp};
use std::time::Duration;

/// Cache backend trait for pluggable cache implementations.
///
/// Implementations must be thread-safe. Values are written whole and never
/// mutated in place; a write replaces the entry and its TTL.
#[async_trait]
pub trait CacheBackend: Send + Sync {
    /// Get the payload stored under `key`, or `None` on miss or expiry.
    async fn get(&self, key: &str) -> StoreResult<Option<String>>;

    /// Store `value` under `key` for `ttl`.
    async fn put(&self, key: &str, value: String, ttl: Duration) -> StoreResult<()>;

    /// Remove `key`. Removing an absent key is not an error.
    async fn delete(&self, key: &str) -> StoreResult<()>;
}

/// A cached payload with its absolute expiry.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CacheEntry {
    pub key: String,
    /// Serialized value.
    pub value: String,
    pub expires_at: Timestamp,
}

impl CacheEntry {
    pub fn is_expired(&self, now: Timestamp) -> bool {
        now >= self.expires_at
    }
}

/// Statistics about cache usage.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct CacheStats {
    pub hits: u64,
    pub misses: u64,
    /// Calls to the caller's compute function that filled the cache.
    pub recomputations: u64,
    /// Calls to compute outside the refresh lock (skipped or degraded).
    pub fallbacks: u64,
    /// Backend errors absorbed as misses or uncached results.
    pub backend_errors: u64,
}

impl CacheStats {
    /// Calculate the hit rate (0.0 to 1.0).
    pub fn hit_rate(&self) -> f64 {
        let total = self.hits + self.misses;
        if total == 0 {
            0.0
        } else {
            self.hits as f64 / total as f64
        }
    }
}
