//! Stampede-safe read-through cache.
//!
//! On a miss, callers race for the `refresh-<key>` lock. The winner checks
//! the cache again (someone may have filled it while it waited), computes,
//! writes and releases. Losers re-read the cache while the lock is held, for
//! at most the refresh lock TTL. Only if the winner gives up without writing,
//! or the wait runs out, do they compute directly without caching.
//!
//! # Example
//!
//! ```ignore
//! let summary: Summary = cache
//!     .get_or_compute(&format!("summary:{id}"), Duration::from_secs(3600), || async {
//!         summarizer.summarize(id).await
//!     })
//!     .await?;
//! ```

use crate::coordinator::{LockCoordinator, LockOutcome};
use async_trait::async_trait;
use keel_core::{CacheConfig, KeelError, KeelResult, StoreResult};
use keel_storage::{CacheBackend, CacheStats};
use serde::{de::DeserializeOwned, Serialize};
use std::future::Future;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

/// Invalidation path exposed to writers of the system of record.
#[async_trait]
pub trait CacheInvalidator: Send + Sync {
    /// Drop the entry under `key`. Absent keys are not an error.
    async fn invalidate(&self, key: &str) -> StoreResult<()>;
}

#[derive(Debug, Default)]
struct Counters {
    hits: AtomicU64,
    misses: AtomicU64,
    recomputations: AtomicU64,
    fallbacks: AtomicU64,
    backend_errors: AtomicU64,
}

/// Read-through cache over a [`CacheBackend`].
pub struct ReadThroughCache<C: CacheBackend> {
    backend: Arc<C>,
    coordinator: LockCoordinator,
    config: CacheConfig,
    counters: Arc<Counters>,
}

impl<C: CacheBackend> Clone for ReadThroughCache<C> {
    fn clone(&self) -> Self {
        Self {
            backend: Arc::clone(&self.backend),
            coordinator: self.coordinator.clone(),
            config: self.config.clone(),
            counters: Arc::clone(&self.counters),
        }
    }
}

impl<C: CacheBackend> ReadThroughCache<C> {
    pub fn new(backend: Arc<C>, coordinator: LockCoordinator, config: CacheConfig) -> Self {
        Self {
            backend,
            coordinator,
            config,
            counters: Arc::new(Counters::default()),
        }
    }

    pub fn with_defaults(backend: Arc<C>, coordinator: LockCoordinator) -> Self {
        Self::new(backend, coordinator, CacheConfig::default())
    }

    pub fn backend(&self) -> &C {
        &self.backend
    }

    /// Return the cached value for `key`, computing and caching it on a miss.
    ///
    /// At most one caller per miss episode runs `compute` under the refresh
    /// lock. Cache backend failures degrade to a miss and an uncached
    /// result; they never fail the read. Errors from `compute` and lock
    /// acquisition failures are returned.
    pub async fn get_or_compute<T, F, Fut>(
        &self,
        key: &str,
        ttl: Duration,
        compute: F,
    ) -> KeelResult<T>
    where
        T: Serialize + DeserializeOwned,
        F: Fn() -> Fut,
        Fut: Future<Output = KeelResult<T>>,
    {
        if let Some(value) = self.read::<T>(key).await {
            self.counters.hits.fetch_add(1, Ordering::Relaxed);
            return Ok(value);
        }
        self.counters.misses.fetch_add(1, Ordering::Relaxed);

        let this = self;
        let compute = &compute;
        let lock_name = self.config.refresh_lock_name(key);
        let outcome = self
            .coordinator
            .execute_with_lock(&lock_name, self.config.refresh_lock_ttl, move || async move {
                if let Some(value) = this.read::<T>(key).await {
                    return Ok::<T, KeelError>(value);
                }
                let value = compute().await?;
                this.counters.recomputations.fetch_add(1, Ordering::Relaxed);
                this.write(key, &value, ttl).await;
                Ok(value)
            })
            .await?;

        match outcome {
            LockOutcome::Ran(value) => Ok(value),
            LockOutcome::RanUnprotected(value) => {
                tracing::debug!(cache_key = %key, "Cache refreshed without stampede protection");
                Ok(value)
            }
            LockOutcome::Skipped => {
                if let Some(value) = self.await_refresh::<T>(key, &lock_name).await {
                    return Ok(value);
                }
                tracing::debug!(cache_key = %key, "Refresh produced no entry, computing uncached");
                self.counters.fallbacks.fetch_add(1, Ordering::Relaxed);
                compute().await
            }
        }
    }

    /// Wait for another caller's refresh of `key` to land in the cache.
    ///
    /// Returns `None` once the refresh lock is gone with the entry still
    /// missing, or after `refresh_lock_ttl`, whichever comes first.
    async fn await_refresh<T: DeserializeOwned>(&self, key: &str, lock_name: &str) -> Option<T> {
        let deadline = Instant::now() + self.config.refresh_lock_ttl;
        loop {
            // Sampled before the read so a release is always followed by one more look.
            let finished =
                Instant::now() >= deadline || !self.coordinator.is_locked(lock_name).await;
            if let Some(value) = self.read::<T>(key).await {
                self.counters.hits.fetch_add(1, Ordering::Relaxed);
                return Some(value);
            }
            if finished {
                return None;
            }
            tokio::time::sleep(self.config.refresh_poll_interval).await;
        }
    }

    /// Drop every key in `keys`, continuing past failures.
    pub async fn invalidate_many(&self, keys: &[String]) -> StoreResult<()> {
        let mut first_error = None;
        for key in keys {
            if let Err(err) = self.backend.delete(key).await {
                self.counters.backend_errors.fetch_add(1, Ordering::Relaxed);
                first_error.get_or_insert(err);
            }
        }
        first_error.map_or(Ok(()), Err)
    }

    pub fn stats(&self) -> CacheStats {
        CacheStats {
            hits: self.counters.hits.load(Ordering::Relaxed),
            misses: self.counters.misses.load(Ordering::Relaxed),
            recomputations: self.counters.recomputations.load(Ordering::Relaxed),
            fallbacks: self.counters.fallbacks.load(Ordering::Relaxed),
            backend_errors: self.counters.backend_errors.load(Ordering::Relaxed),
        }
    }

    async fn read<T: DeserializeOwned>(&self, key: &str) -> Option<T> {
        let raw = match self.backend.get(key).await {
            Ok(raw) => raw?,
            Err(err) => {
                self.counters.backend_errors.fetch_add(1, Ordering::Relaxed);
                tracing::warn!(cache_key = %key, error = %err, "Cache read failed, treating as miss");
                return None;
            }
        };
        match serde_json::from_str(&raw) {
            Ok(value) => Some(value),
            Err(err) => {
                tracing::warn!(cache_key = %key, error = %err, "Cached value unreadable, treating as miss");
                None
            }
        }
    }

    async fn write<T: Serialize>(&self, key: &str, value: &T, ttl: Duration) {
        let raw = match serde_json::to_string(value) {
            Ok(raw) => raw,
            Err(err) => {
                tracing::warn!(cache_key = %key, error = %err, "Value not serializable, not caching");
                return;
            }
        };
        if let Err(err) = self.backend.put(key, raw, ttl).await {
            self.counters.backend_errors.fetch_add(1, Ordering::Relaxed);
            tracing::warn!(cache_key = %key, error = %err, "Cache write failed, result not cached");
        }
    }
}

#[async_trait]
impl<C: CacheBackend> CacheInvalidator for ReadThroughCache<C> {
    async fn invalidate(&self, key: &str) -> StoreResult<()> {
        self.backend.delete(key).await.inspect_err(|_| {
            self.counters.backend_errors.fetch_add(1, Ordering::Relaxed);
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::DistributedLock;
    use keel_core::KeelError;
    use keel_storage::{LeaseStore, MemoryCacheBackend, MemoryLeaseStore};
    use keel_test_utils::fixtures::fast_lock_config;
    use keel_test_utils::{FailingCacheBackend, UnreachableLeaseStore};
    use serde::Deserialize;
    use std::sync::atomic::AtomicUsize;

    const TTL: Duration = Duration::from_secs(60);

    #[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
    struct Summary {
        id: u32,
        text: String,
    }

    fn coordinator(store: Arc<dyn LeaseStore>) -> LockCoordinator {
        LockCoordinator::new(DistributedLock::single(store, fast_lock_config()).unwrap())
    }

    fn cache<C: CacheBackend>(backend: C, store: Arc<dyn LeaseStore>) -> ReadThroughCache<C> {
        ReadThroughCache::with_defaults(Arc::new(backend), coordinator(store))
    }

    #[tokio::test]
    async fn test_miss_computes_then_hits() {
        let cache = cache(MemoryCacheBackend::new(), Arc::new(MemoryLeaseStore::new()));
        let calls = AtomicUsize::new(0);
        let compute = || async {
            calls.fetch_add(1, Ordering::SeqCst);
            Ok::<_, KeelError>(Summary {
                id: 1,
                text: "hello".to_string(),
            })
        };

        let first = cache.get_or_compute("summary:1", TTL, compute).await.unwrap();
        let second = cache.get_or_compute("summary:1", TTL, compute).await.unwrap();

        assert_eq!(first, second);
        assert_eq!(calls.load(Ordering::SeqCst), 1);
        let stats = cache.stats();
        assert_eq!((stats.hits, stats.misses, stats.recomputations), (1, 1, 1));
    }

    /// Misses on the first read only, as if another instance filled the
    /// entry while this one waited for the refresh lock.
    struct LateFill {
        inner: MemoryCacheBackend,
        reads: AtomicUsize,
    }

    #[async_trait]
    impl CacheBackend for LateFill {
        async fn get(&self, key: &str) -> StoreResult<Option<String>> {
            if self.reads.fetch_add(1, Ordering::SeqCst) == 0 {
                return Ok(None);
            }
            self.inner.get(key).await
        }

        async fn put(&self, key: &str, value: String, ttl: Duration) -> StoreResult<()> {
            self.inner.put(key, value, ttl).await
        }

        async fn delete(&self, key: &str) -> StoreResult<()> {
            self.inner.delete(key).await
        }
    }

    #[tokio::test]
    async fn test_double_check_inside_lock() {
        let inner = MemoryCacheBackend::new();
        inner.put("k", "5".to_string(), TTL).await.unwrap();
        let backend = LateFill {
            inner,
            reads: AtomicUsize::new(0),
        };
        let cache = cache(backend, Arc::new(MemoryLeaseStore::new()));
        let calls = AtomicUsize::new(0);

        let value = cache
            .get_or_compute("k", TTL, || async {
                calls.fetch_add(1, Ordering::SeqCst);
                Ok::<_, KeelError>(0u32)
            })
            .await
            .unwrap();

        assert_eq!(value, 5);
        assert_eq!(calls.load(Ordering::SeqCst), 0);
        assert_eq!(cache.stats().recomputations, 0);
    }

    fn short_wait_cache(
        backend: MemoryCacheBackend,
        store: Arc<dyn LeaseStore>,
        wait: Duration,
    ) -> ReadThroughCache<MemoryCacheBackend> {
        let config = CacheConfig::default()
            .with_refresh_lock_ttl(wait)
            .with_refresh_poll_interval(Duration::from_millis(10));
        ReadThroughCache::new(Arc::new(backend), coordinator(store), config)
    }

    #[tokio::test]
    async fn test_stuck_refresh_falls_back_after_wait() {
        let store = MemoryLeaseStore::new();
        store
            .set_if_absent("lock:refresh-k", "other-instance", TTL)
            .await
            .unwrap();
        let backend = MemoryCacheBackend::new();
        let cache = short_wait_cache(backend.clone(), Arc::new(store), Duration::from_millis(150));

        let started = Instant::now();
        let value = cache
            .get_or_compute("k", TTL, || async { Ok::<_, KeelError>(9u32) })
            .await
            .unwrap();

        assert_eq!(value, 9);
        assert!(started.elapsed() >= Duration::from_millis(150));
        assert!(backend.get("k").await.unwrap().is_none());
        assert_eq!(cache.stats().fallbacks, 1);
    }

    #[tokio::test]
    async fn test_waits_for_refresh_running_elsewhere() {
        let store = MemoryLeaseStore::new();
        store
            .set_if_absent("lock:refresh-k", "other-instance", TTL)
            .await
            .unwrap();
        let backend = MemoryCacheBackend::new();
        let cache = short_wait_cache(backend.clone(), Arc::new(store.clone()), TTL);

        // The other instance finishes its computation after a while.
        let writer = backend.clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(100)).await;
            writer.put("k", "7".to_string(), TTL).await.unwrap();
            store
                .compare_and_delete("lock:refresh-k", "other-instance")
                .await
                .unwrap();
        });

        let calls = AtomicUsize::new(0);
        let value = cache
            .get_or_compute("k", TTL, || async {
                calls.fetch_add(1, Ordering::SeqCst);
                Ok::<_, KeelError>(0u32)
            })
            .await
            .unwrap();

        assert_eq!(value, 7);
        assert_eq!(calls.load(Ordering::SeqCst), 0);
        assert_eq!(cache.stats().fallbacks, 0);
    }

    #[tokio::test]
    async fn test_released_refresh_without_entry_computes_at_once() {
        let store = MemoryLeaseStore::new();
        store
            .set_if_absent("lock:refresh-k", "other-instance", TTL)
            .await
            .unwrap();
        let cache = short_wait_cache(MemoryCacheBackend::new(), Arc::new(store.clone()), TTL);

        let releaser = store.clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(50)).await;
            releaser
                .compare_and_delete("lock:refresh-k", "other-instance")
                .await
                .unwrap();
        });

        let started = Instant::now();
        let value = cache
            .get_or_compute("k", TTL, || async { Ok::<_, KeelError>(2u32) })
            .await
            .unwrap();

        assert_eq!(value, 2);
        assert!(started.elapsed() < Duration::from_secs(5));
        assert_eq!(cache.stats().fallbacks, 1);
    }

    #[tokio::test]
    async fn test_unavailable_lock_still_caches() {
        let backend = MemoryCacheBackend::new();
        let cache = cache(backend.clone(), Arc::new(UnreachableLeaseStore));

        let value = cache
            .get_or_compute("k", TTL, || async { Ok::<_, KeelError>(3u32) })
            .await
            .unwrap();

        assert_eq!(value, 3);
        assert_eq!(backend.get("k").await.unwrap().as_deref(), Some("3"));
    }

    #[tokio::test]
    async fn test_backend_failure_degrades_to_compute() {
        let cache = cache(FailingCacheBackend, Arc::new(MemoryLeaseStore::new()));
        let value = cache
            .get_or_compute("k", TTL, || async { Ok::<_, KeelError>(4u32) })
            .await
            .unwrap();
        assert_eq!(value, 4);
        assert!(cache.stats().backend_errors >= 2);
        assert!(cache.invalidate("k").await.is_err());
    }

    #[tokio::test]
    async fn test_compute_error_is_returned_and_not_cached() {
        let backend = MemoryCacheBackend::new();
        let cache = cache(backend.clone(), Arc::new(MemoryLeaseStore::new()));
        let result: KeelResult<u32> = cache
            .get_or_compute("k", TTL, || async { Err(KeelError::operation("provider down")) })
            .await;
        assert_eq!(result, Err(KeelError::operation("provider down")));
        assert!(backend.is_empty());
    }

    #[tokio::test]
    async fn test_unreadable_entry_is_recomputed() {
        let backend = MemoryCacheBackend::new();
        backend.put("k", "not json".to_string(), TTL).await.unwrap();
        let cache = cache(backend.clone(), Arc::new(MemoryLeaseStore::new()));
        let value = cache
            .get_or_compute("k", TTL, || async { Ok::<_, KeelError>(8u32) })
            .await
            .unwrap();
        assert_eq!(value, 8);
        assert_eq!(backend.get("k").await.unwrap().as_deref(), Some("8"));
    }

    #[tokio::test]
    async fn test_invalidate_forces_recompute() {
        let cache = cache(MemoryCacheBackend::new(), Arc::new(MemoryLeaseStore::new()));
        let calls = AtomicUsize::new(0);
        let compute = || async {
            Ok::<_, KeelError>(calls.fetch_add(1, Ordering::SeqCst) as u32)
        };

        assert_eq!(cache.get_or_compute("k", TTL, compute).await.unwrap(), 0);
        cache.invalidate("k").await.unwrap();
        assert_eq!(cache.get_or_compute("k", TTL, compute).await.unwrap(), 1);

        cache
            .invalidate_many(&["k".to_string(), "missing".to_string()])
            .await
            .unwrap();
        assert_eq!(cache.get_or_compute("k", TTL, compute).await.unwrap(), 2);
    }
}
