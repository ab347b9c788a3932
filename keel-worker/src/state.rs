//! Dependency injection root.
//!
//! Everything the worker runs is built once here from [`WorkerConfig`] and
//! handed out by clone or `Arc`. There is no global state: two `AppState`s
//! built from different configs are fully independent.

use crate::billing::EventProcessor;
use crate::config::{LeaseBackend, LeaseConfig, WorkerConfig};
use crate::db::DbClient;
use crate::error::WorkerResult;
use crate::jobs::ExpiringRecordSweeper;
use async_trait::async_trait;
use keel_coord::{DistributedLock, LockCoordinator, ReadThroughCache};
use keel_core::{HealthCheck, LockConfig, StoreError, StoreResult};
use keel_storage::{
    connect, CacheBackend, LeaseStore, MemoryCacheBackend, MemoryLeaseStore, RedisCacheBackend,
    RedisLeaseStore,
};
use std::sync::Arc;
use std::time::{Duration, Instant};

// ============================================================================
// CACHE BACKEND SELECTION
// ============================================================================

/// Cache backend picked to match the lease backend.
pub enum SharedCacheBackend {
    Redis(RedisCacheBackend),
    /// Process-local; only coherent for a single instance.
    Memory(MemoryCacheBackend),
}

#[async_trait]
impl CacheBackend for SharedCacheBackend {
    async fn get(&self, key: &str) -> StoreResult<Option<String>> {
        match self {
            SharedCacheBackend::Redis(b) => b.get(key).await,
            SharedCacheBackend::Memory(b) => b.get(key).await,
        }
    }

    async fn put(&self, key: &str, value: String, ttl: Duration) -> StoreResult<()> {
        match self {
            SharedCacheBackend::Redis(b) => b.put(key, value, ttl).await,
            SharedCacheBackend::Memory(b) => b.put(key, value, ttl).await,
        }
    }

    async fn delete(&self, key: &str) -> StoreResult<()> {
        match self {
            SharedCacheBackend::Redis(b) => b.delete(key).await,
            SharedCacheBackend::Memory(b) => b.delete(key).await,
        }
    }
}

/// Read-through cache shared with the request-serving processes.
pub type WorkerCache = ReadThroughCache<SharedCacheBackend>;

// ============================================================================
// LEASE STORE SELECTION
// ============================================================================

/// Stand-in for a configured node that could not be reached at startup.
///
/// Keeps the node counted so the quorum stays a majority of the configured
/// fleet rather than of whatever happened to connect.
struct OfflineLeaseStore {
    name: String,
    reason: String,
}

impl OfflineLeaseStore {
    fn unavailable(&self) -> StoreError {
        StoreError::Unavailable {
            reason: format!("{} offline since startup: {}", self.name, self.reason),
        }
    }
}

#[async_trait]
impl LeaseStore for OfflineLeaseStore {
    fn name(&self) -> &str {
        &self.name
    }

    async fn ping(&self) -> StoreResult<()> {
        Err(self.unavailable())
    }

    async fn set_if_absent(&self, _key: &str, _value: &str, _ttl: Duration) -> StoreResult<bool> {
        Err(self.unavailable())
    }

    async fn exists(&self, _key: &str) -> StoreResult<bool> {
        Err(self.unavailable())
    }

    async fn delete(&self, _key: &str) -> StoreResult<()> {
        Err(self.unavailable())
    }

    async fn extend(&self, _key: &str, _owner: &str, _ttl: Duration) -> StoreResult<bool> {
        Err(self.unavailable())
    }

    async fn compare_and_delete(&self, _key: &str, _owner: &str) -> StoreResult<bool> {
        Err(self.unavailable())
    }
}

/// Connect the configured lease backend.
///
/// Redis nodes that cannot be reached are kept as offline members; when no
/// node connects at all the coordinator runs unprotected and the cache falls
/// back to process memory.
pub async fn lease_backend(
    lease: &LeaseConfig,
    lock: &LockConfig,
) -> WorkerResult<(LockCoordinator, SharedCacheBackend)> {
    match lease.backend {
        LeaseBackend::Disabled => {
            tracing::warn!("Lease store disabled; coordinated operations run unprotected");
            Ok((
                LockCoordinator::unprotected(),
                SharedCacheBackend::Memory(MemoryCacheBackend::new()),
            ))
        }
        LeaseBackend::Local => {
            tracing::warn!("Using process-local lease store; safe for a single instance only");
            let store: Arc<dyn LeaseStore> = Arc::new(MemoryLeaseStore::new());
            let distributed = DistributedLock::single(store, lock.clone())?;
            Ok((
                LockCoordinator::new(distributed),
                SharedCacheBackend::Memory(MemoryCacheBackend::new()),
            ))
        }
        LeaseBackend::Redis => {
            let mut stores: Vec<Arc<dyn LeaseStore>> = Vec::with_capacity(lease.redis_urls.len());
            let mut cache = None;
            let mut connected = 0usize;

            for (index, url) in lease.redis_urls.iter().enumerate() {
                let name = format!("redis-{index}");
                match connect(url, lease.timeout).await {
                    Ok(conn) => {
                        connected += 1;
                        if cache.is_none() {
                            cache = Some(RedisCacheBackend::from_connection(
                                conn.clone(),
                                lease.cache_key_prefix.clone(),
                            ));
                        }
                        stores.push(Arc::new(RedisLeaseStore::from_connection(conn, name)));
                    }
                    Err(e) => {
                        tracing::warn!(store = %name, error = %e, "Lease store node unreachable");
                        stores.push(Arc::new(OfflineLeaseStore {
                            name,
                            reason: e.to_string(),
                        }));
                    }
                }
            }

            let Some(cache) = cache else {
                tracing::warn!(
                    nodes = stores.len(),
                    "No lease store node reachable; coordinated operations run unprotected"
                );
                return Ok((
                    LockCoordinator::unprotected(),
                    SharedCacheBackend::Memory(MemoryCacheBackend::new()),
                ));
            };

            let distributed = DistributedLock::new(stores, lock.clone())?;
            tracing::info!(
                nodes = distributed.store_count(),
                connected,
                quorum = distributed.quorum(),
                "Lease store connected"
            );
            Ok((
                LockCoordinator::new(distributed),
                SharedCacheBackend::Redis(cache),
            ))
        }
    }
}

// ============================================================================
// APP STATE
// ============================================================================

#[derive(Clone)]
pub struct AppState {
    pub db: DbClient,
    pub coordinator: LockCoordinator,
    pub cache: Arc<WorkerCache>,
    pub processor: EventProcessor,
    pub sweeper: Arc<ExpiringRecordSweeper>,
    pub start_time: Instant,
}

impl AppState {
    pub async fn build(config: &WorkerConfig) -> WorkerResult<Self> {
        let db = DbClient::from_config(&config.db)?;
        let (coordinator, cache_backend) = lease_backend(&config.lease, &config.lock).await?;

        let cache = Arc::new(ReadThroughCache::new(
            Arc::new(cache_backend),
            coordinator.clone(),
            config.cache.clone(),
        ));

        let processor = EventProcessor::new(Arc::new(db.clone()), cache.clone())
            .with_plan_resolver(Arc::new(config.prices.clone()));

        let sweeper = Arc::new(ExpiringRecordSweeper::new(
            Arc::new(db.clone()),
            coordinator.clone(),
            config.sweep.clone(),
        ));

        Ok(Self {
            db,
            coordinator,
            cache,
            processor,
            sweeper,
            start_time: Instant::now(),
        })
    }

    /// Lease store and database health.
    pub async fn health(&self) -> Vec<HealthCheck> {
        let lease = self.coordinator.health().await;

        let started = Instant::now();
        let db = match self.db.ping().await {
            Ok(()) => HealthCheck::healthy("database"),
            Err(e) => HealthCheck::unhealthy("database", e.to_string()),
        }
        .with_latency(started.elapsed())
        .with_gauge("pool_size", self.db.pool_size() as u64);

        vec![lease, db]
    }
}
