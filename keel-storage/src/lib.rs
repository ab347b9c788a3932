//! KEEL Storage - Store Seams and Implementations
//!
//! Three kinds of store back the coordination layer:
//!
//! - [`LeaseStore`]: the shared fast key-value store leases live in. Redis
//!   for fleets, an in-memory map for single-instance deployments.
//! - [`CacheBackend`]: where read-through cache entries live.
//! - [`SubscriptionStore`] / [`ExpiringRecordStore`]: the durable relational
//!   store, touched only for correlation recovery, the atomic subscription
//!   transition and expired-record sweeps.
//!
//! Durable implementations backed by Postgres live in `keel-worker`; the
//! in-memory ones here serve tests and local runs.

pub mod cache;
pub mod connection;
pub mod durable;
pub mod lease;
pub mod memory;

pub use cache::{CacheBackend, CacheEntry, CacheStats, MemoryCacheBackend, RedisCacheBackend};
pub use connection::{connect, map_redis_error};
pub use durable::{ExpiringRecordStore, StorageResult, SubscriptionStore};
pub use lease::{LeaseStore, MemoryLeaseStore, RedisLeaseStore};
pub use memory::{InMemoryRecordStore, InMemorySubscriptionStore};
