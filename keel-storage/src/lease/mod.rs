//! Lease store seam.
//!
//! The distributed lock never reads-modifies-writes a lease key itself. All
//! mutation goes through the atomic primitives below, which every
//! implementation must provide with the same semantics whether the store is
//! one Redis node or a process-local map.

mod memory;
mod redis;

pub use self::memory::MemoryLeaseStore;
pub use self::redis::RedisLeaseStore;

use async_trait::async_trait;
use keel_core::StoreResult;
use std::time::Duration;

/// Shared fast key-value store holding lease keys.
///
/// Safe for concurrent use from many independent processes.
#[async_trait]
pub trait LeaseStore: Send + Sync {
    /// Short label for logs (e.g. `redis://cache-1:6379`, `memory`).
    fn name(&self) -> &str;

    /// Cheap reachability check. Run before any mutation so unavailability
    /// is detected up front.
    async fn ping(&self) -> StoreResult<()>;

    /// Atomically create `key = value` with `ttl` unless the key exists.
    /// Returns true if this call created the key.
    async fn set_if_absent(&self, key: &str, value: &str, ttl: Duration) -> StoreResult<bool>;

    async fn exists(&self, key: &str) -> StoreResult<bool>;

    /// Idempotent; deleting an absent key is not an error.
    async fn delete(&self, key: &str) -> StoreResult<()>;

    /// Refresh the TTL of `key` if it exists and still holds `owner`.
    async fn extend(&self, key: &str, owner: &str, ttl: Duration) -> StoreResult<bool>;

    /// Atomically delete `key` only if it still holds `owner`.
    async fn compare_and_delete(&self, key: &str, owner: &str) -> StoreResult<bool>;
}

/// Milliseconds for `PX`/`PEXPIRE`, never zero.
pub(crate) fn ttl_millis(ttl: Duration) -> u64 {
    (ttl.as_millis() as u64).max(1)
}
