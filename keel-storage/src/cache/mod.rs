//! Cache backends for the read-through cache.
//!
//! Backends store opaque serialized payloads under string keys with a TTL.
//! Serialization and stampede protection live one layer up, in
//! `keel-coord`'s `ReadThroughCache`.

mod memory;
mod redis;
mod traits;

pub use self::memory::MemoryCacheBackend;
pub use self::redis::RedisCacheBackend;
pub use self::traits::{CacheBackend, CacheEntry, CacheStats};
