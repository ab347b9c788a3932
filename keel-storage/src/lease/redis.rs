//! Redis-backed lease store.
//!
//! Uses `SET NX PX` for acquisition and Lua scripts for the owner-checked
//! operations, so the check and the mutation happen atomically server-side.

use super::{ttl_millis, LeaseStore};
use crate::connection::{connect, map_redis_error, redact_url};
use async_trait::async_trait;
use keel_core::StoreResult;
use redis::aio::ConnectionManager;
use redis::Script;
use std::time::Duration;

const COMPARE_AND_DELETE: &str = r#"
if redis.call("GET", KEYS[1]) == ARGV[1] then
    return redis.call("DEL", KEYS[1])
else
    return 0
end
"#;

const COMPARE_AND_EXTEND: &str = r#"
if redis.call("GET", KEYS[1]) == ARGV[1] then
    return redis.call("PEXPIRE", KEYS[1], ARGV[2])
else
    return 0
end
"#;

/// One Redis node acting as a lease store.
///
/// Cloning is cheap: the connection manager multiplexes one connection.
#[derive(Clone)]
pub struct RedisLeaseStore {
    conn: ConnectionManager,
    name: String,
    release: Script,
    extend: Script,
}

impl RedisLeaseStore {
    /// Connect and verify the node with `PING`.
    pub async fn connect(url: &str, timeout: Duration) -> StoreResult<Self> {
        let conn = connect(url, timeout).await?;
        Ok(Self::from_connection(conn, redact_url(url)))
    }

    pub fn from_connection(conn: ConnectionManager, name: impl Into<String>) -> Self {
        Self {
            conn,
            name: name.into(),
            release: Script::new(COMPARE_AND_DELETE),
            extend: Script::new(COMPARE_AND_EXTEND),
        }
    }
}

#[async_trait]
impl LeaseStore for RedisLeaseStore {
    fn name(&self) -> &str {
        &self.name
    }

    async fn ping(&self) -> StoreResult<()> {
        let mut conn = self.conn.clone();
        let _: String = redis::cmd("PING")
            .query_async(&mut conn)
            .await
            .map_err(map_redis_error)?;
        Ok(())
    }

    async fn set_if_absent(&self, key: &str, value: &str, ttl: Duration) -> StoreResult<bool> {
        let mut conn = self.conn.clone();
        let reply: Option<String> = redis::cmd("SET")
            .arg(key)
            .arg(value)
            .arg("NX")
            .arg("PX")
            .arg(ttl_millis(ttl))
            .query_async(&mut conn)
            .await
            .map_err(map_redis_error)?;
        Ok(reply.is_some())
    }

    async fn exists(&self, key: &str) -> StoreResult<bool> {
        let mut conn = self.conn.clone();
        let count: i64 = redis::cmd("EXISTS")
            .arg(key)
            .query_async(&mut conn)
            .await
            .map_err(map_redis_error)?;
        Ok(count > 0)
    }

    async fn delete(&self, key: &str) -> StoreResult<()> {
        let mut conn = self.conn.clone();
        let _: i64 = redis::cmd("DEL")
            .arg(key)
            .query_async(&mut conn)
            .await
            .map_err(map_redis_error)?;
        Ok(())
    }

    async fn extend(&self, key: &str, owner: &str, ttl: Duration) -> StoreResult<bool> {
        let mut conn = self.conn.clone();
        let extended: i64 = self
            .extend
            .key(key)
            .arg(owner)
            .arg(ttl_millis(ttl))
            .invoke_async(&mut conn)
            .await
            .map_err(map_redis_error)?;
        Ok(extended == 1)
    }

    async fn compare_and_delete(&self, key: &str, owner: &str) -> StoreResult<bool> {
        let mut conn = self.conn.clone();
        let deleted: i64 = self
            .release
            .key(key)
            .arg(owner)
            .invoke_async(&mut conn)
            .await
            .map_err(map_redis_error)?;
        Ok(deleted == 1)
    }
}
