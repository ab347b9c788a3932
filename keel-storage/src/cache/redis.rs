use super::CacheBackend;
use crate::connection::{connect, map_redis_error};
use crate::lease::ttl_millis;
use async_trait::async_trait;
use keel_core::StoreResult;
use redis::aio::ConnectionManager;
use std::time::Duration;

/// Redis cache backend. Entries expire server-side via `PX`.
#[derive(Clone)]
pub struct RedisCacheBackend {
    conn: ConnectionManager,
    key_prefix: String,
}

impl RedisCacheBackend {
    pub async fn connect(
        url: &str,
        timeout: Duration,
        key_prefix: impl Into<String>,
    ) -> StoreResult<Self> {
        let conn = connect(url, timeout).await?;
        Ok(Self::from_connection(conn, key_prefix))
    }

    pub fn from_connection(conn: ConnectionManager, key_prefix: impl Into<String>) -> Self {
        Self {
            conn,
            key_prefix: key_prefix.into(),
        }
    }

    fn key(&self, key: &str) -> String {
        format!("{}{}", self.key_prefix, key)
    }
}

#[async_trait]
impl CacheBackend for RedisCacheBackend {
    async fn get(&self, key: &str) -> StoreResult<Option<String>> {
        let mut conn = self.conn.clone();
        redis::cmd("GET")
            .arg(self.key(key))
            .query_async(&mut conn)
            .await
            .map_err(map_redis_error)
    }

    async fn put(&self, key: &str, value: String, ttl: Duration) -> StoreResult<()> {
        let mut conn = self.conn.clone();
        let _: () = redis::cmd("SET")
            .arg(self.key(key))
            .arg(value)
            .arg("PX")
            .arg(ttl_millis(ttl))
            .query_async(&mut conn)
            .await
            .map_err(map_redis_error)?;
        Ok(())
    }

    async fn delete(&self, key: &str) -> StoreResult<()> {
        let mut conn = self.conn.clone();
        let _: i64 = redis::cmd("DEL")
            .arg(self.key(key))
            .query_async(&mut conn)
            .await
            .map_err(map_redis_error)?;
        Ok(())
    }
}
