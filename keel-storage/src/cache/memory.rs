use super::{CacheBackend, CacheEntry};
use async_trait::async_trait;
use chrono::Utc;
use keel_core::{StoreError, StoreResult};
use std::collections::HashMap;
use std::sync::{Arc, RwLock};
use std::time::Duration;

/// In-process cache backend. Clones share entries.
#[derive(Debug, Clone, Default)]
pub struct MemoryCacheBackend {
    entries: Arc<RwLock<HashMap<String, CacheEntry>>>,
}

impl MemoryCacheBackend {
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of stored entries, expired ones included until next read.
    pub fn len(&self) -> usize {
        self.entries.read().map(|e| e.len()).unwrap_or(0)
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    fn poisoned() -> StoreError {
        StoreError::Backend {
            reason: "cache map lock poisoned".to_string(),
        }
    }
}

#[async_trait]
impl CacheBackend for MemoryCacheBackend {
    async fn get(&self, key: &str) -> StoreResult<Option<String>> {
        let now = Utc::now();
        {
            let entries = self.entries.read().map_err(|_| Self::poisoned())?;
            match entries.get(key) {
                None => return Ok(None),
                Some(entry) if !entry.is_expired(now) => return Ok(Some(entry.value.clone())),
                Some(_) => {}
            }
        }
        let mut entries = self.entries.write().map_err(|_| Self::poisoned())?;
        if entries.get(key).is_some_and(|e| e.is_expired(now)) {
            entries.remove(key);
        }
        Ok(None)
    }

    async fn put(&self, key: &str, value: String, ttl: Duration) -> StoreResult<()> {
        let expires_at = Utc::now()
            + chrono::Duration::from_std(ttl).map_err(|e| StoreError::Backend {
                reason: format!("ttl out of range: {e}"),
            })?;
        let mut entries = self.entries.write().map_err(|_| Self::poisoned())?;
        entries.insert(
            key.to_string(),
            CacheEntry {
                key: key.to_string(),
                value,
                expires_at,
            },
        );
        Ok(())
    }

    async fn delete(&self, key: &str) -> StoreResult<()> {
        let mut entries = self.entries.write().map_err(|_| Self::poisoned())?;
        entries.remove(key);
        Ok(())
    }
}
