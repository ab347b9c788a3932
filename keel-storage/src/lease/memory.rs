use super::LeaseStore;
use async_trait::async_trait;
use keel_core::{StoreError, StoreResult};
use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::{Duration, Instant};

#[derive(Debug, Clone)]
struct Slot {
    owner: String,
    expires_at: Instant,
}

/// Process-local lease store.
///
/// The local strategy for single-instance deployments: leases exclude
/// concurrent callers inside this process only. Clones share the same map,
/// so tests can hand one store to several coordinators standing in for
/// separate processes.
#[derive(Debug, Clone, Default)]
pub struct MemoryLeaseStore {
    slots: Arc<Mutex<HashMap<String, Slot>>>,
}

impl MemoryLeaseStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of live (non-expired) keys.
    pub fn live_keys(&self) -> usize {
        let now = Instant::now();
        self.slots
            .lock()
            .map(|slots| slots.values().filter(|s| s.expires_at > now).count())
            .unwrap_or(0)
    }

    fn slots(&self) -> StoreResult<MutexGuard<'_, HashMap<String, Slot>>> {
        let mut slots = self.slots.lock().map_err(|_| StoreError::Backend {
            reason: "lease map lock poisoned".to_string(),
        })?;
        let now = Instant::now();
        slots.retain(|_, slot| slot.expires_at > now);
        Ok(slots)
    }
}

#[async_trait]
impl LeaseStore for MemoryLeaseStore {
    fn name(&self) -> &str {
        "memory"
    }

    async fn ping(&self) -> StoreResult<()> {
        self.slots().map(|_| ())
    }

    async fn set_if_absent(&self, key: &str, value: &str, ttl: Duration) -> StoreResult<bool> {
        let mut slots = self.slots()?;
        if slots.contains_key(key) {
            return Ok(false);
        }
        slots.insert(
            key.to_string(),
            Slot {
                owner: value.to_string(),
                expires_at: Instant::now() + ttl,
            },
        );
        Ok(true)
    }

    async fn exists(&self, key: &str) -> StoreResult<bool> {
        Ok(self.slots()?.contains_key(key))
    }

    async fn delete(&self, key: &str) -> StoreResult<()> {
        self.slots()?.remove(key);
        Ok(())
    }

    async fn extend(&self, key: &str, owner: &str, ttl: Duration) -> StoreResult<bool> {
        let mut slots = self.slots()?;
        match slots.get_mut(key) {
            Some(slot) if slot.owner == owner => {
                slot.expires_at = Instant::now() + ttl;
                Ok(true)
            }
            _ => Ok(false),
        }
    }

    async fn compare_and_delete(&self, key: &str, owner: &str) -> StoreResult<bool> {
        let mut slots = self.slots()?;
        if slots.get(key).is_some_and(|slot| slot.owner == owner) {
            slots.remove(key);
            Ok(true)
        } else {
            Ok(false)
        }
    }
}
