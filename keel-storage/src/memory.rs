//! In-memory durable stores for tests and local runs.

use crate::durable::{ExpiringRecordStore, StorageResult, SubscriptionStore};
use async_trait::async_trait;
use chrono::Utc;
use keel_core::{
    new_entity_id, BillingPlan, EntityId, RecordKind, StorageError, SubscriptionRecord,
    SubscriptionTransition, Timestamp, TransitionApplied,
};
use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};

// ============================================================================
// SUBSCRIPTIONS
// ============================================================================

#[derive(Debug, Default)]
struct BillingTables {
    /// Keyed by provider subscription id.
    subscriptions: HashMap<String, SubscriptionRecord>,
    user_plans: HashMap<EntityId, BillingPlan>,
}

/// In-memory subscription store.
///
/// Both tables sit behind one mutex, so a transition is applied entirely or
/// not at all.
#[derive(Debug, Clone, Default)]
pub struct InMemorySubscriptionStore {
    tables: Arc<Mutex<BillingTables>>,
    writes: Arc<AtomicU64>,
}

impl InMemorySubscriptionStore {
    pub fn new() -> Self {
        Self::default()
    }

    fn tables(&self) -> StorageResult<MutexGuard<'_, BillingTables>> {
        self.tables.lock().map_err(|_| StorageError::LockPoisoned)
    }

    /// Seed a row directly, bypassing the transition path.
    pub fn insert(&self, record: SubscriptionRecord) -> StorageResult<()> {
        let mut tables = self.tables()?;
        tables
            .subscriptions
            .insert(record.provider_subscription_id.clone(), record);
        Ok(())
    }

    pub fn subscriptions(&self) -> Vec<SubscriptionRecord> {
        self.tables
            .lock()
            .map(|t| t.subscriptions.values().cloned().collect())
            .unwrap_or_default()
    }

    pub fn user_plan(&self, user_id: EntityId) -> Option<BillingPlan> {
        self.tables
            .lock()
            .ok()
            .and_then(|t| t.user_plans.get(&user_id).copied())
    }

    /// Number of transitions applied.
    pub fn writes(&self) -> u64 {
        self.writes.load(Ordering::Relaxed)
    }
}

#[async_trait]
impl SubscriptionStore for InMemorySubscriptionStore {
    async fn find_by_provider_subscription_id(
        &self,
        provider_subscription_id: &str,
    ) -> StorageResult<Option<SubscriptionRecord>> {
        Ok(self
            .tables()?
            .subscriptions
            .get(provider_subscription_id)
            .cloned())
    }

    async fn find_by_provider_customer_id(
        &self,
        provider_customer_id: &str,
    ) -> StorageResult<Option<SubscriptionRecord>> {
        Ok(self
            .tables()?
            .subscriptions
            .values()
            .filter(|r| r.provider_customer_id.as_deref() == Some(provider_customer_id))
            .max_by_key(|r| r.updated_at)
            .cloned())
    }

    async fn apply_transition(
        &self,
        transition: &SubscriptionTransition,
    ) -> StorageResult<TransitionApplied> {
        let now = Utc::now();
        let mut tables = self.tables()?;

        let (record, created, previous_status) =
            match tables.subscriptions.get_mut(&transition.provider_subscription_id) {
                Some(existing) if !transition.supersedes(existing.status) => {
                    return Ok(TransitionApplied {
                        record: existing.clone(),
                        created: false,
                        written: false,
                        previous_status: Some(existing.status),
                    });
                }
                Some(existing) => {
                    let previous = existing.status;
                    existing.apply(transition, now);
                    (existing.clone(), false, Some(previous))
                }
                None => {
                    let record =
                        SubscriptionRecord::from_transition(new_entity_id(), transition, now);
                    tables
                        .subscriptions
                        .insert(record.provider_subscription_id.clone(), record.clone());
                    (record, true, None)
                }
            };
        tables
            .user_plans
            .insert(transition.user_id, transition.effective_plan());
        self.writes.fetch_add(1, Ordering::Relaxed);

        Ok(TransitionApplied {
            record,
            created,
            written: true,
            previous_status,
        })
    }
}

// ============================================================================
// EXPIRING RECORDS
// ============================================================================

/// In-memory expiring record tables.
#[derive(Debug, Clone, Default)]
pub struct InMemoryRecordStore {
    tables: Arc<Mutex<HashMap<RecordKind, HashMap<EntityId, Timestamp>>>>,
    delete_calls: Arc<AtomicU64>,
}

impl InMemoryRecordStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert(&self, kind: RecordKind, id: EntityId, expires_at: Timestamp) {
        if let Ok(mut tables) = self.tables.lock() {
            tables.entry(kind).or_default().insert(id, expires_at);
        }
    }

    /// Insert `count` records of `kind` expiring at `expires_at`.
    pub fn insert_many(&self, kind: RecordKind, count: usize, expires_at: Timestamp) {
        for _ in 0..count {
            self.insert(kind, new_entity_id(), expires_at);
        }
    }

    pub fn count(&self, kind: RecordKind) -> usize {
        self.tables
            .lock()
            .map(|t| t.get(&kind).map_or(0, HashMap::len))
            .unwrap_or(0)
    }

    pub fn count_expired(&self, kind: RecordKind, now: Timestamp) -> usize {
        self.tables
            .lock()
            .map(|t| {
                t.get(&kind)
                    .map_or(0, |rows| rows.values().filter(|e| **e < now).count())
            })
            .unwrap_or(0)
    }

    /// Number of `delete_by_ids` calls issued.
    pub fn delete_calls(&self) -> u64 {
        self.delete_calls.load(Ordering::Relaxed)
    }
}

#[async_trait]
impl ExpiringRecordStore for InMemoryRecordStore {
    async fn find_expired(
        &self,
        kind: RecordKind,
        now: Timestamp,
        limit: usize,
    ) -> StorageResult<Vec<EntityId>> {
        let tables = self.tables.lock().map_err(|_| StorageError::LockPoisoned)?;
        let Some(rows) = tables.get(&kind) else {
            return Ok(Vec::new());
        };
        let mut expired: Vec<(Timestamp, EntityId)> = rows
            .iter()
            .filter(|(_, expires_at)| **expires_at < now)
            .map(|(id, expires_at)| (*expires_at, *id))
            .collect();
        expired.sort();
        Ok(expired.into_iter().take(limit).map(|(_, id)| id).collect())
    }

    async fn delete_by_ids(&self, kind: RecordKind, ids: &[EntityId]) -> StorageResult<u64> {
        self.delete_calls.fetch_add(1, Ordering::Relaxed);
        let mut tables = self.tables.lock().map_err(|_| StorageError::LockPoisoned)?;
        let rows = tables.entry(kind).or_default();
        Ok(ids.iter().filter(|id| rows.remove(id).is_some()).count() as u64)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use keel_core::SubscriptionStatus;
    use uuid::Uuid;

    fn transition(status: SubscriptionStatus, event: &str) -> SubscriptionTransition {
        SubscriptionTransition {
            user_id: Uuid::from_u128(7),
            provider_subscription_id: "sub_1".to_string(),
            provider_customer_id: Some("cus_1".to_string()),
            plan: BillingPlan::Pro,
            status,
            current_period_end: None,
            cancel_at_period_end: false,
            source_event_id: event.to_string(),
        }
    }

    #[tokio::test]
    async fn test_apply_transition_upserts() {
        let store = InMemorySubscriptionStore::new();
        let first = store
            .apply_transition(&transition(SubscriptionStatus::Active, "evt_1"))
            .await
            .unwrap();
        assert!(first.created && first.written);
        assert_eq!(first.previous_status, None);

        let second = store
            .apply_transition(&transition(SubscriptionStatus::Canceled, "evt_2"))
            .await
            .unwrap();
        assert!(!second.created);
        assert_eq!(second.previous_status, Some(SubscriptionStatus::Active));
        assert_eq!(second.record.id, first.record.id);

        assert_eq!(store.subscriptions().len(), 1);
        assert_eq!(store.user_plan(Uuid::from_u128(7)), Some(BillingPlan::Free));
        assert_eq!(store.writes(), 2);
    }

    #[tokio::test]
    async fn test_canceled_row_rejects_later_transitions() {
        let store = InMemorySubscriptionStore::new();
        store
            .apply_transition(&transition(SubscriptionStatus::Canceled, "evt_2"))
            .await
            .unwrap();

        let late = store
            .apply_transition(&transition(SubscriptionStatus::Active, "evt_1"))
            .await
            .unwrap();

        assert!(!late.written);
        assert_eq!(late.record.status, SubscriptionStatus::Canceled);
        assert_eq!(late.record.last_event_id, "evt_2");
        assert_eq!(store.user_plan(Uuid::from_u128(7)), Some(BillingPlan::Free));
        assert_eq!(store.writes(), 1);
    }

    #[tokio::test]
    async fn test_find_by_customer_prefers_latest() {
        let store = InMemorySubscriptionStore::new();
        store
            .apply_transition(&transition(SubscriptionStatus::Active, "evt_1"))
            .await
            .unwrap();
        let found = store.find_by_provider_customer_id("cus_1").await.unwrap();
        assert_eq!(found.map(|r| r.provider_subscription_id), Some("sub_1".to_string()));
        assert!(store
            .find_by_provider_customer_id("cus_other")
            .await
            .unwrap()
            .is_none());
    }

    #[tokio::test]
    async fn test_find_expired_is_bounded_and_ordered() {
        let store = InMemoryRecordStore::new();
        let now = Utc::now();
        let oldest = Uuid::from_u128(1);
        store.insert(RecordKind::Session, oldest, now - chrono::Duration::hours(3));
        store.insert_many(RecordKind::Session, 4, now - chrono::Duration::hours(1));
        store.insert_many(RecordKind::Session, 2, now + chrono::Duration::hours(1));

        let batch = store.find_expired(RecordKind::Session, now, 3).await.unwrap();
        assert_eq!(batch.len(), 3);
        assert_eq!(batch[0], oldest);
        assert!(store
            .find_expired(RecordKind::CsrfToken, now, 3)
            .await
            .unwrap()
            .is_empty());
    }

    #[tokio::test]
    async fn test_delete_by_ids_counts_removed_rows() {
        let store = InMemoryRecordStore::new();
        let now = Utc::now();
        let id = Uuid::from_u128(9);
        store.insert(RecordKind::PasswordReset, id, now);
        let removed = store
            .delete_by_ids(RecordKind::PasswordReset, &[id, Uuid::from_u128(10)])
            .await
            .unwrap();
        assert_eq!(removed, 1);
        assert_eq!(store.count(RecordKind::PasswordReset), 0);
        assert_eq!(store.delete_calls(), 1);
    }
}
