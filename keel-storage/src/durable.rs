//! Durable store seams.
//!
//! The coordination layer reads the relational store only to recover event
//! correlation and to find expired records. It writes to it in exactly two
//! places: the atomic subscription transition and the by-id batch delete.

use async_trait::async_trait;
use keel_core::{
    EntityId, RecordKind, StorageError, SubscriptionRecord, SubscriptionTransition, Timestamp,
    TransitionApplied,
};

/// Result type alias for durable store operations.
pub type StorageResult<T> = Result<T, StorageError>;

/// Subscription rows keyed by the billing provider's subscription id.
#[async_trait]
pub trait SubscriptionStore: Send + Sync {
    async fn find_by_provider_subscription_id(
        &self,
        provider_subscription_id: &str,
    ) -> StorageResult<Option<SubscriptionRecord>>;

    /// Most recently updated row for a provider customer.
    async fn find_by_provider_customer_id(
        &self,
        provider_customer_id: &str,
    ) -> StorageResult<Option<SubscriptionRecord>>;

    /// Upsert the subscription row and update the user's plan as one atomic
    /// write. Replaying the same transition converges on the same state.
    async fn apply_transition(
        &self,
        transition: &SubscriptionTransition,
    ) -> StorageResult<TransitionApplied>;
}

/// Tables of records carrying an `expires_at` column.
#[async_trait]
pub trait ExpiringRecordStore: Send + Sync {
    /// Up to `limit` ids with `expires_at < now`, oldest first.
    async fn find_expired(
        &self,
        kind: RecordKind,
        now: Timestamp,
        limit: usize,
    ) -> StorageResult<Vec<EntityId>>;

    /// Delete exactly `ids`. Returns the number of rows removed.
    async fn delete_by_ids(&self, kind: RecordKind, ids: &[EntityId]) -> StorageResult<u64>;
}
