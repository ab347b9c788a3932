//! KEEL Test Utilities
//!
//! Centralized test infrastructure for the KEEL workspace:
//! - Fault-injecting store doubles
//! - Proptest generators
//! - Event and record fixtures
//! - Custom assertions for lock outcomes and errors

pub use keel_core::{
    BillingPlan, EventKind, ExternalEvent, KeelError, KeelResult, LockConfig, LockError,
    RecordKind, StoreError, StoreResult, SubscriptionRecord, SubscriptionStatus,
    SubscriptionTransition, Timestamp,
};
pub use keel_storage::{
    CacheBackend, ExpiringRecordStore, InMemoryRecordStore, InMemorySubscriptionStore,
    LeaseStore, MemoryCacheBackend, MemoryLeaseStore, StorageResult,
};

use async_trait::async_trait;
use keel_core::{EntityId, StorageError};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::time::Duration;

// ============================================================================
// STORE DOUBLES
// ============================================================================

/// Lease store that is never reachable.
#[derive(Debug, Clone, Default)]
pub struct UnreachableLeaseStore;

impl UnreachableLeaseStore {
    fn err() -> StoreError {
        StoreError::Unavailable {
            reason: "connection refused".to_string(),
        }
    }
}

#[async_trait]
impl LeaseStore for UnreachableLeaseStore {
    fn name(&self) -> &str {
        "unreachable"
    }

    async fn ping(&self) -> StoreResult<()> {
        Err(Self::err())
    }

    async fn set_if_absent(&self, _key: &str, _value: &str, _ttl: Duration) -> StoreResult<bool> {
        Err(Self::err())
    }

    async fn exists(&self, _key: &str) -> StoreResult<bool> {
        Err(Self::err())
    }

    async fn delete(&self, _key: &str) -> StoreResult<()> {
        Err(Self::err())
    }

    async fn extend(&self, _key: &str, _owner: &str, _ttl: Duration) -> StoreResult<bool> {
        Err(Self::err())
    }

    async fn compare_and_delete(&self, _key: &str, _owner: &str) -> StoreResult<bool> {
        Err(Self::err())
    }
}

/// Memory lease store with switchable faults and call counters.
///
/// `ping` always succeeds, so faults surface mid-operation rather than in
/// the up-front availability check.
#[derive(Debug, Default)]
pub struct FaultyLeaseStore {
    inner: MemoryLeaseStore,
    pub fail_acquire: AtomicBool,
    pub fail_release: AtomicBool,
    pub fail_extend: AtomicBool,
    pub acquire_calls: AtomicU64,
    pub release_calls: AtomicU64,
    pub extend_calls: AtomicU64,
}

impl FaultyLeaseStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Wrap an existing store so several doubles can share its keys.
    pub fn wrapping(inner: MemoryLeaseStore) -> Self {
        Self {
            inner,
            ..Default::default()
        }
    }

    pub fn inner(&self) -> &MemoryLeaseStore {
        &self.inner
    }

    fn backend_err(op: &str) -> StoreError {
        StoreError::Backend {
            reason: format!("injected {op} failure"),
        }
    }
}

#[async_trait]
impl LeaseStore for FaultyLeaseStore {
    fn name(&self) -> &str {
        "faulty"
    }

    async fn ping(&self) -> StoreResult<()> {
        Ok(())
    }

    async fn set_if_absent(&self, key: &str, value: &str, ttl: Duration) -> StoreResult<bool> {
        self.acquire_calls.fetch_add(1, Ordering::SeqCst);
        if self.fail_acquire.load(Ordering::SeqCst) {
            return Err(Self::backend_err("set"));
        }
        self.inner.set_if_absent(key, value, ttl).await
    }

    async fn exists(&self, key: &str) -> StoreResult<bool> {
        self.inner.exists(key).await
    }

    async fn delete(&self, key: &str) -> StoreResult<()> {
        self.inner.delete(key).await
    }

    async fn extend(&self, key: &str, owner: &str, ttl: Duration) -> StoreResult<bool> {
        self.extend_calls.fetch_add(1, Ordering::SeqCst);
        if self.fail_extend.load(Ordering::SeqCst) {
            return Err(Self::backend_err("extend"));
        }
        self.inner.extend(key, owner, ttl).await
    }

    async fn compare_and_delete(&self, key: &str, owner: &str) -> StoreResult<bool> {
        self.release_calls.fetch_add(1, Ordering::SeqCst);
        if self.fail_release.load(Ordering::SeqCst) {
            return Err(Self::backend_err("release"));
        }
        self.inner.compare_and_delete(key, owner).await
    }
}

/// Cache backend where every operation fails.
#[derive(Debug, Clone, Default)]
pub struct FailingCacheBackend;

#[async_trait]
impl CacheBackend for FailingCacheBackend {
    async fn get(&self, _key: &str) -> StoreResult<Option<String>> {
        Err(StoreError::Unavailable {
            reason: "cache down".to_string(),
        })
    }

    async fn put(&self, _key: &str, _value: String, _ttl: Duration) -> StoreResult<()> {
        Err(StoreError::Unavailable {
            reason: "cache down".to_string(),
        })
    }

    async fn delete(&self, _key: &str) -> StoreResult<()> {
        Err(StoreError::Unavailable {
            reason: "cache down".to_string(),
        })
    }
}

/// Record store whose `delete_by_ids` fails on one chosen call (1-based).
#[derive(Debug, Default)]
pub struct FailingRecordStore {
    inner: InMemoryRecordStore,
    fail_on_delete_call: u64,
    delete_calls: AtomicU64,
    pub fail_fetch: AtomicBool,
}

impl FailingRecordStore {
    pub fn new(inner: InMemoryRecordStore, fail_on_delete_call: u64) -> Self {
        Self {
            inner,
            fail_on_delete_call,
            delete_calls: AtomicU64::new(0),
            fail_fetch: AtomicBool::new(false),
        }
    }

    pub fn inner(&self) -> &InMemoryRecordStore {
        &self.inner
    }
}

#[async_trait]
impl ExpiringRecordStore for FailingRecordStore {
    async fn find_expired(
        &self,
        kind: RecordKind,
        now: Timestamp,
        limit: usize,
    ) -> StorageResult<Vec<EntityId>> {
        if self.fail_fetch.load(Ordering::SeqCst) {
            return Err(StorageError::Unavailable {
                reason: "injected fetch failure".to_string(),
            });
        }
        self.inner.find_expired(kind, now, limit).await
    }

    async fn delete_by_ids(&self, kind: RecordKind, ids: &[EntityId]) -> StorageResult<u64> {
        let call = self.delete_calls.fetch_add(1, Ordering::SeqCst) + 1;
        if call == self.fail_on_delete_call {
            return Err(StorageError::TransactionFailed {
                reason: "injected delete failure".to_string(),
            });
        }
        self.inner.delete_by_ids(kind, ids).await
    }
}

// ============================================================================
// PROPTEST GENERATORS
// ============================================================================

pub mod generators {
    //! Proptest strategies for KEEL types.

    use super::*;
    use proptest::prelude::*;
    use uuid::Uuid;

    pub fn arb_uuid() -> impl Strategy<Value = Uuid> {
        any::<[u8; 16]>().prop_map(Uuid::from_bytes)
    }

    pub fn arb_record_kind() -> impl Strategy<Value = RecordKind> {
        prop_oneof![
            Just(RecordKind::Session),
            Just(RecordKind::EmailVerification),
            Just(RecordKind::PasswordReset),
            Just(RecordKind::CsrfToken),
        ]
    }

    pub fn arb_billing_plan() -> impl Strategy<Value = BillingPlan> {
        prop_oneof![
            Just(BillingPlan::Free),
            Just(BillingPlan::Pro),
            Just(BillingPlan::Enterprise),
        ]
    }

    /// Provider status strings, mapped and unmapped.
    pub fn arb_provider_status() -> impl Strategy<Value = String> {
        prop_oneof![
            Just("active".to_string()),
            Just("trialing".to_string()),
            Just("past_due".to_string()),
            Just("canceled".to_string()),
            Just("unpaid".to_string()),
            Just("incomplete".to_string()),
            Just("incomplete_expired".to_string()),
            "[a-z_]{0,16}",
        ]
    }

    /// Logical lock names as callers write them.
    pub fn arb_lock_name() -> impl Strategy<Value = String> {
        "[a-z]{1,8}(-[a-z0-9]{1,8}){0,2}"
    }
}

// ============================================================================
// TEST FIXTURES
// ============================================================================

pub mod fixtures {
    //! Pre-built events and configs.

    use super::*;
    use serde_json::{json, Value};

    /// Lock config with short backoff so contention tests finish quickly.
    ///
    /// Worst-case retry window is 3 * (10ms + 10ms) = 60ms.
    pub fn fast_lock_config() -> LockConfig {
        LockConfig::default()
            .with_retry_count(3)
            .with_retry_delay(Duration::from_millis(10), Duration::from_millis(10))
    }

    /// Valid correlation metadata for `user_id`.
    pub fn metadata(user_id: EntityId, plan: BillingPlan) -> Value {
        json!({ "user_id": user_id.to_string(), "plan": plan.as_str() })
    }

    /// Provider envelope for a subscription event.
    pub fn subscription_envelope(
        event_id: &str,
        event_type: &str,
        subscription_id: &str,
        customer_id: &str,
        status: &str,
        price_id: Option<&str>,
        metadata: Option<Value>,
    ) -> Vec<u8> {
        let mut object = json!({
            "id": subscription_id,
            "customer": customer_id,
            "status": status,
            "cancel_at_period_end": false,
            "current_period_end": 1_767_225_600,
        });
        if let Some(price) = price_id {
            object["items"] = json!({ "data": [ { "price": { "id": price } } ] });
        }
        if let Some(meta) = metadata {
            object["metadata"] = meta;
        }
        let body = json!({ "id": event_id, "type": event_type, "data": { "object": object } });
        serde_json::to_vec(&body).unwrap_or_default()
    }

    /// Decoded `customer.subscription.updated` event.
    pub fn subscription_updated(
        event_id: &str,
        subscription_id: &str,
        customer_id: &str,
        status: &str,
        price_id: Option<&str>,
        metadata: Option<Value>,
    ) -> ExternalEvent {
        let body = subscription_envelope(
            event_id,
            "customer.subscription.updated",
            subscription_id,
            customer_id,
            status,
            price_id,
            metadata,
        );
        decode(&body)
    }

    /// Decoded `customer.subscription.deleted` event.
    pub fn subscription_deleted(
        event_id: &str,
        subscription_id: &str,
        customer_id: &str,
        metadata: Option<Value>,
    ) -> ExternalEvent {
        let body = subscription_envelope(
            event_id,
            "customer.subscription.deleted",
            subscription_id,
            customer_id,
            "canceled",
            None,
            metadata,
        );
        decode(&body)
    }

    /// Decoded `checkout.session.completed` event.
    pub fn checkout_completed(
        event_id: &str,
        subscription_id: &str,
        customer_id: &str,
        metadata: Option<Value>,
    ) -> ExternalEvent {
        let mut object = json!({
            "id": format!("cs_{event_id}"),
            "customer": customer_id,
            "subscription": subscription_id,
        });
        if let Some(meta) = metadata {
            object["metadata"] = meta;
        }
        let body = json!({
            "id": event_id,
            "type": "checkout.session.completed",
            "data": { "object": object }
        });
        decode(&serde_json::to_vec(&body).unwrap_or_default())
    }

    /// Decoded `invoice.payment_failed` event.
    pub fn invoice_payment_failed(
        event_id: &str,
        subscription_id: Option<&str>,
        customer_id: &str,
    ) -> ExternalEvent {
        let body = json!({
            "id": event_id,
            "type": "invoice.payment_failed",
            "data": { "object": {
                "id": format!("in_{event_id}"),
                "customer": customer_id,
                "subscription": subscription_id,
            } }
        });
        decode(&serde_json::to_vec(&body).unwrap_or_default())
    }

    #[track_caller]
    fn decode(body: &[u8]) -> ExternalEvent {
        match ExternalEvent::from_envelope(body) {
            Ok(event) => event,
            Err(err) => panic!("fixture envelope failed to decode: {err}"),
        }
    }
}

// ============================================================================
// CUSTOM ASSERTIONS
// ============================================================================

pub mod assertions {
    //! Assertions for KEEL results.

    use super::*;

    /// Assert that a KeelResult is Ok.
    #[track_caller]
    pub fn assert_ok<T: std::fmt::Debug>(result: &KeelResult<T>) {
        assert!(result.is_ok(), "Expected Ok, got Err: {:?}", result);
    }

    /// Assert that a KeelResult is a lock acquisition failure.
    #[track_caller]
    pub fn assert_acquire_failed<T: std::fmt::Debug>(result: &KeelResult<T>) {
        match result {
            Err(KeelError::Lock(LockError::AcquireFailed { .. })) => {}
            other => panic!("Expected AcquireFailed, got: {:?}", other),
        }
    }

    /// Assert that a KeelResult failed with an unrecoverable correlation.
    #[track_caller]
    pub fn assert_correlation_unrecoverable<T: std::fmt::Debug>(result: &KeelResult<T>) {
        match result {
            Err(err) if err.is_correlation_unrecoverable() => {}
            other => panic!("Expected CorrelationUnrecoverable, got: {:?}", other),
        }
    }
}

// ============================================================================
// TESTS
// ============================================================================
