//! Billing event processing against in-memory stores.

use async_trait::async_trait;
use chrono::Utc;
use keel_coord::{LockCoordinator, ReadThroughCache};
use keel_core::{BillingPlan, KeelError, KeelResult, SubscriptionRecord, SubscriptionStatus};
use keel_storage::{CacheBackend, InMemorySubscriptionStore, MemoryCacheBackend};
use keel_test_utils::assertions::assert_correlation_unrecoverable;
use keel_test_utils::{fixtures, FailingCacheBackend};
use keel_worker::{AlertSink, EventProcessor, Notifier, OperatorAlert, PriceTable, ProcessOutcome};
use serde_json::json;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use uuid::Uuid;

#[derive(Default)]
struct RecordingNotifier {
    sent: Mutex<Vec<SubscriptionRecord>>,
    fail: bool,
    calls: AtomicU64,
}

impl RecordingNotifier {
    fn failing() -> Self {
        Self {
            fail: true,
            ..Self::default()
        }
    }
}

#[async_trait]
impl Notifier for RecordingNotifier {
    async fn subscription_created(&self, record: &SubscriptionRecord) -> KeelResult<()> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        if self.fail {
            return Err(KeelError::operation("mail relay down"));
        }
        self.sent.lock().unwrap().push(record.clone());
        Ok(())
    }
}

#[derive(Default)]
struct RecordingAlertSink {
    alerts: Mutex<Vec<OperatorAlert>>,
}

#[async_trait]
impl AlertSink for RecordingAlertSink {
    async fn alert(&self, alert: OperatorAlert) {
        self.alerts.lock().unwrap().push(alert);
    }
}

struct Harness {
    store: Arc<InMemorySubscriptionStore>,
    cache: Arc<ReadThroughCache<MemoryCacheBackend>>,
    notifier: Arc<RecordingNotifier>,
    alerts: Arc<RecordingAlertSink>,
    processor: EventProcessor,
}

fn harness_with(notifier: RecordingNotifier) -> Harness {
    let store = Arc::new(InMemorySubscriptionStore::new());
    let cache = Arc::new(ReadThroughCache::with_defaults(
        Arc::new(MemoryCacheBackend::new()),
        LockCoordinator::unprotected(),
    ));
    let notifier = Arc::new(notifier);
    let alerts = Arc::new(RecordingAlertSink::default());
    let prices = PriceTable::new()
        .with_price("price_pro", BillingPlan::Pro)
        .with_price("price_ent", BillingPlan::Enterprise);
    let processor = EventProcessor::new(store.clone(), cache.clone())
        .with_plan_resolver(Arc::new(prices))
        .with_notifier(notifier.clone())
        .with_alert_sink(alerts.clone());
    Harness {
        store,
        cache,
        notifier,
        alerts,
        processor,
    }
}

fn harness() -> Harness {
    harness_with(RecordingNotifier::default())
}

/// Wait for spawned notification tasks to reach the notifier.
async fn wait_for_calls(notifier: &RecordingNotifier, expected: u64) {
    for _ in 0..100 {
        if notifier.calls.load(Ordering::SeqCst) >= expected {
            return;
        }
        tokio::time::sleep(Duration::from_millis(5)).await;
    }
}

#[tokio::test]
async fn test_replayed_event_converges() {
    let h = harness();
    let user_id = Uuid::now_v7();
    let event = fixtures::subscription_updated(
        "evt_1",
        "sub_1",
        "cus_1",
        "active",
        Some("price_pro"),
        Some(fixtures::metadata(user_id, BillingPlan::Pro)),
    );

    let first = h.processor.process(&event).await.unwrap();
    let after_first = h.store.subscriptions();
    let second = h.processor.process(&event).await.unwrap();
    let after_second = h.store.subscriptions();

    assert_eq!(
        first,
        ProcessOutcome::Applied {
            user_id,
            status: SubscriptionStatus::Active,
            created: true
        }
    );
    assert_eq!(
        second,
        ProcessOutcome::Applied {
            user_id,
            status: SubscriptionStatus::Active,
            created: false
        }
    );
    assert_eq!(after_second.len(), 1);
    assert_eq!(after_first[0].id, after_second[0].id);
    assert_eq!(after_first[0].status, after_second[0].status);
    assert_eq!(after_first[0].plan, after_second[0].plan);
    assert_eq!(h.store.user_plan(user_id), Some(BillingPlan::Pro));

    wait_for_calls(&h.notifier, 1).await;
    tokio::time::sleep(Duration::from_millis(20)).await;
    assert_eq!(h.notifier.calls.load(Ordering::SeqCst), 1);
    assert_eq!(h.notifier.sent.lock().unwrap()[0].user_id, user_id);
}

#[tokio::test]
async fn test_recovers_user_from_subscription_row() {
    let h = harness();
    let user_id = Uuid::now_v7();
    let created = fixtures::subscription_updated(
        "evt_1",
        "sub_1",
        "cus_1",
        "active",
        Some("price_pro"),
        Some(fixtures::metadata(user_id, BillingPlan::Pro)),
    );
    h.processor.process(&created).await.unwrap();

    // Same subscription, metadata stripped.
    let later = fixtures::subscription_updated("evt_2", "sub_1", "cus_1", "past_due", None, None);
    let outcome = h.processor.process(&later).await.unwrap();

    assert_eq!(
        outcome,
        ProcessOutcome::Applied {
            user_id,
            status: SubscriptionStatus::PastDue,
            created: false
        }
    );
    assert_eq!(h.store.subscriptions()[0].plan, BillingPlan::Pro);
    assert!(h.alerts.alerts.lock().unwrap().is_empty());
}

#[tokio::test]
async fn test_recovers_user_from_customer_row() {
    let h = harness();
    let user_id = Uuid::now_v7();
    let created = fixtures::subscription_updated(
        "evt_1",
        "sub_1",
        "cus_1",
        "active",
        Some("price_ent"),
        Some(fixtures::metadata(user_id, BillingPlan::Enterprise)),
    );
    h.processor.process(&created).await.unwrap();

    let failed = fixtures::invoice_payment_failed("evt_2", Some("sub_2"), "cus_1");
    let outcome = h.processor.process(&failed).await.unwrap();

    assert_eq!(
        outcome,
        ProcessOutcome::Applied {
            user_id,
            status: SubscriptionStatus::PastDue,
            created: true
        }
    );
    let rows = h.store.subscriptions();
    assert_eq!(rows.len(), 2);
    assert!(rows.iter().all(|r| r.user_id == user_id));
}

#[tokio::test]
async fn test_invalid_metadata_recovered_from_row() {
    let h = harness();
    let user_id = Uuid::now_v7();
    let created = fixtures::subscription_updated(
        "evt_1",
        "sub_1",
        "cus_1",
        "active",
        None,
        Some(fixtures::metadata(user_id, BillingPlan::Pro)),
    );
    h.processor.process(&created).await.unwrap();

    let tampered = fixtures::subscription_updated(
        "evt_2",
        "sub_1",
        "cus_1",
        "active",
        None,
        Some(json!({ "user_id": "not-a-uuid" })),
    );
    let outcome = h.processor.process(&tampered).await.unwrap();
    assert!(matches!(outcome, ProcessOutcome::Applied { user_id: u, .. } if u == user_id));
}

#[tokio::test]
async fn test_unrecoverable_correlation_alerts_and_fails() {
    let h = harness();
    let event = fixtures::subscription_updated("evt_9", "sub_9", "cus_9", "active", None, None);

    let result = h.processor.process(&event).await;

    assert_correlation_unrecoverable(&result);
    assert_eq!(h.store.writes(), 0);
    let alerts = h.alerts.alerts.lock().unwrap();
    assert_eq!(alerts.len(), 1);
    assert_eq!(alerts[0].event_id, "evt_9");
    assert_eq!(alerts[0].event_type, "customer.subscription.updated");
}

#[tokio::test]
async fn test_notification_failure_does_not_fail_event() {
    let h = harness_with(RecordingNotifier::failing());
    let user_id = Uuid::now_v7();
    let event = fixtures::checkout_completed(
        "evt_1",
        "sub_1",
        "cus_1",
        Some(fixtures::metadata(user_id, BillingPlan::Pro)),
    );

    let outcome = h.processor.process(&event).await.unwrap();

    assert!(matches!(outcome, ProcessOutcome::Applied { created: true, .. }));
    assert_eq!(h.store.subscriptions()[0].status, SubscriptionStatus::Active);
    wait_for_calls(&h.notifier, 1).await;
    assert_eq!(h.notifier.calls.load(Ordering::SeqCst), 1);
    assert!(h.notifier.sent.lock().unwrap().is_empty());
}

#[tokio::test]
async fn test_cached_plan_invalidated_after_transition() {
    let h = harness();
    let user_id = Uuid::now_v7();
    let key = format!("user-plan:{user_id}");
    h.cache
        .backend()
        .put(&key, "\"free\"".to_string(), Duration::from_secs(300))
        .await
        .unwrap();

    let event = fixtures::subscription_updated(
        "evt_1",
        "sub_1",
        "cus_1",
        "active",
        Some("price_pro"),
        Some(fixtures::metadata(user_id, BillingPlan::Pro)),
    );
    h.processor.process(&event).await.unwrap();

    assert_eq!(h.cache.backend().get(&key).await.unwrap(), None);
    let plan: BillingPlan = h
        .cache
        .get_or_compute(&key, Duration::from_secs(300), || async {
            Ok(h.store.user_plan(user_id).unwrap_or_default())
        })
        .await
        .unwrap();
    assert_eq!(plan, BillingPlan::Pro);
}

#[tokio::test]
async fn test_cache_outage_does_not_fail_event() {
    let store = Arc::new(InMemorySubscriptionStore::new());
    let cache = Arc::new(ReadThroughCache::with_defaults(
        Arc::new(FailingCacheBackend),
        LockCoordinator::unprotected(),
    ));
    let processor = EventProcessor::new(store.clone(), cache);
    let user_id = Uuid::now_v7();
    let event = fixtures::subscription_updated(
        "evt_1",
        "sub_1",
        "cus_1",
        "active",
        None,
        Some(fixtures::metadata(user_id, BillingPlan::Pro)),
    );

    let outcome = processor.process(&event).await.unwrap();
    assert!(matches!(outcome, ProcessOutcome::Applied { .. }));
    assert_eq!(store.writes(), 1);
}

#[tokio::test]
async fn test_status_mapping_drives_effective_plan() {
    let cases = [
        ("active", SubscriptionStatus::Active, BillingPlan::Pro),
        ("trialing", SubscriptionStatus::Trialing, BillingPlan::Pro),
        ("past_due", SubscriptionStatus::PastDue, BillingPlan::Pro),
        ("unpaid", SubscriptionStatus::Unpaid, BillingPlan::Free),
        ("incomplete_expired", SubscriptionStatus::Canceled, BillingPlan::Free),
        ("paused", SubscriptionStatus::Inactive, BillingPlan::Free),
    ];

    for (i, (provider_status, status, effective)) in cases.into_iter().enumerate() {
        let h = harness();
        let user_id = Uuid::now_v7();
        let event = fixtures::subscription_updated(
            &format!("evt_{i}"),
            &format!("sub_{i}"),
            "cus_1",
            provider_status,
            Some("price_pro"),
            Some(fixtures::metadata(user_id, BillingPlan::Pro)),
        );
        let outcome = h.processor.process(&event).await.unwrap();
        assert!(
            matches!(outcome, ProcessOutcome::Applied { status: s, .. } if s == status),
            "{provider_status}"
        );
        assert_eq!(h.store.user_plan(user_id), Some(effective), "{provider_status}");
    }
}

#[tokio::test]
async fn test_late_update_cannot_revive_canceled_subscription() {
    let h = harness();
    let user_id = Uuid::now_v7();
    let meta = fixtures::metadata(user_id, BillingPlan::Pro);

    let deleted = fixtures::subscription_deleted("evt_2", "sub_1", "cus_1", Some(meta.clone()));
    h.processor.process(&deleted).await.unwrap();

    // The update was sent first but arrives after the deletion.
    let updated = fixtures::subscription_updated(
        "evt_1",
        "sub_1",
        "cus_1",
        "active",
        Some("price_pro"),
        Some(meta),
    );
    let outcome = h.processor.process(&updated).await.unwrap();

    assert_eq!(
        outcome,
        ProcessOutcome::Stale {
            user_id,
            status: SubscriptionStatus::Canceled
        }
    );
    let record = &h.store.subscriptions()[0];
    assert_eq!(record.status, SubscriptionStatus::Canceled);
    assert_eq!(record.last_event_id, "evt_2");
    assert!(record.updated_at <= Utc::now());
    assert_eq!(h.store.user_plan(user_id), Some(BillingPlan::Free));
    assert_eq!(h.store.writes(), 1);
}

#[tokio::test]
async fn test_late_payment_failure_leaves_canceled_subscription() {
    let h = harness();
    let user_id = Uuid::now_v7();
    let deleted = fixtures::subscription_deleted(
        "evt_3",
        "sub_1",
        "cus_1",
        Some(fixtures::metadata(user_id, BillingPlan::Pro)),
    );
    h.processor.process(&deleted).await.unwrap();

    let failed = fixtures::invoice_payment_failed("evt_2", Some("sub_1"), "cus_1");
    let outcome = h.processor.process(&failed).await.unwrap();

    assert_eq!(outcome.as_str(), "stale");
    assert_eq!(h.store.subscriptions()[0].status, SubscriptionStatus::Canceled);
    assert_eq!(h.store.user_plan(user_id), Some(BillingPlan::Free));
}

#[tokio::test]
async fn test_no_confirmation_for_rows_first_seen_canceled_or_failing() {
    let h = harness();
    let user_id = Uuid::now_v7();
    let meta = fixtures::metadata(user_id, BillingPlan::Pro);

    let deleted = fixtures::subscription_deleted("evt_1", "sub_1", "cus_1", Some(meta.clone()));
    let outcome = h.processor.process(&deleted).await.unwrap();
    assert!(matches!(outcome, ProcessOutcome::Applied { created: true, .. }));

    // Seeds the customer row so the invoice below can be correlated.
    let updated =
        fixtures::subscription_updated("evt_2", "sub_2", "cus_2", "unpaid", None, Some(meta));
    h.processor.process(&updated).await.unwrap();

    let failed = fixtures::invoice_payment_failed("evt_3", Some("sub_3"), "cus_2");
    let outcome = h.processor.process(&failed).await.unwrap();
    assert!(matches!(outcome, ProcessOutcome::Applied { created: true, .. }));

    tokio::time::sleep(Duration::from_millis(50)).await;
    assert_eq!(h.notifier.calls.load(Ordering::SeqCst), 0);
}
