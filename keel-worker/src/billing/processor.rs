//! Idempotent processing of billing provider events.

use super::{
    AlertSink, LogAlertSink, LogNotifier, Notifier, OperatorAlert, PlanResolver, PriceTable,
};
use crate::constants::{SUBSCRIPTION_CACHE_PREFIX, USER_PLAN_CACHE_PREFIX};
use keel_coord::CacheInvalidator;
use keel_core::{
    BillingPlan, EntityId, EventError, EventKind, ExternalEvent, KeelError, KeelResult,
    SubscriptionMetadata, SubscriptionRecord, SubscriptionStatus, SubscriptionTransition,
};
use keel_storage::SubscriptionStore;
use std::sync::Arc;
use std::time::Instant;

/// What processing an event did.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ProcessOutcome {
    /// A transition was written.
    Applied {
        user_id: EntityId,
        status: SubscriptionStatus,
        /// The subscription row did not exist before this event.
        created: bool,
    },
    /// The subscription was already canceled; the late event was dropped.
    Stale {
        user_id: EntityId,
        status: SubscriptionStatus,
    },
    /// Acknowledged without a state change.
    Ignored { event_type: String },
}

impl ProcessOutcome {
    pub fn as_str(&self) -> &'static str {
        match self {
            ProcessOutcome::Applied { created: true, .. } => "created",
            ProcessOutcome::Applied { created: false, .. } => "updated",
            ProcessOutcome::Stale { .. } => "stale",
            ProcessOutcome::Ignored { .. } => "ignored",
        }
    }
}

/// Who the event belongs to.
struct Correlation {
    user_id: EntityId,
    plan: Option<BillingPlan>,
    /// Row already on file for the event's subscription id, if any.
    existing: Option<SubscriptionRecord>,
}

/// Applies billing events to the subscription store.
///
/// Each event becomes exactly one [`SubscriptionTransition`] written through
/// [`SubscriptionStore::apply_transition`]. The transition is computed only
/// from the event and the row on file, so a replayed delivery writes the
/// same target state again and leaves the store unchanged.
#[derive(Clone)]
pub struct EventProcessor {
    subscriptions: Arc<dyn SubscriptionStore>,
    plans: Arc<dyn PlanResolver>,
    cache: Arc<dyn CacheInvalidator>,
    notifier: Arc<dyn Notifier>,
    alerts: Arc<dyn AlertSink>,
}

impl EventProcessor {
    pub fn new(
        subscriptions: Arc<dyn SubscriptionStore>,
        cache: Arc<dyn CacheInvalidator>,
    ) -> Self {
        Self {
            subscriptions,
            plans: Arc::new(PriceTable::default()),
            cache,
            notifier: Arc::new(LogNotifier),
            alerts: Arc::new(LogAlertSink),
        }
    }

    pub fn with_plan_resolver(mut self, plans: Arc<dyn PlanResolver>) -> Self {
        self.plans = plans;
        self
    }

    pub fn with_notifier(mut self, notifier: Arc<dyn Notifier>) -> Self {
        self.notifier = notifier;
        self
    }

    pub fn with_alert_sink(mut self, alerts: Arc<dyn AlertSink>) -> Self {
        self.alerts = alerts;
        self
    }

    /// Decode a raw provider envelope and process it.
    pub async fn process_envelope(&self, body: &[u8]) -> KeelResult<ProcessOutcome> {
        let event = ExternalEvent::from_envelope(body)?;
        self.process(&event).await
    }

    /// Process one delivery. Safe to call again with the same event.
    pub async fn process(&self, event: &ExternalEvent) -> KeelResult<ProcessOutcome> {
        let started = Instant::now();
        let result = self.apply(event).await;
        let duration_ms = started.elapsed().as_millis() as u64;

        match &result {
            Ok(outcome) => tracing::info!(
                operation = "process_event",
                event_id = %event.event_id,
                event_type = %event.event_type(),
                outcome = outcome.as_str(),
                duration_ms,
                "Billing event processed"
            ),
            Err(e) => tracing::error!(
                operation = "process_event",
                event_id = %event.event_id,
                event_type = %event.event_type(),
                outcome = "failed",
                duration_ms,
                error = %e,
                "Billing event failed"
            ),
        }
        result
    }

    async fn apply(&self, event: &ExternalEvent) -> KeelResult<ProcessOutcome> {
        let Some(provider_subscription_id) = subscription_key(event) else {
            return Ok(ProcessOutcome::Ignored {
                event_type: event.event_type().to_string(),
            });
        };

        let correlation = self.correlate(event, provider_subscription_id).await?;
        let transition = self.transition_for(event, provider_subscription_id, &correlation);
        let applied = self.subscriptions.apply_transition(&transition).await?;

        if !applied.written {
            tracing::info!(
                event_id = %event.event_id,
                user_id = %applied.record.user_id,
                status = %applied.record.status,
                "Subscription already canceled, dropping late event"
            );
            return Ok(ProcessOutcome::Stale {
                user_id: applied.record.user_id,
                status: applied.record.status,
            });
        }

        if let Some(previous) = applied.previous_status {
            if previous != applied.record.status {
                tracing::info!(
                    user_id = %applied.record.user_id,
                    from = %previous,
                    to = %applied.record.status,
                    "Subscription status changed"
                );
            }
        }

        self.invalidate_user(applied.record.user_id).await;
        if applied.created && confirms_subscription(&event.kind, applied.record.status) {
            self.notify(applied.record.clone());
        }

        Ok(ProcessOutcome::Applied {
            user_id: applied.record.user_id,
            status: applied.record.status,
            created: applied.created,
        })
    }

    /// Resolve the owning user from metadata, falling back to the row on
    /// file when the metadata is missing or invalid.
    async fn correlate(
        &self,
        event: &ExternalEvent,
        provider_subscription_id: &str,
    ) -> KeelResult<Correlation> {
        let existing = self
            .subscriptions
            .find_by_provider_subscription_id(provider_subscription_id)
            .await?;

        let parsed = SubscriptionMetadata::parse(&event.event_id, event.metadata.as_ref());
        let metadata_error = match parsed {
            Ok(metadata) => {
                return Ok(Correlation {
                    user_id: metadata.user_id,
                    plan: metadata.plan,
                    existing,
                })
            }
            Err(e) => e,
        };

        tracing::warn!(
            event_id = %event.event_id,
            error = %metadata_error,
            "Event metadata unusable, recovering correlation from stored subscription"
        );

        let recovered = match &existing {
            Some(record) => Some(record.clone()),
            None => match event.provider_customer_id() {
                Some(customer_id) => {
                    self.subscriptions
                        .find_by_provider_customer_id(customer_id)
                        .await?
                }
                None => None,
            },
        };

        match recovered {
            Some(record) => {
                tracing::info!(
                    event_id = %event.event_id,
                    user_id = %record.user_id,
                    via = if existing.is_some() { "subscription" } else { "customer" },
                    "Correlation recovered"
                );
                Ok(Correlation {
                    user_id: record.user_id,
                    plan: Some(record.plan),
                    existing,
                })
            }
            None => {
                let reason = format!(
                    "{}; no stored subscription for {} or customer {}",
                    metadata_error,
                    provider_subscription_id,
                    event.provider_customer_id().unwrap_or("<none>")
                );
                self.alerts
                    .alert(OperatorAlert {
                        event_id: event.event_id.clone(),
                        event_type: event.event_type().to_string(),
                        reason: reason.clone(),
                    })
                    .await;
                Err(KeelError::from(EventError::CorrelationUnrecoverable {
                    event_id: event.event_id.clone(),
                    reason,
                }))
            }
        }
    }

    fn transition_for(
        &self,
        event: &ExternalEvent,
        provider_subscription_id: &str,
        correlation: &Correlation,
    ) -> SubscriptionTransition {
        let existing = correlation.existing.as_ref();
        let known_plan = correlation
            .plan
            .or_else(|| existing.map(|r| r.plan))
            .unwrap_or_default();
        let kept_period_end = existing.and_then(|r| r.current_period_end);
        let kept_cancel = existing.is_some_and(|r| r.cancel_at_period_end);

        let (plan, status, current_period_end, cancel_at_period_end) = match &event.kind {
            EventKind::SubscriptionUpdated(payload) => {
                let plan = payload
                    .price_id
                    .as_deref()
                    .and_then(|price| self.plans.resolve(price))
                    .unwrap_or(known_plan);
                (
                    plan,
                    SubscriptionStatus::from_provider(&payload.status),
                    payload.current_period_end,
                    payload.cancel_at_period_end,
                )
            }
            EventKind::SubscriptionDeleted(payload) => (
                BillingPlan::Free,
                SubscriptionStatus::Canceled,
                payload.current_period_end,
                false,
            ),
            EventKind::InvoicePaymentFailed(_) => (
                known_plan,
                SubscriptionStatus::PastDue,
                kept_period_end,
                kept_cancel,
            ),
            // Subscription events are authoritative for status; checkout only
            // activates a subscription nothing else has reported on yet.
            EventKind::CheckoutCompleted(_) => (
                known_plan,
                existing.map_or(SubscriptionStatus::Active, |r| r.status),
                kept_period_end,
                kept_cancel,
            ),
            EventKind::Unknown { .. } => (
                known_plan,
                existing.map_or(SubscriptionStatus::Inactive, |r| r.status),
                kept_period_end,
                kept_cancel,
            ),
        };

        SubscriptionTransition {
            user_id: correlation.user_id,
            provider_subscription_id: provider_subscription_id.to_string(),
            provider_customer_id: event.provider_customer_id().map(str::to_string),
            plan,
            status,
            current_period_end,
            cancel_at_period_end,
            source_event_id: event.event_id.clone(),
        }
    }

    async fn invalidate_user(&self, user_id: EntityId) {
        for key in [
            format!("{SUBSCRIPTION_CACHE_PREFIX}{user_id}"),
            format!("{USER_PLAN_CACHE_PREFIX}{user_id}"),
        ] {
            if let Err(e) = self.cache.invalidate(&key).await {
                // Entries carry a TTL, so a stale value ages out on its own.
                tracing::warn!(key = %key, error = %e, "Cache invalidation failed");
            }
        }
    }

    fn notify(&self, record: SubscriptionRecord) {
        let notifier = Arc::clone(&self.notifier);
        tokio::spawn(async move {
            if let Err(e) = notifier.subscription_created(&record).await {
                tracing::warn!(
                    user_id = %record.user_id,
                    error = %e,
                    "Subscription confirmation failed"
                );
            }
        });
    }
}

/// Provider subscription id the event's transition is keyed by. Events
/// without one (unknown kinds, one-off checkouts and invoices) change nothing.
fn subscription_key(event: &ExternalEvent) -> Option<&str> {
    match &event.kind {
        EventKind::Unknown { .. } => None,
        _ => event.provider_subscription_id(),
    }
}

/// Whether a newly created row deserves a confirmation. Rows first seen
/// through a cancellation or a failed invoice do not.
fn confirms_subscription(kind: &EventKind, status: SubscriptionStatus) -> bool {
    matches!(
        kind,
        EventKind::CheckoutCompleted(_) | EventKind::SubscriptionUpdated(_)
    ) && status.grants_access()
}

#[cfg(test)]
mod tests {
    use super::*;
    use keel_core::StoreResult;
    use keel_storage::InMemorySubscriptionStore;
    use keel_test_utils::fixtures;
    use std::sync::Mutex;
    use uuid::Uuid;

    #[derive(Default)]
    struct RecordingInvalidator {
        keys: Mutex<Vec<String>>,
    }

    #[async_trait::async_trait]
    impl CacheInvalidator for RecordingInvalidator {
        async fn invalidate(&self, key: &str) -> StoreResult<()> {
            self.keys.lock().unwrap().push(key.to_string());
            Ok(())
        }
    }

    fn processor(
        store: &Arc<InMemorySubscriptionStore>,
    ) -> (EventProcessor, Arc<RecordingInvalidator>) {
        let cache = Arc::new(RecordingInvalidator::default());
        let prices = PriceTable::new().with_price("price_pro", BillingPlan::Pro);
        let processor = EventProcessor::new(store.clone(), cache.clone())
            .with_plan_resolver(Arc::new(prices));
        (processor, cache)
    }

    #[test]
    fn test_subscription_key() {
        let event = fixtures::invoice_payment_failed("evt_1", None, "cus_1");
        assert_eq!(subscription_key(&event), None);
        let event = fixtures::invoice_payment_failed("evt_2", Some("sub_1"), "cus_1");
        assert_eq!(subscription_key(&event), Some("sub_1"));
    }

    #[test]
    fn test_confirmation_only_for_granted_subscriptions() {
        let user = Some(fixtures::metadata(Uuid::nil(), BillingPlan::Pro));
        let checkout = fixtures::checkout_completed("evt_1", "sub_1", "cus_1", user.clone());
        let deleted = fixtures::subscription_deleted("evt_2", "sub_1", "cus_1", user);
        let failed = fixtures::invoice_payment_failed("evt_3", Some("sub_1"), "cus_1");

        assert!(confirms_subscription(&checkout.kind, SubscriptionStatus::Active));
        assert!(!confirms_subscription(&checkout.kind, SubscriptionStatus::Incomplete));
        assert!(!confirms_subscription(&deleted.kind, SubscriptionStatus::Canceled));
        assert!(!confirms_subscription(&failed.kind, SubscriptionStatus::PastDue));
    }

    #[tokio::test]
    async fn test_price_overrides_metadata_plan() {
        let store = Arc::new(InMemorySubscriptionStore::new());
        let (processor, _) = processor(&store);
        let user_id = Uuid::now_v7();
        let event = fixtures::subscription_updated(
            "evt_1",
            "sub_1",
            "cus_1",
            "active",
            Some("price_pro"),
            Some(fixtures::metadata(user_id, BillingPlan::Enterprise)),
        );

        processor.process(&event).await.unwrap();
        assert_eq!(store.subscriptions()[0].plan, BillingPlan::Pro);
        assert_eq!(store.user_plan(user_id), Some(BillingPlan::Pro));
    }

    #[tokio::test]
    async fn test_unknown_price_keeps_metadata_plan() {
        let store = Arc::new(InMemorySubscriptionStore::new());
        let (processor, _) = processor(&store);
        let user_id = Uuid::now_v7();
        let event = fixtures::subscription_updated(
            "evt_1",
            "sub_1",
            "cus_1",
            "trialing",
            Some("price_other"),
            Some(fixtures::metadata(user_id, BillingPlan::Enterprise)),
        );

        let outcome = processor.process(&event).await.unwrap();
        assert_eq!(
            outcome,
            ProcessOutcome::Applied {
                user_id,
                status: SubscriptionStatus::Trialing,
                created: true
            }
        );
        assert_eq!(store.subscriptions()[0].plan, BillingPlan::Enterprise);
    }

    #[tokio::test]
    async fn test_invalidates_both_user_keys() {
        let store = Arc::new(InMemorySubscriptionStore::new());
        let (processor, cache) = processor(&store);
        let user_id = Uuid::now_v7();
        let event = fixtures::subscription_updated(
            "evt_1",
            "sub_1",
            "cus_1",
            "active",
            None,
            Some(fixtures::metadata(user_id, BillingPlan::Pro)),
        );

        processor.process(&event).await.unwrap();
        let keys = cache.keys.lock().unwrap().clone();
        assert_eq!(
            keys,
            vec![format!("subscription:{user_id}"), format!("user-plan:{user_id}")]
        );
    }

    #[tokio::test]
    async fn test_unknown_event_ignored_without_write() {
        let store = Arc::new(InMemorySubscriptionStore::new());
        let (processor, cache) = processor(&store);
        let event = ExternalEvent::new(
            "evt_1",
            EventKind::Unknown {
                event_type: "customer.created".to_string(),
            },
            None,
        );

        let outcome = processor.process(&event).await.unwrap();
        assert_eq!(
            outcome,
            ProcessOutcome::Ignored {
                event_type: "customer.created".to_string()
            }
        );
        assert_eq!(store.writes(), 0);
        assert!(cache.keys.lock().unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_checkout_keeps_status_reported_by_subscription_event() {
        let store = Arc::new(InMemorySubscriptionStore::new());
        let (processor, _) = processor(&store);
        let user_id = Uuid::now_v7();
        let meta = fixtures::metadata(user_id, BillingPlan::Pro);

        let updated = fixtures::subscription_updated(
            "evt_1",
            "sub_1",
            "cus_1",
            "trialing",
            Some("price_pro"),
            Some(meta.clone()),
        );
        processor.process(&updated).await.unwrap();

        let checkout = fixtures::checkout_completed("evt_2", "sub_1", "cus_1", Some(meta));
        let outcome = processor.process(&checkout).await.unwrap();
        assert_eq!(
            outcome,
            ProcessOutcome::Applied {
                user_id,
                status: SubscriptionStatus::Trialing,
                created: false
            }
        );
        let record = &store.subscriptions()[0];
        assert_eq!(record.plan, BillingPlan::Pro);
        assert!(record.current_period_end.is_some());
    }

    #[tokio::test]
    async fn test_deletion_downgrades_to_free() {
        let store = Arc::new(InMemorySubscriptionStore::new());
        let (processor, _) = processor(&store);
        let user_id = Uuid::now_v7();
        let meta = fixtures::metadata(user_id, BillingPlan::Pro);

        let created = fixtures::subscription_updated(
            "evt_1",
            "sub_1",
            "cus_1",
            "active",
            Some("price_pro"),
            Some(meta.clone()),
        );
        processor.process(&created).await.unwrap();
        assert_eq!(store.user_plan(user_id), Some(BillingPlan::Pro));

        let deleted = fixtures::subscription_deleted("evt_2", "sub_1", "cus_1", Some(meta));
        processor.process(&deleted).await.unwrap();
        let record = &store.subscriptions()[0];
        assert_eq!(record.status, SubscriptionStatus::Canceled);
        assert_eq!(record.plan, BillingPlan::Free);
        assert_eq!(store.user_plan(user_id), Some(BillingPlan::Free));
    }

    #[tokio::test]
    async fn test_malformed_envelope_rejected() {
        let store = Arc::new(InMemorySubscriptionStore::new());
        let (processor, _) = processor(&store);
        let err = processor.process_envelope(b"{not json").await.unwrap_err();
        assert!(matches!(
            err,
            KeelError::Event(EventError::MalformedEnvelope { .. })
        ));
        assert_eq!(store.writes(), 0);
    }
}
