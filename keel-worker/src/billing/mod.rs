//! Billing event ingestion
//!
//! The billing provider delivers events at least once and in any order.
//! [`EventProcessor`] turns each delivery into one atomic subscription
//! transition, so replays converge on the same state.
//!
//! Collaborators are injected as trait objects:
//! - [`PlanResolver`]: price id to plan policy ([`PriceTable`] by default)
//! - [`Notifier`]: customer confirmation, fire-and-forget
//! - [`AlertSink`]: operator alerts for events that cannot be correlated

mod processor;

pub use processor::{EventProcessor, ProcessOutcome};

use crate::config::{list, Vars};
use async_trait::async_trait;
use keel_core::{BillingPlan, KeelResult, SubscriptionRecord};
use std::collections::HashMap;

// ============================================================================
// PLAN RESOLUTION
// ============================================================================

/// Maps a provider price id to the plan it grants.
pub trait PlanResolver: Send + Sync {
    /// `None` when the price is not recognised.
    fn resolve(&self, price_id: &str) -> Option<BillingPlan>;
}

/// Static price id table.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct PriceTable {
    prices: HashMap<String, BillingPlan>,
}

impl PriceTable {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_price(mut self, price_id: impl Into<String>, plan: BillingPlan) -> Self {
        self.prices.insert(price_id.into(), plan);
        self
    }

    /// # Environment Variables
    /// - `KEEL_PRICE_IDS_PRO`: comma separated price ids granting Pro
    /// - `KEEL_PRICE_IDS_ENTERPRISE`: comma separated price ids granting Enterprise
    pub fn from_vars(vars: Vars<'_>) -> Self {
        let mut table = Self::new();
        for (key, plan) in [
            ("KEEL_PRICE_IDS_PRO", BillingPlan::Pro),
            ("KEEL_PRICE_IDS_ENTERPRISE", BillingPlan::Enterprise),
        ] {
            for price_id in list(vars, key) {
                table.prices.insert(price_id, plan);
            }
        }
        table
    }

    pub fn len(&self) -> usize {
        self.prices.len()
    }

    pub fn is_empty(&self) -> bool {
        self.prices.is_empty()
    }
}

impl PlanResolver for PriceTable {
    fn resolve(&self, price_id: &str) -> Option<BillingPlan> {
        self.prices.get(price_id).copied()
    }
}

// ============================================================================
// NOTIFICATIONS AND ALERTS
// ============================================================================

/// Sends the confirmation message for a newly created subscription.
#[async_trait]
pub trait Notifier: Send + Sync {
    async fn subscription_created(&self, record: &SubscriptionRecord) -> KeelResult<()>;
}

/// Logs instead of sending. Used until a delivery channel is wired in.
#[derive(Debug, Clone, Copy, Default)]
pub struct LogNotifier;

#[async_trait]
impl Notifier for LogNotifier {
    async fn subscription_created(&self, record: &SubscriptionRecord) -> KeelResult<()> {
        tracing::info!(
            user_id = %record.user_id,
            plan = %record.plan,
            provider_subscription_id = %record.provider_subscription_id,
            "Subscription confirmation queued"
        );
        Ok(())
    }
}

/// An event the worker could not act on and had to fail.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct OperatorAlert {
    pub event_id: String,
    pub event_type: String,
    pub reason: String,
}

/// Destination for operator alerts.
#[async_trait]
pub trait AlertSink: Send + Sync {
    async fn alert(&self, alert: OperatorAlert);
}

/// Emits alerts as error-level log records.
#[derive(Debug, Clone, Copy, Default)]
pub struct LogAlertSink;

#[async_trait]
impl AlertSink for LogAlertSink {
    async fn alert(&self, alert: OperatorAlert) {
        tracing::error!(
            alert = true,
            event_id = %alert.event_id,
            event_type = %alert.event_type,
            reason = %alert.reason,
            "Billing event requires operator attention"
        );
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_price_table_resolve() {
        let table = PriceTable::new()
            .with_price("price_pro_monthly", BillingPlan::Pro)
            .with_price("price_ent", BillingPlan::Enterprise);
        assert_eq!(table.resolve("price_pro_monthly"), Some(BillingPlan::Pro));
        assert_eq!(table.resolve("price_ent"), Some(BillingPlan::Enterprise));
        assert_eq!(table.resolve("price_unknown"), None);
        assert_eq!(table.len(), 2);
    }

    #[test]
    fn test_price_table_from_vars() {
        let table = PriceTable::from_vars(&|key| match key {
            "KEEL_PRICE_IDS_PRO" => Some("price_a, price_b".to_string()),
            "KEEL_PRICE_IDS_ENTERPRISE" => Some("price_c".to_string()),
            _ => None,
        });
        assert_eq!(table.resolve("price_b"), Some(BillingPlan::Pro));
        assert_eq!(table.resolve("price_c"), Some(BillingPlan::Enterprise));
        assert_eq!(table.len(), 3);
    }

    #[test]
    fn test_price_table_empty_by_default() {
        assert!(PriceTable::from_vars(&|_| None).is_empty());
    }
}
