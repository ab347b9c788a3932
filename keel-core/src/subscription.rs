//! Subscription state owned by the durable store.

use crate::{EntityId, Timestamp};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

// ============================================================================
// PLAN
// ============================================================================

/// Billing plan granted to a user.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum BillingPlan {
    #[default]
    Free,
    Pro,
    Enterprise,
}

impl BillingPlan {
    pub fn as_str(&self) -> &'static str {
        match self {
            BillingPlan::Free => "free",
            BillingPlan::Pro => "pro",
            BillingPlan::Enterprise => "enterprise",
        }
    }
}

impl fmt::Display for BillingPlan {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for BillingPlan {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "free" => Ok(BillingPlan::Free),
            "pro" => Ok(BillingPlan::Pro),
            "enterprise" => Ok(BillingPlan::Enterprise),
            other => Err(format!("unknown plan: {other}")),
        }
    }
}

// ============================================================================
// STATUS
// ============================================================================

/// Internal subscription status.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SubscriptionStatus {
    Active,
    Trialing,
    PastDue,
    Canceled,
    Unpaid,
    Incomplete,
    /// Default for any provider status without a mapping.
    Inactive,
}

impl SubscriptionStatus {
    /// Map a billing provider status string onto the internal status.
    ///
    /// Total: unknown values map to `Inactive` instead of failing.
    pub fn from_provider(status: &str) -> Self {
        match status.trim().to_ascii_lowercase().as_str() {
            "active" => SubscriptionStatus::Active,
            "trialing" | "on_trial" => SubscriptionStatus::Trialing,
            "past_due" => SubscriptionStatus::PastDue,
            "canceled" | "cancelled" | "incomplete_expired" | "expired" => {
                SubscriptionStatus::Canceled
            }
            "unpaid" => SubscriptionStatus::Unpaid,
            "incomplete" => SubscriptionStatus::Incomplete,
            _ => SubscriptionStatus::Inactive,
        }
    }

    /// Whether the user keeps paid-plan access in this status.
    pub fn grants_access(&self) -> bool {
        matches!(
            self,
            SubscriptionStatus::Active | SubscriptionStatus::Trialing | SubscriptionStatus::PastDue
        )
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            SubscriptionStatus::Active => "active",
            SubscriptionStatus::Trialing => "trialing",
            SubscriptionStatus::PastDue => "past_due",
            SubscriptionStatus::Canceled => "canceled",
            SubscriptionStatus::Unpaid => "unpaid",
            SubscriptionStatus::Incomplete => "incomplete",
            SubscriptionStatus::Inactive => "inactive",
        }
    }

    /// Parse the stored representation written by `as_str`.
    pub fn from_db_str(s: &str) -> Option<Self> {
        match s {
            "active" => Some(SubscriptionStatus::Active),
            "trialing" => Some(SubscriptionStatus::Trialing),
            "past_due" => Some(SubscriptionStatus::PastDue),
            "canceled" => Some(SubscriptionStatus::Canceled),
            "unpaid" => Some(SubscriptionStatus::Unpaid),
            "incomplete" => Some(SubscriptionStatus::Incomplete),
            "inactive" => Some(SubscriptionStatus::Inactive),
            _ => None,
        }
    }
}

impl fmt::Display for SubscriptionStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

// ============================================================================
// RECORD AND TRANSITION
// ============================================================================

/// Durable subscription row, keyed by the provider's subscription id.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SubscriptionRecord {
    pub id: EntityId,
    pub user_id: EntityId,
    pub provider_subscription_id: String,
    pub provider_customer_id: Option<String>,
    pub plan: BillingPlan,
    pub status: SubscriptionStatus,
    pub current_period_end: Option<Timestamp>,
    pub cancel_at_period_end: bool,
    /// Last event applied to this row.
    pub last_event_id: String,
    pub created_at: Timestamp,
    pub updated_at: Timestamp,
}

impl SubscriptionRecord {
    /// Build a new row from a transition.
    pub fn from_transition(
        id: EntityId,
        transition: &SubscriptionTransition,
        now: Timestamp,
    ) -> Self {
        Self {
            id,
            user_id: transition.user_id,
            provider_subscription_id: transition.provider_subscription_id.clone(),
            provider_customer_id: transition.provider_customer_id.clone(),
            plan: transition.plan,
            status: transition.status,
            current_period_end: transition.current_period_end,
            cancel_at_period_end: transition.cancel_at_period_end,
            last_event_id: transition.source_event_id.clone(),
            created_at: now,
            updated_at: now,
        }
    }

    /// Overwrite the mutable columns with the transition's target state.
    ///
    /// A customer id already on file is kept when the event omits one.
    pub fn apply(&mut self, transition: &SubscriptionTransition, now: Timestamp) {
        self.user_id = transition.user_id;
        if transition.provider_customer_id.is_some() {
            self.provider_customer_id = transition.provider_customer_id.clone();
        }
        self.plan = transition.plan;
        self.status = transition.status;
        self.current_period_end = transition.current_period_end;
        self.cancel_at_period_end = transition.cancel_at_period_end;
        self.last_event_id = transition.source_event_id.clone();
        self.updated_at = now;
    }
}

/// Target state computed from one external event.
///
/// Applied as a single atomic write: the subscription row is upserted by
/// `provider_subscription_id` and the user's effective plan is updated with it.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SubscriptionTransition {
    pub user_id: EntityId,
    pub provider_subscription_id: String,
    pub provider_customer_id: Option<String>,
    pub plan: BillingPlan,
    pub status: SubscriptionStatus,
    pub current_period_end: Option<Timestamp>,
    pub cancel_at_period_end: bool,
    pub source_event_id: String,
}

impl SubscriptionTransition {
    /// Plan the user actually gets: the subscribed plan while the status
    /// grants access, `Free` otherwise.
    pub fn effective_plan(&self) -> BillingPlan {
        if self.status.grants_access() {
            self.plan
        } else {
            BillingPlan::Free
        }
    }

    /// Whether this transition may overwrite a row currently in `current`.
    ///
    /// Cancellation is final for a provider subscription id: once a row is
    /// canceled only another cancellation may touch it, so an update that
    /// was delivered late cannot bring the subscription back.
    pub fn supersedes(&self, current: SubscriptionStatus) -> bool {
        current != SubscriptionStatus::Canceled || self.status == SubscriptionStatus::Canceled
    }
}

/// Result of applying a transition.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TransitionApplied {
    /// The row as stored after the call.
    pub record: SubscriptionRecord,
    /// True only when this write created the row.
    pub created: bool,
    /// False when the row was final and the transition was dropped.
    pub written: bool,
    pub previous_status: Option<SubscriptionStatus>,
}
