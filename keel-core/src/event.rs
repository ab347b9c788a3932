//! Externally delivered events (billing provider webhooks).
//!
//! The provider envelope is decoded once into a tagged sum type. Each known
//! kind carries its own typed payload; everything else lands in
//! `EventKind::Unknown` and is acknowledged without side effects.

use crate::{BillingPlan, EntityId, EventError, Timestamp};
use chrono::{TimeZone, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;

// ============================================================================
// PAYLOADS
// ============================================================================

/// `checkout.session.completed`
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CheckoutPayload {
    #[serde(rename = "id")]
    pub session_id: String,
    #[serde(default)]
    pub customer: Option<String>,
    #[serde(default)]
    pub subscription: Option<String>,
}

/// `customer.subscription.*`
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SubscriptionPayload {
    pub subscription_id: String,
    pub customer_id: Option<String>,
    /// Provider status string, mapped later.
    pub status: String,
    pub price_id: Option<String>,
    pub current_period_end: Option<Timestamp>,
    pub cancel_at_period_end: bool,
}

/// `invoice.payment_failed`
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct InvoicePayload {
    #[serde(rename = "id")]
    pub invoice_id: String,
    #[serde(default)]
    pub customer: Option<String>,
    #[serde(default)]
    pub subscription: Option<String>,
}

/// Provider wire shape of a subscription object.
#[derive(Deserialize)]
struct RawSubscription {
    id: String,
    #[serde(default)]
    customer: Option<String>,
    #[serde(default)]
    status: Option<String>,
    #[serde(default)]
    items: Option<RawItems>,
    #[serde(default)]
    current_period_end: Option<i64>,
    #[serde(default)]
    cancel_at_period_end: bool,
}

#[derive(Deserialize)]
struct RawItems {
    #[serde(default)]
    data: Vec<RawItem>,
}

#[derive(Deserialize)]
struct RawItem {
    price: Option<RawPrice>,
}

#[derive(Deserialize)]
struct RawPrice {
    id: String,
}

impl From<RawSubscription> for SubscriptionPayload {
    fn from(raw: RawSubscription) -> Self {
        let price_id = raw
            .items
            .and_then(|items| items.data.into_iter().find_map(|item| item.price))
            .map(|price| price.id);
        Self {
            subscription_id: raw.id,
            customer_id: raw.customer,
            status: raw.status.unwrap_or_default(),
            price_id,
            current_period_end: raw
                .current_period_end
                .and_then(|secs| Utc.timestamp_opt(secs, 0).single()),
            cancel_at_period_end: raw.cancel_at_period_end,
        }
    }
}

// ============================================================================
// EVENT KIND
// ============================================================================

/// Known event kinds, each with a typed payload.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum EventKind {
    CheckoutCompleted(CheckoutPayload),
    /// Covers both `created` and `updated`; the upsert makes them equivalent.
    SubscriptionUpdated(SubscriptionPayload),
    SubscriptionDeleted(SubscriptionPayload),
    InvoicePaymentFailed(InvoicePayload),
    Unknown { event_type: String },
}

impl EventKind {
    /// Provider event type string.
    pub fn event_type(&self) -> &str {
        match self {
            EventKind::CheckoutCompleted(_) => "checkout.session.completed",
            EventKind::SubscriptionUpdated(_) => "customer.subscription.updated",
            EventKind::SubscriptionDeleted(_) => "customer.subscription.deleted",
            EventKind::InvoicePaymentFailed(_) => "invoice.payment_failed",
            EventKind::Unknown { event_type } => event_type,
        }
    }

    fn decode(event_type: &str, object: Value) -> Result<Self, serde_json::Error> {
        let kind = match event_type {
            "checkout.session.completed" => {
                EventKind::CheckoutCompleted(serde_json::from_value(object)?)
            }
            "customer.subscription.created" | "customer.subscription.updated" => {
                let raw: RawSubscription = serde_json::from_value(object)?;
                EventKind::SubscriptionUpdated(raw.into())
            }
            "customer.subscription.deleted" => {
                let raw: RawSubscription = serde_json::from_value(object)?;
                EventKind::SubscriptionDeleted(raw.into())
            }
            "invoice.payment_failed" => {
                EventKind::InvoicePaymentFailed(serde_json::from_value(object)?)
            }
            other => EventKind::Unknown {
                event_type: other.to_string(),
            },
        };
        Ok(kind)
    }
}

// ============================================================================
// EXTERNAL EVENT
// ============================================================================

#[derive(Deserialize)]
struct Envelope {
    id: String,
    #[serde(rename = "type")]
    event_type: String,
    data: EnvelopeData,
}

#[derive(Deserialize)]
struct EnvelopeData {
    object: Value,
}

/// A decoded webhook delivery.
///
/// Transport authenticity is verified upstream; `metadata` is still untrusted.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ExternalEvent {
    pub event_id: String,
    pub kind: EventKind,
    pub metadata: Option<Value>,
    pub received_at: Timestamp,
}

impl ExternalEvent {
    pub fn new(event_id: impl Into<String>, kind: EventKind, metadata: Option<Value>) -> Self {
        Self {
            event_id: event_id.into(),
            kind,
            metadata,
            received_at: Utc::now(),
        }
    }

    /// Decode a provider envelope (`{"id", "type", "data": {"object": ..}}`).
    pub fn from_envelope(body: &[u8]) -> Result<Self, EventError> {
        let envelope: Envelope =
            serde_json::from_slice(body).map_err(|e| EventError::MalformedEnvelope {
                reason: e.to_string(),
            })?;
        let metadata = envelope
            .data
            .object
            .get("metadata")
            .filter(|m| !m.is_null())
            .cloned();
        let kind = EventKind::decode(&envelope.event_type, envelope.data.object).map_err(|e| {
            EventError::MalformedEnvelope {
                reason: format!("{} payload: {}", envelope.event_type, e),
            }
        })?;
        Ok(Self::new(envelope.id, kind, metadata))
    }

    pub fn event_type(&self) -> &str {
        self.kind.event_type()
    }

    /// Provider subscription id carried by the event itself.
    pub fn provider_subscription_id(&self) -> Option<&str> {
        match &self.kind {
            EventKind::CheckoutCompleted(p) => p.subscription.as_deref(),
            EventKind::SubscriptionUpdated(p) | EventKind::SubscriptionDeleted(p) => {
                Some(p.subscription_id.as_str())
            }
            EventKind::InvoicePaymentFailed(p) => p.subscription.as_deref(),
            EventKind::Unknown { .. } => None,
        }
    }

    /// Provider customer id carried by the event itself.
    pub fn provider_customer_id(&self) -> Option<&str> {
        match &self.kind {
            EventKind::CheckoutCompleted(p) => p.customer.as_deref(),
            EventKind::SubscriptionUpdated(p) | EventKind::SubscriptionDeleted(p) => {
                p.customer_id.as_deref()
            }
            EventKind::InvoicePaymentFailed(p) => p.customer.as_deref(),
            EventKind::Unknown { .. } => None,
        }
    }
}

// ============================================================================
// METADATA
// ============================================================================

/// Strict schema for the correlation metadata attached at checkout.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SubscriptionMetadata {
    pub user_id: EntityId,
    #[serde(default)]
    pub plan: Option<BillingPlan>,
}

impl SubscriptionMetadata {
    /// Validate untrusted metadata.
    ///
    /// Missing or empty metadata is `MissingField`; anything present that
    /// does not fit the schema is `ValidationFailed`.
    pub fn parse(event_id: &str, metadata: Option<&Value>) -> Result<Self, EventError> {
        let value = match metadata {
            Some(Value::Object(map)) if map.contains_key("user_id") => Value::Object(map.clone()),
            Some(Value::Object(_)) | Some(Value::Null) | None => {
                return Err(EventError::MissingField {
                    event_id: event_id.to_string(),
                    field: "metadata.user_id".to_string(),
                })
            }
            Some(other) => {
                return Err(EventError::ValidationFailed {
                    event_id: event_id.to_string(),
                    reason: format!("metadata must be an object, got {other}"),
                })
            }
        };
        serde_json::from_value(value).map_err(|e| EventError::ValidationFailed {
            event_id: event_id.to_string(),
            reason: e.to_string(),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;
    use serde_json::json;

    fn envelope(event_type: &str, object: Value) -> Vec<u8> {
        serde_json::to_vec(&json!({
            "id": "evt_123",
            "type": event_type,
            "data": { "object": object }
        }))
        .unwrap()
    }

    #[test]
    fn test_decode_subscription_updated() {
        let body = envelope(
            "customer.subscription.updated",
            json!({
                "id": "sub_1",
                "customer": "cus_1",
                "status": "past_due",
                "cancel_at_period_end": true,
                "current_period_end": 1_700_000_000,
                "items": { "data": [ { "price": { "id": "price_pro_monthly" } } ] },
                "metadata": { "user_id": "018f0000-0000-7000-8000-000000000001", "plan": "pro" }
            }),
        );
        let event = ExternalEvent::from_envelope(&body).unwrap();
        assert_eq!(event.event_id, "evt_123");
        assert_eq!(event.event_type(), "customer.subscription.updated");
        assert_eq!(event.provider_subscription_id(), Some("sub_1"));
        assert_eq!(event.provider_customer_id(), Some("cus_1"));
        match &event.kind {
            EventKind::SubscriptionUpdated(p) => {
                assert_eq!(p.status, "past_due");
                assert_eq!(p.price_id.as_deref(), Some("price_pro_monthly"));
                assert!(p.cancel_at_period_end);
                assert!(p.current_period_end.is_some());
            }
            other => panic!("unexpected kind {other:?}"),
        }
        assert!(event.metadata.is_some());
    }

    #[test]
    fn test_created_decodes_as_updated() {
        let body = envelope("customer.subscription.created", json!({ "id": "sub_9" }));
        let event = ExternalEvent::from_envelope(&body).unwrap();
        assert!(matches!(event.kind, EventKind::SubscriptionUpdated(_)));
    }

    #[test]
    fn test_decode_unknown_kind() {
        let body = envelope("customer.created", json!({ "id": "cus_1" }));
        let event = ExternalEvent::from_envelope(&body).unwrap();
        assert_eq!(
            event.kind,
            EventKind::Unknown {
                event_type: "customer.created".to_string()
            }
        );
        assert_eq!(event.provider_subscription_id(), None);
    }

    #[test]
    fn test_decode_checkout_and_invoice() {
        let checkout = ExternalEvent::from_envelope(&envelope(
            "checkout.session.completed",
            json!({ "id": "cs_1", "customer": "cus_1", "subscription": "sub_1" }),
        ))
        .unwrap();
        assert_eq!(checkout.provider_subscription_id(), Some("sub_1"));

        let invoice = ExternalEvent::from_envelope(&envelope(
            "invoice.payment_failed",
            json!({ "id": "in_1", "customer": "cus_2" }),
        ))
        .unwrap();
        assert_eq!(invoice.provider_subscription_id(), None);
        assert_eq!(invoice.provider_customer_id(), Some("cus_2"));
    }

    #[test]
    fn test_malformed_known_payload_is_rejected() {
        let body = envelope("customer.subscription.updated", json!({ "status": "active" }));
        let err = ExternalEvent::from_envelope(&body).unwrap_err();
        assert!(matches!(err, EventError::MalformedEnvelope { .. }));
    }

    #[test]
    fn test_metadata_parse() {
        let ok = SubscriptionMetadata::parse(
            "evt",
            Some(&json!({ "user_id": "018f0000-0000-7000-8000-000000000001", "plan": "enterprise" })),
        )
        .unwrap();
        assert_eq!(ok.plan, Some(BillingPlan::Enterprise));

        let missing = SubscriptionMetadata::parse("evt", Some(&json!({}))).unwrap_err();
        assert!(matches!(missing, EventError::MissingField { .. }));

        let absent = SubscriptionMetadata::parse("evt", None).unwrap_err();
        assert!(matches!(absent, EventError::MissingField { .. }));

        let bad_uuid =
            SubscriptionMetadata::parse("evt", Some(&json!({ "user_id": "42" }))).unwrap_err();
        assert!(matches!(bad_uuid, EventError::ValidationFailed { .. }));

        let bad_plan = SubscriptionMetadata::parse(
            "evt",
            Some(&json!({ "user_id": "018f0000-0000-7000-8000-000000000001", "plan": "gold" })),
        )
        .unwrap_err();
        assert!(matches!(bad_plan, EventError::ValidationFailed { .. }));

        let not_object =
            SubscriptionMetadata::parse("evt", Some(&json!("user-1"))).unwrap_err();
        assert!(matches!(not_object, EventError::ValidationFailed { .. }));
    }

    proptest! {
        #[test]
        fn prop_envelope_decoding_never_panics(bytes in proptest::collection::vec(any::<u8>(), 0..256)) {
            let _ = ExternalEvent::from_envelope(&bytes);
        }

        #[test]
        fn prop_unmapped_types_decode_as_unknown(suffix in "[a-z]{1,12}") {
            let event_type = format!("custom.{suffix}");
            let event = ExternalEvent::from_envelope(&envelope(&event_type, json!({}))).unwrap();
            prop_assert_eq!(event.event_type(), event_type.as_str());
        }
    }
}
