//! KEEL Core - Coordination Types
//!
//! Pure data structures shared by every KEEL crate: lease model, external
//! event sum type, subscription state, expiring record kinds, tuning config
//! and the error taxonomy. This crate performs no I/O.

use chrono::{DateTime, Utc};
use uuid::Uuid;

// ============================================================================
// IDENTITY TYPES
// ============================================================================

/// Entity identifier using UUIDv7 for timestamp-sortable IDs.
pub type EntityId = Uuid;

/// Timestamp type using UTC timezone.
pub type Timestamp = DateTime<Utc>;

/// Generate a new UUIDv7 EntityId (timestamp-sortable).
pub fn new_entity_id() -> EntityId {
    Uuid::now_v7()
}

/// Generate a fresh opaque lease owner token.
///
/// Tokens are unique per acquisition attempt, never per process.
pub fn new_owner_token() -> String {
    Uuid::now_v7().simple().to_string()
}

mod config;
mod error;
mod event;
mod health;
mod lease;
mod record;
mod subscription;

pub use config::{CacheConfig, LockConfig};
pub use error::{
    ConfigError, EventError, KeelError, KeelResult, LockError, StorageError, StoreError,
    StoreResult, SweepError,
};
pub use event::{
    CheckoutPayload, EventKind, ExternalEvent, InvoicePayload, SubscriptionMetadata,
    SubscriptionPayload,
};
pub use health::{HealthCheck, HealthStatus};
pub use lease::{Lease, LeaseState};
pub use record::RecordKind;
pub use subscription::{
    BillingPlan, SubscriptionRecord, SubscriptionStatus, SubscriptionTransition,
    TransitionApplied,
};
