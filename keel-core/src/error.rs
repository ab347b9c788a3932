//! Error types for KEEL operations

use thiserror::Error;

/// Fast key-value store errors (lease store and cache backend).
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum StoreError {
    /// The store could not be reached at all.
    #[error("Store unavailable: {reason}")]
    Unavailable { reason: String },

    #[error("Store backend error: {reason}")]
    Backend { reason: String },

    #[error("Serialization failed: {reason}")]
    Serialization { reason: String },
}

impl StoreError {
    /// Whether this error means the store is unreachable rather than misbehaving.
    pub fn is_unavailable(&self) -> bool {
        matches!(self, StoreError::Unavailable { .. })
    }
}

/// Lease lock errors.
///
/// Callers decide control flow by matching on the variant, never on the
/// message.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum LockError {
    /// Coordination store unreachable. Triggers unprotected execution.
    #[error("Lock store unavailable for {resource}: {reason}")]
    Unavailable { resource: String, reason: String },

    /// Another owner holds the lease. A normal skip outcome.
    #[error("Lock held by another owner: {resource}")]
    Held { resource: String },

    #[error("Lock acquisition failed for {resource}: {reason}")]
    AcquireFailed { resource: String, reason: String },

    #[error("Lock release failed for {resource}: {reason}")]
    ReleaseFailed { resource: String, reason: String },

    #[error("Lock extension failed for {resource}: {reason}")]
    ExtendFailed { resource: String, reason: String },
}

/// Durable (relational) storage errors.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum StorageError {
    #[error("Record not found: {entity} with id {id}")]
    NotFound { entity: String, id: String },

    #[error("Transaction failed: {reason}")]
    TransactionFailed { reason: String },

    #[error("Storage backend error: {reason}")]
    Backend { reason: String },

    #[error("Storage unavailable: {reason}")]
    Unavailable { reason: String },

    #[error("Storage lock poisoned")]
    LockPoisoned,
}

/// External event processing errors.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum EventError {
    /// Untrusted metadata failed the strict schema.
    #[error("Event {event_id} metadata invalid: {reason}")]
    ValidationFailed { event_id: String, reason: String },

    #[error("Event {event_id} missing required field: {field}")]
    MissingField { event_id: String, field: String },

    #[error("Event {event_id} could not be correlated: {reason}")]
    CorrelationUnrecoverable { event_id: String, reason: String },

    #[error("Event envelope malformed: {reason}")]
    MalformedEnvelope { reason: String },
}

/// Expiring record sweep errors.
///
/// Both variants carry the number of records deleted before the failure.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum SweepError {
    #[error("Sweep of {kind} failed fetching batch after {deleted} deletions: {reason}")]
    FetchFailed {
        kind: String,
        deleted: u64,
        reason: String,
    },

    #[error("Sweep of {kind} stopped after {deleted} deletions: batch of {batch_len} ids failed: {reason}")]
    BatchFailed {
        kind: String,
        deleted: u64,
        batch_len: usize,
        reason: String,
    },
}

impl SweepError {
    /// Records deleted before the sweep stopped.
    pub fn deleted(&self) -> u64 {
        match self {
            SweepError::FetchFailed { deleted, .. } | SweepError::BatchFailed { deleted, .. } => {
                *deleted
            }
        }
    }
}

/// Configuration errors.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum ConfigError {
    #[error("Missing required configuration: {field}")]
    MissingRequired { field: String },

    #[error("Invalid value for {field}: {value} ({reason})")]
    InvalidValue {
        field: String,
        value: String,
        reason: String,
    },
}

/// Master error type for all KEEL errors.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum KeelError {
    #[error("Store error: {0}")]
    Store(#[from] StoreError),

    #[error("Lock error: {0}")]
    Lock(#[from] LockError),

    #[error("Storage error: {0}")]
    Storage(#[from] StorageError),

    #[error("Event error: {0}")]
    Event(#[from] EventError),

    #[error("Sweep error: {0}")]
    Sweep(#[from] SweepError),

    #[error("Config error: {0}")]
    Config(#[from] ConfigError),

    /// Failure raised by a caller-supplied computation.
    #[error("Operation failed: {reason}")]
    Operation { reason: String },
}

impl KeelError {
    /// Wrap an arbitrary caller failure.
    pub fn operation(reason: impl Into<String>) -> Self {
        KeelError::Operation {
            reason: reason.into(),
        }
    }

    /// Whether the event was failed because its correlation could not be recovered.
    pub fn is_correlation_unrecoverable(&self) -> bool {
        matches!(
            self,
            KeelError::Event(EventError::CorrelationUnrecoverable { .. })
        )
    }
}

/// Result type alias for KEEL operations.
pub type KeelResult<T> = Result<T, KeelError>;

/// Result type alias for fast key-value store operations.
pub type StoreResult<T> = Result<T, StoreError>;

// =============================================================================
// TESTS
// =============================================================================

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_lock_error_display_held() {
        let err = LockError::Held {
            resource: "lock:cleanup-sessions".to_string(),
        };
        let msg = format!("{}", err);
        assert!(msg.contains("held"));
        assert!(msg.contains("lock:cleanup-sessions"));
    }

    #[test]
    fn test_sweep_error_carries_partial_count() {
        let err = SweepError::BatchFailed {
            kind: "session".to_string(),
            deleted: 200,
            batch_len: 100,
            reason: "connection reset".to_string(),
        };
        assert_eq!(err.deleted(), 200);
        let msg = format!("{}", err);
        assert!(msg.contains("after 200 deletions"));
        assert!(msg.contains("connection reset"));
    }

    #[test]
    fn test_store_error_unavailable_classification() {
        assert!(StoreError::Unavailable {
            reason: "refused".to_string()
        }
        .is_unavailable());
        assert!(!StoreError::Backend {
            reason: "WRONGTYPE".to_string()
        }
        .is_unavailable());
    }

    #[test]
    fn test_keel_error_from_conversions() {
        let lock = KeelError::from(LockError::Held {
            resource: "x".to_string(),
        });
        assert!(matches!(lock, KeelError::Lock(_)));

        let event = KeelError::from(EventError::CorrelationUnrecoverable {
            event_id: "evt_1".to_string(),
            reason: "no record".to_string(),
        });
        assert!(event.is_correlation_unrecoverable());

        let sweep = KeelError::from(SweepError::FetchFailed {
            kind: "csrf_token".to_string(),
            deleted: 0,
            reason: "timeout".to_string(),
        });
        assert!(matches!(sweep, KeelError::Sweep(_)));

        let storage = KeelError::from(StorageError::LockPoisoned);
        assert!(matches!(storage, KeelError::Storage(_)));
    }
}
