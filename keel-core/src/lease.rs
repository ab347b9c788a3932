//! Lease model for the distributed lock.
//!
//! A lease is a time-bounded exclusive claim on a resource key. It is owned
//! by the process that acquired it and moved into `release`, so a released
//! lease cannot be used again.
//!
//! # State Transition Diagram
//!
//! ```text
//! Unacquired ── acquire() ──→ Acquiring ──→ Held ── release() ──→ Releasing ──→ Released
//!                                 │           │ ↺ extend()
//!                                 ↓           └── ttl elapses ──→ Expired
//!                         AcquisitionFailed
//! ```

use crate::Timestamp;
use chrono::Utc;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::time::{Duration, Instant};

// ============================================================================
// LEASE STATE
// ============================================================================

/// Lifecycle state of a lease.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum LeaseState {
    Unacquired,
    Acquiring,
    Held,
    Releasing,
    Released,
    Expired,
    AcquisitionFailed,
}

impl LeaseState {
    /// Terminal states admit no further transition.
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            LeaseState::Released | LeaseState::Expired | LeaseState::AcquisitionFailed
        )
    }

    /// Whether moving from `self` to `next` is a legal transition.
    pub fn can_transition_to(&self, next: LeaseState) -> bool {
        use LeaseState::*;
        matches!(
            (self, next),
            (Unacquired, Acquiring)
                | (Acquiring, Held)
                | (Acquiring, AcquisitionFailed)
                | (Held, Held)
                | (Held, Releasing)
                | (Held, Expired)
                | (Releasing, Released)
        )
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            LeaseState::Unacquired => "unacquired",
            LeaseState::Acquiring => "acquiring",
            LeaseState::Held => "held",
            LeaseState::Releasing => "releasing",
            LeaseState::Released => "released",
            LeaseState::Expired => "expired",
            LeaseState::AcquisitionFailed => "acquisition_failed",
        }
    }
}

impl fmt::Display for LeaseState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

// ============================================================================
// LEASE
// ============================================================================

/// A granted lease.
///
/// `deadline` is the monotonic instant after which the holder must assume the
/// lease is gone. It already has clock drift and acquisition latency
/// subtracted, so it is earlier than the store-side expiry.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Lease {
    /// Fully namespaced store key (e.g. `lock:cleanup-session`).
    pub resource_key: String,
    /// Opaque token unique to this acquisition.
    pub owner_token: String,
    /// TTL requested from the store.
    pub ttl: Duration,
    pub acquired_at: Timestamp,
    /// Wall-clock view of `deadline`, for logging.
    pub expires_at: Timestamp,
    pub deadline: Instant,
}

impl Lease {
    /// Build a lease that stays valid for `validity` from now.
    pub fn new(
        resource_key: impl Into<String>,
        owner_token: impl Into<String>,
        ttl: Duration,
        validity: Duration,
    ) -> Self {
        let now = Utc::now();
        Self {
            resource_key: resource_key.into(),
            owner_token: owner_token.into(),
            ttl,
            acquired_at: now,
            expires_at: now + to_chrono(validity),
            deadline: Instant::now() + validity,
        }
    }

    /// Push the deadline out after a successful extension.
    pub fn renew(&mut self, validity: Duration) {
        self.expires_at = Utc::now() + to_chrono(validity);
        self.deadline = Instant::now() + validity;
    }

    /// Remaining validity, zero once expired.
    pub fn remaining(&self) -> Duration {
        self.deadline.saturating_duration_since(Instant::now())
    }

    pub fn is_expired(&self) -> bool {
        Instant::now() >= self.deadline
    }

    /// Current state as seen by the holder.
    pub fn state(&self) -> LeaseState {
        if self.is_expired() {
            LeaseState::Expired
        } else {
            LeaseState::Held
        }
    }
}

fn to_chrono(d: Duration) -> chrono::Duration {
    chrono::Duration::from_std(d).unwrap_or(chrono::Duration::zero())
}
