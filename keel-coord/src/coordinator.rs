//! Lock coordinator: run a named operation at most once across the fleet.
//!
//! # Outcomes
//!
//! | acquisition             | `f` runs | result                      |
//! |-------------------------|----------|-----------------------------|
//! | granted                 | yes      | `Ran(value)` or `Err(f's)`  |
//! | held elsewhere          | no       | `Skipped`                   |
//! | no store / unreachable  | yes      | `RanUnprotected(value)`     |
//! | any other lock error    | no       | `Err(E::from(lock_error))`  |
//!
//! Release happens on every exit path once a lease is granted, and its
//! failures are logged only: the operation's own result always wins.

use crate::lock::DistributedLock;
use futures_util::FutureExt;
use keel_core::{HealthCheck, Lease, LeaseState, LockConfig, LockError};
use std::future::Future;
use std::panic::AssertUnwindSafe;
use std::sync::Arc;
use std::time::{Duration, Instant};

/// Outcome of [`LockCoordinator::execute_with_lock`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum LockOutcome<T> {
    /// Ran while holding the lease.
    Ran(T),
    /// Ran without a lease because no lease store was available.
    RanUnprotected(T),
    /// Another instance holds the lease; the operation did not run.
    Skipped,
}

impl<T> LockOutcome<T> {
    pub fn is_skipped(&self) -> bool {
        matches!(self, LockOutcome::Skipped)
    }

    pub fn value(&self) -> Option<&T> {
        match self {
            LockOutcome::Ran(v) | LockOutcome::RanUnprotected(v) => Some(v),
            LockOutcome::Skipped => None,
        }
    }

    pub fn into_value(self) -> Option<T> {
        match self {
            LockOutcome::Ran(v) | LockOutcome::RanUnprotected(v) => Some(v),
            LockOutcome::Skipped => None,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            LockOutcome::Ran(_) => "ran",
            LockOutcome::RanUnprotected(_) => "ran_unprotected",
            LockOutcome::Skipped => "skipped",
        }
    }
}

/// Public orchestration API over [`DistributedLock`].
///
/// Cheap to clone. Built without a lock it is the disabled strategy: every
/// call runs unprotected, for single-instance deployments.
#[derive(Debug, Clone)]
pub struct LockCoordinator {
    lock: Option<Arc<DistributedLock>>,
    config: LockConfig,
}

impl LockCoordinator {
    pub fn new(lock: DistributedLock) -> Self {
        let config = lock.config().clone();
        Self {
            lock: Some(Arc::new(lock)),
            config,
        }
    }

    /// Coordinator with no lease store.
    pub fn unprotected() -> Self {
        Self {
            lock: None,
            config: LockConfig::default(),
        }
    }

    pub fn from_option(lock: Option<DistributedLock>) -> Self {
        lock.map_or_else(Self::unprotected, Self::new)
    }

    pub fn is_protected(&self) -> bool {
        self.lock.is_some()
    }

    pub fn lock(&self) -> Option<&DistributedLock> {
        self.lock.as_deref()
    }

    /// Run `f` under the lease `name` (namespaced with the key prefix).
    ///
    /// `f` is invoked at most once. Its result is returned unchanged.
    pub async fn execute_with_lock<T, E, F, Fut>(
        &self,
        name: &str,
        ttl: Duration,
        f: F,
    ) -> Result<LockOutcome<T>, E>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = Result<T, E>>,
        E: From<LockError>,
    {
        let started = Instant::now();
        let Some(lock) = &self.lock else {
            tracing::warn!(
                operation = %name,
                outcome = "degraded",
                reason = "no lease store configured",
                "Running without lock"
            );
            return f().await.map(LockOutcome::RanUnprotected);
        };

        let key = self.config.namespaced(name);
        let lease = match lock.acquire(&key, ttl).await {
            Ok(lease) => lease,
            Err(LockError::Unavailable { reason, .. }) => {
                tracing::warn!(
                    operation = %name,
                    outcome = "degraded",
                    reason = %reason,
                    duration_ms = started.elapsed().as_millis() as u64,
                    "Lease store unavailable, running without lock"
                );
                return f().await.map(LockOutcome::RanUnprotected);
            }
            Err(LockError::Held { .. }) => {
                tracing::info!(
                    operation = %name,
                    outcome = "skipped",
                    duration_ms = started.elapsed().as_millis() as u64,
                    "Lock held elsewhere, skipping"
                );
                return Ok(LockOutcome::Skipped);
            }
            Err(err) => {
                tracing::error!(
                    operation = %name,
                    outcome = "failed",
                    state = %LeaseState::AcquisitionFailed,
                    error = %err,
                    duration_ms = started.elapsed().as_millis() as u64,
                    "Lock acquisition failed"
                );
                return Err(E::from(err));
            }
        };

        tracing::info!(
            operation = %name,
            outcome = "acquired",
            duration_ms = started.elapsed().as_millis() as u64,
            "Lock acquired"
        );

        let mut guard = LeaseGuard::new(Arc::clone(lock), lease, name);
        let result = AssertUnwindSafe(self.run_with_extension(&mut guard, f()))
            .catch_unwind()
            .await;
        guard.release().await;

        match result {
            Ok(result) => result.map(LockOutcome::Ran),
            Err(panic) => std::panic::resume_unwind(panic),
        }
    }

    /// Drive `fut`, extending the lease whenever its remaining life drops
    /// below the extension threshold.
    async fn run_with_extension<T, E, Fut>(
        &self,
        guard: &mut LeaseGuard,
        fut: Fut,
    ) -> Result<T, E>
    where
        Fut: Future<Output = Result<T, E>>,
    {
        let threshold = self.config.extension_threshold;
        let ttl = guard.lease().map_or(Duration::ZERO, |l| l.ttl);
        // Extending a lease that can never outlive the threshold would spin.
        let usable = ttl.saturating_sub(self.config.drift_for(ttl));
        if !self.config.auto_extend || usable <= threshold {
            return fut.await;
        }

        tokio::pin!(fut);
        loop {
            let wait = guard
                .lease()
                .map_or(Duration::ZERO, |l| l.remaining().saturating_sub(threshold));
            tokio::select! {
                out = &mut fut => return out,
                _ = tokio::time::sleep(wait) => {
                    match guard.extend().await {
                        Ok(remaining) => tracing::debug!(
                            operation = %guard.name,
                            outcome = "extended",
                            state = %guard.state,
                            remaining_ms = remaining.as_millis() as u64,
                            "Lease extended"
                        ),
                        Err(err) => {
                            tracing::warn!(
                                operation = %guard.name,
                                outcome = "extend_failed",
                                state = %guard.state,
                                error = %err,
                                "Lease extension failed, operation may lose exclusivity"
                            );
                            return fut.await;
                        }
                    }
                }
            }
        }
    }

    /// Whether `name` is currently locked. `false` when no store is
    /// configured or reachable.
    pub async fn is_locked(&self, name: &str) -> bool {
        match &self.lock {
            Some(lock) => lock.is_held(&self.config.namespaced(name)).await,
            None => false,
        }
    }

    /// Lease store health as seen by this coordinator.
    pub async fn health(&self) -> HealthCheck {
        let Some(lock) = &self.lock else {
            return HealthCheck::degraded("lease_store", "no lease store configured");
        };
        let started = Instant::now();
        let reachable = lock.reachable_stores().await;
        let elapsed = started.elapsed();
        let check = if reachable >= lock.quorum() {
            HealthCheck::healthy("lease_store")
        } else {
            HealthCheck::degraded(
                "lease_store",
                format!("{reachable} of {} stores reachable", lock.store_count()),
            )
        };
        check
            .with_latency(elapsed)
            .with_gauge("reachable", reachable as u64)
            .with_gauge("quorum", lock.quorum() as u64)
    }
}

/// Holds a granted lease until released.
///
/// Dropped without `release` (the caller's future was cancelled), it hands
/// the release to the runtime.
struct LeaseGuard {
    lock: Arc<DistributedLock>,
    lease: Option<Lease>,
    state: LeaseState,
    name: String,
    acquired: Instant,
}

impl LeaseGuard {
    fn new(lock: Arc<DistributedLock>, lease: Lease, name: &str) -> Self {
        Self {
            lock,
            lease: Some(lease),
            state: LeaseState::Held,
            name: name.to_string(),
            acquired: Instant::now(),
        }
    }

    fn lease(&self) -> Option<&Lease> {
        self.lease.as_ref()
    }

    /// Move to `next`, ignoring moves the lifecycle does not allow.
    fn advance(&mut self, next: LeaseState) {
        if self.state.can_transition_to(next) {
            self.state = next;
        } else {
            tracing::debug!(
                operation = %self.name,
                from = %self.state,
                to = %next,
                "Ignoring lease state change"
            );
        }
    }

    async fn extend(&mut self) -> Result<Duration, LockError> {
        let Some(lease) = self.lease.as_mut() else {
            return Ok(Duration::ZERO);
        };
        let result = self.lock.extend(lease).await;
        let (expired, remaining) = (lease.is_expired(), lease.remaining());
        match result {
            Ok(()) => {
                self.advance(LeaseState::Held);
                Ok(remaining)
            }
            Err(err) => {
                if expired {
                    self.advance(LeaseState::Expired);
                }
                Err(err)
            }
        }
    }

    async fn release(&mut self) {
        let Some(lease) = self.lease.take() else {
            return;
        };
        if lease.is_expired() {
            self.advance(LeaseState::Expired);
        } else {
            self.advance(LeaseState::Releasing);
        }
        let started = Instant::now();
        match self.lock.release(lease).await {
            Ok(()) => {
                self.advance(LeaseState::Released);
                tracing::info!(
                    operation = %self.name,
                    outcome = "released",
                    state = %self.state,
                    held_ms = self.acquired.elapsed().as_millis() as u64,
                    duration_ms = started.elapsed().as_millis() as u64,
                    "Lock released"
                )
            }
            Err(err) => tracing::warn!(
                operation = %self.name,
                outcome = "release_failed",
                state = %self.state,
                error = %err,
                duration_ms = started.elapsed().as_millis() as u64,
                "Lock release failed, lease will expire by TTL"
            ),
        }
    }
}

impl Drop for LeaseGuard {
    fn drop(&mut self) {
        let Some(lease) = self.lease.take() else {
            return;
        };
        let lock = Arc::clone(&self.lock);
        let name = std::mem::take(&mut self.name);
        match tokio::runtime::Handle::try_current() {
            Ok(handle) => {
                handle.spawn(async move {
                    if let Err(err) = lock.release(lease).await {
                        tracing::warn!(
                            operation = %name,
                            outcome = "release_failed",
                            error = %err,
                            "Lock release after cancellation failed"
                        );
                    }
                });
            }
            Err(_) => tracing::warn!(
                operation = %name,
                outcome = "release_failed",
                "No runtime to release cancelled lease, it will expire by TTL"
            ),
        }
    }
}
