//! Quorum lease lock.
//!
//! A lease is granted when a majority of stores accepted the owner token
//! and enough of the TTL survives acquisition latency and clock drift.
//! With one store the quorum is one and the algorithm reduces to a plain
//! `SET NX PX` lock.

use futures_util::future::join_all;
use keel_core::{new_owner_token, ConfigError, Lease, LockConfig, LockError};
use keel_storage::LeaseStore;
use rand::Rng;
use std::sync::Arc;
use std::time::{Duration, Instant};

/// Why an acquisition attempt did not produce a lease.
enum AttemptFailure {
    /// Another owner holds the key on enough stores.
    Contended,
    /// Store errors left too few stores to reach quorum.
    Store(String),
    /// Quorum reached but acquisition ate the whole TTL.
    ValidityExhausted,
}

/// Best-effort exclusive leases with bounded lifetime.
///
/// Owned by the process's dependency root and shared by reference; holds no
/// global state.
pub struct DistributedLock {
    stores: Vec<Arc<dyn LeaseStore>>,
    config: LockConfig,
}

impl std::fmt::Debug for DistributedLock {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DistributedLock")
            .field(
                "stores",
                &self.stores.iter().map(|s| s.name()).collect::<Vec<_>>(),
            )
            .field("config", &self.config)
            .finish()
    }
}

impl DistributedLock {
    pub fn new(stores: Vec<Arc<dyn LeaseStore>>, config: LockConfig) -> Result<Self, ConfigError> {
        if stores.is_empty() {
            return Err(ConfigError::MissingRequired {
                field: "lease store".to_string(),
            });
        }
        config.validate()?;
        Ok(Self { stores, config })
    }

    /// Lock over a single store.
    pub fn single(store: Arc<dyn LeaseStore>, config: LockConfig) -> Result<Self, ConfigError> {
        Self::new(vec![store], config)
    }

    pub fn config(&self) -> &LockConfig {
        &self.config
    }

    pub fn store_count(&self) -> usize {
        self.stores.len()
    }

    /// Stores that must agree for a lease to be granted.
    pub fn quorum(&self) -> usize {
        self.stores.len() / 2 + 1
    }

    /// Number of stores answering `ping`.
    pub async fn reachable_stores(&self) -> usize {
        join_all(self.stores.iter().map(|s| s.ping()))
            .await
            .into_iter()
            .filter(Result::is_ok)
            .count()
    }

    /// Acquire `resource_key` for `ttl`.
    ///
    /// Fails with `Unavailable` before touching any key when fewer than a
    /// quorum of stores answer, with `Held` when every attempt lost to
    /// another owner, and with `AcquireFailed` otherwise.
    pub async fn acquire(&self, resource_key: &str, ttl: Duration) -> Result<Lease, LockError> {
        self.ensure_available(resource_key).await?;

        let attempts = self.config.retry_count + 1;
        let mut last_failure = AttemptFailure::Contended;
        for attempt in 0..attempts {
            if attempt > 0 {
                tokio::time::sleep(self.backoff()).await;
            }
            match self.try_acquire(resource_key, ttl).await {
                Ok(lease) => {
                    tracing::debug!(
                        resource = %resource_key,
                        attempt = attempt + 1,
                        validity_ms = lease.remaining().as_millis() as u64,
                        "Lease granted"
                    );
                    return Ok(lease);
                }
                Err(failure) => last_failure = failure,
            }
        }

        Err(match last_failure {
            AttemptFailure::Contended => LockError::Held {
                resource: resource_key.to_string(),
            },
            AttemptFailure::Store(reason) => LockError::AcquireFailed {
                resource: resource_key.to_string(),
                reason,
            },
            AttemptFailure::ValidityExhausted => LockError::AcquireFailed {
                resource: resource_key.to_string(),
                reason: format!("lease validity exhausted during acquisition (ttl {ttl:?})"),
            },
        })
    }

    async fn try_acquire(
        &self,
        resource_key: &str,
        ttl: Duration,
    ) -> Result<Lease, AttemptFailure> {
        let token = new_owner_token();
        let started = Instant::now();
        let results = join_all(
            self.stores
                .iter()
                .map(|s| s.set_if_absent(resource_key, &token, ttl)),
        )
        .await;

        let mut votes = 0;
        let mut errors = Vec::new();
        for (store, result) in self.stores.iter().zip(results) {
            match result {
                Ok(true) => votes += 1,
                Ok(false) => {}
                Err(err) => errors.push(format!("{}: {}", store.name(), err)),
            }
        }

        let validity = ttl
            .checked_sub(started.elapsed() + self.config.drift_for(ttl))
            .unwrap_or(Duration::ZERO);
        if votes >= self.quorum() && !validity.is_zero() {
            return Ok(Lease::new(resource_key, token, ttl, validity));
        }

        if votes > 0 {
            self.rollback(resource_key, &token).await;
        }
        if votes >= self.quorum() {
            Err(AttemptFailure::ValidityExhausted)
        } else if self.stores.len() - errors.len() < self.quorum() {
            Err(AttemptFailure::Store(errors.join("; ")))
        } else {
            Err(AttemptFailure::Contended)
        }
    }

    /// Undo a partial acquisition. Keys left behind expire with their TTL.
    async fn rollback(&self, resource_key: &str, token: &str) {
        let results = join_all(
            self.stores
                .iter()
                .map(|s| s.compare_and_delete(resource_key, token)),
        )
        .await;
        for (store, result) in self.stores.iter().zip(results) {
            if let Err(err) = result {
                tracing::debug!(
                    resource = %resource_key,
                    store = %store.name(),
                    error = %err,
                    "Rollback of partial lease failed"
                );
            }
        }
    }

    /// Release a lease. Releasing an expired lease is a no-op.
    ///
    /// Only deletes keys still holding this lease's owner token, so a key
    /// re-acquired by someone else after expiry is left alone.
    pub async fn release(&self, lease: Lease) -> Result<(), LockError> {
        if lease.is_expired() {
            tracing::debug!(
                resource = %lease.resource_key,
                state = %lease.state(),
                "Lease already expired, nothing to release"
            );
            return Ok(());
        }

        let results = join_all(
            self.stores
                .iter()
                .map(|s| s.compare_and_delete(&lease.resource_key, &lease.owner_token)),
        )
        .await;
        let errors: Vec<String> = self
            .stores
            .iter()
            .zip(results)
            .filter_map(|(store, result)| result.err().map(|e| format!("{}: {}", store.name(), e)))
            .collect();

        if errors.is_empty() {
            Ok(())
        } else {
            Err(LockError::ReleaseFailed {
                resource: lease.resource_key,
                reason: errors.join("; "),
            })
        }
    }

    /// Refresh the lease TTL on a quorum of stores.
    pub async fn extend(&self, lease: &mut Lease) -> Result<(), LockError> {
        if lease.is_expired() {
            return Err(LockError::ExtendFailed {
                resource: lease.resource_key.clone(),
                reason: format!("lease is {}", lease.state()),
            });
        }

        let started = Instant::now();
        let results = join_all(
            self.stores
                .iter()
                .map(|s| s.extend(&lease.resource_key, &lease.owner_token, lease.ttl)),
        )
        .await;
        let mut votes = 0;
        let mut errors = Vec::new();
        for (store, result) in self.stores.iter().zip(results) {
            match result {
                Ok(true) => votes += 1,
                Ok(false) => {}
                Err(err) => errors.push(format!("{}: {}", store.name(), err)),
            }
        }

        let validity = lease
            .ttl
            .checked_sub(started.elapsed() + self.config.drift_for(lease.ttl))
            .unwrap_or(Duration::ZERO);
        if votes >= self.quorum() && !validity.is_zero() {
            lease.renew(validity);
            return Ok(());
        }

        let reason = if errors.is_empty() {
            format!("only {votes} of {} stores still held the lease", self.stores.len())
        } else {
            errors.join("; ")
        };
        Err(LockError::ExtendFailed {
            resource: lease.resource_key.clone(),
            reason,
        })
    }

    /// Whether a quorum of stores holds `resource_key`. Store errors count as
    /// absence.
    pub async fn is_held(&self, resource_key: &str) -> bool {
        let held = join_all(self.stores.iter().map(|s| s.exists(resource_key)))
            .await
            .into_iter()
            .filter(|r| matches!(r, Ok(true)))
            .count();
        held >= self.quorum()
    }

    async fn ensure_available(&self, resource_key: &str) -> Result<(), LockError> {
        let results = join_all(self.stores.iter().map(|s| s.ping())).await;
        let failures: Vec<String> = self
            .stores
            .iter()
            .zip(results)
            .filter_map(|(store, result)| result.err().map(|e| format!("{}: {}", store.name(), e)))
            .collect();
        if self.stores.len() - failures.len() < self.quorum() {
            return Err(LockError::Unavailable {
                resource: resource_key.to_string(),
                reason: failures.join("; "),
            });
        }
        Ok(())
    }

    /// Base delay plus uniform jitter.
    fn backoff(&self) -> Duration {
        let jitter_ms = self.config.retry_jitter.as_millis() as u64;
        let jitter = if jitter_ms == 0 {
            0
        } else {
            rand::rng().random_range(0..=jitter_ms)
        };
        self.config.retry_delay + Duration::from_millis(jitter)
    }
}
