//! Expiring Record Sweeper
//!
//! Removes records whose `expires_at` has passed, in bounded batches:
//!
//! 1. fetch up to `batch_size` expired ids, oldest first
//! 2. delete exactly those ids
//! 3. pause, then repeat until a fetch comes back short
//!
//! Deleting by id keeps every statement's lock footprint bounded no matter
//! how far behind the sweep is. A failed batch stops the sweep and reports how
//! many records were already removed; the next run resumes where it left off.
//!
//! # Configuration
//!
//! ```rust
//! use keel_worker::jobs::SweepConfig;
//! use keel_core::RecordKind;
//! use std::time::Duration;
//!
//! let config = SweepConfig {
//!     kinds: RecordKind::ALL.to_vec(),
//!     batch_size: 1000,                          // Ids per batch
//!     pause: Duration::from_millis(100),         // Between batches
//!     lock_ttl: Duration::from_secs(600),        // One exclusive sweep
//!     check_interval: Duration::from_secs(3600), // Hourly
//! };
//! ```

use crate::config::{list, millis_or, parse_or, Vars};
use crate::constants::{
    DEFAULT_SWEEP_BATCH_SIZE, DEFAULT_SWEEP_CHECK_INTERVAL_SECS, DEFAULT_SWEEP_LOCK_TTL_SECS,
    DEFAULT_SWEEP_PAUSE_MS, SWEEP_LOCK_PREFIX,
};
use chrono::Utc;
use keel_coord::{LockCoordinator, LockOutcome};
use keel_core::{ConfigError, KeelError, KeelResult, RecordKind, SweepError};
use keel_storage::ExpiringRecordStore;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::watch;
use tokio::time::{interval, MissedTickBehavior};

// ============================================================================
// CONFIGURATION
// ============================================================================

/// Configuration for the expiring record sweep.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SweepConfig {
    /// Record kinds swept each cycle (default: all)
    pub kinds: Vec<RecordKind>,

    /// Ids fetched and deleted per batch (default: 1000)
    pub batch_size: usize,

    /// Pause between batches (default: 100ms)
    pub pause: Duration,

    /// Lease TTL for one exclusive sweep of a kind (default: 10 minutes)
    pub lock_ttl: Duration,

    /// How often the periodic task sweeps (default: 1 hour)
    pub check_interval: Duration,
}

impl Default for SweepConfig {
    fn default() -> Self {
        Self {
            kinds: RecordKind::ALL.to_vec(),
            batch_size: DEFAULT_SWEEP_BATCH_SIZE,
            pause: Duration::from_millis(DEFAULT_SWEEP_PAUSE_MS),
            lock_ttl: Duration::from_secs(DEFAULT_SWEEP_LOCK_TTL_SECS),
            check_interval: Duration::from_secs(DEFAULT_SWEEP_CHECK_INTERVAL_SECS),
        }
    }
}

impl SweepConfig {
    /// # Environment Variables
    /// - `KEEL_SWEEP_KINDS`: comma separated kinds or table names (default: all)
    /// - `KEEL_SWEEP_BATCH_SIZE`: ids per batch (default: 1000)
    /// - `KEEL_SWEEP_PAUSE_MS`: pause between batches (default: 100)
    /// - `KEEL_SWEEP_LOCK_TTL_SECS`: exclusive sweep lease TTL (default: 600)
    /// - `KEEL_SWEEP_CHECK_INTERVAL_SECS`: sweep period (default: 3600)
    pub fn from_vars(vars: Vars<'_>) -> Result<Self, ConfigError> {
        let defaults = Self::default();

        let requested = list(vars, "KEEL_SWEEP_KINDS");
        let kinds = if requested.is_empty() {
            defaults.kinds
        } else {
            requested
                .iter()
                .map(|s| {
                    s.parse::<RecordKind>()
                        .map_err(|reason| ConfigError::InvalidValue {
                            field: "KEEL_SWEEP_KINDS".to_string(),
                            value: s.clone(),
                            reason,
                        })
                })
                .collect::<Result<Vec<_>, _>>()?
        };

        let batch_size = parse_or(vars, "KEEL_SWEEP_BATCH_SIZE", defaults.batch_size);
        if batch_size == 0 {
            return Err(ConfigError::InvalidValue {
                field: "KEEL_SWEEP_BATCH_SIZE".to_string(),
                value: "0".to_string(),
                reason: "must be at least 1".to_string(),
            });
        }

        Ok(Self {
            kinds,
            batch_size,
            pause: millis_or(vars, "KEEL_SWEEP_PAUSE_MS", defaults.pause),
            lock_ttl: Duration::from_secs(parse_or(
                vars,
                "KEEL_SWEEP_LOCK_TTL_SECS",
                DEFAULT_SWEEP_LOCK_TTL_SECS,
            )),
            check_interval: Duration::from_secs(parse_or(
                vars,
                "KEEL_SWEEP_CHECK_INTERVAL_SECS",
                DEFAULT_SWEEP_CHECK_INTERVAL_SECS,
            )),
        })
    }

    /// Create a configuration for development/testing with short intervals.
    pub fn development() -> Self {
        Self {
            kinds: RecordKind::ALL.to_vec(),
            batch_size: 100,
            pause: Duration::from_millis(10),
            lock_ttl: Duration::from_secs(60),
            check_interval: Duration::from_secs(10),
        }
    }
}

// ============================================================================
// METRICS
// ============================================================================

/// Counters for sweep activity since startup.
#[derive(Debug, Default)]
pub struct SweepMetrics {
    /// Sweep cycles started
    pub cycles: AtomicU64,

    /// Records deleted, including those removed by sweeps that later failed
    pub deleted: AtomicU64,

    /// Kind sweeps skipped because another instance held the lease
    pub skipped: AtomicU64,

    /// Kind sweeps that ended in an error
    pub errors: AtomicU64,
}

impl SweepMetrics {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn snapshot(&self) -> SweepSnapshot {
        SweepSnapshot {
            cycles: self.cycles.load(Ordering::Relaxed),
            deleted: self.deleted.load(Ordering::Relaxed),
            skipped: self.skipped.load(Ordering::Relaxed),
            errors: self.errors.load(Ordering::Relaxed),
        }
    }
}

/// Snapshot of sweep metrics at a point in time.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SweepSnapshot {
    pub cycles: u64,
    pub deleted: u64,
    pub skipped: u64,
    pub errors: u64,
}

// ============================================================================
// SWEEPER
// ============================================================================

/// Result of one completed sweep of a record kind.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SweepReport {
    pub kind: RecordKind,
    pub deleted: u64,
    /// Delete statements issued.
    pub batches: u64,
    pub duration: Duration,
}

pub struct ExpiringRecordSweeper {
    store: Arc<dyn ExpiringRecordStore>,
    coordinator: LockCoordinator,
    config: SweepConfig,
}

impl ExpiringRecordSweeper {
    pub fn new(
        store: Arc<dyn ExpiringRecordStore>,
        coordinator: LockCoordinator,
        config: SweepConfig,
    ) -> Self {
        Self {
            store,
            coordinator,
            config,
        }
    }

    pub fn config(&self) -> &SweepConfig {
        &self.config
    }

    /// Delete every record of `kind` that has expired, `batch_size` at a time.
    pub async fn sweep(
        &self,
        kind: RecordKind,
        batch_size: usize,
        pause: Duration,
    ) -> Result<SweepReport, SweepError> {
        let started = Instant::now();
        let batch_size = batch_size.max(1);
        let mut deleted = 0u64;
        let mut batches = 0u64;

        loop {
            let ids = self
                .store
                .find_expired(kind, Utc::now(), batch_size)
                .await
                .map_err(|e| {
                    tracing::error!(
                        kind = %kind,
                        deleted,
                        error = %e,
                        "Expired record fetch failed"
                    );
                    SweepError::FetchFailed {
                        kind: kind.to_string(),
                        deleted,
                        reason: e.to_string(),
                    }
                })?;
            if ids.is_empty() {
                break;
            }

            let batch_started = Instant::now();
            let removed = self.store.delete_by_ids(kind, &ids).await.map_err(|e| {
                tracing::error!(
                    operation = "sweep_batch",
                    kind = %kind,
                    outcome = "failed",
                    batch_len = ids.len(),
                    deleted,
                    error = %e,
                    "Sweep batch failed"
                );
                SweepError::BatchFailed {
                    kind: kind.to_string(),
                    deleted,
                    batch_len: ids.len(),
                    reason: e.to_string(),
                }
            })?;
            deleted += removed;
            batches += 1;

            tracing::info!(
                operation = "sweep_batch",
                kind = %kind,
                outcome = "deleted",
                batch = batches,
                batch_len = ids.len(),
                removed,
                total_deleted = deleted,
                duration_ms = batch_started.elapsed().as_millis() as u64,
                "Sweep batch completed"
            );

            if ids.len() < batch_size {
                break;
            }
            if !pause.is_zero() {
                tokio::time::sleep(pause).await;
            }
        }

        let duration = started.elapsed();
        tracing::info!(
            operation = "sweep",
            kind = %kind,
            outcome = "completed",
            deleted,
            batches,
            duration_ms = duration.as_millis() as u64,
            "Sweep completed"
        );
        Ok(SweepReport {
            kind,
            deleted,
            batches,
            duration,
        })
    }

    /// [`sweep`](Self::sweep) with the configured batch size and pause, run
    /// by at most one instance at a time.
    pub async fn sweep_exclusive(&self, kind: RecordKind) -> KeelResult<LockOutcome<SweepReport>> {
        let name = format!("{SWEEP_LOCK_PREFIX}{kind}");
        self.coordinator
            .execute_with_lock(&name, self.config.lock_ttl, || async {
                self.sweep(kind, self.config.batch_size, self.config.pause)
                    .await
                    .map_err(KeelError::from)
            })
            .await
    }

    /// One cycle over every configured kind. Failures are counted and the
    /// remaining kinds still run.
    pub async fn sweep_all(&self, metrics: &SweepMetrics) {
        metrics.cycles.fetch_add(1, Ordering::Relaxed);

        for &kind in &self.config.kinds {
            match self.sweep_exclusive(kind).await {
                Ok(LockOutcome::Ran(report)) | Ok(LockOutcome::RanUnprotected(report)) => {
                    metrics.deleted.fetch_add(report.deleted, Ordering::Relaxed);
                }
                Ok(LockOutcome::Skipped) => {
                    tracing::debug!(kind = %kind, "Sweep running elsewhere, skipped");
                    metrics.skipped.fetch_add(1, Ordering::Relaxed);
                }
                Err(e) => {
                    if let KeelError::Sweep(sweep_error) = &e {
                        metrics
                            .deleted
                            .fetch_add(sweep_error.deleted(), Ordering::Relaxed);
                    }
                    tracing::error!(kind = %kind, error = %e, "Sweep failed");
                    metrics.errors.fetch_add(1, Ordering::Relaxed);
                }
            }
        }
    }
}

// ============================================================================
// BACKGROUND TASK
// ============================================================================

/// Periodically sweep every configured kind until `shutdown_rx` flips to
/// `true`. Returns the metrics collected over the task's lifetime.
///
/// ```ignore
/// let (shutdown_tx, shutdown_rx) = watch::channel(false);
/// let handle = tokio::spawn(cleanup_task(Arc::clone(&sweeper), shutdown_rx));
///
/// let _ = shutdown_tx.send(true);
/// let metrics = handle.await?;
/// ```
pub async fn cleanup_task(
    sweeper: Arc<ExpiringRecordSweeper>,
    mut shutdown_rx: watch::Receiver<bool>,
) -> Arc<SweepMetrics> {
    let metrics = Arc::new(SweepMetrics::new());
    let config = sweeper.config();

    let mut sweep_interval = interval(config.check_interval);
    sweep_interval.set_missed_tick_behavior(MissedTickBehavior::Skip);

    tracing::info!(
        check_interval_secs = config.check_interval.as_secs(),
        batch_size = config.batch_size,
        kinds = config.kinds.len(),
        "Expiring record cleanup task started"
    );

    loop {
        tokio::select! {
            _ = shutdown_rx.changed() => {
                if *shutdown_rx.borrow() {
                    tracing::info!("Expiring record cleanup task shutting down");
                    break;
                }
            }

            _ = sweep_interval.tick() => {
                sweeper.sweep_all(&metrics).await;
            }
        }
    }

    let snapshot = metrics.snapshot();
    tracing::info!(
        cycles = snapshot.cycles,
        deleted = snapshot.deleted,
        skipped = snapshot.skipped,
        errors = snapshot.errors,
        "Expiring record cleanup task completed"
    );

    metrics
}
