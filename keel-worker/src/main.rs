//! KEEL worker entry point
//!
//! Loads configuration, connects the stores, runs the expiring record
//! cleanup task and waits for Ctrl-C.

use std::sync::Arc;

use keel_core::HealthStatus;
use keel_worker::{
    cleanup_task, init_tracing, AppState, WorkerConfig, WorkerError, WorkerResult,
};
use tokio::sync::watch;

#[tokio::main]
async fn main() -> WorkerResult<()> {
    let config = WorkerConfig::from_env()?;
    init_tracing(&config.telemetry)?;

    tracing::info!(
        lease_backend = %config.lease.backend,
        lease_nodes = config.lease.redis_urls.len(),
        sweep_kinds = config.sweep.kinds.len(),
        "Starting KEEL worker"
    );

    let state = AppState::build(&config).await?;
    for check in state.health().await {
        match check.status {
            HealthStatus::Healthy => tracing::info!(
                component = %check.component,
                latency_ms = ?check.latency_ms(),
                gauges = ?check.gauges,
                "Component healthy"
            ),
            _ => tracing::warn!(
                component = %check.component,
                status = %check.status,
                message = ?check.message,
                gauges = ?check.gauges,
                "Component not healthy"
            ),
        }
    }

    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    let cleanup = tokio::spawn(cleanup_task(Arc::clone(&state.sweeper), shutdown_rx));

    tokio::signal::ctrl_c()
        .await
        .map_err(|e| WorkerError::Task(format!("Failed to listen for shutdown: {}", e)))?;
    tracing::info!("Shutdown signal received");

    let _ = shutdown_tx.send(true);
    let metrics = cleanup
        .await
        .map_err(|e| WorkerError::Task(format!("Cleanup task panicked: {}", e)))?;

    let snapshot = metrics.snapshot();
    let stats = state.cache.stats();
    tracing::info!(
        sweep_cycles = snapshot.cycles,
        records_deleted = snapshot.deleted,
        sweeps_skipped = snapshot.skipped,
        sweep_errors = snapshot.errors,
        cache_backend_errors = stats.backend_errors,
        uptime_secs = state.start_time.elapsed().as_secs(),
        "KEEL worker stopped"
    );
    Ok(())
}
