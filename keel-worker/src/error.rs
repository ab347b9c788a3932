//! Worker process errors

use keel_core::{ConfigError, KeelError, StorageError, StoreError};
use thiserror::Error;

/// Errors that stop the worker from starting or shutting down cleanly.
#[derive(Debug, Error)]
pub enum WorkerError {
    #[error(transparent)]
    Keel(#[from] KeelError),

    #[error("Config error: {0}")]
    Config(#[from] ConfigError),

    #[error("Storage error: {0}")]
    Storage(#[from] StorageError),

    #[error("Lease store error: {0}")]
    Store(#[from] StoreError),

    #[error("Telemetry error: {0}")]
    Telemetry(String),

    #[error("Background task failed: {0}")]
    Task(String),
}

pub type WorkerResult<T> = Result<T, WorkerError>;
