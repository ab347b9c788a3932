//! Background Jobs for the KEEL worker
//!
//! - `sweeper`: removes expired sessions and one-time tokens in bounded
//!   batches, one instance at a time
//!
//! # Usage
//!
//! ```ignore
//! use keel_worker::jobs::{cleanup_task, ExpiringRecordSweeper, SweepConfig};
//! use tokio::sync::watch;
//!
//! let (shutdown_tx, shutdown_rx) = watch::channel(false);
//! let sweeper = Arc::new(ExpiringRecordSweeper::new(store, coordinator, SweepConfig::default()));
//! tokio::spawn(cleanup_task(sweeper, shutdown_rx));
//!
//! // On shutdown
//! let _ = shutdown_tx.send(true);
//! ```

pub mod sweeper;

pub use sweeper::{
    cleanup_task, ExpiringRecordSweeper, SweepConfig, SweepMetrics, SweepReport, SweepSnapshot,
};
