//! KEEL Worker
//!
//! Process root for the coordination layer. Wires the lease store, durable
//! store and cache into the two workloads that must stay correct when many
//! identical instances run at once:
//!
//! - [`billing::EventProcessor`]: idempotent ingestion of billing webhooks
//! - [`jobs::ExpiringRecordSweeper`]: batched cleanup of expired records,
//!   run by one instance at a time
//!
//! Configuration comes from `KEEL_*` environment variables
//! ([`WorkerConfig::from_env`]); [`AppState::build`] turns it into a ready
//! dependency graph.

pub mod billing;
pub mod config;
pub mod constants;
pub mod db;
pub mod error;
pub mod jobs;
pub mod state;
pub mod telemetry;

pub use billing::{
    AlertSink, EventProcessor, LogAlertSink, LogNotifier, Notifier, OperatorAlert, PlanResolver,
    PriceTable, ProcessOutcome,
};
pub use config::{LeaseBackend, LeaseConfig, WorkerConfig};
pub use db::{DbClient, DbConfig};
pub use error::{WorkerError, WorkerResult};
pub use jobs::{cleanup_task, ExpiringRecordSweeper, SweepConfig, SweepMetrics, SweepReport};
pub use state::{AppState, SharedCacheBackend, WorkerCache};
pub use telemetry::{init_tracing, TelemetryConfig};
