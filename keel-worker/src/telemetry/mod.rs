//! Worker telemetry
//!
//! Structured logging through `tracing`; the subscriber is installed once by
//! the binary.

pub mod tracer;

pub use tracer::{init_tracing, LogFormat, TelemetryConfig};
