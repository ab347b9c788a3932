//! Tracing subscriber initialization

use crate::config::Vars;
use crate::constants::{DEFAULT_LOG_FILTER, DEFAULT_SERVICE_NAME};
use crate::error::{WorkerError, WorkerResult};
use std::str::FromStr;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

/// Log record encoding.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum LogFormat {
    /// One JSON object per record, for log shippers.
    Json,
    #[default]
    Text,
}

impl FromStr for LogFormat {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_lowercase().as_str() {
            "json" => Ok(LogFormat::Json),
            "text" | "pretty" | "compact" => Ok(LogFormat::Text),
            other => Err(format!("unknown log format: {other}")),
        }
    }
}

/// Telemetry configuration from environment variables.
#[derive(Debug, Clone)]
pub struct TelemetryConfig {
    /// Service name attached to every record
    pub service_name: String,
    /// Service version
    pub service_version: String,
    /// Environment (production, staging, development)
    pub environment: String,
    pub log_format: LogFormat,
    /// Filter used when `RUST_LOG` is unset
    pub default_filter: String,
}

impl Default for TelemetryConfig {
    fn default() -> Self {
        Self {
            service_name: DEFAULT_SERVICE_NAME.to_string(),
            service_version: env!("CARGO_PKG_VERSION").to_string(),
            environment: "development".to_string(),
            log_format: LogFormat::Text,
            default_filter: DEFAULT_LOG_FILTER.to_string(),
        }
    }
}

impl TelemetryConfig {
    /// # Environment Variables
    /// - `KEEL_SERVICE_NAME` (default: `keel-worker`)
    /// - `KEEL_SERVICE_VERSION` (default: crate version)
    /// - `KEEL_ENVIRONMENT` (default: development)
    /// - `KEEL_LOG_FORMAT`: `json` or `text` (default: text)
    pub fn from_vars(vars: Vars<'_>) -> Self {
        let defaults = Self::default();
        Self {
            service_name: vars("KEEL_SERVICE_NAME").unwrap_or(defaults.service_name),
            service_version: vars("KEEL_SERVICE_VERSION").unwrap_or(defaults.service_version),
            environment: vars("KEEL_ENVIRONMENT").unwrap_or(defaults.environment),
            log_format: vars("KEEL_LOG_FORMAT")
                .and_then(|s| s.parse().ok())
                .unwrap_or(defaults.log_format),
            default_filter: defaults.default_filter,
        }
    }
}

/// Install the global tracing subscriber.
///
/// Call once at startup, before anything logs. Fails if a subscriber is
/// already installed.
pub fn init_tracing(config: &TelemetryConfig) -> WorkerResult<()> {
    let env_filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(&config.default_filter));

    let registry = tracing_subscriber::registry().with(env_filter);
    let result = match config.log_format {
        LogFormat::Json => registry
            .with(tracing_subscriber::fmt::layer().json())
            .try_init(),
        LogFormat::Text => registry
            .with(tracing_subscriber::fmt::layer().compact())
            .try_init(),
    };
    result.map_err(|e| WorkerError::Telemetry(format!("Failed to init subscriber: {}", e)))?;

    tracing::info!(
        service_name = %config.service_name,
        service_version = %config.service_version,
        environment = %config.environment,
        log_format = ?config.log_format,
        "Telemetry initialized"
    );

    Ok(())
}
