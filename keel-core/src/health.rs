//! Component health as reported at worker startup.
//!
//! Lets an operator tell shared, local and disabled coordination apart
//! before the first lock is ever taken.

use std::collections::BTreeMap;
use std::fmt;
use std::time::Duration;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum HealthStatus {
    Healthy,
    /// Working, but without cross-instance guarantees.
    Degraded,
    Unhealthy,
}

impl HealthStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            HealthStatus::Healthy => "healthy",
            HealthStatus::Degraded => "degraded",
            HealthStatus::Unhealthy => "unhealthy",
        }
    }
}

impl fmt::Display for HealthStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Result of checking one component.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HealthCheck {
    pub component: String,
    pub status: HealthStatus,
    /// Why the component is not healthy.
    pub message: Option<String>,
    /// Time the check took.
    pub latency: Option<Duration>,
    /// Counts observed by the check, such as reachable stores or pool size.
    pub gauges: BTreeMap<String, u64>,
}

impl HealthCheck {
    fn new(component: impl Into<String>, status: HealthStatus, message: Option<String>) -> Self {
        Self {
            component: component.into(),
            status,
            message,
            latency: None,
            gauges: BTreeMap::new(),
        }
    }

    pub fn healthy(component: impl Into<String>) -> Self {
        Self::new(component, HealthStatus::Healthy, None)
    }

    pub fn degraded(component: impl Into<String>, message: impl Into<String>) -> Self {
        Self::new(component, HealthStatus::Degraded, Some(message.into()))
    }

    pub fn unhealthy(component: impl Into<String>, message: impl Into<String>) -> Self {
        Self::new(component, HealthStatus::Unhealthy, Some(message.into()))
    }

    pub fn with_latency(mut self, latency: Duration) -> Self {
        self.latency = Some(latency);
        self
    }

    pub fn with_gauge(mut self, name: impl Into<String>, value: u64) -> Self {
        self.gauges.insert(name.into(), value);
        self
    }

    pub fn gauge(&self, name: &str) -> Option<u64> {
        self.gauges.get(name).copied()
    }

    pub fn latency_ms(&self) -> Option<u64> {
        self.latency.map(|d| d.as_millis() as u64)
    }

    pub fn is_healthy(&self) -> bool {
        self.status == HealthStatus::Healthy
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_degraded_with_gauges() {
        let check = HealthCheck::degraded("lease_store", "1 of 3 stores reachable")
            .with_gauge("reachable", 1)
            .with_gauge("quorum", 2)
            .with_latency(Duration::from_millis(3));

        assert!(!check.is_healthy());
        assert_eq!(check.status.to_string(), "degraded");
        assert_eq!(check.latency_ms(), Some(3));
        assert_eq!(check.gauge("reachable"), Some(1));
        assert_eq!(check.gauge("pool_size"), None);
    }
}
