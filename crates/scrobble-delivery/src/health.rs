//! Store health probe.

use std::{sync::Arc, time::Duration};

use chrono::{DateTime, Utc};
use scrobble_core::{Clock, Store};
use serde::Serialize;
use tracing::{debug, error};

/// Default bound on a single health probe.
pub const DEFAULT_HEALTH_TIMEOUT: Duration = Duration::from_secs(2);

/// Health check report.
#[derive(Debug, Clone, Serialize)]
pub struct HealthReport {
    /// Overall status
    pub status: HealthStatus,
    /// When the check ran
    pub timestamp: DateTime<Utc>,
    /// Individual component checks
    pub checks: HealthChecks,
    /// Relay version
    pub version: String,
}

impl HealthReport {
    /// Returns true when every component is up.
    pub fn is_healthy(&self) -> bool {
        self.status == HealthStatus::Healthy
    }
}

/// Overall health status.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum HealthStatus {
    /// All components operational
    Healthy,
    /// A critical component is failing
    Unhealthy,
}

/// Component checks.
#[derive(Debug, Clone, Serialize)]
pub struct HealthChecks {
    /// Configured store backend
    pub store: ComponentHealth,
}

/// Health of one component.
#[derive(Debug, Clone, Serialize)]
pub struct ComponentHealth {
    /// Component status
    pub status: ComponentStatus,
    /// Backend name
    pub backend: &'static str,
    /// Failure detail when down
    #[serde(skip_serializing_if = "Option::is_none")]
    pub message: Option<String>,
    /// Probe duration in milliseconds
    pub response_time_ms: u64,
}

/// Component-level status.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum ComponentStatus {
    /// Reachable
    Up,
    /// Failing or timed out
    Down,
}

/// Runs bounded health probes against the store.
#[derive(Debug, Clone)]
pub struct HealthService {
    clock: Arc<dyn Clock>,
    timeout: Duration,
}

impl HealthService {
    /// Creates a health service with the default probe timeout.
    pub fn new(clock: Arc<dyn Clock>) -> Self {
        Self { clock, timeout: DEFAULT_HEALTH_TIMEOUT }
    }

    /// Overrides the probe timeout.
    #[must_use]
    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    /// Probes the store and reports its status.
    pub async fn check(&self, store: &dyn Store) -> HealthReport {
        let timestamp = self.clock.now_utc();
        let started = self.clock.now();

        let (status, message) = match tokio::time::timeout(self.timeout, store.ping()).await {
            Ok(Ok(())) => {
                debug!(backend = store.backend(), "store health check passed");
                (ComponentStatus::Up, None)
            },
            Ok(Err(e)) => {
                error!(backend = store.backend(), error = %e, "store health check failed");
                (ComponentStatus::Down, Some(e.to_string()))
            },
            Err(_) => {
                error!(
                    backend = store.backend(),
                    timeout_ms = u64::try_from(self.timeout.as_millis()).unwrap_or(u64::MAX),
                    "store health check timed out"
                );
                (ComponentStatus::Down, Some(format!("no response within {:?}", self.timeout)))
            },
        };
        let elapsed = self.clock.now().saturating_duration_since(started);

        let overall = match status {
            ComponentStatus::Up => HealthStatus::Healthy,
            ComponentStatus::Down => HealthStatus::Unhealthy,
        };

        HealthReport {
            status: overall,
            timestamp,
            checks: HealthChecks {
                store: ComponentHealth {
                    status,
                    backend: store.backend(),
                    message,
                    response_time_ms: u64::try_from(elapsed.as_millis()).unwrap_or(u64::MAX),
                },
            },
            version: env!("CARGO_PKG_VERSION").to_string(),
        }
    }
}
