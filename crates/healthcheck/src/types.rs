//! Health check types and structures.

use serde::{Deserialize, Serialize};
use std::fmt;
use std::time::{Duration, SystemTime};

/// Health check status
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum HealthStatus {
    /// Service answered the probe
    Healthy,
    /// Service refused or answered badly
    Unhealthy,
    /// Probe did not finish within the check timeout
    Timeout,
    /// Probe could not be carried out
    Error,
}

impl HealthStatus {
    /// Lowercase label, used for metrics
    pub fn as_str(&self) -> &'static str {
        match self {
            HealthStatus::Healthy => "healthy",
            HealthStatus::Unhealthy => "unhealthy",
            HealthStatus::Timeout => "timeout",
            HealthStatus::Error => "error",
        }
    }
}

impl fmt::Display for HealthStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            HealthStatus::Healthy => write!(f, "HEALTHY"),
            HealthStatus::Unhealthy => write!(f, "UNHEALTHY"),
            HealthStatus::Timeout => write!(f, "TIMEOUT"),
            HealthStatus::Error => write!(f, "ERROR"),
        }
    }
}

/// Outcome of probing one service
#[derive(Debug, Clone, Serialize)]
pub struct HealthCheckResult {
    pub service_name: String,

    pub status: HealthStatus,

    /// Time spent probing
    #[serde(with = "humantime_serde")]
    pub latency: Duration,

    /// Failure description
    pub error: Option<String>,

    /// Response code (for HTTP checks)
    pub response_code: Option<u16>,

    #[serde(with = "humantime_serde")]
    pub timestamp: SystemTime,
}

impl HealthCheckResult {
    fn with_status(
        service_name: impl Into<String>,
        status: HealthStatus,
        latency: Duration,
        error: Option<String>,
    ) -> Self {
        Self {
            service_name: service_name.into(),
            status,
            latency,
            error,
            response_code: None,
            timestamp: SystemTime::now(),
        }
    }

    /// Create a healthy result
    pub fn healthy(service_name: impl Into<String>, latency: Duration) -> Self {
        Self::with_status(service_name, HealthStatus::Healthy, latency, None)
    }

    /// Create an unhealthy result
    pub fn unhealthy(
        service_name: impl Into<String>,
        latency: Duration,
        message: impl Into<String>,
    ) -> Self {
        Self::with_status(
            service_name,
            HealthStatus::Unhealthy,
            latency,
            Some(message.into()),
        )
    }

    /// Create a timeout result
    pub fn timeout(service_name: impl Into<String>, latency: Duration) -> Self {
        Self::with_status(
            service_name,
            HealthStatus::Timeout,
            latency,
            Some("Health check timed out".to_string()),
        )
    }

    /// Create an error result
    pub fn error(
        service_name: impl Into<String>,
        latency: Duration,
        message: impl Into<String>,
    ) -> Self {
        Self::with_status(
            service_name,
            HealthStatus::Error,
            latency,
            Some(message.into()),
        )
    }

    pub fn with_response_code(mut self, code: u16) -> Self {
        self.response_code = Some(code);
        self
    }

    /// Check if the result is healthy
    pub fn is_healthy(&self) -> bool {
        self.status == HealthStatus::Healthy
    }
}

/// How a service is probed
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ProbeStrategy {
    /// Bounded TCP connect
    #[default]
    Tcp,
    /// Bounded GET, 2xx is healthy
    Http,
    /// Caller-supplied check
    Custom,
}

impl fmt::Display for ProbeStrategy {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ProbeStrategy::Tcp => write!(f, "tcp"),
            ProbeStrategy::Http => write!(f, "http"),
            ProbeStrategy::Custom => write!(f, "custom"),
        }
    }
}

/// Health monitor configuration
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct HealthMonitorConfig {
    /// Interval between probe cycles
    #[serde(with = "humantime_serde")]
    pub check_interval: Duration,

    /// Upper bound on a single probe
    #[serde(with = "humantime_serde")]
    pub check_timeout: Duration,

    /// Consecutive failures before a service is marked unhealthy
    pub unhealthy_threshold: u32,

    /// Consecutive successes before a service is marked healthy again
    pub healthy_threshold: u32,

    /// Deregister services that keep failing
    pub enable_auto_removal: bool,

    /// Consecutive failures before auto-removal
    pub removal_threshold: u32,

    pub default_strategy: ProbeStrategy,

    /// HTTP probe path when the service has no `health_endpoint` metadata
    pub http_path: String,
}

impl HealthMonitorConfig {
    /// Removal threshold, never below the unhealthy threshold
    pub fn effective_removal_threshold(&self) -> u32 {
        self.removal_threshold.max(self.unhealthy_threshold)
    }
}

impl Default for HealthMonitorConfig {
    fn default() -> Self {
        Self {
            check_interval: Duration::from_secs(5),
            check_timeout: Duration::from_secs(2),
            unhealthy_threshold: 3,
            healthy_threshold: 2,
            enable_auto_removal: true,
            removal_threshold: 5,
            default_strategy: ProbeStrategy::Tcp,
            http_path: "/health".to_string(),
        }
    }
}

/// Health check statistics
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct HealthCheckStats {
    /// Total checks performed
    pub total_checks: u64,

    /// Successful checks
    pub successful_checks: u64,

    /// Failed checks
    pub failed_checks: u64,

    /// Timeout count
    pub timeouts: u64,

    /// Average probe latency (milliseconds)
    pub avg_latency_ms: f64,

    /// Current consecutive successes
    pub consecutive_successes: u32,

    /// Current consecutive failures
    pub consecutive_failures: u32,

    /// Health flips written to the registry
    pub transitions: u64,
}

impl HealthCheckStats {
    /// Update stats with a check result
    pub fn update(&mut self, result: &HealthCheckResult) {
        self.total_checks += 1;

        match result.status {
            HealthStatus::Healthy => {
                self.successful_checks += 1;
                self.consecutive_successes += 1;
                self.consecutive_failures = 0;
            }
            HealthStatus::Unhealthy | HealthStatus::Error => {
                self.failed_checks += 1;
                self.consecutive_failures += 1;
                self.consecutive_successes = 0;
            }
            HealthStatus::Timeout => {
                self.timeouts += 1;
                self.consecutive_failures += 1;
                self.consecutive_successes = 0;
            }
        }

        let latency_ms = result.latency.as_secs_f64() * 1000.0;
        self.avg_latency_ms = (self.avg_latency_ms * (self.total_checks - 1) as f64 + latency_ms)
            / self.total_checks as f64;
    }

    /// Clear the hysteresis counters
    pub fn reset_counts(&mut self) {
        self.consecutive_successes = 0;
        self.consecutive_failures = 0;
    }
}
