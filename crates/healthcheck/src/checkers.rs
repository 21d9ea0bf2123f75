//! Health check implementations.

use crate::types::HealthCheckResult;
use async_trait::async_trait;
use common::{Error, Result};
use registry::{HEALTH_ENDPOINT_KEY, Protocol, ServiceRecord};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::net::TcpStream;
use tokio::time::timeout;
use tracing::{debug, warn};

/// Caller-supplied health predicate, run on the blocking pool
pub type CustomCheck = Arc<dyn Fn(&ServiceRecord) -> Result<()> + Send + Sync>;

/// Health checker trait
#[async_trait]
pub trait HealthChecker: Send + Sync {
    /// Probe one service
    async fn check(&self, record: &ServiceRecord) -> HealthCheckResult;

    /// Get the name of this checker
    fn name(&self) -> &str;
}

/// TCP health checker
pub struct TcpChecker {
    timeout_duration: Duration,
}

impl TcpChecker {
    /// Create a new TCP health checker
    pub fn new(timeout_duration: Duration) -> Self {
        Self { timeout_duration }
    }
}

#[async_trait]
impl HealthChecker for TcpChecker {
    async fn check(&self, record: &ServiceRecord) -> HealthCheckResult {
        let start = Instant::now();
        let target = record.address();

        match timeout(self.timeout_duration, TcpStream::connect(target.as_str())).await {
            Ok(Ok(_stream)) => {
                let duration = start.elapsed();
                debug!(service = %record.name, target = %target, duration_ms = duration.as_millis(), "TCP check successful");
                HealthCheckResult::healthy(&record.name, duration)
            }
            Ok(Err(e)) => {
                let duration = start.elapsed();
                warn!(service = %record.name, target = %target, error = %e, "TCP check failed");
                HealthCheckResult::unhealthy(
                    &record.name,
                    duration,
                    format!("Connection failed: {}", e),
                )
            }
            Err(_) => {
                let duration = start.elapsed();
                warn!(service = %record.name, target = %target, "TCP check timed out");
                HealthCheckResult::timeout(&record.name, duration)
            }
        }
    }

    fn name(&self) -> &str {
        "tcp"
    }
}

/// HTTP health checker
///
/// Issues a GET against the service's health endpoint. Any 2xx answer is
/// healthy; redirects are reported as-is rather than followed.
pub struct HttpChecker {
    default_path: String,
    timeout_duration: Duration,
    client: reqwest::Client,
}

impl HttpChecker {
    /// Create a new HTTP health checker
    pub fn new(default_path: impl Into<String>, timeout_duration: Duration) -> Result<Self> {
        let client = reqwest::Client::builder()
            .timeout(timeout_duration)
            .redirect(reqwest::redirect::Policy::none())
            .build()
            .map_err(|e| Error::config(format!("failed to build HTTP client: {e}")))?;

        Ok(Self {
            default_path: default_path.into(),
            timeout_duration,
            client,
        })
    }

    /// Probe URL for a service
    pub fn url_for(&self, record: &ServiceRecord) -> String {
        let scheme = match record.protocol {
            Protocol::Https => "https",
            _ => "http",
        };
        let path = record
            .metadata
            .get(HEALTH_ENDPOINT_KEY)
            .map(String::as_str)
            .unwrap_or(&self.default_path);

        if path.starts_with('/') {
            format!("{}://{}{}", scheme, record.address(), path)
        } else {
            format!("{}://{}/{}", scheme, record.address(), path)
        }
    }
}

#[async_trait]
impl HealthChecker for HttpChecker {
    async fn check(&self, record: &ServiceRecord) -> HealthCheckResult {
        let start = Instant::now();
        let url = self.url_for(record);

        match timeout(self.timeout_duration, self.client.get(&url).send()).await {
            Ok(Ok(response)) => {
                let duration = start.elapsed();
                let status = response.status();

                if status.is_success() {
                    debug!(service = %record.name, url = %url, status = status.as_u16(), duration_ms = duration.as_millis(),
                           "HTTP check successful");
                    HealthCheckResult::healthy(&record.name, duration)
                        .with_response_code(status.as_u16())
                } else {
                    warn!(service = %record.name, url = %url, status = status.as_u16(), "HTTP check failed: unexpected status code");
                    HealthCheckResult::unhealthy(
                        &record.name,
                        duration,
                        format!("Unexpected status code: {}", status.as_u16()),
                    )
                    .with_response_code(status.as_u16())
                }
            }
            Ok(Err(e)) if e.is_timeout() => {
                let duration = start.elapsed();
                warn!(service = %record.name, url = %url, "HTTP check timed out");
                HealthCheckResult::timeout(&record.name, duration)
            }
            Ok(Err(e)) => {
                let duration = start.elapsed();
                warn!(service = %record.name, url = %url, error = %e, "HTTP check failed");
                HealthCheckResult::unhealthy(
                    &record.name,
                    duration,
                    format!("HTTP request failed: {}", e),
                )
            }
            Err(_) => {
                let duration = start.elapsed();
                warn!(service = %record.name, url = %url, "HTTP check timed out");
                HealthCheckResult::timeout(&record.name, duration)
            }
        }
    }

    fn name(&self) -> &str {
        "http"
    }
}

/// Adapter running a [`CustomCheck`] on the blocking pool
pub struct FnChecker {
    check: CustomCheck,
}

impl FnChecker {
    pub fn new(check: CustomCheck) -> Self {
        Self { check }
    }
}

#[async_trait]
impl HealthChecker for FnChecker {
    async fn check(&self, record: &ServiceRecord) -> HealthCheckResult {
        let start = Instant::now();
        let check = self.check.clone();
        let owned = record.clone();

        match tokio::task::spawn_blocking(move || check(&owned)).await {
            Ok(Ok(())) => HealthCheckResult::healthy(&record.name, start.elapsed()),
            Ok(Err(e)) => {
                warn!(service = %record.name, error = %e, "Custom check failed");
                HealthCheckResult::unhealthy(&record.name, start.elapsed(), e.to_string())
            }
            Err(e) => {
                warn!(service = %record.name, error = %e, "Custom check panicked");
                HealthCheckResult::error(
                    &record.name,
                    start.elapsed(),
                    format!("custom check aborted: {e}"),
                )
            }
        }
    }

    fn name(&self) -> &str {
        "custom"
    }
}
