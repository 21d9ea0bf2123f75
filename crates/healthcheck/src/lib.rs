//! Health monitoring for registered Waypoint services.
//!
//! The [`HealthMonitor`] periodically probes every service in a
//! [`registry::ServiceRegistry`] and writes verdicts back to the record's
//! `healthy` flag. Supported probes:
//! - TCP connection checks
//! - HTTP/HTTPS checks (2xx is healthy, path from the `health_endpoint`
//!   metadata key)
//! - Custom checks, either a predicate or any [`HealthChecker`]
//!
//! # Features
//!
//! - Concurrent probing, each probe bounded by the check timeout
//! - Configurable rise/fall thresholds
//! - Optional auto-removal of persistently failing services
//! - Per-service statistics
//!
//! # Example
//!
//! ```no_run
//! use healthcheck::{HealthMonitor, HealthMonitorConfig, ProbeStrategy};
//! use registry::{ServiceRecord, ServiceRegistry};
//! use std::sync::Arc;
//!
//! # async fn example() -> common::Result<()> {
//! let registry = Arc::new(ServiceRegistry::default());
//! registry.register(ServiceRecord::new("web", "10.0.0.7", 8081)).await?;
//!
//! let monitor = Arc::new(HealthMonitor::new(HealthMonitorConfig::default(), registry)?);
//! monitor.set_service_strategy("web", ProbeStrategy::Http);
//! monitor.start().await?;
//!
//! let result = monitor.check_service_health("web").await?;
//! println!("web is {}", result.status);
//!
//! monitor.stop().await?;
//! # Ok(())
//! # }
//! ```

pub mod checkers;
pub mod monitor;
pub mod types;

pub use checkers::{CustomCheck, FnChecker, HealthChecker, HttpChecker, TcpChecker};
pub use monitor::HealthMonitor;
pub use types::{
    HealthCheckResult, HealthCheckStats, HealthMonitorConfig, HealthStatus, ProbeStrategy,
};
