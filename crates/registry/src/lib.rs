//! Service registry for Waypoint.
//!
//! The registry maps a service name to its current [`ServiceRecord`]. Every
//! record carries a TTL; a service that stops heartbeating past its TTL is
//! treated as gone by all reads and is eventually purged by the background
//! sweep started with [`ServiceRegistry::start`]. Every removal, whether
//! by expiry or `deregister`, is reported to hooks installed with
//! [`ServiceRegistry::on_remove`].
//!
//! ```no_run
//! use registry::{ServiceRecord, ServiceRegistry};
//! use std::sync::Arc;
//!
//! # async fn example() -> common::Result<()> {
//! let registry = Arc::new(ServiceRegistry::default());
//! registry.start().await?;
//!
//! registry.register(ServiceRecord::new("orders", "10.0.0.5", 8081)).await?;
//! registry.heartbeat("orders").await?;
//!
//! let record = registry.get("orders").await?;
//! assert_eq!(record.address(), "10.0.0.5:8081");
//!
//! registry.stop().await?;
//! # Ok(())
//! # }
//! ```

pub mod registry;
pub mod types;

pub use registry::{RemovalCause, RemovalHook, ServiceRegistry};
pub use types::{HEALTH_ENDPOINT_KEY, Protocol, RegistryConfig, ServiceRecord};
