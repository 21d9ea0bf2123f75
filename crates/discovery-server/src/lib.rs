//! Waypoint discovery daemon
//!
//! Hosts the service registry, port allocator, health monitor and discovery
//! client in one process, and exposes them over a small HTTP surface.
//!
//! # Endpoints
//!
//! - `GET /healthz`: liveness
//! - `GET /metrics`: Prometheus text format
//! - `GET /services[?healthy=true]`: live records
//! - `GET /services/:name`: one record with its last probe and statistics
//! - `GET /discover/:name`: run the configured discovery strategies
//! - `GET /config`, `PUT /config`: read or replace the live configuration
//! - `PUT /config/ranges/:name`: add or replace a port range
//! - `POST /config/reserved-ports/:port`, `DELETE /config/reserved-ports/:port`
//! - `POST /config/lock`, `POST /config/unlock`
//!
//! Configuration is YAML, searched in `/etc/waypoint/discoveryd.yaml`,
//! `~/.config/waypoint/discoveryd.yaml` and `./discoveryd.yaml`.

pub mod collector;
pub mod config;
pub mod config_manager;
pub mod http_server;
pub mod metrics;
pub mod server;

pub use collector::MetricsCollector;
pub use config::{BroadcastSettings, Config, ConfigError, LogFormat};
pub use config_manager::{ConfigChange, ConfigManager, UpdateCallback};
pub use http_server::{AppState, HttpServer, router};
pub use metrics::MetricsRegistry;
pub use server::DiscoveryServer;
