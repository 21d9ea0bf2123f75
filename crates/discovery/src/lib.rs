//! Service discovery for Waypoint.
//!
//! [`DiscoveryClient`] is the entry point services use to register
//! themselves (with a port assigned from the allocator when they ask for
//! port 0) and to find each other. Lookups try a configurable, ordered list
//! of strategies:
//!
//! - `registry`: healthy, unexpired records in the local registry
//! - `default_port`: a quick TCP probe of `localhost` on a well-known port
//! - `dns`: the configured [`Resolver`], the system resolver by default
//! - `broadcast`: UDP multicast on the local network, see [`BroadcastService`]
//! - any name registered with [`DiscoveryClient::add_resolver`]
//!
//! # Example
//!
//! ```no_run
//! use discovery::{DiscoveryClient, DiscoveryClientConfig};
//! use portalloc::PortAllocator;
//! use registry::{ServiceRecord, ServiceRegistry};
//! use std::sync::Arc;
//! use std::time::Duration;
//!
//! # async fn example() -> common::Result<()> {
//! let client = DiscoveryClient::new(
//!     DiscoveryClientConfig::default(),
//!     Arc::new(ServiceRegistry::default()),
//!     Arc::new(PortAllocator::default()),
//! );
//!
//! let stored = client.register(ServiceRecord::new("billing-api", "10.0.0.4", 0)).await?;
//! println!("billing-api listens on {}", stored.port);
//!
//! let found = client.wait_for_service("ledger-db", Duration::from_secs(10)).await?;
//! println!("ledger-db at {} via {}", found.address(), found.strategy);
//! # Ok(())
//! # }
//! ```

pub mod broadcast;
pub mod client;
pub mod config;
pub mod resolver;
pub mod stats;
pub mod strategy;

pub use broadcast::{
    Announcement, BroadcastConfig, BroadcastMessage, BroadcastService, DEFAULT_MULTICAST_GROUP,
    MessageKind,
};
pub use client::DiscoveryClient;
pub use config::{DNS_FALLBACK_PORT, DefaultPorts, DiscoveryClientConfig};
pub use resolver::{Resolver, StaticResolver, SystemDnsResolver};
pub use stats::DiscoveryStats;
pub use strategy::{DiscoveryResult, DiscoveryStrategy};
