//! Name resolvers consulted by the DNS and named strategies.

use crate::config::{DNS_FALLBACK_PORT, DefaultPorts};
use async_trait::async_trait;
use common::{Error, Result};
use std::collections::HashMap;
use tokio::net::lookup_host;
use tracing::debug;

/// Resolves a service name to a `(host, port)` pair
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait Resolver: Send + Sync {
    async fn resolve(&self, name: &str) -> Result<(String, u16)>;
}

/// Resolver backed by the operating system's name lookup.
///
/// DNS carries no port, so the port comes from the well-known port table,
/// falling back to 80.
pub struct SystemDnsResolver {
    ports: DefaultPorts,
}

impl SystemDnsResolver {
    pub fn new(ports: DefaultPorts) -> Self {
        Self { ports }
    }
}

#[async_trait]
impl Resolver for SystemDnsResolver {
    async fn resolve(&self, name: &str) -> Result<(String, u16)> {
        let port = self.ports.port_for(name).unwrap_or(DNS_FALLBACK_PORT);
        let mut addrs = lookup_host((name, port)).await?;

        let addr = addrs.next().ok_or_else(|| Error::service_not_found(name))?;
        debug!(service = name, address = %addr, "DNS lookup succeeded");
        Ok((addr.ip().to_string(), port))
    }
}

/// Fixed name table, useful for pinned endpoints
#[derive(Debug, Clone, Default)]
pub struct StaticResolver {
    entries: HashMap<String, (String, u16)>,
}

impl StaticResolver {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_entry(mut self, name: impl Into<String>, host: impl Into<String>, port: u16) -> Self {
        self.entries.insert(name.into(), (host.into(), port));
        self
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

#[async_trait]
impl Resolver for StaticResolver {
    async fn resolve(&self, name: &str) -> Result<(String, u16)> {
        self.entries
            .get(name)
            .cloned()
            .ok_or_else(|| Error::service_not_found(name))
    }
}
