//! Discovery client configuration.

use crate::strategy::DiscoveryStrategy;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::time::Duration;

/// Port assumed for DNS answers when the name has no well-known port
pub const DNS_FALLBACK_PORT: u16 = 80;

/// Name keywords and the well-known port they imply
const PORT_KEYWORDS: &[(&str, u16)] = &[
    ("postgresql", 5432),
    ("postgres", 5432),
    ("pg", 5432),
    ("redis", 6379),
    ("cache", 6379),
    ("grpc", 9090),
    ("metrics", 9100),
    ("prometheus", 9100),
    ("api", 8080),
    ("http", 8080),
];

/// Well-known ports by service name
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct DefaultPorts(BTreeMap<String, u16>);

impl DefaultPorts {
    pub fn new(ports: BTreeMap<String, u16>) -> Self {
        Self(ports)
    }

    pub fn insert(&mut self, name: impl Into<String>, port: u16) {
        self.0.insert(name.into(), port);
    }

    /// Exact table entry, else a keyword guess from the name
    pub fn port_for(&self, service_name: &str) -> Option<u16> {
        if let Some(&port) = self.0.get(service_name) {
            return Some(port);
        }

        let lower = service_name.to_ascii_lowercase();
        let tokens: Vec<&str> = lower.split(['-', '_', '.', ':']).collect();
        PORT_KEYWORDS
            .iter()
            .find(|(keyword, _)| {
                tokens.contains(keyword) || (keyword.len() >= 4 && lower.contains(keyword))
            })
            .map(|(_, port)| *port)
    }

    pub fn iter(&self) -> impl Iterator<Item = (&String, &u16)> {
        self.0.iter()
    }
}

impl Default for DefaultPorts {
    fn default() -> Self {
        Self(
            [
                ("database", 5432),
                ("cache", 6379),
                ("api", 8080),
                ("grpc", 9090),
                ("metrics", 9100),
            ]
            .into_iter()
            .map(|(name, port)| (name.to_string(), port))
            .collect(),
        )
    }
}

/// Discovery client configuration
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct DiscoveryClientConfig {
    /// Strategies tried, strictly in this order
    pub preferred_strategies: Vec<DiscoveryStrategy>,

    /// Allow the DNS strategy
    pub enable_dns: bool,

    /// Upper bound on one `discover` call
    #[serde(with = "humantime_serde")]
    pub discovery_timeout: Duration,

    /// Pause between attempts in `wait_for_service`
    #[serde(with = "humantime_serde")]
    pub wait_poll_interval: Duration,

    pub default_ports: DefaultPorts,
}

impl Default for DiscoveryClientConfig {
    fn default() -> Self {
        Self {
            preferred_strategies: vec![DiscoveryStrategy::Registry, DiscoveryStrategy::Dns],
            enable_dns: true,
            discovery_timeout: Duration::from_secs(5),
            wait_poll_interval: Duration::from_millis(100),
            default_ports: DefaultPorts::default(),
        }
    }
}
