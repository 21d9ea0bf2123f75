//! Discovery strategies and results.

use registry::ServiceRecord;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::time::Duration;

/// Where the client looks for a service
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(from = "String", into = "String")]
pub enum DiscoveryStrategy {
    /// Healthy, unexpired records in the local registry
    Registry,
    /// TCP probe of `localhost` on the service's well-known port
    DefaultPort,
    /// The DNS resolver
    Dns,
    /// UDP multicast announcements and queries on the local network
    Broadcast,
    /// A resolver installed with `add_resolver`
    Named(String),
}

impl DiscoveryStrategy {
    pub fn as_str(&self) -> &str {
        match self {
            DiscoveryStrategy::Registry => "registry",
            DiscoveryStrategy::DefaultPort => "default_port",
            DiscoveryStrategy::Dns => "dns",
            DiscoveryStrategy::Broadcast => "broadcast",
            DiscoveryStrategy::Named(name) => name,
        }
    }
}

impl fmt::Display for DiscoveryStrategy {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl From<String> for DiscoveryStrategy {
    fn from(name: String) -> Self {
        match name.as_str() {
            "registry" => DiscoveryStrategy::Registry,
            "default_port" => DiscoveryStrategy::DefaultPort,
            "dns" => DiscoveryStrategy::Dns,
            "broadcast" => DiscoveryStrategy::Broadcast,
            _ => DiscoveryStrategy::Named(name),
        }
    }
}

impl From<&str> for DiscoveryStrategy {
    fn from(name: &str) -> Self {
        DiscoveryStrategy::from(name.to_string())
    }
}

impl From<DiscoveryStrategy> for String {
    fn from(strategy: DiscoveryStrategy) -> Self {
        strategy.as_str().to_string()
    }
}

/// A successful lookup
#[derive(Debug, Clone, Serialize)]
pub struct DiscoveryResult {
    pub record: ServiceRecord,

    /// Strategy that produced the record
    pub strategy: DiscoveryStrategy,

    /// Time from the start of the lookup
    #[serde(with = "humantime_serde")]
    pub latency: Duration,
}

impl DiscoveryResult {
    pub fn address(&self) -> String {
        self.record.address()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_strategy_names() {
        for (text, strategy) in [
            ("registry", DiscoveryStrategy::Registry),
            ("default_port", DiscoveryStrategy::DefaultPort),
            ("dns", DiscoveryStrategy::Dns),
            ("broadcast", DiscoveryStrategy::Broadcast),
            ("consul", DiscoveryStrategy::Named("consul".to_string())),
        ] {
            assert_eq!(DiscoveryStrategy::from(text), strategy);
            assert_eq!(strategy.to_string(), text);
        }
    }

    #[test]
    fn test_strategy_serde() {
        let strategies: Vec<DiscoveryStrategy> =
            serde_json::from_str(r#"["registry", "dns", "mdns"]"#).unwrap();
        assert_eq!(
            strategies,
            vec![
                DiscoveryStrategy::Registry,
                DiscoveryStrategy::Dns,
                DiscoveryStrategy::Named("mdns".to_string()),
            ]
        );
        assert_eq!(
            serde_json::to_string(&DiscoveryStrategy::DefaultPort).unwrap(),
            r#""default_port""#
        );
    }
}
