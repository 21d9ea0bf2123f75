//! Service record and registry configuration types.

use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::fmt;
use std::str::FromStr;
use std::time::{Duration, SystemTime};
use tokio::time::Instant;

/// Metadata key overriding the HTTP health check path
pub const HEALTH_ENDPOINT_KEY: &str = "health_endpoint";

/// Transport or application protocol a service speaks
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Protocol {
    #[default]
    Tcp,
    Udp,
    Http,
    Https,
    Grpc,
}

impl fmt::Display for Protocol {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Protocol::Tcp => "tcp",
            Protocol::Udp => "udp",
            Protocol::Http => "http",
            Protocol::Https => "https",
            Protocol::Grpc => "grpc",
        };
        f.write_str(name)
    }
}

impl FromStr for Protocol {
    type Err = common::Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "tcp" => Ok(Protocol::Tcp),
            "udp" => Ok(Protocol::Udp),
            "http" => Ok(Protocol::Http),
            "https" => Ok(Protocol::Https),
            "grpc" => Ok(Protocol::Grpc),
            other => Err(common::Error::invalid_service(format!(
                "unknown protocol {other}"
            ))),
        }
    }
}

/// One registered service instance
#[derive(Debug, Clone, Serialize)]
pub struct ServiceRecord {
    /// Unique service name
    pub name: String,

    /// Hostname or IP address
    pub host: String,

    /// Service port (0 asks the discovery client to assign one)
    pub port: u16,

    pub protocol: Protocol,

    pub version: String,

    /// Free-form metadata
    pub metadata: HashMap<String, String>,

    /// Explicit port range for auto-assignment
    #[serde(skip_serializing_if = "Option::is_none")]
    pub range_hint: Option<String>,

    /// Health flag written by registration, manual overrides and the monitor
    pub healthy: bool,

    #[serde(with = "humantime_serde")]
    pub registered_at: SystemTime,

    #[serde(with = "humantime_serde")]
    pub last_heartbeat: SystemTime,

    /// Silence allowed before the record is purged (zero: registry default)
    #[serde(with = "humantime_serde")]
    pub ttl: Duration,

    #[serde(skip)]
    pub(crate) heartbeat_at: Instant,
}

impl ServiceRecord {
    /// Create a record with default protocol, no metadata and the registry's TTL
    pub fn new(name: impl Into<String>, host: impl Into<String>, port: u16) -> Self {
        let now = SystemTime::now();
        Self {
            name: name.into(),
            host: host.into(),
            port,
            protocol: Protocol::default(),
            version: String::new(),
            metadata: HashMap::new(),
            range_hint: None,
            healthy: true,
            registered_at: now,
            last_heartbeat: now,
            ttl: Duration::ZERO,
            heartbeat_at: Instant::now(),
        }
    }

    pub fn with_protocol(mut self, protocol: Protocol) -> Self {
        self.protocol = protocol;
        self
    }

    pub fn with_version(mut self, version: impl Into<String>) -> Self {
        self.version = version.into();
        self
    }

    pub fn with_metadata(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.metadata.insert(key.into(), value.into());
        self
    }

    pub fn with_ttl(mut self, ttl: Duration) -> Self {
        self.ttl = ttl;
        self
    }

    pub fn with_range_hint(mut self, hint: impl Into<String>) -> Self {
        self.range_hint = Some(hint.into());
        self
    }

    /// `host:port`, bracketing IPv6 literals
    pub fn address(&self) -> String {
        if self.host.contains(':') && !self.host.starts_with('[') {
            format!("[{}]:{}", self.host, self.port)
        } else {
            format!("{}:{}", self.host, self.port)
        }
    }

    /// True once the TTL has elapsed since the last heartbeat. Zero TTL never expires.
    pub fn is_expired(&self) -> bool {
        !self.ttl.is_zero() && self.heartbeat_at.elapsed() > self.ttl
    }

    /// Remaining time before expiry, `None` for records that never expire
    pub fn expires_in(&self) -> Option<Duration> {
        if self.ttl.is_zero() {
            None
        } else {
            Some(self.ttl.saturating_sub(self.heartbeat_at.elapsed()))
        }
    }

    pub(crate) fn touch(&mut self) {
        self.heartbeat_at = Instant::now();
        self.last_heartbeat = SystemTime::now();
    }
}

/// Registry configuration
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct RegistryConfig {
    /// TTL applied to records registered without one
    #[serde(with = "humantime_serde")]
    pub default_ttl: Duration,

    /// Interval between expiry sweeps
    #[serde(with = "humantime_serde")]
    pub cleanup_interval: Duration,
}

impl Default for RegistryConfig {
    fn default() -> Self {
        Self {
            default_ttl: Duration::from_secs(30),
            cleanup_interval: Duration::from_secs(10),
        }
    }
}
