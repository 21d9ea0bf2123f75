//! Port allocation types and configuration.

use common::{Error, Result};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;
use std::time::SystemTime;

/// Name under which the catch-all range is reported.
pub const DEFAULT_RANGE: &str = "default";

/// Inclusive range of ports reserved for one class of service
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct PortRange {
    /// First port of the range
    pub start: u16,
    /// Last port of the range (inclusive)
    pub end: u16,
}

impl PortRange {
    pub const fn new(start: u16, end: u16) -> Self {
        Self { start, end }
    }

    /// Check that the range is non-empty and does not include port 0
    pub fn validate(&self) -> Result<()> {
        if self.start == 0 || self.start > self.end {
            return Err(Error::InvalidPortRange {
                start: self.start,
                end: self.end,
            });
        }
        Ok(())
    }

    pub fn contains(&self, port: u16) -> bool {
        (self.start..=self.end).contains(&port)
    }

    /// Number of ports in the range
    pub fn len(&self) -> usize {
        if self.start > self.end {
            0
        } else {
            usize::from(self.end - self.start) + 1
        }
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl fmt::Display for PortRange {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}-{}", self.start, self.end)
    }
}

/// A claimed port
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PortAllocation {
    /// Allocated port
    pub port: u16,

    /// Service owning the port
    pub service_name: String,

    /// Range the port was drawn from
    pub range_name: String,

    /// When the port was handed out
    #[serde(with = "humantime_serde")]
    pub allocated_at: SystemTime,
}

/// Port allocator configuration
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct PortAllocatorConfig {
    /// Named ranges keyed by service type (database, cache, api, ...)
    pub ranges: BTreeMap<String, PortRange>,

    /// Catch-all range used when no hint applies
    pub default_range: PortRange,

    /// Ports that are never handed out
    pub reserved_ports: Vec<u16>,
}

impl Default for PortAllocatorConfig {
    fn default() -> Self {
        let ranges = [
            ("database", PortRange::new(5433, 5442)),
            ("cache", PortRange::new(6380, 6389)),
            ("api", PortRange::new(8081, 8099)),
            ("websocket", PortRange::new(8001, 8020)),
            ("rpc", PortRange::new(9091, 9099)),
            ("metrics", PortRange::new(9101, 9109)),
        ]
        .into_iter()
        .map(|(name, range)| (name.to_string(), range))
        .collect();

        Self {
            ranges,
            default_range: PortRange::new(10000, 10999),
            reserved_ports: vec![22, 80, 443, 3306, 5432, 6379, 8080, 9090, 9100],
        }
    }
}

impl PortAllocatorConfig {
    /// Validate every configured range
    pub fn validate(&self) -> Result<()> {
        self.default_range.validate()?;
        for (name, range) in &self.ranges {
            range
                .validate()
                .map_err(|e| Error::config(format!("port range {name}: {e}")))?;
        }
        Ok(())
    }

    /// Replace or add a named range
    pub fn with_range(mut self, name: impl Into<String>, range: PortRange) -> Self {
        self.ranges.insert(name.into(), range);
        self
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_config_is_valid() {
        let config = PortAllocatorConfig::default();
        assert!(config.validate().is_ok());
        assert_eq!(config.ranges["api"], PortRange::new(8081, 8099));
        assert_eq!(config.default_range.len(), 1000);
    }

    #[test]
    fn test_invalid_ranges() {
        assert!(PortRange::new(0, 10).validate().is_err());
        assert!(PortRange::new(20, 10).validate().is_err());
        assert!(PortRange::new(10, 10).validate().is_ok());

        let config = PortAllocatorConfig::default().with_range("broken", PortRange::new(9, 1));
        let err = config.validate().unwrap_err();
        assert!(err.to_string().contains("broken"));
    }

    #[test]
    fn test_range_display_and_contains() {
        let range = PortRange::new(8081, 8099);
        assert_eq!(range.to_string(), "8081-8099");
        assert!(range.contains(8081));
        assert!(range.contains(8099));
        assert!(!range.contains(8100));
    }
}
