//! Error types shared by the Waypoint crates.

use std::fmt;
use std::time::Duration;

/// A specialized Result type for Waypoint operations.
pub type Result<T> = std::result::Result<T, Error>;

/// Common error type for registry, allocator, monitor and discovery operations.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum Error {
    /// The service is absent, expired, or no discovery strategy resolved it.
    #[error("service not found: {name}{}", format_attempted(.attempted))]
    ServiceNotFound {
        name: String,
        /// Discovery strategies tried before giving up (empty for plain lookups)
        attempted: Vec<String>,
    },

    #[error("no ports available in range {range}")]
    PortRangeExhausted { range: String },

    #[error("invalid port range {start}-{end}")]
    InvalidPortRange { start: u16, end: u16 },

    #[error("invalid service: {0}")]
    InvalidService(String),

    #[error("{0} already running")]
    AlreadyRunning(&'static str),

    #[error("{0} not running")]
    NotRunning(&'static str),

    #[error("discovery of {service} timed out after {waited:?}")]
    DiscoveryTimeout { service: String, waited: Duration },

    #[error("health check failed: {0}")]
    ProbeFailed(String),

    #[error("operation cancelled")]
    Cancelled,

    #[error("configuration error: {0}")]
    Config(String),

    #[error("IO error: {0}")]
    Io(String),

    #[error("invalid broadcast message: {0}")]
    InvalidMessage(String),
}

fn format_attempted(attempted: &[String]) -> String {
    if attempted.is_empty() {
        String::new()
    } else {
        format!(" (tried: {})", attempted.join(", "))
    }
}

impl From<std::io::Error> for Error {
    fn from(err: std::io::Error) -> Self {
        Error::Io(err.to_string())
    }
}

impl Error {
    /// Create a plain not-found error for a registry lookup.
    pub fn service_not_found(name: impl Into<String>) -> Self {
        Error::ServiceNotFound {
            name: name.into(),
            attempted: Vec::new(),
        }
    }

    /// Create a probe failure error.
    pub fn probe(msg: impl fmt::Display) -> Self {
        Error::ProbeFailed(msg.to_string())
    }

    /// Create a new configuration error.
    pub fn config(msg: impl fmt::Display) -> Self {
        Error::Config(msg.to_string())
    }

    /// Create a new invalid-service error.
    pub fn invalid_service(msg: impl fmt::Display) -> Self {
        Error::InvalidService(msg.to_string())
    }

    /// True for every not-found flavour, including exhausted discovery.
    pub fn is_not_found(&self) -> bool {
        matches!(self, Error::ServiceNotFound { .. })
    }

    pub fn is_timeout(&self) -> bool {
        matches!(self, Error::DiscoveryTimeout { .. })
    }

    pub fn is_cancelled(&self) -> bool {
        matches!(self, Error::Cancelled)
    }
}
