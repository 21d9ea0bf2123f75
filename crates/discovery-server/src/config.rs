//! Configuration loading and validation for discoveryd

use discovery::{
    BroadcastConfig, DefaultPorts, DiscoveryClientConfig, DiscoveryStrategy, StaticResolver,
};
use healthcheck::{HealthMonitorConfig, ProbeStrategy};
use portalloc::PortAllocatorConfig;
use registry::RegistryConfig;
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashSet};
use std::net::SocketAddr;
use std::path::{Path, PathBuf};
use std::time::Duration;
use thiserror::Error;
use validator::{Validate, ValidationError, ValidationErrors};

/// Name of the resolver serving `discovery.static_services`
pub const STATIC_RESOLVER: &str = "static";

/// Configuration error types
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("Failed to read configuration file: {0}")]
    IoError(#[from] std::io::Error),

    #[error("Failed to parse YAML: {0}")]
    ParseError(#[from] serde_yaml::Error),

    #[error("Invalid configuration: {0}")]
    ValidationError(#[from] validator::ValidationErrors),

    #[error("Configuration is locked")]
    Locked,

    #[error("Configuration update rejected: {0}")]
    Rejected(String),
}

/// Main configuration structure
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Config {
    #[serde(default)]
    pub server: ServerSettings,

    #[serde(default)]
    pub registry: RegistryConfig,

    #[serde(default)]
    pub ports: PortAllocatorConfig,

    #[serde(default)]
    pub health: HealthSettings,

    #[serde(default)]
    pub discovery: DiscoverySettings,

    #[serde(default)]
    pub broadcast: BroadcastSettings,

    #[serde(default)]
    pub metrics: MetricsSettings,

    #[serde(default)]
    pub logging: LoggingSettings,
}

impl Validate for Config {
    fn validate(&self) -> Result<(), ValidationErrors> {
        self.server.validate()?;
        self.health.validate()?;
        self.discovery.validate()?;
        self.metrics.validate()?;

        let mut errors = ValidationErrors::new();
        if let Err(e) = validate_registry(&self.registry) {
            errors.add("registry", e);
        }
        if let Err(e) = validate_ports(&self.ports) {
            errors.add("ports", e);
        }
        if let Err(e) = validate_broadcast(&self.broadcast) {
            errors.add("broadcast", e);
        }
        if errors.is_empty() {
            Ok(())
        } else {
            Err(errors)
        }
    }
}

/// HTTP listener settings
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, Validate)]
pub struct ServerSettings {
    /// Address serving /metrics, /services and /healthz
    #[validate(custom = "validate_listen_addr")]
    pub listen_addr: String,
}

/// Health monitor settings
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, Validate)]
#[serde(default)]
#[validate(schema(function = "validate_thresholds"))]
pub struct HealthSettings {
    #[serde(with = "humantime_serde")]
    #[validate(custom = "validate_check_interval")]
    pub check_interval: Duration,

    #[serde(with = "humantime_serde")]
    #[validate(custom = "validate_check_timeout")]
    pub check_timeout: Duration,

    #[validate(range(min = 1, max = 100))]
    pub unhealthy_threshold: u32,

    #[validate(range(min = 1, max = 100))]
    pub healthy_threshold: u32,

    pub enable_auto_removal: bool,

    #[validate(range(min = 1, max = 1000))]
    pub removal_threshold: u32,

    pub default_strategy: ProbeStrategy,

    #[validate(custom = "validate_http_path")]
    pub http_path: String,
}

/// Discovery client settings
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, Validate)]
#[serde(default)]
pub struct DiscoverySettings {
    #[validate(length(min = 1), custom = "validate_strategies")]
    pub preferred_strategies: Vec<DiscoveryStrategy>,

    pub enable_dns: bool,

    #[serde(with = "humantime_serde")]
    #[validate(custom = "validate_discovery_timeout")]
    pub discovery_timeout: Duration,

    #[serde(with = "humantime_serde")]
    #[validate(custom = "validate_poll_interval")]
    pub wait_poll_interval: Duration,

    /// Extra well-known ports, merged over the built-in table
    #[validate(custom = "validate_default_ports")]
    pub default_ports: BTreeMap<String, u16>,

    /// Pinned endpoints served by the `static` strategy
    pub static_services: BTreeMap<String, StaticEndpoint>,
}

/// A pinned service endpoint
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StaticEndpoint {
    pub host: String,
    pub port: u16,
}

/// LAN broadcast discovery settings
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct BroadcastSettings {
    /// Join the multicast group and serve the `broadcast` strategy
    pub enabled: bool,

    #[serde(flatten)]
    pub config: BroadcastConfig,
}

/// Metrics collection settings
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, Validate)]
#[serde(default)]
pub struct MetricsSettings {
    pub enabled: bool,

    /// Interval between collector samples
    #[serde(with = "humantime_serde")]
    #[validate(custom = "validate_collect_interval")]
    pub collect_interval: Duration,
}

/// Log output format
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LogFormat {
    #[default]
    Text,
    Json,
}

/// Logging settings
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct LoggingSettings {
    pub level: String,
    pub format: LogFormat,
}

// Default implementations

impl Default for ServerSettings {
    fn default() -> Self {
        Self {
            listen_addr: "0.0.0.0:9180".to_string(),
        }
    }
}

impl From<HealthMonitorConfig> for HealthSettings {
    fn from(config: HealthMonitorConfig) -> Self {
        Self {
            check_interval: config.check_interval,
            check_timeout: config.check_timeout,
            unhealthy_threshold: config.unhealthy_threshold,
            healthy_threshold: config.healthy_threshold,
            enable_auto_removal: config.enable_auto_removal,
            removal_threshold: config.removal_threshold,
            default_strategy: config.default_strategy,
            http_path: config.http_path,
        }
    }
}

impl Default for HealthSettings {
    fn default() -> Self {
        HealthMonitorConfig::default().into()
    }
}

impl Default for DiscoverySettings {
    fn default() -> Self {
        let defaults = DiscoveryClientConfig::default();
        Self {
            preferred_strategies: defaults.preferred_strategies,
            enable_dns: defaults.enable_dns,
            discovery_timeout: defaults.discovery_timeout,
            wait_poll_interval: defaults.wait_poll_interval,
            default_ports: BTreeMap::new(),
            static_services: BTreeMap::new(),
        }
    }
}

impl Default for MetricsSettings {
    fn default() -> Self {
        Self {
            enabled: true,
            collect_interval: Duration::from_secs(1),
        }
    }
}

impl Default for LoggingSettings {
    fn default() -> Self {
        Self {
            level: "info".to_string(),
            format: LogFormat::Text,
        }
    }
}

// Custom validators

fn invalid(code: &'static str, message: impl ToString) -> ValidationError {
    let mut error = ValidationError::new(code);
    error.message = Some(message.to_string().into());
    error
}

fn validate_listen_addr(addr: &str) -> Result<(), ValidationError> {
    addr.trim()
        .parse::<SocketAddr>()
        .map(|_| ())
        .map_err(|e| invalid("listen_addr_invalid", e))
}

fn validate_duration(
    value: &Duration,
    min: Duration,
    max: Duration,
    code: &'static str,
) -> Result<(), ValidationError> {
    if *value < min || *value > max {
        return Err(invalid(
            code,
            format!("must be between {:?} and {:?}", min, max),
        ));
    }
    Ok(())
}

fn validate_check_interval(interval: &Duration) -> Result<(), ValidationError> {
    validate_duration(
        interval,
        Duration::from_millis(10),
        Duration::from_secs(3600),
        "check_interval_out_of_range",
    )
}

fn validate_check_timeout(timeout: &Duration) -> Result<(), ValidationError> {
    validate_duration(
        timeout,
        Duration::from_millis(1),
        Duration::from_secs(60),
        "check_timeout_out_of_range",
    )
}

fn validate_discovery_timeout(timeout: &Duration) -> Result<(), ValidationError> {
    validate_duration(
        timeout,
        Duration::from_millis(10),
        Duration::from_secs(300),
        "discovery_timeout_out_of_range",
    )
}

fn validate_poll_interval(interval: &Duration) -> Result<(), ValidationError> {
    validate_duration(
        interval,
        Duration::from_millis(1),
        Duration::from_secs(60),
        "poll_interval_out_of_range",
    )
}

fn validate_collect_interval(interval: &Duration) -> Result<(), ValidationError> {
    validate_duration(
        interval,
        Duration::from_millis(10),
        Duration::from_secs(60),
        "collect_interval_out_of_range",
    )
}

fn validate_http_path(path: &str) -> Result<(), ValidationError> {
    if !path.starts_with('/') {
        return Err(ValidationError::new("http_path_must_be_absolute"));
    }
    Ok(())
}

fn validate_thresholds(health: &HealthSettings) -> Result<(), ValidationError> {
    if health.removal_threshold < health.unhealthy_threshold {
        return Err(invalid(
            "removal_below_unhealthy_threshold",
            "removal_threshold must be at least unhealthy_threshold",
        ));
    }
    if health.check_timeout > health.check_interval {
        return Err(ValidationError::new("check_timeout_exceeds_interval"));
    }
    Ok(())
}

fn validate_strategies(strategies: &[DiscoveryStrategy]) -> Result<(), ValidationError> {
    let mut seen = HashSet::new();
    for strategy in strategies {
        if !seen.insert(strategy) {
            return Err(invalid(
                "duplicate_strategy",
                format!("strategy {strategy} listed twice"),
            ));
        }
        if let DiscoveryStrategy::Named(name) = strategy {
            if name != STATIC_RESOLVER {
                return Err(invalid(
                    "unknown_strategy",
                    format!("unknown discovery strategy {name}"),
                ));
            }
        }
    }
    Ok(())
}

fn validate_default_ports(ports: &BTreeMap<String, u16>) -> Result<(), ValidationError> {
    match ports.iter().find(|(_, port)| **port == 0) {
        Some((name, _)) => Err(invalid(
            "default_port_zero",
            format!("default port for {name} must be non-zero"),
        )),
        None => Ok(()),
    }
}

fn validate_registry(registry: &RegistryConfig) -> Result<(), ValidationError> {
    validate_duration(
        &registry.cleanup_interval,
        Duration::from_millis(10),
        Duration::from_secs(3600),
        "cleanup_interval_out_of_range",
    )
}

fn validate_ports(ports: &PortAllocatorConfig) -> Result<(), ValidationError> {
    ports
        .validate()
        .map_err(|e| invalid("port_ranges_invalid", e))
}

fn validate_broadcast(broadcast: &BroadcastSettings) -> Result<(), ValidationError> {
    if !broadcast.enabled {
        return Ok(());
    }
    broadcast
        .config
        .validate()
        .map_err(|e| invalid("broadcast_invalid", e))
}

// Configuration loading implementation

impl Config {
    /// Load configuration from default search paths
    pub fn load() -> Result<Self, ConfigError> {
        match Self::find_config_file() {
            Some(path) => {
                tracing::info!("Loading configuration from: {}", path.display());
                Self::load_from_file(&path)
            }
            None => {
                tracing::info!("No configuration file found, using defaults");
                Ok(Self::default())
            }
        }
    }

    /// Load configuration from a specific file
    pub fn load_from_file(path: impl AsRef<Path>) -> Result<Self, ConfigError> {
        let contents = std::fs::read_to_string(path.as_ref())?;
        Self::from_yaml(&contents)
    }

    /// Parse and validate a YAML document
    pub fn from_yaml(contents: &str) -> Result<Self, ConfigError> {
        let config: Config = serde_yaml::from_str(contents)?;
        config.validate()?;
        Ok(config)
    }

    /// Find configuration file in standard locations
    fn find_config_file() -> Option<PathBuf> {
        let mut paths = vec![PathBuf::from("/etc/waypoint/discoveryd.yaml")];

        if let Some(home_path) = Self::home_config_path() {
            paths.push(home_path);
        }

        paths.push(PathBuf::from("./discoveryd.yaml"));

        paths
            .into_iter()
            .find(|p: &PathBuf| p.exists() && p.is_file())
    }

    /// Get home directory config path
    fn home_config_path() -> Option<PathBuf> {
        dirs::home_dir().map(|home| home.join(".config/waypoint/discoveryd.yaml"))
    }

    pub fn to_registry_config(&self) -> RegistryConfig {
        self.registry.clone()
    }

    pub fn to_allocator_config(&self) -> PortAllocatorConfig {
        self.ports.clone()
    }

    pub fn to_monitor_config(&self) -> HealthMonitorConfig {
        HealthMonitorConfig {
            check_interval: self.health.check_interval,
            check_timeout: self.health.check_timeout,
            unhealthy_threshold: self.health.unhealthy_threshold,
            healthy_threshold: self.health.healthy_threshold,
            enable_auto_removal: self.health.enable_auto_removal,
            removal_threshold: self.health.removal_threshold,
            default_strategy: self.health.default_strategy,
            http_path: self.health.http_path.clone(),
        }
    }

    pub fn to_discovery_config(&self) -> DiscoveryClientConfig {
        let mut default_ports = DefaultPorts::default();
        for (name, port) in &self.discovery.default_ports {
            default_ports.insert(name.clone(), *port);
        }

        DiscoveryClientConfig {
            preferred_strategies: self.discovery.preferred_strategies.clone(),
            enable_dns: self.discovery.enable_dns,
            discovery_timeout: self.discovery.discovery_timeout,
            wait_poll_interval: self.discovery.wait_poll_interval,
            default_ports,
        }
    }

    /// Broadcast settings, when the strategy is enabled
    pub fn to_broadcast_config(&self) -> Option<BroadcastConfig> {
        self.broadcast.enabled.then(|| self.broadcast.config.clone())
    }

    /// Resolver for the pinned endpoints, if any are configured
    pub fn static_resolver(&self) -> Option<StaticResolver> {
        if self.discovery.static_services.is_empty() {
            return None;
        }
        Some(
            self.discovery
                .static_services
                .iter()
                .fold(StaticResolver::new(), |resolver, (name, endpoint)| {
                    resolver.with_entry(name.clone(), endpoint.host.clone(), endpoint.port)
                }),
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use portalloc::PortRange;

    #[test]
    fn test_default_config_is_valid() {
        let config = Config::default();
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_valid_yaml_parsing() {
        let yaml = r#"
server:
  listen_addr: "127.0.0.1:9999"

registry:
  default_ttl: 45s
  cleanup_interval: 5s

ports:
  default_range: { start: 20000, end: 20099 }
  ranges:
    api: { start: 8081, end: 8099 }
  reserved_ports: [8090]

health:
  check_interval: 2s
  check_timeout: 500ms
  unhealthy_threshold: 4
  removal_threshold: 6
  default_strategy: http
  http_path: /ready

discovery:
  preferred_strategies: [registry, static, dns]
  discovery_timeout: 2s
  static_services:
    legacy-billing: { host: 10.20.0.5, port: 8080 }

logging:
  level: debug
  format: json
"#;

        let config = Config::from_yaml(yaml).unwrap();
        assert_eq!(config.server.listen_addr, "127.0.0.1:9999");
        assert_eq!(config.registry.default_ttl, Duration::from_secs(45));
        assert_eq!(config.ports.default_range, PortRange::new(20000, 20099));
        assert_eq!(config.ports.reserved_ports, vec![8090]);
        assert_eq!(config.health.default_strategy, ProbeStrategy::Http);
        assert_eq!(config.health.healthy_threshold, 2);
        assert_eq!(config.logging.format, LogFormat::Json);
        assert_eq!(
            config.discovery.preferred_strategies[1],
            DiscoveryStrategy::Named(STATIC_RESOLVER.to_string())
        );
        assert_eq!(config.static_resolver().unwrap().len(), 1);
    }

    #[test]
    fn test_minimal_yaml_uses_defaults() {
        let config = Config::from_yaml("logging:\n  level: warn\n").unwrap();
        assert_eq!(config.registry.default_ttl, Duration::from_secs(30));
        assert_eq!(config.health.check_interval, Duration::from_secs(5));
        assert_eq!(config.discovery.discovery_timeout, Duration::from_secs(5));
        assert!(config.metrics.enabled);
        assert!(config.static_resolver().is_none());
    }

    #[test]
    fn test_removal_threshold_below_unhealthy_rejected() {
        let yaml = r#"
health:
  unhealthy_threshold: 5
  removal_threshold: 3
"#;
        assert!(matches!(
            Config::from_yaml(yaml),
            Err(ConfigError::ValidationError(_))
        ));
    }

    #[test]
    fn test_zero_threshold_rejected() {
        let yaml = r#"
health:
  healthy_threshold: 0
"#;
        assert!(Config::from_yaml(yaml).is_err());
    }

    #[test]
    fn test_inverted_port_range_rejected() {
        let yaml = r#"
ports:
  ranges:
    api: { start: 9000, end: 8000 }
"#;
        assert!(Config::from_yaml(yaml).is_err());
    }

    #[test]
    fn test_unknown_strategy_rejected() {
        let yaml = r#"
discovery:
  preferred_strategies: [registry, consul]
"#;
        assert!(Config::from_yaml(yaml).is_err());

        let yaml = r#"
discovery:
  preferred_strategies: [registry, registry]
"#;
        assert!(Config::from_yaml(yaml).is_err());

        let yaml = r#"
discovery:
  preferred_strategies: []
"#;
        assert!(Config::from_yaml(yaml).is_err());
    }

    #[test]
    fn test_interval_bounds() {
        let yaml = r#"
health:
  check_interval: 5ms
"#;
        assert!(Config::from_yaml(yaml).is_err());

        let yaml = r#"
registry:
  cleanup_interval: 0s
"#;
        assert!(Config::from_yaml(yaml).is_err());

        let yaml = r#"
metrics:
  collect_interval: 2m
"#;
        assert!(Config::from_yaml(yaml).is_err());
    }

    #[test]
    fn test_listen_addr_validation() {
        assert!(validate_listen_addr("127.0.0.1:9180").is_ok());
        assert!(validate_listen_addr("[::1]:9180").is_ok());
        assert!(validate_listen_addr("localhost").is_err());
        assert!(validate_listen_addr("").is_err());
    }

    #[test]
    fn test_broadcast_section() {
        let config = Config::default();
        assert!(config.to_broadcast_config().is_none());

        let yaml = r#"
discovery:
  preferred_strategies: [registry, broadcast]
broadcast:
  enabled: true
  group: "239.255.0.9:7100"
  announce_interval: 2s
  multicast_ttl: 1
"#;
        let config = Config::from_yaml(yaml).unwrap();
        assert_eq!(
            config.discovery.preferred_strategies[1],
            DiscoveryStrategy::Broadcast
        );
        let broadcast = config.to_broadcast_config().unwrap();
        assert_eq!(broadcast.group.port(), 7100);
        assert_eq!(broadcast.announce_interval, Duration::from_secs(2));
        assert_eq!(broadcast.query_timeout, Duration::from_secs(3));
        assert_eq!(broadcast.multicast_ttl, 1);

        let yaml = r#"
broadcast:
  enabled: true
  multicast_ttl: 0
"#;
        assert!(Config::from_yaml(yaml).is_err());

        // Disabled sections are not checked
        let yaml = r#"
broadcast:
  multicast_ttl: 0
"#;
        assert!(Config::from_yaml(yaml).is_ok());
    }

    #[test]
    fn test_conversions() {
        let mut config = Config::default();
        config.discovery.default_ports.insert("ledger".to_string(), 7443);
        config.health.removal_threshold = 8;

        let monitor = config.to_monitor_config();
        assert_eq!(monitor.removal_threshold, 8);
        assert_eq!(monitor.http_path, "/health");

        let discovery = config.to_discovery_config();
        assert_eq!(discovery.default_ports.port_for("ledger"), Some(7443));
        assert_eq!(discovery.default_ports.port_for("database"), Some(5432));

        assert_eq!(config.to_allocator_config(), PortAllocatorConfig::default());
        assert_eq!(config.to_registry_config(), RegistryConfig::default());
    }
}
