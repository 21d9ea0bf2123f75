//! Runtime configuration changes.
//!
//! Every change is validated, offered to the registered callbacks and then
//! pushed into the running components. Port ranges, reserved ports and the
//! discovery settings take effect immediately; the remaining sections are
//! stored and reported as needing a restart.

use crate::config::{Config, ConfigError, STATIC_RESOLVER};
use discovery::{DiscoveryClient, DiscoveryStrategy};
use portalloc::{DEFAULT_RANGE, PortAllocator, PortRange};
use serde::Serialize;
use std::sync::{Arc, Mutex, PoisonError, RwLock};
use std::time::Duration;
use tracing::{info, warn};
use validator::Validate;

/// Veto hook run with the current and proposed configuration. Returning an
/// error aborts the update.
pub type UpdateCallback = Box<dyn Fn(&Config, &Config) -> anyhow::Result<()> + Send + Sync>;

/// Outcome of an accepted update
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct ConfigChange {
    /// Changed sections that only apply after a restart
    pub restart_required: Vec<&'static str>,
}

struct State {
    config: Config,
    locked: bool,
}

/// Owner of the live daemon configuration
pub struct ConfigManager {
    state: Mutex<State>,
    callbacks: RwLock<Vec<UpdateCallback>>,
    allocator: Option<Arc<PortAllocator>>,
    client: Option<Arc<DiscoveryClient>>,
}

impl ConfigManager {
    /// Manage `config` without pushing changes anywhere
    pub fn new(config: Config) -> Result<Self, ConfigError> {
        config.validate()?;
        Ok(Self {
            state: Mutex::new(State {
                config,
                locked: false,
            }),
            callbacks: RwLock::new(Vec::new()),
            allocator: None,
            client: None,
        })
    }

    /// Push port changes into `allocator`
    pub fn with_allocator(mut self, allocator: Arc<PortAllocator>) -> Self {
        self.allocator = Some(allocator);
        self
    }

    /// Push discovery changes into `client`
    pub fn with_client(mut self, client: Arc<DiscoveryClient>) -> Self {
        self.client = Some(client);
        self
    }

    /// Snapshot of the active configuration
    pub fn current(&self) -> Config {
        self.state().config.clone()
    }

    /// Reject every update until `unlock`
    pub fn lock(&self) {
        self.state().locked = true;
        info!("Configuration locked");
    }

    pub fn unlock(&self) {
        self.state().locked = false;
        info!("Configuration unlocked");
    }

    pub fn is_locked(&self) -> bool {
        self.state().locked
    }

    /// Add a veto hook. Hooks run while updates are serialized and must
    /// not call back into the manager.
    pub fn on_update<F>(&self, callback: F)
    where
        F: Fn(&Config, &Config) -> anyhow::Result<()> + Send + Sync + 'static,
    {
        self.callbacks
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .push(Box::new(callback));
    }

    /// Replace the whole configuration
    pub fn update(&self, config: Config) -> Result<ConfigChange, ConfigError> {
        self.modify(|current| {
            *current = config;
            Ok(())
        })
    }

    /// Edit a copy of the current configuration and submit it as a whole
    pub fn update_partial<F>(&self, edit: F) -> Result<ConfigChange, ConfigError>
    where
        F: FnOnce(&mut Config),
    {
        self.modify(|config| {
            edit(config);
            Ok(())
        })
    }

    /// Add or replace a named range; `default` names the catch-all range
    pub fn set_port_range(&self, name: &str, range: PortRange) -> Result<ConfigChange, ConfigError> {
        self.update_partial(|config| {
            if name == DEFAULT_RANGE {
                config.ports.default_range = range;
            } else {
                config.ports.ranges.insert(name.to_string(), range);
            }
        })
    }

    pub fn reserved_ports(&self) -> Vec<u16> {
        self.state().config.ports.reserved_ports.clone()
    }

    pub fn add_reserved_port(&self, port: u16) -> Result<ConfigChange, ConfigError> {
        self.modify(|config| {
            if config.ports.reserved_ports.contains(&port) {
                return Err(ConfigError::Rejected(format!("port {port} is already reserved")));
            }
            config.ports.reserved_ports.push(port);
            Ok(())
        })
    }

    pub fn remove_reserved_port(&self, port: u16) -> Result<ConfigChange, ConfigError> {
        self.modify(|config| {
            let before = config.ports.reserved_ports.len();
            config.ports.reserved_ports.retain(|reserved| *reserved != port);
            if config.ports.reserved_ports.len() == before {
                return Err(ConfigError::Rejected(format!("port {port} is not reserved")));
            }
            Ok(())
        })
    }

    pub fn set_discovery_strategies(
        &self,
        strategies: Vec<DiscoveryStrategy>,
    ) -> Result<ConfigChange, ConfigError> {
        self.update_partial(|config| config.discovery.preferred_strategies = strategies)
    }

    /// Stored now, applied by the monitor on restart
    pub fn set_health_check_interval(&self, interval: Duration) -> Result<ConfigChange, ConfigError> {
        self.update_partial(|config| config.health.check_interval = interval)
    }

    /// Stored now, applied on restart
    pub fn enable_broadcast(&self, enabled: bool) -> Result<ConfigChange, ConfigError> {
        self.update_partial(|config| config.broadcast.enabled = enabled)
    }

    /// Edit a copy under the state lock, then validate, consult the
    /// callbacks and apply. Concurrent edits never overwrite each other.
    fn modify<F>(&self, edit: F) -> Result<ConfigChange, ConfigError>
    where
        F: FnOnce(&mut Config) -> Result<(), ConfigError>,
    {
        let mut state = self.state();
        if state.locked {
            return Err(ConfigError::Locked);
        }

        let mut config = state.config.clone();
        edit(&mut config)?;
        config.validate()?;

        for callback in self
            .callbacks
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .iter()
        {
            callback(&state.config, &config)
                .map_err(|e| ConfigError::Rejected(format!("{e:#}")))?;
        }

        let change = self.apply(&state.config, &config)?;
        state.config = config;
        info!(
            restart_required = ?change.restart_required,
            "Configuration updated"
        );
        Ok(change)
    }

    fn state(&self) -> std::sync::MutexGuard<'_, State> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Push `new` into the components. Only the allocator can refuse, and it
    /// goes first so a refusal leaves everything untouched.
    fn apply(&self, old: &Config, new: &Config) -> Result<ConfigChange, ConfigError> {
        if old.ports != new.ports {
            if let Some(allocator) = &self.allocator {
                allocator
                    .reconfigure(new.to_allocator_config())
                    .map_err(|e| ConfigError::Rejected(e.to_string()))?;
            }
        }

        if old.discovery != new.discovery {
            if let Some(client) = &self.client {
                client.reconfigure(new.to_discovery_config());
                if old.discovery.static_services != new.discovery.static_services {
                    match new.static_resolver() {
                        Some(resolver) => client.add_resolver(STATIC_RESOLVER, Arc::new(resolver)),
                        None => {
                            client.remove_resolver(STATIC_RESOLVER);
                        }
                    }
                }
            }
        }

        let mut change = ConfigChange::default();
        let sections = [
            ("server", old.server != new.server),
            ("registry", old.registry != new.registry),
            ("health", old.health != new.health),
            ("broadcast", old.broadcast != new.broadcast),
            ("metrics", old.metrics != new.metrics),
            ("logging", old.logging != new.logging),
        ];
        for (section, changed) in sections {
            if changed {
                warn!(section, "Configuration section changes apply after restart");
                change.restart_required.push(section);
            }
        }
        Ok(change)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use discovery::DiscoveryClientConfig;
    use registry::{ServiceRecord, ServiceRegistry};
    use std::sync::atomic::{AtomicUsize, Ordering};

    fn components() -> (ConfigManager, Arc<PortAllocator>, Arc<DiscoveryClient>) {
        let mut config = Config::default();
        config.discovery.enable_dns = false;

        let registry = Arc::new(ServiceRegistry::default());
        let allocator = Arc::new(PortAllocator::new(config.to_allocator_config()));
        let client = Arc::new(DiscoveryClient::new(
            config.to_discovery_config(),
            registry,
            allocator.clone(),
        ));
        let manager = ConfigManager::new(config)
            .unwrap()
            .with_allocator(allocator.clone())
            .with_client(client.clone());
        (manager, allocator, client)
    }

    #[test]
    fn test_invalid_initial_config_rejected() {
        let mut config = Config::default();
        config.health.unhealthy_threshold = 0;
        assert!(ConfigManager::new(config).is_err());
    }

    #[test]
    fn test_port_range_applies_to_allocator() {
        let (manager, allocator, _) = components();

        let change = manager
            .set_port_range("jobs", PortRange::new(30000, 30009))
            .unwrap();
        assert!(change.restart_required.is_empty());
        assert_eq!(allocator.allocate("worker", Some("jobs")).unwrap(), 30000);

        manager
            .set_port_range(DEFAULT_RANGE, PortRange::new(31000, 31009))
            .unwrap();
        assert_eq!(allocator.allocate("misc", None).unwrap(), 31000);
        assert_eq!(
            manager.current().ports.default_range,
            PortRange::new(31000, 31009)
        );
    }

    #[test]
    fn test_invalid_update_leaves_config_untouched() {
        let (manager, allocator, _) = components();
        let before = manager.current();

        let err = manager
            .set_port_range("jobs", PortRange::new(9000, 8000))
            .unwrap_err();
        assert!(matches!(err, ConfigError::ValidationError(_)));
        assert_eq!(manager.current(), before);
        assert!(!allocator.range_names().contains(&"jobs".to_string()));
    }

    #[test]
    fn test_reserved_ports() {
        let (manager, allocator, _) = components();

        manager.add_reserved_port(8081).unwrap();
        assert!(manager.reserved_ports().contains(&8081));
        assert_eq!(allocator.allocate("api", Some("api")).unwrap(), 8082);

        assert!(matches!(
            manager.add_reserved_port(8081),
            Err(ConfigError::Rejected(_))
        ));

        manager.remove_reserved_port(8081).unwrap();
        assert!(!manager.reserved_ports().contains(&8081));
        assert!(matches!(
            manager.remove_reserved_port(8081),
            Err(ConfigError::Rejected(_))
        ));
    }

    #[test]
    fn test_lock_blocks_updates() {
        let (manager, _, _) = components();

        manager.lock();
        assert!(manager.is_locked());
        assert!(matches!(
            manager.add_reserved_port(7000),
            Err(ConfigError::Locked)
        ));
        assert!(matches!(
            manager.update(Config::default()),
            Err(ConfigError::Locked)
        ));

        manager.unlock();
        assert!(manager.add_reserved_port(7000).is_ok());
    }

    #[test]
    fn test_callback_veto() {
        let (manager, allocator, _) = components();
        let calls = Arc::new(AtomicUsize::new(0));

        let seen = calls.clone();
        manager.on_update(move |old, new| {
            seen.fetch_add(1, Ordering::SeqCst);
            if new.ports.reserved_ports.len() < old.ports.reserved_ports.len() {
                anyhow::bail!("reserved ports may only grow");
            }
            Ok(())
        });

        manager.add_reserved_port(8081).unwrap();
        let err = manager.remove_reserved_port(8081).unwrap_err();
        assert!(err.to_string().contains("may only grow"));
        assert_eq!(calls.load(Ordering::SeqCst), 2);

        // The vetoed change never reached the allocator
        assert!(!allocator.is_port_available(8081));
        assert!(manager.reserved_ports().contains(&8081));
    }

    #[test]
    fn test_discovery_settings_apply_to_client() {
        let (manager, _, client) = components();

        manager
            .update_partial(|config| {
                config.discovery.discovery_timeout = Duration::from_millis(250);
                config.discovery.preferred_strategies = vec![DiscoveryStrategy::Registry];
            })
            .unwrap();

        let applied: DiscoveryClientConfig = client.config();
        assert_eq!(applied.discovery_timeout, Duration::from_millis(250));
        assert_eq!(applied.preferred_strategies, vec![DiscoveryStrategy::Registry]);

        manager
            .set_discovery_strategies(vec![DiscoveryStrategy::Dns, DiscoveryStrategy::Registry])
            .unwrap();
        assert_eq!(client.config().preferred_strategies[0], DiscoveryStrategy::Dns);
    }

    #[tokio::test]
    async fn test_static_services_swap_resolver() {
        let (manager, _, client) = components();

        manager
            .update_partial(|config| {
                config.discovery.preferred_strategies =
                    vec![DiscoveryStrategy::Named(STATIC_RESOLVER.to_string())];
                config.discovery.static_services.insert(
                    "legacy".to_string(),
                    crate::config::StaticEndpoint {
                        host: "10.0.0.5".to_string(),
                        port: 8080,
                    },
                );
            })
            .unwrap();
        let result = client.discover("legacy").await.unwrap();
        assert_eq!(result.record.port, 8080);

        manager
            .update_partial(|config| config.discovery.static_services.clear())
            .unwrap();
        assert!(client.discover("legacy").await.is_err());
    }

    #[test]
    fn test_restart_sections_reported() {
        let (manager, _, _) = components();

        let change = manager
            .set_health_check_interval(Duration::from_secs(10))
            .unwrap();
        assert_eq!(change.restart_required, vec!["health"]);
        assert_eq!(manager.current().health.check_interval, Duration::from_secs(10));

        let change = manager.enable_broadcast(true).unwrap();
        assert_eq!(change.restart_required, vec!["broadcast"]);
    }

    #[tokio::test]
    async fn test_existing_allocations_survive_range_change() {
        let (manager, allocator, client) = components();

        let record = client
            .register(ServiceRecord::new("billing-api", "127.0.0.1", 0))
            .await
            .unwrap();
        assert_eq!(record.port, 8081);

        manager
            .set_port_range("api", PortRange::new(18081, 18099))
            .unwrap();
        assert_eq!(allocator.port_for_service("billing-api"), Some(8081));
    }
}
