//! In-process service registry with TTL expiry.

use crate::types::{Protocol, RegistryConfig, ServiceRecord};
use common::{Error, Result};
use std::collections::HashMap;
use std::fmt;
use std::sync::{Arc, PoisonError, RwLock as StdRwLock, Weak};
use std::time::SystemTime;
use tokio::sync::{Mutex, RwLock};
use tokio::task::JoinHandle;
use tokio::time::{MissedTickBehavior, interval};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

/// Why a record left the registry
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RemovalCause {
    /// TTL elapsed; purged by the sweep, a mutating call or a re-registration
    Expired,
    /// Removed through `deregister`
    Deregistered,
}

impl fmt::Display for RemovalCause {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            RemovalCause::Expired => f.write_str("expired"),
            RemovalCause::Deregistered => f.write_str("deregistered"),
        }
    }
}

/// Callback run for every record that leaves the registry
pub type RemovalHook = Arc<dyn Fn(&ServiceRecord, RemovalCause) + Send + Sync>;

/// Handle on the running expiry sweep
struct Sweeper {
    cancel: CancellationToken,
    handle: JoinHandle<()>,
}

/// Authoritative map of service name to service record.
///
/// Expired records are invisible to every read even before the background
/// sweep removes them. Owners of per-service resources learn about removals
/// through [`on_remove`](Self::on_remove).
pub struct ServiceRegistry {
    config: RegistryConfig,
    services: RwLock<HashMap<String, ServiceRecord>>,
    hooks: StdRwLock<Vec<RemovalHook>>,
    sweeper: Mutex<Option<Sweeper>>,
}

impl ServiceRegistry {
    /// Create a new registry. The expiry sweep is not started.
    pub fn new(config: RegistryConfig) -> Self {
        Self {
            config,
            services: RwLock::new(HashMap::new()),
            hooks: StdRwLock::new(Vec::new()),
            sweeper: Mutex::new(None),
        }
    }

    pub fn config(&self) -> &RegistryConfig {
        &self.config
    }

    /// Run `hook` for every record removed from now on.
    ///
    /// Hooks run synchronously while the registry's write lock is held, so a
    /// removal and its hooks are atomic with respect to other registry calls.
    /// A hook must not call back into the registry.
    pub fn on_remove<F>(&self, hook: F)
    where
        F: Fn(&ServiceRecord, RemovalCause) + Send + Sync + 'static,
    {
        self.hooks
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .push(Arc::new(hook));
    }

    /// Start the background expiry sweep
    pub async fn start(self: &Arc<Self>) -> Result<()> {
        if self.config.cleanup_interval.is_zero() {
            return Err(Error::config("cleanup_interval must be non-zero"));
        }

        let mut slot = self.sweeper.lock().await;
        if slot.is_some() {
            return Err(Error::AlreadyRunning("registry cleanup"));
        }

        let cancel = CancellationToken::new();
        let handle = tokio::spawn(Self::sweep_loop(
            Arc::downgrade(self),
            self.config.cleanup_interval,
            cancel.clone(),
        ));

        info!(
            interval_ms = self.config.cleanup_interval.as_millis(),
            "Registry cleanup started"
        );
        *slot = Some(Sweeper { cancel, handle });
        Ok(())
    }

    /// Stop the background expiry sweep and wait for it to finish
    pub async fn stop(&self) -> Result<()> {
        let sweeper = self
            .sweeper
            .lock()
            .await
            .take()
            .ok_or(Error::NotRunning("registry cleanup"))?;

        sweeper.cancel.cancel();
        if let Err(e) = sweeper.handle.await {
            warn!(error = %e, "Registry cleanup task ended abnormally");
        }
        info!("Registry cleanup stopped");
        Ok(())
    }

    pub async fn is_running(&self) -> bool {
        self.sweeper.lock().await.is_some()
    }

    /// Register or renew a service.
    ///
    /// Renewal keeps the original registration time. The record is marked
    /// healthy and its heartbeat refreshed either way.
    pub async fn register(&self, mut record: ServiceRecord) -> Result<()> {
        validate(&record)?;

        if record.ttl.is_zero() {
            record.ttl = self.config.default_ttl;
        }
        record.healthy = true;
        record.touch();

        let mut services = self.services.write().await;
        match services.get(&record.name) {
            Some(existing) if !existing.is_expired() => {
                record.registered_at = existing.registered_at;
                debug!(service = %record.name, address = %record.address(), "Renewed service registration");
            }
            stale => {
                if let Some(expired) = stale {
                    self.notify_removed(expired, RemovalCause::Expired);
                }
                record.registered_at = SystemTime::now();
                info!(
                    service = %record.name,
                    address = %record.address(),
                    protocol = %record.protocol,
                    ttl_ms = record.ttl.as_millis(),
                    "Registered service"
                );
            }
        }
        services.insert(record.name.clone(), record);
        Ok(())
    }

    /// Look up a live service
    pub async fn get(&self, name: &str) -> Result<ServiceRecord> {
        self.services
            .read()
            .await
            .get(name)
            .filter(|record| !record.is_expired())
            .cloned()
            .ok_or_else(|| Error::service_not_found(name))
    }

    /// Extend a service's TTL deadline
    pub async fn heartbeat(&self, name: &str) -> Result<()> {
        let mut services = self.services.write().await;
        let record = self.live_entry(&mut services, name)?;
        record.touch();
        debug!(service = name, "Heartbeat");
        Ok(())
    }

    /// Overwrite a service's health flag
    pub async fn update_health(&self, name: &str, healthy: bool) -> Result<()> {
        let mut services = self.services.write().await;
        let record = self.live_entry(&mut services, name)?;
        if record.healthy != healthy {
            info!(service = name, healthy, "Service health changed");
        }
        record.healthy = healthy;
        Ok(())
    }

    /// Replace the descriptive fields of an existing service
    pub async fn update(&self, name: &str, mut record: ServiceRecord) -> Result<()> {
        validate(&record)?;
        if record.name != name {
            return Err(Error::invalid_service(format!(
                "record name {} does not match {}",
                record.name, name
            )));
        }

        let mut services = self.services.write().await;
        let existing = self.live_entry(&mut services, name)?;

        if record.ttl.is_zero() {
            record.ttl = self.config.default_ttl;
        }
        record.registered_at = existing.registered_at;
        record.healthy = existing.healthy;
        record.touch();
        *existing = record;
        debug!(service = name, "Updated service");
        Ok(())
    }

    /// Remove a service, returning its last record
    pub async fn deregister(&self, name: &str) -> Result<ServiceRecord> {
        let mut services = self.services.write().await;
        match services.remove(name) {
            Some(record) if !record.is_expired() => {
                self.notify_removed(&record, RemovalCause::Deregistered);
                info!(service = name, "Deregistered service");
                Ok(record)
            }
            Some(record) => {
                self.notify_removed(&record, RemovalCause::Expired);
                info!(service = name, "Purged expired service");
                Err(Error::service_not_found(name))
            }
            None => Err(Error::service_not_found(name)),
        }
    }

    /// Snapshot of live services sorted by name, optionally only healthy ones
    pub async fn list(&self, filter_healthy: bool) -> Vec<ServiceRecord> {
        self.collect(|record| !filter_healthy || record.healthy).await
    }

    /// Live services speaking `protocol`
    pub async fn list_by_protocol(&self, protocol: Protocol) -> Vec<ServiceRecord> {
        self.collect(|record| record.protocol == protocol).await
    }

    /// Number of stored records, including expired ones not yet swept
    pub async fn len(&self) -> usize {
        self.services.read().await.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.services.read().await.is_empty()
    }

    /// Purge every expired record, returning the purged names
    pub async fn cleanup_expired(&self) -> Vec<String> {
        let mut services = self.services.write().await;
        let mut purged: Vec<String> = services
            .values()
            .filter(|record| record.is_expired())
            .map(|record| record.name.clone())
            .collect();
        purged.sort();

        for name in &purged {
            if let Some(record) = services.remove(name) {
                self.notify_removed(&record, RemovalCause::Expired);
                info!(service = %name, "Purged expired service");
            }
        }
        purged
    }

    /// Live record for `name`; an expired one is purged on the spot
    fn live_entry<'a>(
        &self,
        services: &'a mut HashMap<String, ServiceRecord>,
        name: &str,
    ) -> Result<&'a mut ServiceRecord> {
        if services.get(name).is_some_and(ServiceRecord::is_expired) {
            if let Some(record) = services.remove(name) {
                self.notify_removed(&record, RemovalCause::Expired);
                info!(service = name, "Purged expired service");
            }
        }
        services
            .get_mut(name)
            .ok_or_else(|| Error::service_not_found(name))
    }

    fn notify_removed(&self, record: &ServiceRecord, cause: RemovalCause) {
        let hooks = self.hooks.read().unwrap_or_else(PoisonError::into_inner);
        for hook in hooks.iter() {
            hook(record, cause);
        }
    }

    async fn collect(&self, keep: impl Fn(&ServiceRecord) -> bool) -> Vec<ServiceRecord> {
        let mut records: Vec<ServiceRecord> = self
            .services
            .read()
            .await
            .values()
            .filter(|record| !record.is_expired() && keep(record))
            .cloned()
            .collect();
        records.sort_by(|a, b| a.name.cmp(&b.name));
        records
    }

    async fn sweep_loop(
        registry: Weak<Self>,
        period: std::time::Duration,
        cancel: CancellationToken,
    ) {
        let mut ticker = interval(period);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
        ticker.tick().await; // Skip first immediate tick

        loop {
            tokio::select! {
                _ = ticker.tick() => {
                    let Some(registry) = registry.upgrade() else {
                        debug!("Registry dropped, cleanup exiting");
                        break;
                    };
                    let purged = registry.cleanup_expired().await;
                    if !purged.is_empty() {
                        debug!(count = purged.len(), "Cleanup sweep finished");
                    }
                }
                _ = cancel.cancelled() => {
                    break;
                }
            }
        }
    }
}

impl Default for ServiceRegistry {
    fn default() -> Self {
        Self::new(RegistryConfig::default())
    }
}

fn validate(record: &ServiceRecord) -> Result<()> {
    if record.name.trim().is_empty() {
        return Err(Error::invalid_service("service name is required"));
    }
    if record.host.trim().is_empty() {
        return Err(Error::invalid_service(format!(
            "service {} has no host",
            record.name
        )));
    }
    if record.port == 0 {
        return Err(Error::invalid_service(format!(
            "service {} has no port",
            record.name
        )));
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    fn record(name: &str, port: u16) -> ServiceRecord {
        ServiceRecord::new(name, "127.0.0.1", port)
    }

    #[tokio::test]
    async fn test_register_and_get() {
        let registry = ServiceRegistry::default();
        registry
            .register(record("api", 8081).with_version("1.2.0"))
            .await
            .unwrap();

        let found = registry.get("api").await.unwrap();
        assert_eq!(found.port, 8081);
        assert_eq!(found.version, "1.2.0");
        assert!(found.healthy);
        assert_eq!(found.ttl, Duration::from_secs(30));
    }

    #[tokio::test]
    async fn test_register_rejects_invalid_records() {
        let registry = ServiceRegistry::default();
        assert!(matches!(
            registry.register(record("", 80)).await,
            Err(Error::InvalidService(_))
        ));
        assert!(matches!(
            registry.register(ServiceRecord::new("x", "", 80)).await,
            Err(Error::InvalidService(_))
        ));
        assert!(matches!(
            registry.register(record("x", 0)).await,
            Err(Error::InvalidService(_))
        ));
    }

    #[tokio::test]
    async fn test_reregistration_is_renewal() {
        let registry = ServiceRegistry::default();
        registry.register(record("api", 8081)).await.unwrap();
        let first = registry.get("api").await.unwrap();

        registry.update_health("api", false).await.unwrap();
        registry.register(record("api", 8082)).await.unwrap();

        let renewed = registry.get("api").await.unwrap();
        assert_eq!(renewed.port, 8082);
        assert_eq!(renewed.registered_at, first.registered_at);
        assert!(renewed.healthy);
        assert_eq!(registry.len().await, 1);
    }

    #[tokio::test]
    async fn test_missing_service_errors() {
        let registry = ServiceRegistry::default();
        assert!(registry.get("ghost").await.unwrap_err().is_not_found());
        assert!(registry.heartbeat("ghost").await.unwrap_err().is_not_found());
        assert!(registry.update_health("ghost", true).await.unwrap_err().is_not_found());
        assert!(registry.deregister("ghost").await.unwrap_err().is_not_found());
    }

    #[tokio::test]
    async fn test_deregister() {
        let registry = ServiceRegistry::default();
        registry.register(record("api", 8081)).await.unwrap();

        let removed = registry.deregister("api").await.unwrap();
        assert_eq!(removed.name, "api");
        assert!(registry.get("api").await.is_err());
        assert!(registry.deregister("api").await.unwrap_err().is_not_found());
    }

    #[tokio::test]
    async fn test_list_filters_unhealthy() {
        let registry = ServiceRegistry::default();
        registry.register(record("b", 2)).await.unwrap();
        registry.register(record("a", 1)).await.unwrap();
        registry.update_health("b", false).await.unwrap();

        let all: Vec<_> = registry.list(false).await.into_iter().map(|r| r.name).collect();
        assert_eq!(all, vec!["a", "b"]);

        let healthy: Vec<_> = registry.list(true).await.into_iter().map(|r| r.name).collect();
        assert_eq!(healthy, vec!["a"]);
    }

    #[tokio::test]
    async fn test_list_by_protocol() {
        let registry = ServiceRegistry::default();
        registry
            .register(record("web", 1).with_protocol(Protocol::Http))
            .await
            .unwrap();
        registry.register(record("raw", 2)).await.unwrap();

        let http = registry.list_by_protocol(Protocol::Http).await;
        assert_eq!(http.len(), 1);
        assert_eq!(http[0].name, "web");
    }

    #[tokio::test]
    async fn test_update_preserves_identity() {
        let registry = ServiceRegistry::default();
        registry.register(record("api", 8081)).await.unwrap();
        registry.update_health("api", false).await.unwrap();

        registry
            .update("api", record("api", 9000).with_version("2"))
            .await
            .unwrap();
        let updated = registry.get("api").await.unwrap();
        assert_eq!(updated.port, 9000);
        assert_eq!(updated.version, "2");
        assert!(!updated.healthy);

        assert!(matches!(
            registry.update("api", record("other", 1)).await,
            Err(Error::InvalidService(_))
        ));
        assert!(registry.update("ghost", record("ghost", 1)).await.unwrap_err().is_not_found());
    }

    #[tokio::test(start_paused = true)]
    async fn test_expired_record_is_invisible_before_sweep() {
        let registry = ServiceRegistry::default();
        registry
            .register(record("short", 1).with_ttl(Duration::from_millis(100)))
            .await
            .unwrap();

        tokio::time::advance(Duration::from_millis(150)).await;

        assert!(registry.get("short").await.unwrap_err().is_not_found());
        assert!(registry.list(false).await.is_empty());
        // Still physically stored until swept
        assert_eq!(registry.len().await, 1);

        // Heartbeat on an expired record fails and purges it
        assert!(registry.heartbeat("short").await.unwrap_err().is_not_found());
        assert!(registry.is_empty().await);
    }

    #[tokio::test(start_paused = true)]
    async fn test_cleanup_expired() {
        let registry = ServiceRegistry::default();
        registry
            .register(record("short", 1).with_ttl(Duration::from_millis(100)))
            .await
            .unwrap();
        registry
            .register(record("long", 2).with_ttl(Duration::from_secs(10)))
            .await
            .unwrap();

        tokio::time::advance(Duration::from_millis(150)).await;
        assert_eq!(registry.cleanup_expired().await, vec!["short".to_string()]);
        assert_eq!(registry.len().await, 1);
    }

    #[tokio::test]
    async fn test_lifecycle_misuse() {
        let registry = Arc::new(ServiceRegistry::default());
        assert_eq!(
            registry.stop().await.unwrap_err(),
            Error::NotRunning("registry cleanup")
        );

        registry.start().await.unwrap();
        assert!(registry.is_running().await);
        assert_eq!(
            registry.start().await.unwrap_err(),
            Error::AlreadyRunning("registry cleanup")
        );

        registry.stop().await.unwrap();
        assert!(!registry.is_running().await);
    }

    #[tokio::test]
    async fn test_zero_cleanup_interval_rejected() {
        let registry = Arc::new(ServiceRegistry::new(RegistryConfig {
            cleanup_interval: Duration::ZERO,
            ..RegistryConfig::default()
        }));
        assert!(matches!(registry.start().await, Err(Error::Config(_))));
    }

    fn recording_hook(registry: &ServiceRegistry) -> Arc<StdRwLock<Vec<(String, RemovalCause)>>> {
        let seen = Arc::new(StdRwLock::new(Vec::new()));
        let sink = seen.clone();
        registry.on_remove(move |record, cause| {
            sink.write().unwrap().push((record.name.clone(), cause));
        });
        seen
    }

    #[tokio::test(start_paused = true)]
    async fn test_removal_hooks_see_every_removal() {
        let registry = ServiceRegistry::default();
        let seen = recording_hook(&registry);

        registry.register(record("api", 8081)).await.unwrap();
        registry.deregister("api").await.unwrap();

        for name in ["swept", "beat", "renewed"] {
            registry
                .register(record(name, 1).with_ttl(Duration::from_millis(100)))
                .await
                .unwrap();
        }
        tokio::time::advance(Duration::from_millis(150)).await;

        assert!(registry.heartbeat("beat").await.is_err());
        registry.register(record("renewed", 2)).await.unwrap();
        assert_eq!(registry.cleanup_expired().await, vec!["swept".to_string()]);

        assert_eq!(
            *seen.read().unwrap(),
            vec![
                ("api".to_string(), RemovalCause::Deregistered),
                ("beat".to_string(), RemovalCause::Expired),
                ("renewed".to_string(), RemovalCause::Expired),
                ("swept".to_string(), RemovalCause::Expired),
            ]
        );
    }

    #[tokio::test]
    async fn test_renewal_is_not_a_removal() {
        let registry = ServiceRegistry::default();
        let seen = recording_hook(&registry);

        registry.register(record("api", 8081)).await.unwrap();
        registry.register(record("api", 8081)).await.unwrap();
        registry.update("api", record("api", 8082)).await.unwrap();
        assert!(registry.deregister("ghost").await.is_err());

        assert!(seen.read().unwrap().is_empty());
    }
}
