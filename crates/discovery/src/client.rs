//! Discovery client: registration with automatic ports, and multi-strategy lookup.

use crate::broadcast::BroadcastService;
use crate::config::DiscoveryClientConfig;
use crate::resolver::{Resolver, SystemDnsResolver};
use crate::stats::{DiscoveryStats, StatsRecorder};
use crate::strategy::{DiscoveryResult, DiscoveryStrategy};
use common::{Error, Result};
use dashmap::DashMap;
use portalloc::PortAllocator;
use registry::{ServiceRecord, ServiceRegistry};
use std::sync::{Arc, PoisonError, RwLock};
use std::time::Duration;
use tokio::net::TcpStream;
use tokio::time::{Instant, sleep, timeout, timeout_at};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

/// Bound on the `localhost` probe of the default-port strategy
const DEFAULT_PORT_PROBE_TIMEOUT: Duration = Duration::from_millis(100);

/// Front door for services: register (with port auto-assignment), find,
/// heartbeat and deregister.
///
/// Ports assigned by the client are released whenever their record leaves
/// the registry, whether through `deregister`, the TTL sweep or auto-removal.
pub struct DiscoveryClient {
    config: RwLock<DiscoveryClientConfig>,
    registry: Arc<ServiceRegistry>,
    allocator: Arc<PortAllocator>,
    dns: Arc<dyn Resolver>,
    broadcast: Option<Arc<BroadcastService>>,
    resolvers: DashMap<String, Arc<dyn Resolver>>,
    stats: StatsRecorder,
}

impl DiscoveryClient {
    /// Create a client using the system resolver for DNS
    pub fn new(
        config: DiscoveryClientConfig,
        registry: Arc<ServiceRegistry>,
        allocator: Arc<PortAllocator>,
    ) -> Self {
        let dns = Arc::new(SystemDnsResolver::new(config.default_ports.clone()));

        let ports = Arc::downgrade(&allocator);
        registry.on_remove(move |record, cause| {
            let Some(allocator) = ports.upgrade() else {
                return;
            };
            if let Some(port) = allocator.release_idle(&record.name) {
                debug!(service = %record.name, port, %cause, "Released port of removed service");
            }
        });

        Self {
            config: RwLock::new(config),
            registry,
            allocator,
            dns,
            broadcast: None,
            resolvers: DashMap::new(),
            stats: StatsRecorder::default(),
        }
    }

    /// Replace the resolver behind the DNS strategy
    pub fn with_dns_resolver(mut self, resolver: Arc<dyn Resolver>) -> Self {
        self.dns = resolver;
        self
    }

    /// Enable the broadcast strategy through `service`. The service is
    /// started on first use when the caller has not started it.
    pub fn with_broadcast(mut self, service: Arc<BroadcastService>) -> Self {
        self.broadcast = Some(service);
        self
    }

    pub fn broadcast(&self) -> Option<&Arc<BroadcastService>> {
        self.broadcast.as_ref()
    }

    /// Snapshot of the active configuration
    pub fn config(&self) -> DiscoveryClientConfig {
        self.config
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    /// Swap in new lookup settings. Lookups already in flight finish with
    /// the settings they started with.
    pub fn reconfigure(&self, config: DiscoveryClientConfig) {
        debug!(
            strategies = ?config.preferred_strategies,
            timeout_ms = config.discovery_timeout.as_millis(),
            "Discovery client reconfigured"
        );
        *self.config.write().unwrap_or_else(PoisonError::into_inner) = config;
    }

    /// Install a resolver reachable through `DiscoveryStrategy::Named(name)`
    pub fn add_resolver(&self, name: impl Into<String>, resolver: Arc<dyn Resolver>) {
        let name = name.into();
        debug!(resolver = %name, "Added resolver");
        self.resolvers.insert(name, resolver);
    }

    /// Drop a named resolver; its strategy is skipped from then on
    pub fn remove_resolver(&self, name: &str) -> bool {
        self.resolvers.remove(name).is_some()
    }

    /// Register a service, assigning a port when `record.port` is zero.
    ///
    /// Returns the record as stored. A port assigned here is released again
    /// if the registry rejects the record.
    pub async fn register(&self, record: ServiceRecord) -> Result<ServiceRecord> {
        self.register_with_cancel(record, &CancellationToken::new())
            .await
    }

    /// Like [`register`](Self::register), abandoning the registration when
    /// `cancel` fires. No port or record is left behind on cancellation.
    pub async fn register_with_cancel(
        &self,
        mut record: ServiceRecord,
        cancel: &CancellationToken,
    ) -> Result<ServiceRecord> {
        if cancel.is_cancelled() {
            return Err(Error::Cancelled);
        }
        if record.name.trim().is_empty() {
            return Err(Error::invalid_service("service name is required"));
        }

        let lease = if record.port == 0 {
            let hint = record
                .range_hint
                .clone()
                .or_else(|| self.allocator.range_for_service(&record.name));
            let lease = self.allocator.lease(&record.name, hint.as_deref())?;
            record.port = lease.port();
            Some(lease)
        } else {
            None
        };

        let name = record.name.clone();
        tokio::select! {
            biased;
            _ = cancel.cancelled() => {
                debug!(service = %name, "Registration cancelled");
                Err(Error::Cancelled)
            }
            registered = self.registry.register(record) => {
                registered?;
                if let Some(lease) = lease {
                    let port = lease.commit();
                    info!(service = %name, port, "Registered service on assigned port");
                }
                self.registry.get(&name).await
            }
        }
    }

    /// Find a service by trying each preferred strategy in order
    pub async fn discover(&self, name: &str) -> Result<DiscoveryResult> {
        self.discover_with_cancel(name, &CancellationToken::new())
            .await
    }

    /// Like [`discover`](Self::discover), returning `Cancelled` when
    /// `cancel` fires first
    pub async fn discover_with_cancel(
        &self,
        name: &str,
        cancel: &CancellationToken,
    ) -> Result<DiscoveryResult> {
        if name.trim().is_empty() {
            return Err(Error::invalid_service("service name is required"));
        }

        let config = self.config();
        let start = Instant::now();
        let deadline = start + config.discovery_timeout;

        let outcome = tokio::select! {
            biased;
            _ = cancel.cancelled() => Err(Error::Cancelled),
            searched = timeout_at(deadline, self.search(&config, name, start)) => {
                searched.unwrap_or_else(|_| {
                    Err(Error::DiscoveryTimeout {
                        service: name.to_string(),
                        waited: config.discovery_timeout,
                    })
                })
            }
        };

        self.stats.record(&outcome);
        match &outcome {
            Ok(result) => debug!(
                service = name,
                strategy = %result.strategy,
                address = %result.address(),
                latency_us = result.latency.as_micros(),
                "Discovered service"
            ),
            Err(e) => debug!(service = name, error = %e, "Discovery failed"),
        }
        outcome
    }

    /// Poll `discover` until the service shows up or `max_wait` passes
    pub async fn wait_for_service(&self, name: &str, max_wait: Duration) -> Result<DiscoveryResult> {
        self.wait_for_service_with_cancel(name, max_wait, &CancellationToken::new())
            .await
    }

    pub async fn wait_for_service_with_cancel(
        &self,
        name: &str,
        max_wait: Duration,
        cancel: &CancellationToken,
    ) -> Result<DiscoveryResult> {
        let deadline = Instant::now() + max_wait;
        let poll_interval = self.config().wait_poll_interval;

        let poll = async {
            loop {
                match self.discover_with_cancel(name, cancel).await {
                    Ok(result) => return Ok(result),
                    Err(e @ (Error::Cancelled | Error::InvalidService(_))) => return Err(e),
                    Err(e) => debug!(service = name, error = %e, "Service not available yet"),
                }

                tokio::select! {
                    _ = cancel.cancelled() => return Err(Error::Cancelled),
                    _ = sleep(poll_interval) => {}
                }
            }
        };

        match timeout_at(deadline, poll).await {
            Ok(outcome) => outcome,
            Err(_) => {
                info!(service = name, waited_ms = max_wait.as_millis(), "Gave up waiting for service");
                Err(Error::DiscoveryTimeout {
                    service: name.to_string(),
                    waited: max_wait,
                })
            }
        }
    }

    pub async fn heartbeat(&self, name: &str) -> Result<()> {
        self.registry.heartbeat(name).await
    }

    /// Deregister a service. Its port goes back to the allocator through
    /// the registry's removal hook.
    pub async fn deregister(&self, name: &str) -> Result<()> {
        self.registry.deregister(name).await?;
        Ok(())
    }

    pub async fn list_services(&self) -> Vec<ServiceRecord> {
        self.registry.list(false).await
    }

    pub async fn list_healthy_services(&self) -> Vec<ServiceRecord> {
        self.registry.list(true).await
    }

    /// `host:port` of a discovered service
    pub async fn get_service_address(&self, name: &str) -> Result<String> {
        Ok(self.discover(name).await?.address())
    }

    pub fn stats(&self) -> DiscoveryStats {
        self.stats.snapshot()
    }

    async fn search(
        &self,
        config: &DiscoveryClientConfig,
        name: &str,
        start: Instant,
    ) -> Result<DiscoveryResult> {
        let mut attempted = Vec::new();

        for strategy in &config.preferred_strategies {
            if !self.is_available(config, strategy) {
                continue;
            }
            attempted.push(strategy.to_string());

            match self.try_strategy(config, strategy, name).await {
                Ok(Some(record)) => {
                    return Ok(DiscoveryResult {
                        record,
                        strategy: strategy.clone(),
                        latency: start.elapsed(),
                    });
                }
                Ok(None) => {}
                Err(e) => debug!(service = name, strategy = %strategy, error = %e, "Strategy failed"),
            }
        }

        Err(Error::ServiceNotFound {
            name: name.to_string(),
            attempted,
        })
    }

    fn is_available(&self, config: &DiscoveryClientConfig, strategy: &DiscoveryStrategy) -> bool {
        match strategy {
            DiscoveryStrategy::Registry | DiscoveryStrategy::DefaultPort => true,
            DiscoveryStrategy::Dns => config.enable_dns,
            DiscoveryStrategy::Broadcast => self.broadcast.is_some(),
            DiscoveryStrategy::Named(resolver) => self.resolvers.contains_key(resolver),
        }
    }

    async fn try_strategy(
        &self,
        config: &DiscoveryClientConfig,
        strategy: &DiscoveryStrategy,
        name: &str,
    ) -> Result<Option<ServiceRecord>> {
        match strategy {
            DiscoveryStrategy::Registry => match self.registry.get(name).await {
                Ok(record) if record.healthy => Ok(Some(record)),
                Ok(_) => {
                    debug!(service = name, "Registry record is unhealthy");
                    Ok(None)
                }
                Err(e) if e.is_not_found() => Ok(None),
                Err(e) => Err(e),
            },
            DiscoveryStrategy::DefaultPort => {
                let Some(port) = config.default_ports.port_for(name) else {
                    return Ok(None);
                };
                let reachable = matches!(
                    timeout(DEFAULT_PORT_PROBE_TIMEOUT, TcpStream::connect(("localhost", port))).await,
                    Ok(Ok(_))
                );
                Ok(reachable.then(|| ServiceRecord::new(name, "localhost", port)))
            }
            DiscoveryStrategy::Dns => Self::resolve_with(self.dns.as_ref(), name).await,
            DiscoveryStrategy::Broadcast => match &self.broadcast {
                Some(broadcast) => {
                    if !broadcast.is_running().await {
                        match broadcast.start().await {
                            Ok(()) | Err(Error::AlreadyRunning(_)) => {}
                            Err(e) => {
                                warn!(error = %e, "Could not start broadcast discovery");
                                return Err(e);
                            }
                        }
                    }
                    Self::resolve_with(broadcast.as_ref(), name).await
                }
                None => Ok(None),
            },
            DiscoveryStrategy::Named(resolver_name) => {
                let resolver = self
                    .resolvers
                    .get(resolver_name)
                    .map(|entry| entry.value().clone());
                match resolver {
                    Some(resolver) => Self::resolve_with(resolver.as_ref(), name).await,
                    None => Ok(None),
                }
            }
        }
    }

    async fn resolve_with(resolver: &dyn Resolver, name: &str) -> Result<Option<ServiceRecord>> {
        match resolver.resolve(name).await {
            Ok((host, port)) => Ok(Some(ServiceRecord::new(name, host, port))),
            Err(e) if e.is_not_found() => Ok(None),
            Err(e) => Err(e),
        }
    }
}
