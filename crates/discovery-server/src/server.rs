//! Daemon wiring: builds the components, runs the background loops and
//! tears everything down on shutdown.

use crate::collector::MetricsCollector;
use crate::config::{Config, STATIC_RESOLVER};
use crate::config_manager::ConfigManager;
use crate::http_server::{AppState, HttpServer};
use crate::metrics::MetricsRegistry;
use anyhow::Context;
use discovery::{BroadcastService, DiscoveryClient};
use healthcheck::HealthMonitor;
use portalloc::PortAllocator;
use registry::ServiceRegistry;
use std::sync::Arc;
use tokio::net::TcpListener;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

/// Discovery daemon
pub struct DiscoveryServer {
    config: Config,
    registry: Arc<ServiceRegistry>,
    allocator: Arc<PortAllocator>,
    monitor: Arc<HealthMonitor>,
    client: Arc<DiscoveryClient>,
    broadcast: Option<Arc<BroadcastService>>,
    config_manager: Arc<ConfigManager>,
    metrics: Option<Arc<MetricsRegistry>>,
}

impl DiscoveryServer {
    /// Build every component from configuration
    pub fn new(config: Config) -> common::Result<Self> {
        let registry = Arc::new(ServiceRegistry::new(config.to_registry_config()));
        let allocator = Arc::new(PortAllocator::new(config.to_allocator_config()));

        let monitor = HealthMonitor::new(config.to_monitor_config(), registry.clone())?
            .with_allocator(allocator.clone());

        let mut client = DiscoveryClient::new(
            config.to_discovery_config(),
            registry.clone(),
            allocator.clone(),
        );
        if let Some(resolver) = config.static_resolver() {
            info!(entries = resolver.len(), "Static services configured");
            client.add_resolver(STATIC_RESOLVER, Arc::new(resolver));
        }

        let broadcast = config.to_broadcast_config().map(|broadcast| {
            info!(group = %broadcast.group, "Broadcast discovery enabled");
            Arc::new(BroadcastService::new(broadcast))
        });
        if let Some(service) = &broadcast {
            client = client.with_broadcast(service.clone());
        }
        let client = Arc::new(client);

        let config_manager = ConfigManager::new(config.clone())
            .map_err(|e| common::Error::config(e.to_string()))?
            .with_allocator(allocator.clone())
            .with_client(client.clone());

        let metrics = if config.metrics.enabled {
            Some(Arc::new(MetricsRegistry::new()))
        } else {
            info!("Metrics disabled");
            None
        };

        Ok(Self {
            config,
            registry,
            allocator,
            monitor: Arc::new(monitor),
            client,
            broadcast,
            config_manager: Arc::new(config_manager),
            metrics,
        })
    }

    pub fn registry(&self) -> &Arc<ServiceRegistry> {
        &self.registry
    }

    pub fn allocator(&self) -> &Arc<PortAllocator> {
        &self.allocator
    }

    pub fn monitor(&self) -> &Arc<HealthMonitor> {
        &self.monitor
    }

    pub fn client(&self) -> &Arc<DiscoveryClient> {
        &self.client
    }

    pub fn broadcast(&self) -> Option<&Arc<BroadcastService>> {
        self.broadcast.as_ref()
    }

    pub fn config_manager(&self) -> &Arc<ConfigManager> {
        &self.config_manager
    }

    pub fn metrics(&self) -> Option<&Arc<MetricsRegistry>> {
        self.metrics.as_ref()
    }

    /// Run until Ctrl-C
    pub async fn run(self) -> anyhow::Result<()> {
        let shutdown = CancellationToken::new();

        let trigger = shutdown.clone();
        tokio::spawn(async move {
            match tokio::signal::ctrl_c().await {
                Ok(()) => {
                    info!("Received shutdown signal");
                    trigger.cancel();
                }
                Err(e) => warn!(error = %e, "Failed to listen for shutdown signal"),
            }
        });

        self.run_until(shutdown).await
    }

    /// Bind the configured listen address and run until `shutdown` fires
    pub async fn run_until(self, shutdown: CancellationToken) -> anyhow::Result<()> {
        let listener = TcpListener::bind(&self.config.server.listen_addr)
            .await
            .with_context(|| format!("failed to bind {}", self.config.server.listen_addr))?;
        self.serve(listener, shutdown).await
    }

    /// Run on an already bound listener until `shutdown` fires
    pub async fn serve(self, listener: TcpListener, shutdown: CancellationToken) -> anyhow::Result<()> {
        info!("Starting discovery server");

        self.registry.start().await?;
        self.monitor.start().await?;
        if let Some(broadcast) = &self.broadcast {
            // A lookup may have started it already
            match broadcast.start().await {
                Ok(()) | Err(common::Error::AlreadyRunning(_)) => {}
                Err(e) => return Err(e.into()),
            }
        }

        // Fires on external shutdown or when the HTTP server dies
        let stop = shutdown.child_token();

        let collector_handle = self.metrics.as_ref().map(|metrics| {
            let collector = Arc::new(MetricsCollector::new(
                self.registry.clone(),
                self.allocator.clone(),
                self.monitor.clone(),
                self.client.clone(),
                metrics.clone(),
            ));
            tokio::spawn(collector.run(self.config.metrics.collect_interval, stop.clone()))
        });

        let state = AppState {
            registry: self.registry.clone(),
            monitor: self.monitor.clone(),
            client: self.client.clone(),
            config: self.config_manager.clone(),
            metrics: self.metrics.clone(),
        };
        let http = HttpServer::new(state, self.config.server.listen_addr.clone());
        let mut http_handle = tokio::spawn(http.serve(listener, stop.clone()));

        info!("All tasks spawned, server running");

        let early_exit = tokio::select! {
            _ = shutdown.cancelled() => None,
            joined = &mut http_handle => Some(joined),
        };
        stop.cancel();

        let http_result = match early_exit {
            Some(joined) => {
                warn!("HTTP server exited before shutdown");
                joined
            }
            None => http_handle.await,
        };

        if let Some(handle) = collector_handle {
            if let Err(e) = handle.await {
                warn!(error = %e, "Metrics collector task failed");
            }
        }

        if let Some(broadcast) = &self.broadcast {
            if let Err(e) = broadcast.stop().await {
                debug!(error = %e, "Broadcast service was not running");
            }
        }
        self.monitor.stop().await?;
        self.registry.stop().await?;
        info!("Discovery server stopped");

        http_result
            .context("HTTP server task failed")?
            .context("HTTP server failed")
    }
}
