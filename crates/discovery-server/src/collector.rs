//! Periodic sampling of registry, allocator, monitor and discovery state
//! into the Prometheus registry.

use crate::metrics::MetricsRegistry;
use discovery::{DiscoveryClient, DiscoveryStats};
use healthcheck::{HealthCheckStats, HealthMonitor};
use portalloc::{PortAllocator, DEFAULT_RANGE};
use registry::ServiceRegistry;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::Mutex;
use tokio::time::MissedTickBehavior;
use tokio_util::sync::CancellationToken;
use tracing::debug;

/// Counters seen on the previous pass
#[derive(Default)]
struct Sample {
    health: HashMap<String, HealthCheckStats>,
    lookups: DiscoveryStats,
}

/// Turns component snapshots into metric updates.
///
/// Monitor and discovery statistics are cumulative, so each pass adds the
/// difference from the previous sample to the Prometheus counters.
pub struct MetricsCollector {
    registry: Arc<ServiceRegistry>,
    allocator: Arc<PortAllocator>,
    monitor: Arc<HealthMonitor>,
    client: Arc<DiscoveryClient>,
    metrics: Arc<MetricsRegistry>,
    previous: Mutex<Sample>,
}

impl MetricsCollector {
    pub fn new(
        registry: Arc<ServiceRegistry>,
        allocator: Arc<PortAllocator>,
        monitor: Arc<HealthMonitor>,
        client: Arc<DiscoveryClient>,
        metrics: Arc<MetricsRegistry>,
    ) -> Self {
        Self {
            registry,
            allocator,
            monitor,
            client,
            metrics,
            previous: Mutex::new(Sample::default()),
        }
    }

    pub fn metrics(&self) -> &Arc<MetricsRegistry> {
        &self.metrics
    }

    /// Sample every component once
    pub async fn collect_once(&self) {
        let start = Instant::now();
        let mut previous = self.previous.lock().await;

        let services = self.registry.list(false).await;
        let healthy = services.iter().filter(|s| s.healthy).count();
        self.metrics
            .update_service_counts(healthy, services.len() - healthy);

        let counts = self.allocator.allocations_by_range();
        let range_names = self.allocator.range_names();
        let ranges = range_names
            .iter()
            .map(String::as_str)
            .chain(std::iter::once(DEFAULT_RANGE));
        self.metrics.update_port_allocations(ranges, &counts);

        let current = self.monitor.get_all_stats();
        for (service, stats) in &current {
            self.record_health(service, stats, previous.health.get(service));
        }
        for service in previous.health.keys() {
            if !current.contains_key(service) {
                debug!(service = %service, "Dropping metrics for removed service");
                self.metrics.remove_service(service);
            }
        }

        let lookups = self.client.stats();
        self.record_lookups(&lookups, &previous.lookups);

        previous.health = current;
        previous.lookups = lookups;

        self.metrics.record_collector_duration(start.elapsed());
    }

    /// Sample on `interval` until `cancel` fires
    pub async fn run(self: Arc<Self>, interval: Duration, cancel: CancellationToken) {
        let mut ticker = tokio::time::interval(interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

        loop {
            tokio::select! {
                biased;
                _ = cancel.cancelled() => break,
                _ = ticker.tick() => self.collect_once().await,
            }
        }

        debug!("Metrics collector stopped");
    }

    fn record_health(
        &self,
        service: &str,
        stats: &HealthCheckStats,
        before: Option<&HealthCheckStats>,
    ) {
        // Totals restart when a removed service comes back
        let baseline = before
            .filter(|b| b.total_checks <= stats.total_checks)
            .cloned()
            .unwrap_or_default();

        let m = &self.metrics;
        m.record_probes(
            service,
            "success",
            stats.successful_checks.saturating_sub(baseline.successful_checks),
        );
        m.record_probes(
            service,
            "failure",
            stats.failed_checks.saturating_sub(baseline.failed_checks),
        );
        m.record_probes(
            service,
            "timeout",
            stats.timeouts.saturating_sub(baseline.timeouts),
        );
        m.record_transitions(service, stats.transitions.saturating_sub(baseline.transitions));
        m.update_consecutive(
            service,
            stats.consecutive_successes,
            stats.consecutive_failures,
        );

        if stats.total_checks > baseline.total_checks {
            if let Some(result) = self.monitor.get_last_result(service) {
                m.observe_probe_latency(service, result.latency);
            }
        }
    }

    fn record_lookups(&self, current: &DiscoveryStats, before: &DiscoveryStats) {
        let m = &self.metrics;
        for (strategy, hits) in &current.hits {
            let seen = before.hits.get(strategy).copied().unwrap_or(0);
            m.record_lookups("hit", strategy, hits.saturating_sub(seen));
        }
        m.record_lookups("miss", "none", current.misses.saturating_sub(before.misses));
        m.record_lookups(
            "timeout",
            "none",
            current.timeouts.saturating_sub(before.timeouts),
        );
        m.record_lookups(
            "cancelled",
            "none",
            current.cancelled.saturating_sub(before.cancelled),
        );
    }
}
