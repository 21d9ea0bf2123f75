//! Prometheus metrics for discoveryd.

use prometheus_client::encoding::text::encode;
use prometheus_client::encoding::EncodeLabelSet;
use prometheus_client::metrics::counter::Counter;
use prometheus_client::metrics::family::Family;
use prometheus_client::metrics::gauge::Gauge;
use prometheus_client::metrics::histogram::{exponential_buckets, Histogram};
use prometheus_client::registry::Registry;
use std::collections::BTreeMap;
use std::time::Duration;

/// Probe outcomes used as the `result` label
pub const PROBE_RESULTS: [&str; 3] = ["success", "failure", "timeout"];

/// Labels for per-service metrics
#[derive(Clone, Debug, Hash, PartialEq, Eq, EncodeLabelSet)]
pub struct ServiceLabels {
    /// Service name
    pub service: String,
}

/// Labels for probe result metrics
#[derive(Clone, Debug, Hash, PartialEq, Eq, EncodeLabelSet)]
pub struct ProbeLabels {
    /// Service name
    pub service: String,
    /// Result (success, failure, timeout)
    pub result: String,
}

/// Labels for health-state metrics
#[derive(Clone, Debug, Hash, PartialEq, Eq, EncodeLabelSet)]
pub struct HealthLabels {
    /// State (healthy, unhealthy)
    pub state: String,
}

/// Labels for port allocation metrics
#[derive(Clone, Debug, Hash, PartialEq, Eq, EncodeLabelSet)]
pub struct RangeLabels {
    /// Named range, or "default"
    pub range: String,
}

/// Labels for discovery lookup metrics
#[derive(Clone, Debug, Hash, PartialEq, Eq, EncodeLabelSet)]
pub struct LookupLabels {
    /// Outcome (hit, miss, timeout, cancelled)
    pub outcome: String,
    /// Strategy that answered, "none" for failed lookups
    pub strategy: String,
}

/// Metrics registry with all discoveryd metrics
pub struct MetricsRegistry {
    /// Prometheus registry
    pub registry: Registry,

    // Registry metrics
    services_registered: Gauge,
    services_by_health: Family<HealthLabels, Gauge>,
    port_allocations: Family<RangeLabels, Gauge>,

    // Per-service health metrics
    probes_total: Family<ProbeLabels, Counter>,
    probe_latency_seconds: Family<ServiceLabels, Histogram>,
    consecutive_successes: Family<ServiceLabels, Gauge>,
    consecutive_failures: Family<ServiceLabels, Gauge>,
    health_transitions_total: Family<ServiceLabels, Counter>,

    // Discovery metrics
    lookups_total: Family<LookupLabels, Counter>,

    /// Collector pass duration
    collector_duration_seconds: Histogram,
}

impl MetricsRegistry {
    pub fn new() -> Self {
        let mut registry = Registry::default();

        let services_registered = Gauge::default();
        registry.register(
            "waypoint_services_registered",
            "Live services in the registry",
            services_registered.clone(),
        );

        let services_by_health = Family::<HealthLabels, Gauge>::default();
        registry.register(
            "waypoint_services_by_health",
            "Live services by health flag",
            services_by_health.clone(),
        );

        let port_allocations = Family::<RangeLabels, Gauge>::default();
        registry.register(
            "waypoint_port_allocations",
            "Allocated ports per range",
            port_allocations.clone(),
        );

        // Counter names gain a _total suffix when encoded
        let probes_total = Family::<ProbeLabels, Counter>::default();
        registry.register(
            "waypoint_probes",
            "Health probes performed",
            probes_total.clone(),
        );

        // 1ms to ~8s
        let probe_latency_seconds = Family::<ServiceLabels, Histogram>::new_with_constructor(|| {
            Histogram::new(exponential_buckets(0.001, 2.0, 14))
        });
        registry.register(
            "waypoint_probe_latency_seconds",
            "Health probe latency in seconds",
            probe_latency_seconds.clone(),
        );

        let consecutive_successes = Family::<ServiceLabels, Gauge>::default();
        registry.register(
            "waypoint_consecutive_successes",
            "Current consecutive probe successes",
            consecutive_successes.clone(),
        );

        let consecutive_failures = Family::<ServiceLabels, Gauge>::default();
        registry.register(
            "waypoint_consecutive_failures",
            "Current consecutive probe failures",
            consecutive_failures.clone(),
        );

        let health_transitions_total = Family::<ServiceLabels, Counter>::default();
        registry.register(
            "waypoint_health_transitions",
            "Health flips written to the registry",
            health_transitions_total.clone(),
        );

        let lookups_total = Family::<LookupLabels, Counter>::default();
        registry.register(
            "waypoint_discovery_lookups",
            "Discovery lookups by outcome",
            lookups_total.clone(),
        );

        let collector_duration_seconds = Histogram::new(exponential_buckets(0.0001, 2.0, 12));
        registry.register(
            "waypoint_collector_duration_seconds",
            "Metrics collector pass duration",
            collector_duration_seconds.clone(),
        );

        Self {
            registry,
            services_registered,
            services_by_health,
            port_allocations,
            probes_total,
            probe_latency_seconds,
            consecutive_successes,
            consecutive_failures,
            health_transitions_total,
            lookups_total,
            collector_duration_seconds,
        }
    }

    /// Update registry population gauges
    pub fn update_service_counts(&self, healthy: usize, unhealthy: usize) {
        self.services_registered.set((healthy + unhealthy) as i64);

        self.services_by_health
            .get_or_create(&HealthLabels {
                state: "healthy".to_string(),
            })
            .set(healthy as i64);

        self.services_by_health
            .get_or_create(&HealthLabels {
                state: "unhealthy".to_string(),
            })
            .set(unhealthy as i64);
    }

    /// Set per-range allocation counts; ranges missing from `counts` drop to zero
    pub fn update_port_allocations<'a>(
        &self,
        ranges: impl IntoIterator<Item = &'a str>,
        counts: &BTreeMap<String, usize>,
    ) {
        for range in ranges {
            let count = counts.get(range).copied().unwrap_or(0);
            self.port_allocations
                .get_or_create(&RangeLabels {
                    range: range.to_string(),
                })
                .set(count as i64);
        }
    }

    /// Add `count` probes with the given result
    pub fn record_probes(&self, service: &str, result: &str, count: u64) {
        if count == 0 {
            return;
        }
        self.probes_total
            .get_or_create(&ProbeLabels {
                service: service.to_string(),
                result: result.to_string(),
            })
            .inc_by(count);
    }

    pub fn observe_probe_latency(&self, service: &str, latency: Duration) {
        self.probe_latency_seconds
            .get_or_create(&ServiceLabels {
                service: service.to_string(),
            })
            .observe(latency.as_secs_f64());
    }

    /// Update consecutive success/failure counts
    pub fn update_consecutive(&self, service: &str, successes: u32, failures: u32) {
        let labels = ServiceLabels {
            service: service.to_string(),
        };

        self.consecutive_successes
            .get_or_create(&labels)
            .set(successes as i64);

        self.consecutive_failures
            .get_or_create(&labels)
            .set(failures as i64);
    }

    pub fn record_transitions(&self, service: &str, count: u64) {
        if count == 0 {
            return;
        }
        self.health_transitions_total
            .get_or_create(&ServiceLabels {
                service: service.to_string(),
            })
            .inc_by(count);
    }

    pub fn record_lookups(&self, outcome: &str, strategy: &str, count: u64) {
        if count == 0 {
            return;
        }
        self.lookups_total
            .get_or_create(&LookupLabels {
                outcome: outcome.to_string(),
                strategy: strategy.to_string(),
            })
            .inc_by(count);
    }

    /// Drop every per-service series for a service that left the registry
    pub fn remove_service(&self, service: &str) {
        let labels = ServiceLabels {
            service: service.to_string(),
        };
        self.probe_latency_seconds.remove(&labels);
        self.consecutive_successes.remove(&labels);
        self.consecutive_failures.remove(&labels);
        self.health_transitions_total.remove(&labels);

        for result in PROBE_RESULTS {
            self.probes_total.remove(&ProbeLabels {
                service: service.to_string(),
                result: result.to_string(),
            });
        }
    }

    pub fn record_collector_duration(&self, duration: Duration) {
        self.collector_duration_seconds
            .observe(duration.as_secs_f64());
    }

    /// Render all metrics in the Prometheus text format
    pub fn encode(&self) -> Result<String, std::fmt::Error> {
        let mut buffer = String::new();
        encode(&mut buffer, &self.registry)?;
        Ok(buffer)
    }
}

impl Default for MetricsRegistry {
    fn default() -> Self {
        Self::new()
    }
}
