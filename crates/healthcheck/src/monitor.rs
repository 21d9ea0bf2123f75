//! Health check monitoring and management.

use crate::checkers::{CustomCheck, FnChecker, HealthChecker, HttpChecker, TcpChecker};
use crate::types::{
    HealthCheckResult, HealthCheckStats, HealthMonitorConfig, HealthStatus, ProbeStrategy,
};
use common::{Error, Result};
use dashmap::DashMap;
use futures::future::join_all;
use portalloc::PortAllocator;
use registry::{ServiceRecord, ServiceRegistry};
use std::collections::{HashMap, HashSet};
use std::sync::{Arc, Weak};
use std::time::Instant;
use tokio::sync::Mutex;
use tokio::task::JoinHandle;
use tokio::time::{MissedTickBehavior, interval, timeout};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

/// Per-service state kept by the monitor
#[derive(Debug, Default)]
struct ServiceHealth {
    stats: HealthCheckStats,
    last_result: Option<HealthCheckResult>,
}

struct MonitorTask {
    cancel: CancellationToken,
    handle: JoinHandle<()>,
}

/// Probes every registered service and writes health verdicts back to the
/// registry.
///
/// Verdicts use rise/fall hysteresis: a healthy service is marked down after
/// `unhealthy_threshold` consecutive failures and back up after
/// `healthy_threshold` consecutive successes.
pub struct HealthMonitor {
    config: HealthMonitorConfig,
    registry: Arc<ServiceRegistry>,
    allocator: Option<Arc<PortAllocator>>,
    tcp: Arc<dyn HealthChecker>,
    http: Arc<dyn HealthChecker>,
    custom: DashMap<String, Arc<dyn HealthChecker>>,
    strategies: DashMap<String, ProbeStrategy>,
    states: Arc<DashMap<String, ServiceHealth>>,
    task: Mutex<Option<MonitorTask>>,
}

impl HealthMonitor {
    /// Create a new health monitor over `registry`
    pub fn new(config: HealthMonitorConfig, registry: Arc<ServiceRegistry>) -> Result<Self> {
        let tcp = Arc::new(TcpChecker::new(config.check_timeout));
        let http = Arc::new(HttpChecker::new(
            config.http_path.clone(),
            config.check_timeout,
        )?);

        // Counters belong to one registration; a re-registered name starts over
        let states: Arc<DashMap<String, ServiceHealth>> = Arc::new(DashMap::new());
        let forget = Arc::downgrade(&states);
        registry.on_remove(move |record, cause| {
            if let Some(states) = forget.upgrade() {
                if states.remove(&record.name).is_some() {
                    debug!(service = %record.name, %cause, "Dropped health state of removed service");
                }
            }
        });

        Ok(Self {
            config,
            registry,
            allocator: None,
            tcp,
            http,
            custom: DashMap::new(),
            strategies: DashMap::new(),
            states,
            task: Mutex::new(None),
        })
    }

    /// Release ports of auto-removed services through `allocator`
    pub fn with_allocator(mut self, allocator: Arc<PortAllocator>) -> Self {
        self.allocator = Some(allocator);
        self
    }

    pub fn config(&self) -> &HealthMonitorConfig {
        &self.config
    }

    /// Start the probe loop. The first cycle runs immediately.
    pub async fn start(self: &Arc<Self>) -> Result<()> {
        if self.config.check_interval.is_zero() {
            return Err(Error::config("check_interval must be non-zero"));
        }

        let mut slot = self.task.lock().await;
        if slot.is_some() {
            return Err(Error::AlreadyRunning("health monitor"));
        }

        let cancel = CancellationToken::new();
        let handle = tokio::spawn(Self::monitor_loop(Arc::downgrade(self), cancel.clone()));
        *slot = Some(MonitorTask { cancel, handle });

        info!(
            interval_ms = self.config.check_interval.as_millis(),
            strategy = %self.config.default_strategy,
            "Health monitor started"
        );
        Ok(())
    }

    /// Stop the probe loop and wait for the in-flight cycle to finish
    pub async fn stop(&self) -> Result<()> {
        let task = self
            .task
            .lock()
            .await
            .take()
            .ok_or(Error::NotRunning("health monitor"))?;

        task.cancel.cancel();
        if let Err(e) = task.handle.await {
            warn!(error = %e, "Health monitor task ended abnormally");
        }
        info!("Health monitor stopped");
        Ok(())
    }

    pub async fn is_running(&self) -> bool {
        self.task.lock().await.is_some()
    }

    /// Register a predicate as the custom check for `service`
    pub fn register_custom_check<F>(&self, service: impl Into<String>, check: F)
    where
        F: Fn(&ServiceRecord) -> Result<()> + Send + Sync + 'static,
    {
        let check: CustomCheck = Arc::new(check);
        self.register_checker(service, Arc::new(FnChecker::new(check)));
    }

    /// Register any checker as the custom check for `service`
    pub fn register_checker(&self, service: impl Into<String>, checker: Arc<dyn HealthChecker>) {
        let service = service.into();
        debug!(service = %service, checker = checker.name(), "Registered custom health check");
        self.custom.insert(service, checker);
    }

    /// Pin the probe strategy for `service`
    pub fn set_service_strategy(&self, service: impl Into<String>, strategy: ProbeStrategy) {
        self.strategies.insert(service.into(), strategy);
    }

    /// Strategy used for `service`: explicit setting, then a registered
    /// custom check, then the configured default
    pub fn strategy_for(&self, service: &str) -> ProbeStrategy {
        if let Some(strategy) = self.strategies.get(service) {
            return *strategy;
        }
        if self.custom.contains_key(service) {
            return ProbeStrategy::Custom;
        }
        self.config.default_strategy
    }

    /// Probe `service` once. Counters and registry health are left untouched.
    pub async fn check_service_health(&self, service: &str) -> Result<HealthCheckResult> {
        let record = self.registry.get(service).await?;
        Ok(self.probe(&record).await)
    }

    /// Feed one probe outcome through the hysteresis state machine.
    ///
    /// Updates counters and the last result, writes a health flip to the
    /// registry on a threshold crossing, and deregisters the service once
    /// auto-removal is due.
    pub async fn record_result(&self, result: HealthCheckResult) -> Result<()> {
        let name = result.service_name.clone();
        let record = self.registry.get(&name).await?;

        let (successes, failures) = {
            let mut state = self.states.entry(name.clone()).or_default();
            state.stats.update(&result);
            state.last_result = Some(result.clone());
            (
                state.stats.consecutive_successes,
                state.stats.consecutive_failures,
            )
        };

        log_result(&result, successes, failures);

        let was_up = record.healthy;
        if was_up && failures >= self.config.unhealthy_threshold {
            self.registry.update_health(&name, false).await?;
            self.count_transition(&name);
            warn!(
                service = %name,
                fall = self.config.unhealthy_threshold,
                "Service is now UNHEALTHY (fall threshold met)"
            );
        } else if !was_up && successes >= self.config.healthy_threshold {
            self.registry.update_health(&name, true).await?;
            self.count_transition(&name);
            info!(
                service = %name,
                rise = self.config.healthy_threshold,
                "Service is now HEALTHY (rise threshold met)"
            );
        }

        if self.config.enable_auto_removal
            && failures >= self.config.effective_removal_threshold()
        {
            self.remove_service(&name).await?;
        }
        Ok(())
    }

    pub fn get_last_result(&self, service: &str) -> Option<HealthCheckResult> {
        self.states
            .get(service)
            .and_then(|state| state.last_result.clone())
    }

    /// Last result for every service the monitor has seen
    pub fn get_all_results(&self) -> HashMap<String, HealthCheckResult> {
        self.states
            .iter()
            .filter_map(|entry| {
                entry
                    .last_result
                    .clone()
                    .map(|result| (entry.key().clone(), result))
            })
            .collect()
    }

    pub fn get_failure_count(&self, service: &str) -> u32 {
        self.states
            .get(service)
            .map_or(0, |state| state.stats.consecutive_failures)
    }

    pub fn get_success_count(&self, service: &str) -> u32 {
        self.states
            .get(service)
            .map_or(0, |state| state.stats.consecutive_successes)
    }

    pub fn get_stats(&self, service: &str) -> Option<HealthCheckStats> {
        self.states.get(service).map(|state| state.stats.clone())
    }

    /// Stats for every service the monitor has seen
    pub fn get_all_stats(&self) -> HashMap<String, HealthCheckStats> {
        self.states
            .iter()
            .map(|entry| (entry.key().clone(), entry.stats.clone()))
            .collect()
    }

    /// Clear the consecutive counters for `service`
    pub fn reset_counts(&self, service: &str) {
        if let Some(mut state) = self.states.get_mut(service) {
            state.stats.reset_counts();
        }
    }

    pub async fn get_healthy_services(&self) -> Vec<ServiceRecord> {
        self.registry.list(true).await
    }

    pub async fn get_unhealthy_services(&self) -> Vec<ServiceRecord> {
        self.registry
            .list(false)
            .await
            .into_iter()
            .filter(|record| !record.healthy)
            .collect()
    }

    /// Probe every registered service concurrently and record the results
    pub async fn run_cycle(&self) {
        let start = Instant::now();
        let records = self.registry.list(false).await;
        self.prune_states(&records);
        if records.is_empty() {
            return;
        }

        let results = join_all(records.iter().map(|record| self.probe(record))).await;

        for result in results {
            let service = result.service_name.clone();
            match self.record_result(result).await {
                Ok(()) => {}
                Err(e) if e.is_not_found() => {
                    debug!(service = %service, "Service vanished during health cycle");
                }
                Err(e) => {
                    warn!(service = %service, error = %e, "Failed to record health result");
                }
            }
        }

        debug!(
            services = records.len(),
            duration_ms = start.elapsed().as_millis(),
            "Health cycle finished"
        );
    }

    /// Drop state for services no longer registered
    fn prune_states(&self, records: &[ServiceRecord]) {
        let live: HashSet<&str> = records.iter().map(|record| record.name.as_str()).collect();
        self.states.retain(|name, _| {
            let keep = live.contains(name.as_str());
            if !keep {
                debug!(service = %name, "Pruned health state of unregistered service");
            }
            keep
        });
    }

    async fn probe(&self, record: &ServiceRecord) -> HealthCheckResult {
        let checker = match self.strategy_for(&record.name) {
            ProbeStrategy::Tcp => self.tcp.clone(),
            ProbeStrategy::Http => self.http.clone(),
            ProbeStrategy::Custom => match self.custom.get(&record.name) {
                Some(checker) => checker.clone(),
                None => {
                    return HealthCheckResult::error(
                        &record.name,
                        std::time::Duration::ZERO,
                        Error::probe("no custom check registered").to_string(),
                    );
                }
            },
        };

        let start = Instant::now();
        match timeout(self.config.check_timeout, checker.check(record)).await {
            Ok(result) => result,
            Err(_) => {
                debug!(service = %record.name, checker = checker.name(), "Probe exceeded check timeout");
                HealthCheckResult::timeout(&record.name, start.elapsed())
            }
        }
    }

    async fn remove_service(&self, name: &str) -> Result<()> {
        let failures = self.get_failure_count(name);
        match self.registry.deregister(name).await {
            Ok(_) => {}
            Err(e) if e.is_not_found() => {
                debug!(service = name, "Service already gone before auto-removal");
            }
            Err(e) => return Err(e),
        }

        if let Some(port) = self
            .allocator
            .as_ref()
            .and_then(|allocator| allocator.release_idle(name))
        {
            debug!(service = name, port, "Released port of removed service");
        }
        self.states.remove(name);

        warn!(service = name, failures, "Auto-removed unhealthy service");
        Ok(())
    }

    fn count_transition(&self, name: &str) {
        if let Some(mut state) = self.states.get_mut(name) {
            state.stats.transitions += 1;
        }
    }

    async fn monitor_loop(monitor: Weak<Self>, cancel: CancellationToken) {
        let period = match monitor.upgrade() {
            Some(monitor) => monitor.config.check_interval,
            None => return,
        };
        let mut ticker = interval(period);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

        loop {
            tokio::select! {
                _ = ticker.tick() => {
                    let Some(monitor) = monitor.upgrade() else {
                        break;
                    };
                    tokio::select! {
                        _ = monitor.run_cycle() => {}
                        _ = cancel.cancelled() => break,
                    }
                }
                _ = cancel.cancelled() => {
                    info!("Health check monitor stopping");
                    break;
                }
            }
        }
    }
}

fn log_result(result: &HealthCheckResult, successes: u32, failures: u32) {
    match result.status {
        HealthStatus::Healthy => {
            debug!(
                service = %result.service_name,
                duration_ms = result.latency.as_millis(),
                consecutive = successes,
                "Health check passed"
            );
        }
        HealthStatus::Unhealthy => {
            warn!(
                service = %result.service_name,
                message = result.error.as_deref().unwrap_or("unknown"),
                consecutive = failures,
                "Health check failed"
            );
        }
        HealthStatus::Timeout => {
            warn!(
                service = %result.service_name,
                consecutive = failures,
                "Health check timed out"
            );
        }
        HealthStatus::Error => {
            warn!(
                service = %result.service_name,
                error = result.error.as_deref().unwrap_or("unknown"),
                consecutive = failures,
                "Health check error"
            );
        }
    }
}
