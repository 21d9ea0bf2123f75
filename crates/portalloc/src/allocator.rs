//! First-fit port allocation over named ranges.

use crate::types::{DEFAULT_RANGE, PortAllocation, PortAllocatorConfig, PortRange};
use common::{Error, Result};
use std::collections::{BTreeMap, HashMap, HashSet};
use std::sync::{PoisonError, RwLock, RwLockReadGuard, RwLockWriteGuard};
use std::time::SystemTime;
use tracing::{debug, info, warn};

/// Keywords mapping a service name onto a range name, checked in order.
const RANGE_KEYWORDS: &[(&str, &[&str])] = &[
    ("database", &["postgres", "postgresql", "pg", "database", "db", "mysql"]),
    ("cache", &["redis", "cache", "memcache", "memcached"]),
    ("rpc", &["grpc", "rpc"]),
    ("metrics", &["metrics", "prometheus", "prom"]),
    ("websocket", &["websocket", "ws"]),
    ("api", &["api", "http", "web", "rest"]),
];

/// Outstanding leases for one service.
///
/// The group decides the fate of the service's port once its last lease
/// ends: a commit keeps it; otherwise it is released if the group allocated
/// it or a release was requested while leases were outstanding.
#[derive(Debug, Default)]
struct LeaseGroup {
    outstanding: usize,
    fresh: bool,
    committed: bool,
    release_requested: bool,
}

struct AllocatorState {
    config: PortAllocatorConfig,
    reserved: HashSet<u16>,
    allocations: BTreeMap<u16, PortAllocation>,
    by_service: HashMap<String, u16>,
    leases: HashMap<String, LeaseGroup>,
}

impl AllocatorState {
    fn new(config: PortAllocatorConfig) -> Self {
        Self {
            reserved: config.reserved_ports.iter().copied().collect(),
            config,
            allocations: BTreeMap::new(),
            by_service: HashMap::new(),
            leases: HashMap::new(),
        }
    }

    fn resolve_range(&self, range_hint: Option<&str>) -> (String, PortRange) {
        match range_hint {
            Some(hint) => match self.config.ranges.get(hint) {
                Some(range) => (hint.to_string(), *range),
                None => {
                    warn!(hint, "Unknown port range hint, using default range");
                    (DEFAULT_RANGE.to_string(), self.config.default_range)
                }
            },
            None => (DEFAULT_RANGE.to_string(), self.config.default_range),
        }
    }

    /// The service's current port, or a fresh one from `range`.
    /// The flag is true when the port was allocated by this call.
    fn allocate(
        &mut self,
        service_name: &str,
        range_name: &str,
        range: PortRange,
    ) -> Result<(u16, bool)> {
        if let Some(&port) = self.by_service.get(service_name) {
            debug!(service = service_name, port, "Service already holds a port");
            return Ok((port, false));
        }

        let port = (range.start..=range.end)
            .find(|port| !self.reserved.contains(port) && !self.allocations.contains_key(port))
            .ok_or_else(|| Error::PortRangeExhausted {
                range: range_name.to_string(),
            })?;

        self.allocations.insert(
            port,
            PortAllocation {
                port,
                service_name: service_name.to_string(),
                range_name: range_name.to_string(),
                allocated_at: SystemTime::now(),
            },
        );
        self.by_service.insert(service_name.to_string(), port);

        info!(service = service_name, port, range = range_name, "Allocated port");
        Ok((port, true))
    }

    fn release_service(&mut self, service_name: &str) -> Option<u16> {
        let port = self.by_service.remove(service_name)?;
        self.allocations.remove(&port);
        Some(port)
    }
}

/// Hands out non-conflicting ports from typed ranges
pub struct PortAllocator {
    state: RwLock<AllocatorState>,
}

impl PortAllocator {
    /// Create a new allocator
    pub fn new(config: PortAllocatorConfig) -> Self {
        Self {
            state: RwLock::new(AllocatorState::new(config)),
        }
    }

    /// Snapshot of the active configuration
    pub fn config(&self) -> PortAllocatorConfig {
        self.read().config.clone()
    }

    /// Names of the configured ranges, without the default range
    pub fn range_names(&self) -> Vec<String> {
        self.read().config.ranges.keys().cloned().collect()
    }

    /// Swap in a new range layout and reserved set.
    ///
    /// Existing allocations are kept even when they fall outside the new
    /// ranges or onto a newly reserved port.
    pub fn reconfigure(&self, config: PortAllocatorConfig) -> Result<()> {
        config.validate()?;
        let mut state = self.write();
        state.reserved = config.reserved_ports.iter().copied().collect();
        state.config = config;
        info!(
            ranges = state.config.ranges.len(),
            reserved = state.reserved.len(),
            "Port allocator reconfigured"
        );
        Ok(())
    }

    /// Allocate a port for `service_name` from the hinted range.
    ///
    /// A service that already holds a port gets that port back. Without a
    /// hint, or when the hint names no configured range, the default range
    /// is used.
    pub fn allocate(&self, service_name: &str, range_hint: Option<&str>) -> Result<u16> {
        let mut state = self.write();
        let (range_name, range) = state.resolve_range(range_hint);
        state
            .allocate(service_name, &range_name, range)
            .map(|(port, _)| port)
    }

    /// Allocate a port within an explicit range
    pub fn allocate_in_range(&self, service_name: &str, start: u16, end: u16) -> Result<u16> {
        let range = PortRange::new(start, end);
        range.validate()?;

        self.write()
            .allocate(service_name, &range.to_string(), range)
            .map(|(port, _)| port)
    }

    /// Allocate and wrap the port in a guard that releases it on drop.
    ///
    /// Concurrent leases for one service share the port. It is released when
    /// the last of them ends uncommitted, and only if one of them allocated
    /// it or [`release_idle`](Self::release_idle) was called meanwhile.
    pub fn lease(&self, service_name: &str, range_hint: Option<&str>) -> Result<PortLease<'_>> {
        let mut state = self.write();
        let (range_name, range) = state.resolve_range(range_hint);
        let (port, fresh) = state.allocate(service_name, &range_name, range)?;

        let group = state.leases.entry(service_name.to_string()).or_default();
        group.outstanding += 1;
        group.fresh |= fresh;

        Ok(PortLease {
            allocator: self,
            service: service_name.to_string(),
            port,
            fresh,
            done: false,
        })
    }

    /// Release a port. Unknown or already free ports are ignored.
    pub fn release(&self, port: u16) {
        let mut state = self.write();
        if let Some(allocation) = state.allocations.remove(&port) {
            state.by_service.remove(&allocation.service_name);
            info!(port, service = %allocation.service_name, "Released port");
        }
    }

    /// Release whatever port `service_name` holds, returning it
    pub fn release_service(&self, service_name: &str) -> Option<u16> {
        let port = self.write().release_service(service_name)?;
        info!(port, service = service_name, "Released service port");
        Some(port)
    }

    /// Release the service's port unless a lease for it is outstanding.
    ///
    /// With a lease outstanding the release is deferred: the port goes when
    /// the last lease ends uncommitted and stays if any of them commits.
    pub fn release_idle(&self, service_name: &str) -> Option<u16> {
        let mut state = self.write();
        if let Some(group) = state.leases.get_mut(service_name) {
            group.release_requested = true;
            debug!(service = service_name, "Port release deferred until lease ends");
            return None;
        }

        let port = state.release_service(service_name)?;
        info!(port, service = service_name, "Released port of removed service");
        Some(port)
    }

    /// Check allocation state only; OS-level bindability is not probed.
    pub fn is_port_available(&self, port: u16) -> bool {
        let state = self.read();
        port != 0 && !state.reserved.contains(&port) && !state.allocations.contains_key(&port)
    }

    pub fn port_for_service(&self, service_name: &str) -> Option<u16> {
        self.read().by_service.get(service_name).copied()
    }

    pub fn allocation(&self, port: u16) -> Option<PortAllocation> {
        self.read().allocations.get(&port).cloned()
    }

    /// Snapshot of all allocations, sorted by port
    pub fn list_allocations(&self) -> Vec<PortAllocation> {
        self.read().allocations.values().cloned().collect()
    }

    /// Count allocations per range name
    pub fn allocations_by_range(&self) -> BTreeMap<String, usize> {
        let mut counts = BTreeMap::new();
        for allocation in self.read().allocations.values() {
            *counts.entry(allocation.range_name.clone()).or_insert(0) += 1;
        }
        counts
    }

    /// Classify a service name into a configured range name.
    ///
    /// Returns `None` when the name carries no known keyword, which means
    /// the default range.
    pub fn range_for_service(&self, service_name: &str) -> Option<String> {
        let state = self.read();
        classify(service_name)
            .filter(|name| state.config.ranges.contains_key(*name))
            .map(str::to_string)
    }

    fn finish_lease(&self, service_name: &str, committed: bool) {
        let mut state = self.write();
        let Some(group) = state.leases.get_mut(service_name) else {
            return;
        };
        group.outstanding = group.outstanding.saturating_sub(1);
        group.committed |= committed;
        if group.outstanding > 0 {
            return;
        }

        let Some(group) = state.leases.remove(service_name) else {
            return;
        };
        if !group.committed && (group.fresh || group.release_requested) {
            if let Some(port) = state.release_service(service_name) {
                debug!(service = service_name, port, "Rolled back uncommitted port lease");
            }
        }
    }

    fn read(&self) -> RwLockReadGuard<'_, AllocatorState> {
        self.state.read().unwrap_or_else(PoisonError::into_inner)
    }

    fn write(&self) -> RwLockWriteGuard<'_, AllocatorState> {
        self.state.write().unwrap_or_else(PoisonError::into_inner)
    }
}

impl Default for PortAllocator {
    fn default() -> Self {
        Self::new(PortAllocatorConfig::default())
    }
}

/// Port held on behalf of an operation that may still fail.
///
/// Dropping an uncommitted lease hands the decision back to the allocator,
/// which releases the port if nothing else claims it.
#[must_use = "dropping a lease releases the port"]
pub struct PortLease<'a> {
    allocator: &'a PortAllocator,
    service: String,
    port: u16,
    fresh: bool,
    done: bool,
}

impl PortLease<'_> {
    pub fn port(&self) -> u16 {
        self.port
    }

    /// True when this lease allocated the port rather than finding it held
    pub fn is_fresh(&self) -> bool {
        self.fresh
    }

    /// Keep the allocation
    pub fn commit(mut self) -> u16 {
        self.done = true;
        self.allocator.finish_lease(&self.service, true);
        self.port
    }
}

impl Drop for PortLease<'_> {
    fn drop(&mut self) {
        if !self.done {
            self.allocator.finish_lease(&self.service, false);
        }
    }
}

/// Map a service name onto a range name by keyword.
///
/// Short keywords must match a whole `-`/`_`/`.` separated token; keywords of
/// four or more characters may appear anywhere in the name.
pub fn classify(service_name: &str) -> Option<&'static str> {
    let lower = service_name.to_ascii_lowercase();
    let tokens: Vec<&str> = lower.split(['-', '_', '.', ':']).collect();

    RANGE_KEYWORDS
        .iter()
        .find(|(_, keywords)| {
            keywords.iter().any(|keyword| {
                tokens.contains(keyword) || (keyword.len() >= 4 && lower.contains(keyword))
            })
        })
        .map(|(range, _)| *range)
}
