//! Lookup counters.

use crate::strategy::DiscoveryResult;
use common::{Error, Result};
use dashmap::DashMap;
use serde::Serialize;
use std::collections::BTreeMap;
use std::sync::atomic::{AtomicU64, Ordering};

/// Snapshot of discovery activity since the client was created
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct DiscoveryStats {
    /// `discover` calls, including those made by `wait_for_service`
    pub lookups: u64,

    /// Successful lookups per strategy
    pub hits: BTreeMap<String, u64>,

    /// Lookups where every strategy missed
    pub misses: u64,

    pub timeouts: u64,

    pub cancelled: u64,
}

impl DiscoveryStats {
    pub fn total_hits(&self) -> u64 {
        self.hits.values().sum()
    }
}

#[derive(Debug, Default)]
pub(crate) struct StatsRecorder {
    lookups: AtomicU64,
    hits: DashMap<String, u64>,
    misses: AtomicU64,
    timeouts: AtomicU64,
    cancelled: AtomicU64,
}

impl StatsRecorder {
    pub(crate) fn record(&self, outcome: &Result<DiscoveryResult>) {
        self.lookups.fetch_add(1, Ordering::Relaxed);
        match outcome {
            Ok(result) => {
                *self.hits.entry(result.strategy.to_string()).or_insert(0) += 1;
            }
            Err(Error::DiscoveryTimeout { .. }) => {
                self.timeouts.fetch_add(1, Ordering::Relaxed);
            }
            Err(Error::Cancelled) => {
                self.cancelled.fetch_add(1, Ordering::Relaxed);
            }
            Err(_) => {
                self.misses.fetch_add(1, Ordering::Relaxed);
            }
        }
    }

    pub(crate) fn snapshot(&self) -> DiscoveryStats {
        DiscoveryStats {
            lookups: self.lookups.load(Ordering::Relaxed),
            hits: self
                .hits
                .iter()
                .map(|entry| (entry.key().clone(), *entry.value()))
                .collect(),
            misses: self.misses.load(Ordering::Relaxed),
            timeouts: self.timeouts.load(Ordering::Relaxed),
            cancelled: self.cancelled.load(Ordering::Relaxed),
        }
    }
}
