//! Router Metrics
//!
//! Lock-free counters for the routing path:
//! - Resolutions by outcome (primary, replica, explicit)
//! - Read fallbacks to the primary
//! - Per-replica selection counts
//! - Topology changes and registered replica count
//! - Probe latency

use std::collections::BTreeMap;
use std::sync::atomic::{AtomicU64, Ordering};

use dashmap::DashMap;

// ============================================================================
// Counter
// ============================================================================

/// A simple atomic counter
#[derive(Debug, Default)]
pub struct Counter {
    value: AtomicU64,
}

impl Counter {
    /// Create a counter at zero
    pub fn new() -> Self {
        Self::default()
    }

    /// Add one
    pub fn inc(&self) {
        self.value.fetch_add(1, Ordering::Relaxed);
    }

    /// Current value
    pub fn get(&self) -> u64 {
        self.value.load(Ordering::Relaxed)
    }
}

// ============================================================================
// Gauge
// ============================================================================

/// A gauge (can go up or down)
#[derive(Debug, Default)]
pub struct Gauge {
    value: AtomicU64,
}

impl Gauge {
    /// Create a gauge at zero
    pub fn new() -> Self {
        Self::default()
    }

    /// Overwrite the value
    pub fn set(&self, value: u64) {
        self.value.store(value, Ordering::Relaxed);
    }

    /// Current value
    pub fn get(&self) -> u64 {
        self.value.load(Ordering::Relaxed)
    }
}

// ============================================================================
// Histogram for Probe Latency
// ============================================================================

/// Bucketed latency distribution in milliseconds
#[derive(Debug)]
pub struct Histogram {
    buckets: Vec<u64>,
    counts: Vec<AtomicU64>,
    total: AtomicU64,
    sum: AtomicU64,
    max: AtomicU64,
}

impl Histogram {
    /// Create a histogram with the given upper bucket bounds
    pub fn new(buckets: Vec<u64>) -> Self {
        let counts = buckets.iter().map(|_| AtomicU64::new(0)).collect();
        Self {
            buckets,
            counts,
            total: AtomicU64::new(0),
            sum: AtomicU64::new(0),
            max: AtomicU64::new(0),
        }
    }

    /// Buckets suited to probe round-trips
    pub fn probe_default() -> Self {
        Self::new(vec![1, 5, 10, 25, 50, 100, 250, 500, 1000, 2500, 5000])
    }

    /// Record one sample; values past the last bound land in the last bucket
    pub fn record(&self, value_ms: u64) {
        let idx = self
            .buckets
            .iter()
            .position(|&bound| value_ms <= bound)
            .unwrap_or(self.buckets.len().saturating_sub(1));
        if let Some(count) = self.counts.get(idx) {
            count.fetch_add(1, Ordering::Relaxed);
        }
        self.total.fetch_add(1, Ordering::Relaxed);
        self.sum.fetch_add(value_ms, Ordering::Relaxed);
        self.max.fetch_max(value_ms, Ordering::Relaxed);
    }

    /// Number of samples
    pub fn count(&self) -> u64 {
        self.total.load(Ordering::Relaxed)
    }

    /// Mean of all samples
    pub fn mean(&self) -> f64 {
        let total = self.count();
        if total == 0 {
            return 0.0;
        }
        self.sum.load(Ordering::Relaxed) as f64 / total as f64
    }

    /// Largest sample
    pub fn max(&self) -> u64 {
        self.max.load(Ordering::Relaxed)
    }
}

// ============================================================================
// Router Metrics
// ============================================================================

/// Counters maintained by a [`Router`](super::router::Router)
#[derive(Debug)]
pub struct RouterMetrics {
    /// Resolutions that went to the primary
    pub primary_resolutions: Counter,
    /// Reads served by a replica
    pub replica_resolutions: Counter,
    /// Resolutions to an explicit key
    pub explicit_resolutions: Counter,
    /// Reads that fell back to the primary for lack of a healthy replica
    pub fallbacks: Counter,
    /// Successful add/remove/reweight/strategy changes
    pub topology_changes: Counter,
    /// Registered replicas
    pub replicas: Gauge,
    /// Probe round-trip latency
    pub probe_latency: Histogram,
    selections: DashMap<String, AtomicU64>,
}

impl Default for RouterMetrics {
    fn default() -> Self {
        Self {
            primary_resolutions: Counter::new(),
            replica_resolutions: Counter::new(),
            explicit_resolutions: Counter::new(),
            fallbacks: Counter::new(),
            topology_changes: Counter::new(),
            replicas: Gauge::new(),
            probe_latency: Histogram::probe_default(),
            selections: DashMap::new(),
        }
    }
}

impl RouterMetrics {
    /// Create empty metrics
    pub fn new() -> Self {
        Self::default()
    }

    /// Count a read served by `key`
    pub fn record_selection(&self, key: &str) {
        self.replica_resolutions.inc();
        if let Some(count) = self.selections.get(key) {
            count.fetch_add(1, Ordering::Relaxed);
            return;
        }
        self.selections
            .entry(key.to_string())
            .or_default()
            .fetch_add(1, Ordering::Relaxed);
    }

    /// Reads served by `key`
    pub fn selections_for(&self, key: &str) -> u64 {
        self.selections
            .get(key)
            .map(|c| c.load(Ordering::Relaxed))
            .unwrap_or(0)
    }

    /// Drop per-replica counts for a removed key
    pub fn forget(&self, key: &str) {
        self.selections.remove(key);
    }

    /// Point-in-time copy of all counters
    pub fn snapshot(&self) -> MetricsSnapshot {
        MetricsSnapshot {
            primary_resolutions: self.primary_resolutions.get(),
            replica_resolutions: self.replica_resolutions.get(),
            explicit_resolutions: self.explicit_resolutions.get(),
            fallbacks: self.fallbacks.get(),
            topology_changes: self.topology_changes.get(),
            replicas: self.replicas.get(),
            probes: self.probe_latency.count(),
            probe_latency_mean_ms: self.probe_latency.mean(),
            probe_latency_max_ms: self.probe_latency.max(),
            selections: self
                .selections
                .iter()
                .map(|e| (e.key().clone(), e.value().load(Ordering::Relaxed)))
                .collect(),
        }
    }
}

/// Snapshot of [`RouterMetrics`]
#[derive(Clone, Debug, Default, PartialEq)]
pub struct MetricsSnapshot {
    /// Resolutions that went to the primary
    pub primary_resolutions: u64,
    /// Reads served by a replica
    pub replica_resolutions: u64,
    /// Resolutions to an explicit key
    pub explicit_resolutions: u64,
    /// Reads that fell back to the primary
    pub fallbacks: u64,
    /// Topology changes
    pub topology_changes: u64,
    /// Registered replicas
    pub replicas: u64,
    /// Probes recorded
    pub probes: u64,
    /// Mean probe latency
    pub probe_latency_mean_ms: f64,
    /// Slowest probe
    pub probe_latency_max_ms: u64,
    /// Reads served per replica
    pub selections: BTreeMap<String, u64>,
}
