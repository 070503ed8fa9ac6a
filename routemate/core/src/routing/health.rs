//! Replica Health Tracking
//!
//! Owns the set of replica keys currently failing probes. Every replica
//! starts healthy:
//!
//! ```text
//! +---------+    probe failure    +-----------+
//! | Healthy | ------------------> | Unhealthy |
//! +---------+ <------------------ +-----------+
//!                probe success
//! ```
//!
//! Transitions are idempotent and logged only when the state actually
//! changes, so a replica that stays down does not flood the log.

use std::collections::HashSet;
use std::sync::atomic::{AtomicU64, Ordering};

use parking_lot::RwLock;

// ============================================================================
// Health Status
// ============================================================================

/// Health status of a replica
#[derive(Clone, Copy, Debug, PartialEq, Eq, Default)]
pub enum HealthStatus {
    /// Eligible for reads
    #[default]
    Healthy,

    /// Failing probes, excluded from reads
    Unhealthy,
}

impl HealthStatus {
    /// Whether reads may be routed to the replica
    #[must_use]
    pub fn is_healthy(&self) -> bool {
        matches!(self, Self::Healthy)
    }
}

impl std::fmt::Display for HealthStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Healthy => write!(f, "healthy"),
            Self::Unhealthy => write!(f, "unhealthy"),
        }
    }
}

// ============================================================================
// Health Tracker
// ============================================================================

/// Tracks which replicas are currently unhealthy
#[derive(Debug, Default)]
pub struct HealthTracker {
    unhealthy: RwLock<HashSet<String>>,
    transitions: AtomicU64,
}

impl HealthTracker {
    /// Create a tracker with every replica healthy
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Mark `key` unhealthy. Returns `true` if this changed its state.
    pub fn mark_unhealthy(&self, key: &str) -> bool {
        let changed = self.unhealthy.write().insert(key.to_string());
        if changed {
            self.transitions.fetch_add(1, Ordering::Relaxed);
            tracing::warn!(replica = %key, "Replica marked unhealthy, excluded from reads");
        }
        changed
    }

    /// Mark `key` healthy. Returns `true` if this changed its state.
    pub fn mark_healthy(&self, key: &str) -> bool {
        let changed = self.unhealthy.write().remove(key);
        if changed {
            self.transitions.fetch_add(1, Ordering::Relaxed);
            tracing::info!(replica = %key, "Replica recovered, eligible for reads");
        }
        changed
    }

    /// Record a probe outcome
    pub fn record(&self, key: &str, healthy: bool) -> bool {
        if healthy {
            self.mark_healthy(key)
        } else {
            self.mark_unhealthy(key)
        }
    }

    /// Drop any state held for `key` without logging a transition
    pub fn forget(&self, key: &str) {
        self.unhealthy.write().remove(key);
    }

    /// Whether `key` is healthy
    #[must_use]
    pub fn is_healthy(&self, key: &str) -> bool {
        !self.unhealthy.read().contains(key)
    }

    /// Status of `key`
    #[must_use]
    pub fn status(&self, key: &str) -> HealthStatus {
        if self.is_healthy(key) {
            HealthStatus::Healthy
        } else {
            HealthStatus::Unhealthy
        }
    }

    /// `keys` minus the unhealthy set, order preserved
    #[must_use]
    pub fn healthy_subset(&self, keys: &[String]) -> Vec<String> {
        let unhealthy = self.unhealthy.read();
        if unhealthy.is_empty() {
            return keys.to_vec();
        }
        keys.iter()
            .filter(|key| !unhealthy.contains(key.as_str()))
            .cloned()
            .collect()
    }

    /// Sorted snapshot of the unhealthy keys
    #[must_use]
    pub fn unhealthy_keys(&self) -> Vec<String> {
        let mut keys: Vec<String> = self.unhealthy.read().iter().cloned().collect();
        keys.sort();
        keys
    }

    /// Number of state changes observed
    #[must_use]
    pub fn transitions(&self) -> u64 {
        self.transitions.load(Ordering::Relaxed)
    }
}
