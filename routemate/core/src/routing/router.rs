//! Router
//!
//! Resolves a routing intent to a backend and owns the replica topology.
//!
//! The topology (replica keys, handles, weights, strategy and balancer) is an
//! immutable snapshot behind an [`ArcSwap`]. Resolutions load the current
//! snapshot without locking; administrative changes clone it, apply the
//! change and publish the new snapshot. A resolution therefore sees a
//! replica either fully registered or not at all.
//!
//! Administrative changes are serialized by a mutex that resolutions never
//! touch.

use std::collections::HashMap;
use std::sync::Arc;

use arc_swap::ArcSwap;
use parking_lot::Mutex;
use thiserror::Error;

use super::balancer::{LoadBalancer, Strategy, WeightTable};
use super::context::{self, RoutingContext, RoutingIntent};
use super::health::HealthTracker;
use super::metrics::RouterMetrics;

// ============================================================================
// Errors
// ============================================================================

/// Rejected topology changes
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum TopologyError {
    /// Blank replica key
    #[error("replica key must not be empty or blank")]
    InvalidKey,

    /// Key already registered as a replica or as the primary
    #[error("backend key '{0}' is already registered")]
    DuplicateKey(String),

    /// Attempt to remove the primary
    #[error("backend key '{0}' is the primary and cannot be removed")]
    ProtectedKey(String),

    /// No replica under this key
    #[error("no replica registered under '{0}'")]
    UnknownKey(String),
}

// ============================================================================
// Target
// ============================================================================

/// Outcome of a resolution
#[derive(Clone, Debug, PartialEq, Eq, Hash)]
pub enum Target {
    /// The primary backend
    Primary,
    /// A replica chosen by the load balancer
    Replica(String),
    /// A backend named explicitly by the caller
    Explicit(String),
}

impl Target {
    /// Whether this is the primary
    #[must_use]
    pub fn is_primary(&self) -> bool {
        matches!(self, Self::Primary)
    }

    /// Backend key, `None` for the primary
    #[must_use]
    pub fn key(&self) -> Option<&str> {
        match self {
            Self::Primary => None,
            Self::Replica(key) | Self::Explicit(key) => Some(key),
        }
    }
}

// ============================================================================
// Topology Snapshot
// ============================================================================

struct Topology<B> {
    keys: Vec<String>,
    replicas: HashMap<String, Arc<B>>,
    weights: WeightTable,
    strategy: Strategy,
    balancer: Arc<dyn LoadBalancer>,
}

impl<B> Topology<B> {
    fn empty(strategy: Strategy) -> Self {
        let weights = WeightTable::new();
        Self {
            keys: Vec::new(),
            replicas: HashMap::new(),
            balancer: strategy.build(&weights),
            weights,
            strategy,
        }
    }

    fn fork(&self) -> Self {
        Self {
            keys: self.keys.clone(),
            replicas: self.replicas.clone(),
            weights: self.weights.clone(),
            strategy: self.strategy,
            balancer: Arc::clone(&self.balancer),
        }
    }
}

// ============================================================================
// Router
// ============================================================================

/// Read/write-splitting router over one primary and any number of replicas
pub struct Router<B> {
    primary_key: String,
    primary: Arc<B>,
    topology: ArcSwap<Topology<B>>,
    health: Arc<HealthTracker>,
    admin: Mutex<()>,
    metrics: RouterMetrics,
}

impl<B> std::fmt::Debug for Router<B> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let topology = self.topology.load();
        f.debug_struct("Router")
            .field("primary_key", &self.primary_key)
            .field("replicas", &topology.keys)
            .field("strategy", &topology.strategy)
            .field("unhealthy", &self.health.unhealthy_keys())
            .finish()
    }
}

impl<B> Router<B> {
    /// Create a router with no replicas
    pub fn new(primary_key: impl Into<String>, primary: impl Into<Arc<B>>, strategy: Strategy) -> Self {
        Self {
            primary_key: primary_key.into(),
            primary: primary.into(),
            topology: ArcSwap::from_pointee(Topology::empty(strategy)),
            health: Arc::new(HealthTracker::new()),
            admin: Mutex::new(()),
            metrics: RouterMetrics::new(),
        }
    }

    /// Share an existing health tracker
    #[must_use]
    pub fn with_health_tracker(mut self, health: Arc<HealthTracker>) -> Self {
        self.health = health;
        self
    }

    // ------------------------------------------------------------------------
    // Resolution
    // ------------------------------------------------------------------------

    /// Resolve the effective intent of `ctx`
    pub fn determine_target(&self, ctx: &RoutingContext) -> Target {
        self.resolve(ctx.current())
    }

    /// Resolve the effective intent of the task-local context
    pub fn determine_current_target(&self) -> Target {
        self.resolve(context::current_intent().as_ref())
    }

    /// Resolve an intent; `None` means `WRITE`
    pub fn resolve(&self, intent: Option<&RoutingIntent>) -> Target {
        let topology = self.topology.load();
        self.resolve_in(&topology, intent)
    }

    /// Resolve `ctx` and look up the handle in the same snapshot.
    ///
    /// Returns `None` only for an explicit key that is not registered.
    pub fn route(&self, ctx: &RoutingContext) -> Option<(Target, Arc<B>)> {
        let topology = self.topology.load();
        let target = self.resolve_in(&topology, ctx.current());
        let handle = match &target {
            Target::Primary => Arc::clone(&self.primary),
            Target::Replica(key) | Target::Explicit(key) => {
                Arc::clone(topology.replicas.get(key)?)
            }
        };
        Some((target, handle))
    }

    fn resolve_in(&self, topology: &Topology<B>, intent: Option<&RoutingIntent>) -> Target {
        match intent {
            None | Some(RoutingIntent::Write) => {
                self.metrics.primary_resolutions.inc();
                Target::Primary
            }
            Some(RoutingIntent::Read) => self.resolve_read(topology),
            Some(RoutingIntent::Backend(key)) if *key == self.primary_key => {
                self.metrics.primary_resolutions.inc();
                Target::Primary
            }
            Some(RoutingIntent::Backend(key)) => {
                self.metrics.explicit_resolutions.inc();
                Target::Explicit(key.clone())
            }
        }
    }

    fn resolve_read(&self, topology: &Topology<B>) -> Target {
        let healthy = self.health.healthy_subset(&topology.keys);
        if let Some(key) = topology.balancer.select(&healthy) {
            self.metrics.record_selection(&key);
            return Target::Replica(key);
        }

        if topology.keys.is_empty() {
            tracing::debug!("No read replicas registered, routing read to primary");
        } else {
            tracing::warn!(
                registered = topology.keys.len(),
                primary = %self.primary_key,
                "No healthy read replicas available, falling back to primary"
            );
        }
        self.metrics.fallbacks.inc();
        self.metrics.primary_resolutions.inc();
        Target::Primary
    }

    // ------------------------------------------------------------------------
    // Topology Changes
    // ------------------------------------------------------------------------

    /// Register a replica. It is eligible for reads as soon as this returns.
    pub fn add_replica(
        &self,
        key: impl Into<String>,
        handle: impl Into<Arc<B>>,
        weight: i64,
    ) -> Result<(), TopologyError> {
        let key = key.into();
        if key.trim().is_empty() {
            return Err(TopologyError::InvalidKey);
        }

        let _admin = self.admin.lock();
        let current = self.topology.load();
        if key == self.primary_key || current.replicas.contains_key(&key) {
            return Err(TopologyError::DuplicateKey(key));
        }

        let mut next = current.fork();
        next.keys.push(key.clone());
        next.replicas.insert(key.clone(), handle.into());
        next.weights.insert(key.as_str(), weight);
        let effective_weight = next.weights.get(&key).unwrap_or(1);

        // A stale mark from an earlier registration must not carry over
        self.health.forget(&key);
        self.publish(next);

        tracing::info!(
            replica = %key,
            weight = effective_weight,
            "Registered read replica"
        );
        Ok(())
    }

    /// Unregister a replica and hand its handle back for teardown.
    ///
    /// The router never closes handles itself.
    pub fn remove_replica(&self, key: &str) -> Result<Arc<B>, TopologyError> {
        if key == self.primary_key {
            return Err(TopologyError::ProtectedKey(key.to_string()));
        }

        let _admin = self.admin.lock();
        let current = self.topology.load();
        if !current.replicas.contains_key(key) {
            return Err(TopologyError::UnknownKey(key.to_string()));
        }

        let mut next = current.fork();
        next.keys.retain(|k| k != key);
        next.weights.remove(key);
        let handle = next
            .replicas
            .remove(key)
            .ok_or_else(|| TopologyError::UnknownKey(key.to_string()))?;

        self.publish(next);
        self.health.forget(key);
        self.metrics.forget(key);

        tracing::info!(replica = %key, "Unregistered read replica");
        Ok(handle)
    }

    /// Merge new weights for registered replicas. Unknown keys are ignored.
    ///
    /// Returns the number of weights applied.
    pub fn update_weights<K, I>(&self, weights: I) -> usize
    where
        K: AsRef<str>,
        I: IntoIterator<Item = (K, i64)>,
    {
        let _admin = self.admin.lock();
        let mut next = self.topology.load().fork();

        let mut applied = 0;
        for (key, weight) in weights {
            let key = key.as_ref();
            if next.replicas.contains_key(key) {
                next.weights.insert(key, weight);
                applied += 1;
            } else {
                tracing::debug!(replica = %key, "Ignoring weight for unregistered replica");
            }
        }

        if applied > 0 {
            self.publish(next);
            tracing::info!(updated = applied, "Replica weights updated");
        }
        applied
    }

    /// Switch the load-balancing strategy. Returns `false` if it was
    /// already active.
    pub fn set_strategy(&self, strategy: Strategy) -> bool {
        let _admin = self.admin.lock();
        let current = self.topology.load();
        if current.strategy == strategy {
            return false;
        }

        let mut next = current.fork();
        next.strategy = strategy;
        next.balancer = strategy.build(&next.weights);
        self.publish(next);

        tracing::info!(strategy = %strategy, "Load balance strategy changed");
        true
    }

    fn publish(&self, next: Topology<B>) {
        next.balancer.update_weights(&next.weights);
        self.metrics.replicas.set(next.keys.len() as u64);
        self.metrics.topology_changes.inc();
        self.topology.store(Arc::new(next));
    }

    // ------------------------------------------------------------------------
    // Health
    // ------------------------------------------------------------------------

    /// Exclude `key` from reads. Returns `true` on a state change.
    pub fn mark_unhealthy(&self, key: &str) -> bool {
        self.health.mark_unhealthy(key)
    }

    /// Restore `key` to reads. Returns `true` on a state change.
    pub fn mark_healthy(&self, key: &str) -> bool {
        self.health.mark_healthy(key)
    }

    /// Record a probe outcome for `key`, provided `probed` is still the
    /// handle registered under it.
    ///
    /// The check and the mark happen under the topology lock, so a result
    /// for a removed or replaced replica is dropped instead of marking the
    /// key. Returns `None` when the result was dropped, otherwise whether the
    /// status changed.
    pub fn record_probe(&self, key: &str, probed: &Arc<B>, healthy: bool) -> Option<bool> {
        let _admin = self.admin.lock();
        let topology = self.topology.load();
        let registered = topology.replicas.get(key)?;
        if !Arc::ptr_eq(registered, probed) {
            return None;
        }
        Some(self.health.record(key, healthy))
    }

    /// Registered replicas that are currently healthy
    #[must_use]
    pub fn healthy_replicas(&self) -> Vec<String> {
        self.health.healthy_subset(&self.topology.load().keys)
    }

    /// The health tracker
    #[must_use]
    pub fn health(&self) -> &Arc<HealthTracker> {
        &self.health
    }

    // ------------------------------------------------------------------------
    // Accessors
    // ------------------------------------------------------------------------

    /// Key of the primary
    #[must_use]
    pub fn primary_key(&self) -> &str {
        &self.primary_key
    }

    /// Primary handle
    #[must_use]
    pub fn primary(&self) -> &Arc<B> {
        &self.primary
    }

    /// Handle for any registered key, including the primary
    #[must_use]
    pub fn handle(&self, key: &str) -> Option<Arc<B>> {
        if key == self.primary_key {
            return Some(Arc::clone(&self.primary));
        }
        self.topology.load().replicas.get(key).cloned()
    }

    /// Whether `key` is a registered replica
    #[must_use]
    pub fn contains_replica(&self, key: &str) -> bool {
        self.topology.load().replicas.contains_key(key)
    }

    /// Replica keys in registration order
    #[must_use]
    pub fn replica_keys(&self) -> Vec<String> {
        self.topology.load().keys.clone()
    }

    /// Replica keys and handles in registration order
    #[must_use]
    pub fn replicas(&self) -> Vec<(String, Arc<B>)> {
        let topology = self.topology.load();
        topology
            .keys
            .iter()
            .filter_map(|key| {
                topology
                    .replicas
                    .get(key)
                    .map(|handle| (key.clone(), Arc::clone(handle)))
            })
            .collect()
    }

    /// Current weights
    #[must_use]
    pub fn weights(&self) -> WeightTable {
        self.topology.load().weights.clone()
    }

    /// Active strategy
    #[must_use]
    pub fn strategy(&self) -> Strategy {
        self.topology.load().strategy
    }

    /// Router metrics
    #[must_use]
    pub fn metrics(&self) -> &RouterMetrics {
        &self.metrics
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    #[derive(Debug, PartialEq)]
    struct Handle(&'static str);

    fn router() -> Router<Handle> {
        Router::new("primary", Handle("primary"), Strategy::RoundRobin)
    }

    fn router_with(keys: &[&'static str]) -> Router<Handle> {
        let router = router();
        for &key in keys {
            router.add_replica(key, Handle(key), 1).unwrap();
        }
        router
    }

    fn reads(router: &Router<Handle>, n: usize) -> Vec<Target> {
        (0..n)
            .map(|_| router.resolve(Some(&RoutingIntent::Read)))
            .collect()
    }

    fn replica(key: &str) -> Target {
        Target::Replica(key.to_string())
    }

    #[test]
    fn test_read_without_replicas_goes_to_primary() {
        let router = router();
        assert_eq!(router.resolve(Some(&RoutingIntent::Read)), Target::Primary);
        assert_eq!(router.metrics().fallbacks.get(), 1);
    }

    #[test]
    fn test_reads_alternate_between_replicas() {
        let router = router_with(&["read1", "read2"]);
        assert_eq!(
            reads(&router, 4),
            vec![replica("read1"), replica("read2"), replica("read1"), replica("read2")]
        );
    }

    #[test]
    fn test_write_and_absent_always_primary() {
        let router = router_with(&["read1"]);
        router.mark_unhealthy("read1");

        let mut ctx = RoutingContext::new();
        assert_eq!(router.determine_target(&ctx), Target::Primary);

        let scope = ctx.enter(RoutingIntent::Write).unwrap();
        assert_eq!(router.determine_target(&scope), Target::Primary);
    }

    #[test]
    fn test_unhealthy_replica_excluded_then_restored() {
        let router = router_with(&["read1", "read2"]);

        assert!(router.mark_unhealthy("read1"));
        assert!(reads(&router, 5).iter().all(|t| *t == replica("read2")));

        assert!(router.mark_healthy("read1"));
        assert!(reads(&router, 4).contains(&replica("read1")));
    }

    #[test]
    fn test_all_unhealthy_falls_back_to_primary() {
        let router = router_with(&["read1", "read2"]);
        router.mark_unhealthy("read1");
        router.mark_unhealthy("read2");
        assert!(!router.mark_unhealthy("read2"));

        assert_eq!(reads(&router, 3), vec![Target::Primary; 3]);
        assert_eq!(router.metrics().fallbacks.get(), 3);
    }

    #[test]
    fn test_explicit_key_bypasses_health_and_balancing() {
        let router = router_with(&["read1", "read2"]);
        router.mark_unhealthy("read2");

        let mut ctx = RoutingContext::new();
        ctx.push_str("read2").unwrap();
        assert_eq!(router.determine_target(&ctx), Target::Explicit("read2".into()));

        ctx.push_str("unregistered").unwrap();
        assert_eq!(
            router.determine_target(&ctx),
            Target::Explicit("unregistered".into())
        );
        assert!(router.route(&ctx).is_none());

        ctx.push_str("primary").unwrap();
        assert_eq!(router.determine_target(&ctx), Target::Primary);
    }

    #[test]
    fn test_route_returns_matching_handle() {
        let router = router_with(&["read1"]);
        let mut ctx = RoutingContext::new();
        let scope = ctx.enter(RoutingIntent::Read).unwrap();

        let (target, handle) = router.route(&scope).unwrap();
        assert_eq!(target, replica("read1"));
        assert_eq!(*handle, Handle("read1"));
    }

    #[test]
    fn test_remove_primary_is_protected() {
        let router = router();
        assert_eq!(
            router.remove_replica("primary").unwrap_err(),
            TopologyError::ProtectedKey("primary".into())
        );
    }

    #[test]
    fn test_duplicate_and_invalid_keys_rejected() {
        let router = router_with(&["read1"]);
        assert_eq!(
            router.add_replica("read1", Handle("again"), 1).unwrap_err(),
            TopologyError::DuplicateKey("read1".into())
        );
        assert_eq!(
            router.add_replica("primary", Handle("primary"), 1).unwrap_err(),
            TopologyError::DuplicateKey("primary".into())
        );
        assert_eq!(
            router.add_replica("  ", Handle("blank"), 1).unwrap_err(),
            TopologyError::InvalidKey
        );
        assert_eq!(
            router.remove_replica("nope").unwrap_err(),
            TopologyError::UnknownKey("nope".into())
        );
        assert_eq!(router.replica_keys(), vec!["read1".to_string()]);
    }

    #[test]
    fn test_remove_returns_handle_and_clears_state() {
        let router = router_with(&["read1", "read2"]);
        router.mark_unhealthy("read1");

        let handle = router.remove_replica("read1").unwrap();
        assert_eq!(*handle, Handle("read1"));
        assert_eq!(router.replica_keys(), vec!["read2".to_string()]);
        assert!(!router.weights().contains("read1"));
        assert!(router.health().unhealthy_keys().is_empty());

        router.add_replica("read1", Handle("read1"), 1).unwrap();
        assert_eq!(
            router.healthy_replicas(),
            vec!["read2".to_string(), "read1".to_string()]
        );
    }

    #[test]
    fn test_weighted_strategy_swap() {
        let router = router();
        router.add_replica("read1", Handle("read1"), 3).unwrap();
        router.add_replica("read2", Handle("read2"), 1).unwrap();

        assert!(router.set_strategy(Strategy::WeightedRoundRobin));
        assert!(!router.set_strategy(Strategy::WeightedRoundRobin));
        assert_eq!(
            reads(&router, 4),
            vec![replica("read1"), replica("read1"), replica("read1"), replica("read2")]
        );
    }

    #[test]
    fn test_update_weights_ignores_unknown_keys() {
        let router = router_with(&["read1", "read2"]);
        router.set_strategy(Strategy::WeightedRoundRobin);

        assert_eq!(router.update_weights([("read2", 2), ("ghost", 5)]), 1);
        let weights: Vec<_> = router
            .weights()
            .iter()
            .map(|(k, w)| (k.to_string(), w))
            .collect();
        assert_eq!(weights, vec![("read1".to_string(), 1), ("read2".to_string(), 2)]);
        assert_eq!(
            reads(&router, 3),
            vec![replica("read1"), replica("read2"), replica("read2")]
        );
    }

    #[test]
    fn test_add_keeps_existing_weights() {
        let router = router();
        router.add_replica("read1", Handle("read1"), 4).unwrap();
        router.add_replica("read2", Handle("read2"), 0).unwrap();

        let weights = router.weights();
        assert_eq!(weights.get("read1"), Some(4));
        assert_eq!(weights.get("read2"), Some(1));
    }

    #[tokio::test]
    async fn test_task_local_resolution() {
        let router = router_with(&["read1"]);
        let target = context::scope(async {
            let _read = context::enter_current(RoutingIntent::Read).unwrap();
            router.determine_current_target()
        })
        .await;

        assert_eq!(target, replica("read1"));
        assert_eq!(router.determine_current_target(), Target::Primary);
    }

    #[test]
    fn test_record_probe_ignores_removed_and_replaced_handles() {
        let router = router_with(&["read1"]);
        let old = router.handle("read1").unwrap();

        router.remove_replica("read1").unwrap();
        assert_eq!(router.record_probe("read1", &old, false), None);
        assert!(router.health().unhealthy_keys().is_empty());

        router.add_replica("read1", Handle("read1"), 1).unwrap();
        assert_eq!(router.record_probe("read1", &old, false), None);
        assert!(router.health().is_healthy("read1"));

        let fresh = router.handle("read1").unwrap();
        assert_eq!(router.record_probe("read1", &fresh, false), Some(true));
        assert!(!router.health().is_healthy("read1"));
    }
}
