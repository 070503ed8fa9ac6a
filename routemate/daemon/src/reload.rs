//! Configuration reload
//!
//! Brings a running router in line with a freshly loaded configuration.
//! Every change goes through the topology manager, so new replicas are
//! validated before they take traffic and removed replicas are drained.
//! Changed health check settings are reported so the caller can restart the
//! prober; topology manager settings and the primary need a restart.

use std::collections::BTreeMap;

use routemate_core::{BackendFactory, HealthCheckConfig, RoutemateConfig, TopologyManager};

/// What a reload changed
#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct ReloadSummary {
    /// Replicas admitted
    pub added: Vec<String>,
    /// Replicas drained and closed
    pub removed: Vec<String>,
    /// Replicas that failed admission or removal
    pub failed: Vec<String>,
    /// Weights applied to replicas that stayed
    pub reweighted: usize,
    /// Whether the strategy changed
    pub strategy_changed: bool,
    /// New health check settings, when they differ from the running ones
    pub health_check: Option<HealthCheckConfig>,
}

/// Apply `config` to the router behind `manager`.
///
/// `running_health` is the configuration of the active prober.
pub async fn reconcile<F: BackendFactory>(
    manager: &TopologyManager<F>,
    config: &RoutemateConfig,
    running_health: &HealthCheckConfig,
) -> ReloadSummary {
    let router = manager.router();
    let mut summary = ReloadSummary::default();

    if config.write_key != router.primary_key() {
        tracing::warn!(
            current = %router.primary_key(),
            configured = %config.write_key,
            "Primary cannot change at runtime, restart to apply"
        );
    }
    if *manager.config() != config.topology_config() {
        tracing::warn!(
            "Management and pool template settings cannot change at runtime, restart to apply"
        );
    }

    let desired: BTreeMap<String, _> = config
        .replica_specs()
        .into_iter()
        .map(|spec| (spec.key.clone(), spec))
        .collect();

    for key in router.replica_keys() {
        if desired.contains_key(&key) {
            continue;
        }
        match manager.remove_replica(&key).await {
            Ok(true) => summary.removed.push(key),
            Ok(false) => {}
            Err(e) => {
                tracing::warn!(replica = %key, error = %e, "Failed to remove replica");
                summary.failed.push(key);
            }
        }
    }

    let mut weights = Vec::new();
    for (key, spec) in desired {
        if router.contains_replica(&key) {
            weights.push((key, spec.weight));
            continue;
        }
        match manager.add_replica(spec).await {
            Ok(()) => summary.added.push(key),
            Err(e) => {
                tracing::warn!(replica = %key, error = %e, "Failed to admit replica");
                summary.failed.push(key);
            }
        }
    }

    summary.reweighted = router.update_weights(weights);
    summary.strategy_changed = router.set_strategy(config.strategy);

    let health = config.health_check_config();
    if health != *running_health {
        summary.health_check = Some(health);
    }

    tracing::info!(
        added = summary.added.len(),
        removed = summary.removed.len(),
        failed = summary.failed.len(),
        "Configuration reloaded"
    );
    summary
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::tcp::{TcpBackend, TcpBackendFactory};
    use routemate_core::{ReplicaSettings, Router, Strategy, TopologyConfig};
    use std::sync::Arc;
    use std::time::Duration;
    use tokio::net::TcpListener;

    fn replica(url: &str, weight: i64) -> ReplicaSettings {
        ReplicaSettings {
            url: url.to_string(),
            username: None,
            password: None,
            weight,
            pool: None,
        }
    }

    #[tokio::test]
    async fn test_reconcile_adds_removes_and_reweights() {
        let live = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let live_url = format!("tcp://{}", live.local_addr().unwrap());

        let router = Arc::new(Router::new(
            "primary",
            TcpBackend::new(live.local_addr().unwrap().to_string(), Duration::from_secs(1)),
            Strategy::RoundRobin,
        ));
        router
            .add_replica("old", TcpBackend::new("127.0.0.1:1", Duration::from_secs(1)), 1)
            .unwrap();
        router
            .add_replica("keep", TcpBackend::new("127.0.0.1:1", Duration::from_secs(1)), 1)
            .unwrap();

        let manager = TopologyManager::new(
            Arc::clone(&router),
            TcpBackendFactory,
            TopologyConfig {
                drain_period: Duration::from_millis(10),
                validation_timeout: Duration::from_secs(1),
                ..TopologyConfig::default()
            },
        );

        let mut config = RoutemateConfig::default();
        config.strategy = Strategy::WeightedRoundRobin;
        config.replicas.insert("keep".into(), replica("tcp://127.0.0.1:1", 4));
        config.replicas.insert("new".into(), replica(&live_url, 1));

        let running = config.health_check_config();
        let summary = reconcile(&manager, &config, &running).await;

        assert_eq!(summary.added, vec!["new".to_string()]);
        assert_eq!(summary.removed, vec!["old".to_string()]);
        assert!(summary.failed.is_empty());
        assert_eq!(summary.reweighted, 1);
        assert!(summary.strategy_changed);
        assert_eq!(summary.health_check, None);
        assert_eq!(router.weights().get("keep"), Some(4));
        assert_eq!(
            router.replica_keys(),
            vec!["keep".to_string(), "new".to_string()]
        );
    }

    #[tokio::test]
    async fn test_reconcile_reports_health_check_changes() {
        let router = Arc::new(Router::new(
            "primary",
            TcpBackend::new("127.0.0.1:1", Duration::from_secs(1)),
            Strategy::RoundRobin,
        ));
        let manager = TopologyManager::new(
            Arc::clone(&router),
            TcpBackendFactory,
            TopologyConfig::default(),
        );
        let running = RoutemateConfig::default().health_check_config();

        let mut config = RoutemateConfig::default();
        config.health_check.interval = Duration::from_secs(30);
        config.health_check.validation_query = Some("SELECT 1".into());

        let summary = reconcile(&manager, &config, &running).await;

        let health = summary.health_check.unwrap();
        assert_eq!(health.interval, Duration::from_secs(30));
        assert_eq!(health.validation_query.as_deref(), Some("SELECT 1"));
        assert!(!summary.strategy_changed);
    }
}
