//! Replica Health Prober
//!
//! Periodically probes every registered replica and feeds the outcome into
//! the router's [`HealthTracker`](super::health::HealthTracker).
//!
//! ```text
//!   interval tick
//!        │
//!        ▼
//!  router.replicas() ──► join_all(probe each, bounded by timeout)
//!        │
//!        ▼
//!  Ok  ──► mark_healthy        Err / timeout ──► mark_unhealthy
//! ```
//!
//! A probe runs the configured validation query when one is set, otherwise
//! the backend's generic liveness check. Probe failures never propagate; they
//! only change health state.

use std::sync::Arc;
use std::time::Duration;

use futures::future::join_all;
use thiserror::Error;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio::time::{Instant, MissedTickBehavior};

use super::backend::{Backend, BackendError};
use super::router::Router;

// ============================================================================
// Configuration
// ============================================================================

/// Health check settings
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct HealthCheckConfig {
    /// Whether the periodic prober runs at all
    pub enabled: bool,
    /// Time between probe rounds
    pub interval: Duration,
    /// Upper bound for a single probe
    pub timeout: Duration,
    /// Query to run instead of the generic liveness check
    pub validation_query: Option<String>,
}

impl Default for HealthCheckConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            interval: Duration::from_secs(5),
            timeout: Duration::from_secs(2),
            validation_query: None,
        }
    }
}

impl HealthCheckConfig {
    /// Set the probe interval
    #[must_use]
    pub fn with_interval(mut self, interval: Duration) -> Self {
        self.interval = interval;
        self
    }

    /// Set the probe timeout
    #[must_use]
    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    /// Set the validation query
    #[must_use]
    pub fn with_validation_query(mut self, query: impl Into<String>) -> Self {
        self.validation_query = Some(query.into());
        self
    }

    /// Validation query, ignoring blank values
    #[must_use]
    pub fn effective_query(&self) -> Option<&str> {
        self.validation_query
            .as_deref()
            .map(str::trim)
            .filter(|q| !q.is_empty())
    }
}

// ============================================================================
// Probe Results
// ============================================================================

/// Why a probe failed
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ProbeError {
    /// The probe did not finish in time
    #[error("probe timed out after {0:?}")]
    Timeout(Duration),

    /// The backend reported an error
    #[error(transparent)]
    Backend(#[from] BackendError),
}

/// Outcome of one probe round
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ProbeReport {
    /// Per-replica outcome in registration order
    pub outcomes: Vec<(String, Result<(), ProbeError>)>,
}

impl ProbeReport {
    /// Keys that passed
    #[must_use]
    pub fn healthy(&self) -> Vec<&str> {
        self.outcomes
            .iter()
            .filter(|(_, r)| r.is_ok())
            .map(|(k, _)| k.as_str())
            .collect()
    }

    /// Keys that failed, with the reason
    #[must_use]
    pub fn failed(&self) -> Vec<(&str, &ProbeError)> {
        self.outcomes
            .iter()
            .filter_map(|(k, r)| r.as_ref().err().map(|e| (k.as_str(), e)))
            .collect()
    }

    /// Whether every probed replica passed
    #[must_use]
    pub fn all_healthy(&self) -> bool {
        self.outcomes.iter().all(|(_, r)| r.is_ok())
    }
}

/// Probe a single backend, bounded by `config.timeout`
pub async fn probe_backend<B: Backend + ?Sized>(
    backend: &B,
    config: &HealthCheckConfig,
) -> Result<(), ProbeError> {
    let check = async {
        match config.effective_query() {
            Some(query) => backend.run_validation_query(query).await,
            None => backend.is_alive().await,
        }
    };
    match tokio::time::timeout(config.timeout, check).await {
        Ok(result) => result.map_err(ProbeError::from),
        Err(_) => Err(ProbeError::Timeout(config.timeout)),
    }
}

// ============================================================================
// Prober
// ============================================================================

/// Drives the router's health state from periodic probes
pub struct HealthProber<B> {
    router: Arc<Router<B>>,
    config: HealthCheckConfig,
}

impl<B: Backend> HealthProber<B> {
    /// Create a prober for `router`
    pub fn new(router: Arc<Router<B>>, config: HealthCheckConfig) -> Self {
        Self { router, config }
    }

    /// Probe settings
    pub fn config(&self) -> &HealthCheckConfig {
        &self.config
    }

    /// Probe every registered replica once and update health state
    pub async fn check_once(&self) -> ProbeReport {
        let replicas = self.router.replicas();
        let config = &self.config;

        let probes = replicas.into_iter().map(|(key, handle)| async move {
            let started = Instant::now();
            let result = probe_backend(handle.as_ref(), config).await;
            (key, handle, result, started.elapsed())
        });

        let mut report = ProbeReport::default();
        for (key, handle, result, elapsed) in join_all(probes).await {
            self.router
                .metrics()
                .probe_latency
                .record(u64::try_from(elapsed.as_millis()).unwrap_or(u64::MAX));

            if let Err(e) = &result {
                tracing::debug!(replica = %key, error = %e, "Health probe failed");
            }

            // Removed or replaced while the probe was in flight
            if self.router.record_probe(&key, &handle, result.is_ok()).is_none() {
                tracing::debug!(replica = %key, "Discarding probe result for unregistered handle");
                continue;
            }
            report.outcomes.push((key, result));
        }
        report
    }

    /// Run [`check_once`](Self::check_once) every interval until stopped.
    ///
    /// The first round runs one full interval after spawning.
    pub fn spawn(self) -> ProberHandle {
        let (shutdown, mut shutdown_rx) = watch::channel(false);
        let interval = self.config.interval;
        let enabled = self.config.enabled;

        let task = tokio::spawn(async move {
            if !enabled {
                tracing::info!("Replica health checks disabled");
                return;
            }

            tracing::info!(
                interval_ms = interval.as_millis() as u64,
                timeout_ms = self.config.timeout.as_millis() as u64,
                "Replica health prober started"
            );

            let mut ticker = tokio::time::interval_at(Instant::now() + interval, interval);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

            loop {
                tokio::select! {
                    _ = ticker.tick() => {
                        let report = self.check_once().await;
                        tracing::trace!(
                            probed = report.outcomes.len(),
                            failed = report.failed().len(),
                            "Probe round complete"
                        );
                    }
                    changed = shutdown_rx.changed() => {
                        if changed.is_err() || *shutdown_rx.borrow() {
                            break;
                        }
                    }
                }
            }
            tracing::info!("Replica health prober stopped");
        });

        ProberHandle { shutdown, task }
    }
}

/// Handle to a running prober. Dropping it also stops the prober.
#[derive(Debug)]
pub struct ProberHandle {
    shutdown: watch::Sender<bool>,
    task: JoinHandle<()>,
}

impl ProberHandle {
    /// Stop the prober and wait for the current round to finish
    pub async fn stop(self) {
        let _ = self.shutdown.send(true);
        if let Err(e) = self.task.await {
            tracing::warn!(error = %e, "Health prober task ended abnormally");
        }
    }

    /// Whether the prober task has exited
    #[must_use]
    pub fn is_finished(&self) -> bool {
        self.task.is_finished()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::routing::balancer::Strategy;
    use async_trait::async_trait;
    use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};

    #[derive(Default)]
    struct Stub {
        down: AtomicBool,
        hang: AtomicBool,
        queries: AtomicUsize,
    }

    #[async_trait]
    impl Backend for Stub {
        async fn is_alive(&self) -> Result<(), BackendError> {
            if self.hang.load(Ordering::SeqCst) {
                tokio::time::sleep(Duration::from_secs(5)).await;
            }
            if self.down.load(Ordering::SeqCst) {
                return Err(BackendError::Connect("refused".into()));
            }
            Ok(())
        }

        async fn run_validation_query(&self, _query: &str) -> Result<(), BackendError> {
            self.queries.fetch_add(1, Ordering::SeqCst);
            self.is_alive().await
        }

        async fn close(&self) {}
    }

    fn setup() -> (Arc<Router<Stub>>, Arc<Stub>, Arc<Stub>) {
        let router = Arc::new(Router::new("primary", Stub::default(), Strategy::RoundRobin));
        let read1 = Arc::new(Stub::default());
        let read2 = Arc::new(Stub::default());
        router.add_replica("read1", Arc::clone(&read1), 1).unwrap();
        router.add_replica("read2", Arc::clone(&read2), 1).unwrap();
        (router, read1, read2)
    }

    fn fast() -> HealthCheckConfig {
        HealthCheckConfig::default()
            .with_interval(Duration::from_millis(20))
            .with_timeout(Duration::from_millis(50))
    }

    #[tokio::test]
    async fn test_failure_and_recovery() {
        let (router, read1, _read2) = setup();
        let prober = HealthProber::new(Arc::clone(&router), fast());

        read1.down.store(true, Ordering::SeqCst);
        let report = prober.check_once().await;
        assert_eq!(report.healthy(), vec!["read2"]);
        assert!(matches!(
            report.failed()[0],
            ("read1", ProbeError::Backend(BackendError::Connect(_)))
        ));
        assert_eq!(router.healthy_replicas(), vec!["read2".to_string()]);

        read1.down.store(false, Ordering::SeqCst);
        assert!(prober.check_once().await.all_healthy());
        assert_eq!(router.healthy_replicas().len(), 2);
    }

    #[tokio::test]
    async fn test_timeout_counts_as_failure() {
        let (router, _read1, read2) = setup();
        read2.hang.store(true, Ordering::SeqCst);

        let report = HealthProber::new(Arc::clone(&router), fast())
            .check_once()
            .await;
        assert_eq!(
            report.failed(),
            vec![("read2", &ProbeError::Timeout(Duration::from_millis(50)))]
        );
        assert!(!router.health().is_healthy("read2"));
    }

    #[tokio::test]
    async fn test_validation_query_used_when_set() {
        let (router, read1, read2) = setup();

        HealthProber::new(Arc::clone(&router), fast().with_validation_query("  "))
            .check_once()
            .await;
        assert_eq!(read1.queries.load(Ordering::SeqCst), 0);

        HealthProber::new(Arc::clone(&router), fast().with_validation_query("SELECT 1"))
            .check_once()
            .await;
        assert_eq!(read1.queries.load(Ordering::SeqCst), 1);
        assert_eq!(read2.queries.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_result_for_replaced_replica_is_discarded() {
        let (router, read1, _read2) = setup();
        read1.hang.store(true, Ordering::SeqCst);
        let prober = HealthProber::new(Arc::clone(&router), fast());

        let replace = async {
            tokio::time::sleep(Duration::from_millis(10)).await;
            router.remove_replica("read1").unwrap();
            router.add_replica("read1", Stub::default(), 1).unwrap();
        };
        let (report, ()) = tokio::join!(prober.check_once(), replace);

        assert!(router.health().is_healthy("read1"));
        assert!(router.health().unhealthy_keys().is_empty());
        assert!(report.outcomes.iter().all(|(key, _)| key != "read1"));
        assert_eq!(report.outcomes.len(), 1);
    }

    #[tokio::test]
    async fn test_spawned_prober_marks_and_stops() {
        let (router, read1, _read2) = setup();
        read1.down.store(true, Ordering::SeqCst);

        let handle = HealthProber::new(Arc::clone(&router), fast()).spawn();
        let deadline = Instant::now() + Duration::from_secs(2);
        while router.health().is_healthy("read1") && Instant::now() < deadline {
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        assert!(!router.health().is_healthy("read1"));

        handle.stop().await;
    }

    #[tokio::test]
    async fn test_disabled_prober_exits() {
        let (router, _read1, _read2) = setup();
        let config = HealthCheckConfig {
            enabled: false,
            ..fast()
        };
        let handle = HealthProber::new(router, config).spawn();
        handle.stop().await;
    }
}
