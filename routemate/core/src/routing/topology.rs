//! Topology Management
//!
//! The only supported way to change the replica set of a running router.
//!
//! ```text
//! add_replica(spec)
//!   validate spec ─► duplicate? ─► factory.create ─► liveness probe ─► router.add_replica
//!                                                    │ fail
//!                                                    └─► close, reject
//!
//! remove_replica(key)
//!   router.remove_replica ─► drain (wait for in-flight holders) ─► close
//! ```
//!
//! Admissions and removals are serialized. Draining happens outside the
//! admission lock, so a slow drain does not hold up other changes.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tokio::sync::Mutex;
use tokio::time::Instant;

use super::backend::{Backend, BackendError};
use super::probe::{probe_backend, HealthCheckConfig, ProbeError};
use super::router::{Router, TopologyError};
use crate::config::RoutemateConfig;

/// How often a draining removal re-checks for outstanding holders
const DRAIN_POLL_INTERVAL: Duration = Duration::from_millis(25);

// ============================================================================
// Errors
// ============================================================================

/// Rejected admissions and removals
#[derive(Debug, Error)]
pub enum AdmissionError {
    /// Missing or blank key/url
    #[error("invalid replica spec: {0}")]
    InvalidSpec(String),

    /// The factory could not create a handle
    #[error("failed to create backend '{key}': {source}")]
    Create {
        /// Replica key
        key: String,
        /// Factory error
        source: BackendError,
    },

    /// The new handle failed its liveness probe
    #[error("replica '{key}' failed validation: {source}")]
    ValidationFailed {
        /// Replica key
        key: String,
        /// Probe failure
        source: ProbeError,
    },

    /// The router rejected the change
    #[error(transparent)]
    Topology(#[from] TopologyError),
}

// ============================================================================
// Replica Definitions
// ============================================================================

/// Connection pool settings handed to the backend factory
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct PoolSettings {
    /// Maximum connections
    pub maximum_pool_size: u32,
    /// Minimum idle connections
    pub minimum_idle: u32,
    /// Wait for a connection before failing
    pub connection_timeout_ms: u64,
    /// Idle connection lifetime
    pub idle_timeout_ms: u64,
    /// Maximum connection lifetime
    pub max_lifetime_ms: u64,
}

impl Default for PoolSettings {
    fn default() -> Self {
        Self {
            maximum_pool_size: 10,
            minimum_idle: 10,
            connection_timeout_ms: 30_000,
            idle_timeout_ms: 600_000,
            max_lifetime_ms: 1_800_000,
        }
    }
}

/// Everything a factory needs to create one backend
#[derive(Clone, PartialEq, Eq)]
pub struct ReplicaSpec {
    /// Replica key
    pub key: String,
    /// Connection URL
    pub url: String,
    /// Optional user name
    pub username: Option<String>,
    /// Optional password
    pub password: Option<String>,
    /// Load-balancing weight (coerced to at least 1)
    pub weight: i64,
    /// Pool settings; the manager's template is used when absent
    pub pool: Option<PoolSettings>,
}

impl std::fmt::Debug for ReplicaSpec {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ReplicaSpec")
            .field("key", &self.key)
            .field("url", &self.url)
            .field("username", &self.username)
            .field("password", &self.password.as_ref().map(|_| "***"))
            .field("weight", &self.weight)
            .field("pool", &self.pool)
            .finish()
    }
}

impl ReplicaSpec {
    /// Spec with weight 1 and no credentials
    pub fn new(key: impl Into<String>, url: impl Into<String>) -> Self {
        Self {
            key: key.into(),
            url: url.into(),
            username: None,
            password: None,
            weight: 1,
            pool: None,
        }
    }

    /// Set the weight
    #[must_use]
    pub fn with_weight(mut self, weight: i64) -> Self {
        self.weight = weight;
        self
    }

    /// Set credentials
    #[must_use]
    pub fn with_credentials(mut self, username: impl Into<String>, password: impl Into<String>) -> Self {
        self.username = Some(username.into());
        self.password = Some(password.into());
        self
    }

    /// Set pool settings
    #[must_use]
    pub fn with_pool(mut self, pool: PoolSettings) -> Self {
        self.pool = Some(pool);
        self
    }

    /// Reject blank keys and urls
    pub fn validate(&self) -> Result<(), AdmissionError> {
        if self.key.trim().is_empty() {
            return Err(AdmissionError::InvalidSpec("replica key is required".into()));
        }
        if self.url.trim().is_empty() {
            return Err(AdmissionError::InvalidSpec(format!(
                "url is required for replica '{}'",
                self.key
            )));
        }
        Ok(())
    }
}

// ============================================================================
// Backend Factory
// ============================================================================

/// Creates backend handles from specs
#[async_trait]
pub trait BackendFactory: Send + Sync + 'static {
    /// Handle type produced
    type Backend: Backend;

    /// Create a handle. Must not register it anywhere.
    async fn create(&self, spec: &ReplicaSpec) -> Result<Self::Backend, BackendError>;
}

// ============================================================================
// Topology Manager
// ============================================================================

/// Topology manager settings
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct TopologyConfig {
    /// Longest wait for in-flight holders before closing a removed handle
    pub drain_period: Duration,
    /// Upper bound for the admission liveness probe
    pub validation_timeout: Duration,
    /// Pool settings for specs that carry none
    pub pool_template: PoolSettings,
}

impl Default for TopologyConfig {
    fn default() -> Self {
        Self {
            drain_period: Duration::from_secs(2),
            validation_timeout: Duration::from_secs(5),
            pool_template: PoolSettings::default(),
        }
    }
}

/// Validated admission and graceful removal of replicas
pub struct TopologyManager<F: BackendFactory> {
    router: Arc<Router<F::Backend>>,
    factory: F,
    config: TopologyConfig,
    admission: Mutex<()>,
}

impl<F: BackendFactory> TopologyManager<F> {
    /// Create a manager for `router`
    pub fn new(router: Arc<Router<F::Backend>>, factory: F, config: TopologyConfig) -> Self {
        Self {
            router,
            factory,
            config,
            admission: Mutex::new(()),
        }
    }

    /// The managed router
    pub fn router(&self) -> &Arc<Router<F::Backend>> {
        &self.router
    }

    /// Manager settings
    pub fn config(&self) -> &TopologyConfig {
        &self.config
    }

    /// Create, validate and register a replica.
    ///
    /// The handle is closed again if validation or registration fails.
    pub async fn add_replica(&self, mut spec: ReplicaSpec) -> Result<(), AdmissionError> {
        spec.validate()?;
        let _admission = self.admission.lock().await;

        if spec.key == self.router.primary_key() || self.router.contains_replica(&spec.key) {
            return Err(TopologyError::DuplicateKey(spec.key).into());
        }
        if spec.pool.is_none() {
            spec.pool = Some(self.config.pool_template.clone());
        }

        tracing::info!(replica = %spec.key, url = %spec.url, "Validating new replica");
        let backend = self
            .factory
            .create(&spec)
            .await
            .map_err(|source| AdmissionError::Create {
                key: spec.key.clone(),
                source,
            })?;

        let probe = HealthCheckConfig::default().with_timeout(self.config.validation_timeout);
        if let Err(source) = probe_backend(&backend, &probe).await {
            tracing::warn!(replica = %spec.key, error = %source, "Replica failed validation, not registered");
            backend.close().await;
            return Err(AdmissionError::ValidationFailed {
                key: spec.key,
                source,
            });
        }

        let backend = Arc::new(backend);
        if let Err(e) = self
            .router
            .add_replica(spec.key.clone(), Arc::clone(&backend), spec.weight)
        {
            backend.close().await;
            return Err(e.into());
        }
        Ok(())
    }

    /// Detach, drain and close a replica.
    ///
    /// Returns `Ok(false)` if no replica is registered under `key`.
    pub async fn remove_replica(&self, key: &str) -> Result<bool, AdmissionError> {
        if key.trim().is_empty() {
            return Err(AdmissionError::InvalidSpec("replica key is required".into()));
        }

        let handle = {
            let _admission = self.admission.lock().await;
            match self.router.remove_replica(key) {
                Ok(handle) => handle,
                Err(TopologyError::UnknownKey(_)) => {
                    tracing::warn!(replica = %key, "Replica not found, nothing to remove");
                    return Ok(false);
                }
                Err(e) => return Err(e.into()),
            }
        };

        self.drain_and_close(key, handle).await;
        Ok(true)
    }

    async fn drain_and_close(&self, key: &str, handle: Arc<F::Backend>) {
        let deadline = Instant::now() + self.config.drain_period;
        while Arc::strong_count(&handle) > 1 && Instant::now() < deadline {
            tokio::time::sleep(DRAIN_POLL_INTERVAL).await;
        }

        let holders = Arc::strong_count(&handle) - 1;
        if holders > 0 {
            tracing::warn!(
                replica = %key,
                holders,
                drain_ms = self.config.drain_period.as_millis() as u64,
                "Closing replica while handles are still in use"
            );
        }
        handle.close().await;
        tracing::info!(replica = %key, "Replica closed");
    }
}

// ============================================================================
// Bootstrap
// ============================================================================

/// Build a router from configuration.
///
/// Replicas declared in configuration are registered without a liveness
/// probe; the health prober takes over from its first round. If any replica
/// fails, every backend created so far is closed before the error returns.
pub async fn build_router<F: BackendFactory>(
    config: &RoutemateConfig,
    factory: &F,
) -> Result<Router<F::Backend>, AdmissionError> {
    let primary_spec = config.primary_spec();
    let primary = create_backend(factory, &primary_spec).await?;
    let router = Router::new(primary_spec.key, primary, config.strategy);

    if let Err(e) = register_replicas(&router, config, factory).await {
        tracing::warn!(error = %e, "Router bootstrap failed, closing created backends");
        close_all(&router).await;
        return Err(e);
    }

    tracing::info!(
        primary = %router.primary_key(),
        replicas = router.replica_keys().len(),
        strategy = %router.strategy(),
        "Router initialized"
    );
    Ok(router)
}

async fn register_replicas<F: BackendFactory>(
    router: &Router<F::Backend>,
    config: &RoutemateConfig,
    factory: &F,
) -> Result<(), AdmissionError> {
    for spec in config.replica_specs() {
        let backend = Arc::new(create_backend(factory, &spec).await?);
        if let Err(e) = router.add_replica(spec.key, Arc::clone(&backend), spec.weight) {
            backend.close().await;
            return Err(e.into());
        }
    }
    Ok(())
}

async fn close_all<B: Backend>(router: &Router<B>) {
    for (_, handle) in router.replicas() {
        handle.close().await;
    }
    router.primary().close().await;
}

async fn create_backend<F: BackendFactory>(
    factory: &F,
    spec: &ReplicaSpec,
) -> Result<F::Backend, AdmissionError> {
    spec.validate()?;
    factory
        .create(spec)
        .await
        .map_err(|source| AdmissionError::Create {
            key: spec.key.clone(),
            source,
        })
}
