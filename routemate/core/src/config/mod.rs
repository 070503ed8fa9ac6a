//! TOML Configuration File Support
//!
//! Loads the router topology and probe settings from
//! `~/.config/routemate/routemate.toml`.
//!
//! # Configuration Priority
//!
//! Configuration values are loaded with the following priority (highest first):
//! 1. Environment variables
//! 2. TOML configuration file
//! 3. Default values
//!
//! # Example Configuration
//!
//! ```toml
//! enabled = true
//!
//! [routing]
//! write_key = "primary"
//! strategy = "weighted-round-robin"
//!
//! [primary]
//! url = "tcp://10.0.0.1:5432"
//!
//! [replicas.read1]
//! url = "tcp://10.0.0.2:5432"
//! weight = 3
//!
//! [replicas.read2]
//! url = "tcp://10.0.0.3:5432"
//!
//! [health_check]
//! interval_ms = 5000
//! timeout_ms = 2000
//! validation_query = "SELECT 1"
//!
//! [management]
//! drain_period_ms = 2000
//! validation_timeout_ms = 5000
//!
//! [pool_template]
//! maximum_pool_size = 20
//! ```

use std::collections::BTreeMap;
use std::path::PathBuf;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::routing::balancer::Strategy;
use crate::routing::probe::HealthCheckConfig;
use crate::routing::topology::{PoolSettings, ReplicaSpec, TopologyConfig};

// =============================================================================
// Error Types
// =============================================================================

/// Errors that can occur when loading configuration
#[derive(Debug, Error)]
pub enum ConfigError {
    /// Failed to read config file
    #[error("Failed to read config file at {path}: {source}")]
    ReadError {
        /// The path that was attempted
        path: PathBuf,
        /// The underlying IO error
        source: std::io::Error,
    },

    /// Failed to parse TOML
    #[error("Failed to parse TOML config: {0}")]
    ParseError(#[from] toml::de::Error),

    /// Invalid configuration value
    #[error("Invalid configuration: {0}")]
    ValidationError(String),
}

/// Where the effective configuration came from
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum ConfigSource {
    /// Value from environment variable
    Env,
    /// Value from TOML configuration file
    File,
    /// Default value
    Default,
}

impl std::fmt::Display for ConfigSource {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Env => write!(f, "environment"),
            Self::File => write!(f, "config file"),
            Self::Default => write!(f, "default"),
        }
    }
}

// =============================================================================
// TOML Configuration Structures
// =============================================================================

/// Routing section of the TOML configuration
#[derive(Clone, Debug, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct RoutingToml {
    /// Key of the primary backend
    pub write_key: Option<String>,

    /// Load balance strategy name
    pub strategy: Option<String>,
}

/// Primary section of the TOML configuration
#[derive(Clone, Debug, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct PrimaryToml {
    /// Connection URL
    pub url: Option<String>,
    /// User name
    pub username: Option<String>,
    /// Password
    pub password: Option<String>,
    /// Pool settings
    pub pool: Option<PoolSettings>,
}

/// One `[replicas.<key>]` table
#[derive(Clone, Debug, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct ReplicaToml {
    /// Connection URL
    pub url: Option<String>,
    /// User name
    pub username: Option<String>,
    /// Password
    pub password: Option<String>,
    /// Load balance weight
    pub weight: Option<i64>,
    /// Pool settings
    pub pool: Option<PoolSettings>,
}

/// Health check section of the TOML configuration
#[derive(Clone, Debug, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct HealthCheckToml {
    /// Whether the prober runs
    pub enabled: Option<bool>,
    /// Probe interval in milliseconds
    pub interval_ms: Option<u64>,
    /// Probe timeout in milliseconds
    pub timeout_ms: Option<u64>,
    /// Query run instead of the liveness check
    pub validation_query: Option<String>,
}

/// Management section of the TOML configuration
#[derive(Clone, Debug, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct ManagementToml {
    /// Drain period before closing a removed replica, in milliseconds
    pub drain_period_ms: Option<u64>,
    /// Admission probe timeout in milliseconds
    pub validation_timeout_ms: Option<u64>,
}

/// Root TOML configuration structure
#[derive(Clone, Debug, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct RoutemateToml {
    /// Read/write splitting on or off
    pub enabled: Option<bool>,
    /// Routing settings
    pub routing: RoutingToml,
    /// Primary backend
    pub primary: PrimaryToml,
    /// Replica backends by key
    pub replicas: BTreeMap<String, ReplicaToml>,
    /// Health check settings
    pub health_check: HealthCheckToml,
    /// Topology management settings
    pub management: ManagementToml,
    /// Pool settings for backends without their own
    pub pool_template: Option<PoolSettings>,
}

// =============================================================================
// Effective Configuration
// =============================================================================

/// Primary backend settings
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct PrimarySettings {
    /// Connection URL
    pub url: String,
    /// User name
    pub username: Option<String>,
    /// Password
    pub password: Option<String>,
    /// Pool settings
    pub pool: Option<PoolSettings>,
}

/// Replica backend settings
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ReplicaSettings {
    /// Connection URL
    pub url: String,
    /// User name
    pub username: Option<String>,
    /// Password
    pub password: Option<String>,
    /// Load balance weight
    pub weight: i64,
    /// Pool settings
    pub pool: Option<PoolSettings>,
}

/// Health check settings
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct HealthCheckSettings {
    /// Whether the prober runs
    pub enabled: bool,
    /// Probe interval
    pub interval: Duration,
    /// Probe timeout
    pub timeout: Duration,
    /// Query run instead of the liveness check
    pub validation_query: Option<String>,
}

impl Default for HealthCheckSettings {
    fn default() -> Self {
        let defaults = HealthCheckConfig::default();
        Self {
            enabled: defaults.enabled,
            interval: defaults.interval,
            timeout: defaults.timeout,
            validation_query: None,
        }
    }
}

/// Topology management settings
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ManagementSettings {
    /// Drain period before closing a removed replica
    pub drain_period: Duration,
    /// Admission probe timeout
    pub validation_timeout: Duration,
}

impl Default for ManagementSettings {
    fn default() -> Self {
        let defaults = TopologyConfig::default();
        Self {
            drain_period: defaults.drain_period,
            validation_timeout: defaults.validation_timeout,
        }
    }
}

/// Effective routemate configuration
#[derive(Clone, Debug)]
pub struct RoutemateConfig {
    /// Read/write splitting on or off; when off every read goes to the primary
    pub enabled: bool,
    /// Key of the primary backend
    pub write_key: String,
    /// Load balance strategy
    pub strategy: Strategy,
    /// Primary backend
    pub primary: PrimarySettings,
    /// Replica backends, ordered by key
    pub replicas: BTreeMap<String, ReplicaSettings>,
    /// Health check settings
    pub health_check: HealthCheckSettings,
    /// Topology management settings
    pub management: ManagementSettings,
    /// Pool settings for backends without their own
    pub pool_template: Option<PoolSettings>,
    /// Path to the config file that was loaded (if any)
    pub config_file_path: Option<PathBuf>,
    source: ConfigSource,
}

impl Default for RoutemateConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            write_key: "primary".to_string(),
            strategy: Strategy::RoundRobin,
            primary: PrimarySettings::default(),
            replicas: BTreeMap::new(),
            health_check: HealthCheckSettings::default(),
            management: ManagementSettings::default(),
            pool_template: None,
            config_file_path: None,
            source: ConfigSource::Default,
        }
    }
}

impl RoutemateConfig {
    /// Create a new configuration with default values
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Get the primary source of this configuration
    #[must_use]
    pub fn source(&self) -> ConfigSource {
        self.source
    }

    /// Pool template: explicit template, else the first replica's pool,
    /// else defaults
    #[must_use]
    pub fn effective_pool_template(&self) -> PoolSettings {
        self.pool_template
            .clone()
            .or_else(|| self.replicas.values().find_map(|r| r.pool.clone()))
            .unwrap_or_default()
    }

    /// Spec for the primary backend
    #[must_use]
    pub fn primary_spec(&self) -> ReplicaSpec {
        ReplicaSpec {
            key: self.write_key.clone(),
            url: self.primary.url.clone(),
            username: self.primary.username.clone(),
            password: self.primary.password.clone(),
            weight: 1,
            pool: Some(
                self.primary
                    .pool
                    .clone()
                    .unwrap_or_else(|| self.effective_pool_template()),
            ),
        }
    }

    /// Specs for the configured replicas, ordered by key.
    ///
    /// Empty when read/write splitting is disabled.
    #[must_use]
    pub fn replica_specs(&self) -> Vec<ReplicaSpec> {
        if !self.enabled {
            return Vec::new();
        }
        let template = self.effective_pool_template();
        self.replicas
            .iter()
            .map(|(key, replica)| ReplicaSpec {
                key: key.clone(),
                url: replica.url.clone(),
                username: replica.username.clone(),
                password: replica.password.clone(),
                weight: replica.weight,
                pool: Some(replica.pool.clone().unwrap_or_else(|| template.clone())),
            })
            .collect()
    }

    /// Prober settings
    #[must_use]
    pub fn health_check_config(&self) -> HealthCheckConfig {
        HealthCheckConfig {
            enabled: self.health_check.enabled,
            interval: self.health_check.interval,
            timeout: self.health_check.timeout,
            validation_query: self.health_check.validation_query.clone(),
        }
    }

    /// Topology manager settings
    #[must_use]
    pub fn topology_config(&self) -> TopologyConfig {
        TopologyConfig {
            drain_period: self.management.drain_period,
            validation_timeout: self.management.validation_timeout,
            pool_template: self.effective_pool_template(),
        }
    }

    /// Check cross-field constraints
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.write_key.trim().is_empty() {
            return Err(ConfigError::ValidationError(
                "routing.write_key must not be blank".into(),
            ));
        }
        for (key, replica) in &self.replicas {
            if key.trim().is_empty() {
                return Err(ConfigError::ValidationError(
                    "replica keys must not be blank".into(),
                ));
            }
            if *key == self.write_key {
                return Err(ConfigError::ValidationError(format!(
                    "replica '{key}' uses the write key"
                )));
            }
            if replica.url.trim().is_empty() {
                return Err(ConfigError::ValidationError(format!(
                    "replicas.{key}.url is required"
                )));
            }
        }
        if self.health_check.interval.is_zero() {
            return Err(ConfigError::ValidationError(
                "health_check.interval_ms must be greater than zero".into(),
            ));
        }
        if self.health_check.timeout.is_zero() {
            return Err(ConfigError::ValidationError(
                "health_check.timeout_ms must be greater than zero".into(),
            ));
        }
        Ok(())
    }
}

// =============================================================================
// Configuration Loading
// =============================================================================

/// Get the default configuration file path
///
/// Returns `$XDG_CONFIG_HOME/routemate/routemate.toml` or
/// `~/.config/routemate/routemate.toml` if `XDG_CONFIG_HOME` is not set.
#[must_use]
pub fn default_config_path() -> Option<PathBuf> {
    dirs::config_dir().map(|p| p.join("routemate").join("routemate.toml"))
}

/// Load configuration from the default path
///
/// # Errors
///
/// Returns an error if the config file exists but cannot be parsed or fails
/// validation. A missing config file is not an error (defaults are used).
pub fn load_config() -> Result<RoutemateConfig, ConfigError> {
    load_config_from_path(default_config_path())
}

/// Load configuration from a specific path
///
/// # Errors
///
/// Returns an error if the specified config file cannot be read, parsed or
/// validated.
pub fn load_config_from_path(path: Option<PathBuf>) -> Result<RoutemateConfig, ConfigError> {
    let mut config = RoutemateConfig::default();

    if let Some(ref config_path) = path {
        if config_path.exists() {
            let toml_content =
                std::fs::read_to_string(config_path).map_err(|e| ConfigError::ReadError {
                    path: config_path.clone(),
                    source: e,
                })?;

            let toml_config: RoutemateToml = toml::from_str(&toml_content)?;
            apply_toml_config(&mut config, &toml_config)?;
            config.config_file_path = Some(config_path.clone());
            config.source = ConfigSource::File;

            tracing::info!(
                path = %config_path.display(),
                replicas = config.replicas.len(),
                "Loaded configuration from file"
            );
        } else {
            tracing::debug!(
                path = %config_path.display(),
                "Config file not found, using defaults"
            );
        }
    }

    apply_env_config(&mut config)?;
    config.validate()?;
    Ok(config)
}

fn parse_strategy(raw: &str) -> Result<Strategy, ConfigError> {
    raw.parse::<Strategy>()
        .map_err(|e| ConfigError::ValidationError(e.to_string()))
}

/// Apply TOML configuration values to the config struct
fn apply_toml_config(config: &mut RoutemateConfig, toml: &RoutemateToml) -> Result<(), ConfigError> {
    if let Some(enabled) = toml.enabled {
        config.enabled = enabled;
    }

    // Routing settings
    if let Some(ref key) = toml.routing.write_key {
        config.write_key = key.clone();
    }
    if let Some(ref strategy) = toml.routing.strategy {
        config.strategy = parse_strategy(strategy)?;
    }

    // Backends
    if let Some(ref url) = toml.primary.url {
        config.primary.url = url.clone();
    }
    config.primary.username = toml.primary.username.clone();
    config.primary.password = toml.primary.password.clone();
    config.primary.pool = toml.primary.pool.clone();

    for (key, replica) in &toml.replicas {
        config.replicas.insert(
            key.clone(),
            ReplicaSettings {
                url: replica.url.clone().unwrap_or_default(),
                username: replica.username.clone(),
                password: replica.password.clone(),
                weight: replica.weight.unwrap_or(1),
                pool: replica.pool.clone(),
            },
        );
    }
    config.pool_template = toml.pool_template.clone();

    // Health check settings
    if let Some(enabled) = toml.health_check.enabled {
        config.health_check.enabled = enabled;
    }
    if let Some(ms) = toml.health_check.interval_ms {
        config.health_check.interval = Duration::from_millis(ms);
    }
    if let Some(ms) = toml.health_check.timeout_ms {
        config.health_check.timeout = Duration::from_millis(ms);
    }
    if toml.health_check.validation_query.is_some() {
        config.health_check.validation_query = toml.health_check.validation_query.clone();
    }

    // Management settings
    if let Some(ms) = toml.management.drain_period_ms {
        config.management.drain_period = Duration::from_millis(ms);
    }
    if let Some(ms) = toml.management.validation_timeout_ms {
        config.management.validation_timeout = Duration::from_millis(ms);
    }

    Ok(())
}

/// Apply environment variable overrides to the config
fn apply_env_config(config: &mut RoutemateConfig) -> Result<(), ConfigError> {
    if let Ok(raw) = std::env::var("ROUTEMATE_STRATEGY") {
        config.strategy = parse_strategy(&raw)?;
        config.source = ConfigSource::Env;
    }
    if let Ok(enabled) = std::env::var("ROUTEMATE_HEALTH_CHECK") {
        config.health_check.enabled = enabled != "0" && enabled.to_lowercase() != "false";
        config.source = ConfigSource::Env;
    }
    if let Ok(interval) = std::env::var("ROUTEMATE_HEALTH_INTERVAL_MS") {
        config.health_check.interval = env_millis("ROUTEMATE_HEALTH_INTERVAL_MS", &interval)?;
        config.source = ConfigSource::Env;
    }
    if let Ok(timeout) = std::env::var("ROUTEMATE_HEALTH_TIMEOUT_MS") {
        config.health_check.timeout = env_millis("ROUTEMATE_HEALTH_TIMEOUT_MS", &timeout)?;
        config.source = ConfigSource::Env;
    }
    if let Ok(query) = std::env::var("ROUTEMATE_VALIDATION_QUERY") {
        config.health_check.validation_query = Some(query);
        config.source = ConfigSource::Env;
    }
    Ok(())
}

fn env_millis(var: &str, raw: &str) -> Result<Duration, ConfigError> {
    raw.trim()
        .parse::<u64>()
        .map(Duration::from_millis)
        .map_err(|_| ConfigError::ValidationError(format!("{var} must be milliseconds, got '{raw}'")))
}
