//! Routemate Core - Read/Write-Splitting Router
//!
//! This crate resolves every unit of work to a concrete backend: writes go to
//! the single primary, reads are spread across healthy replicas with a
//! pluggable load-balancing strategy, and a total replica outage degrades to
//! the primary instead of failing the request.
//!
//! # Architecture
//!
//! ```text
//! ┌──────────────────────────────────────────────────────────────────┐
//! │                         Callers (tasks)                          │
//! │        RoutingContext::enter(READ) / context::enter_current      │
//! └────────────────────────────────┬─────────────────────────────────┘
//!                                  │ determine_target()
//! ┌────────────────────────────────┴─────────────────────────────────┐
//! │                              Router                               │
//! │  ┌──────────────┐  ┌────────────────┐  ┌───────────────────────┐ │
//! │  │   Topology   │  │ HealthTracker  │  │     LoadBalancer      │ │
//! │  │  (ArcSwap)   │  │ (unhealthy set)│  │ rr / random / weighted│ │
//! │  └──────▲───────┘  └───────▲────────┘  └───────────────────────┘ │
//! └─────────┼──────────────────┼─────────────────────────────────────┘
//!           │                  │
//!  ┌────────┴────────┐  ┌──────┴────────┐
//!  │ TopologyManager │  │ HealthProber  │
//!  │ (admission)     │  │ (interval)    │
//!  └─────────────────┘  └───────────────┘
//! ```
//!
//! # Key Types
//!
//! - [`Router`]: resolves intents and owns the replica topology
//! - [`RoutingContext`]: nested stack of caller intents
//! - [`LoadBalancer`]: replica selection strategy
//! - [`HealthTracker`] / [`HealthProber`]: replica health state and probing
//! - [`TopologyManager`]: validated admission and graceful removal
//! - [`RoutemateConfig`]: TOML + environment configuration
//!
//! # Quick Start
//!
//! ```ignore
//! use routemate_core::{RoutingContext, RoutingIntent, Router, Strategy};
//!
//! let router = Router::new("primary", primary_handle, Strategy::RoundRobin);
//! router.add_replica("read1", replica_handle, 1)?;
//!
//! let mut ctx = RoutingContext::new();
//! let scope = ctx.enter(RoutingIntent::Read)?;
//! let target = router.determine_target(&scope);
//! ```

#![warn(missing_docs)]

pub mod config;
pub mod routing;

pub use config::{
    default_config_path, load_config, load_config_from_path, ConfigError, ConfigSource,
    HealthCheckSettings, ManagementSettings, ReplicaSettings, RoutemateConfig,
};
pub use routing::{
    balancer::{
        LoadBalancer, RandomBalancer, RoundRobinBalancer, Strategy, WeightTable,
        WeightedRoundRobinBalancer,
    },
    backend::{Backend, BackendError},
    context::{ContextGuard, IntentError, RoutingContext, RoutingIntent},
    health::{HealthStatus, HealthTracker},
    metrics::{MetricsSnapshot, RouterMetrics},
    probe::{HealthCheckConfig, HealthProber, ProbeError, ProbeReport, ProberHandle},
    router::{Router, Target, TopologyError},
    topology::{
        build_router, AdmissionError, BackendFactory, PoolSettings, ReplicaSpec, TopologyConfig,
        TopologyManager,
    },
};
