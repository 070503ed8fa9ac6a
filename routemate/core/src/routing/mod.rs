//! Read/Write Routing
//!
//! Everything needed to turn a caller's declared intent into a backend:
//!
//! - [`context`]: per-task stack of intents (`WRITE`, `READ`, explicit key)
//! - [`balancer`]: round-robin, random and weighted round-robin selection
//! - [`health`]: the set of replicas currently failing probes
//! - [`probe`]: periodic prober feeding the health tracker
//! - [`router`]: copy-on-write topology and request resolution
//! - [`topology`]: validated admission and graceful removal of replicas
//! - [`metrics`]: resolution and topology counters
//!
//! # Resolution Flow
//!
//! ```text
//! intent ──► WRITE / none ───────────────────────────────► Primary
//!        ──► explicit key ───────────────────────────────► Explicit(key)
//!        ──► READ ──► keys − unhealthy ──► empty? ──yes──► Primary (warn)
//!                                          │
//!                                          no
//!                                          ▼
//!                                   balancer.select ─────► Replica(key)
//! ```
//!
//! Resolution never awaits and never performs I/O. Only the prober and the
//! topology manager touch backends.

pub mod backend;
pub mod balancer;
pub mod context;
pub mod health;
pub mod metrics;
pub mod probe;
pub mod router;
pub mod topology;

pub use backend::{Backend, BackendError};
pub use balancer::{LoadBalancer, Strategy, WeightTable};
pub use context::{RoutingContext, RoutingIntent};
pub use health::HealthTracker;
pub use router::{Router, Target, TopologyError};
