//! Swap guard agent library
//!
//! Node-local protection against memory and swap exhaustion:
//! - Sampling of system swap traffic and memory figures
//! - Shortage detection over the sampled history
//! - Filtering, ranking and eviction of pods under a node taint
//! - Per-container swap ceilings proportional to memory requests
//! - Health checks and observability

pub mod cluster;
pub mod detector;
pub mod error;
pub mod eviction;
pub mod health;
pub mod metrics_source;
pub mod models;
pub mod observability;
pub mod resources;
pub mod stats;
pub mod swap;

pub use error::{AgentError, Result};
pub use health::{
    ComponentHealth, ComponentStatus, HealthRegistry, HealthResponse, ReadinessResponse,
};
pub use models::*;
pub use observability::{AgentMetrics, StructuredLogger};
