//! Swap guard node agent
//!
//! Runs as a DaemonSet on each Kubernetes node, evicting pods under
//! sustained swap pressure and keeping container swap ceilings in line
//! with their memory requests.

pub mod api;
pub mod app;
pub mod config;

pub const AGENT_VERSION: &str = env!("CARGO_PKG_VERSION");
