//! Per-container swap ceilings
//!
//! The Swap-Limit Manager drains a rate-limited queue of pod keys, resolves
//! each running container to its cgroup through the CRI runtime and writes
//! the container's `memory.swap.max`.

mod cgroup;
mod cri;
mod manager;
mod queue;

#[cfg(test)]
mod tests;

pub use cgroup::{cgroup_dir_for_pid, parse_unified_path, swap_allocation, write_swap_limit};
pub use cri::{pid_from_info, running_pid, runtime_v1, ContainerRuntime, CriRuntimeClient};
pub use manager::{node_capacity, EnqueueState, NodeCapacity, SwapLimitManager, SwapManagerConfig};
pub use queue::{backoff_delay, RateLimitedQueue, DEFAULT_BASE_DELAY, DEFAULT_MAX_DELAY};
