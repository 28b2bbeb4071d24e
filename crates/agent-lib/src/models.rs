//! Core data models for the swap guard agent

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::fmt;

/// Node-wide swap/memory sample recorded by the stats sampler
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Sample {
    pub time: DateTime<Utc>,
    /// Cumulative pages swapped in (`pswpin`)
    pub swap_in: u64,
    /// Cumulative pages swapped out (`pswpout`)
    pub swap_out: u64,
    pub swap_used_bytes: u64,
    pub available_memory_bytes: u64,
    pub inactive_file_bytes: u64,
}

/// Node totals reported by a pod metrics source
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct NodeSummary {
    pub working_set_bytes: u64,
    pub swap_used_bytes: u64,
    pub total_memory_bytes: u64,
    pub total_swap_bytes: u64,
}

impl NodeSummary {
    /// Resident working set plus swapped-out memory
    pub fn used_virtual_memory_bytes(&self) -> u64 {
        self.working_set_bytes.saturating_add(self.swap_used_bytes)
    }
}

/// Memory figures for one container
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ContainerSummary {
    pub working_set_bytes: u64,
    pub swap_bytes: u64,
}

impl ContainerSummary {
    pub fn memory_and_swap_bytes(&self) -> u64 {
        self.working_set_bytes.saturating_add(self.swap_bytes)
    }
}

/// Memory figures for one pod, keyed by container name
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct PodSummary {
    pub pod_uid: String,
    pub working_set_bytes: u64,
    pub swap_bytes: u64,
    pub containers: HashMap<String, ContainerSummary>,
}

impl PodSummary {
    pub fn memory_and_swap_bytes(&self) -> u64 {
        self.working_set_bytes.saturating_add(self.swap_bytes)
    }
}

/// Namespace/name identity of a pod, used as the work queue key
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct PodKey {
    pub namespace: String,
    pub name: String,
}

impl PodKey {
    pub fn new(namespace: impl Into<String>, name: impl Into<String>) -> Self {
        Self {
            namespace: namespace.into(),
            name: name.into(),
        }
    }
}

impl fmt::Display for PodKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}", self.namespace, self.name)
    }
}
