//! Pod and node memory figures
//!
//! Two implementations sit behind `MetricsSource`: a cgroup v2 reader that
//! reports per-pod and per-container working set and swap, and a node-only
//! source that reports totals from `/proc/meminfo` and no pod data. The
//! variant is chosen once at startup.

mod cgroup;
mod layout;

pub use cgroup::CgroupMetricsSource;
pub use layout::{container_cgroup_path, pod_cgroup_path};

use crate::cluster::PodLister;
use crate::error::{AgentError, Result};
use crate::models::{NodeSummary, PodSummary};
use crate::stats::SystemStatsSource;
use async_trait::async_trait;
use k8s_openapi::api::core::v1::Pod;
use kube::ResourceExt;
use std::path::Path;
use std::str::FromStr;
use std::sync::Arc;
use tokio::fs;

/// Supplier of current working-set and swap figures
#[async_trait]
pub trait MetricsSource: Send + Sync {
    /// Summary for one pod; an error means no data for that pod
    async fn pod_summary(&self, pod: &Pod) -> Result<PodSummary>;

    /// Summaries for every pod the source has data for
    async fn list_pods_summary(&self) -> Result<Vec<PodSummary>>;

    /// Node-wide totals
    async fn root_summary(&self) -> Result<NodeSummary>;

    fn name(&self) -> &'static str;
}

/// Node totals derived from meminfo
pub(crate) async fn node_summary_from(system: &dyn SystemStatsSource) -> Result<NodeSummary> {
    let info = system.meminfo().await?;
    Ok(NodeSummary {
        working_set_bytes: info.working_set(),
        swap_used_bytes: info.swap_used(),
        total_memory_bytes: info.mem_total,
        total_swap_bytes: info.swap_total,
    })
}

/// Metrics source with node totals only
pub struct NodeMetricsSource {
    system: Arc<dyn SystemStatsSource>,
}

impl NodeMetricsSource {
    pub fn new(system: Arc<dyn SystemStatsSource>) -> Self {
        Self { system }
    }
}

#[async_trait]
impl MetricsSource for NodeMetricsSource {
    async fn pod_summary(&self, pod: &Pod) -> Result<PodSummary> {
        Err(AgentError::NoMetrics(format!(
            "{}/{}",
            pod.namespace().unwrap_or_default(),
            pod.name_any()
        )))
    }

    async fn list_pods_summary(&self) -> Result<Vec<PodSummary>> {
        Ok(Vec::new())
    }

    async fn root_summary(&self) -> Result<NodeSummary> {
        node_summary_from(self.system.as_ref()).await
    }

    fn name(&self) -> &'static str {
        "node"
    }
}

/// Which metrics source to run
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MetricsSourceKind {
    Cgroup,
    Node,
}

impl FromStr for MetricsSourceKind {
    type Err = AgentError;

    fn from_str(s: &str) -> Result<Self> {
        match s.trim().to_ascii_lowercase().as_str() {
            "cgroup" => Ok(Self::Cgroup),
            "node" => Ok(Self::Node),
            other => Err(AgentError::Other(format!(
                "unknown metrics source {:?}",
                other
            ))),
        }
    }
}

/// Cgroup version detected on the system
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CgroupVersion {
    V1,
    V2,
    Unknown,
}

/// Detect which cgroup hierarchy is mounted at `cgroup_root`
pub async fn detect_cgroup_version(cgroup_root: &Path) -> CgroupVersion {
    if fs::metadata(cgroup_root.join("cgroup.controllers")).await.is_ok() {
        return CgroupVersion::V2;
    }

    let v1_memory = cgroup_root.join("memory");
    if fs::metadata(&v1_memory).await.is_ok() {
        return CgroupVersion::V1;
    }

    CgroupVersion::Unknown
}

/// Build the configured metrics source, falling back to node totals when
/// the unified hierarchy is not available
pub async fn create_metrics_source(
    kind: MetricsSourceKind,
    cgroup_root: &Path,
    pods: Arc<dyn PodLister>,
    system: Arc<dyn SystemStatsSource>,
) -> Arc<dyn MetricsSource> {
    if kind == MetricsSourceKind::Node {
        return Arc::new(NodeMetricsSource::new(system));
    }

    match detect_cgroup_version(cgroup_root).await {
        CgroupVersion::V2 => {
            tracing::info!("Detected cgroup v2, using per-pod cgroup metrics");
            Arc::new(CgroupMetricsSource::new(cgroup_root, pods, system))
        }
        version => {
            tracing::warn!(
                ?version,
                "Unified cgroup hierarchy not found, using node-only metrics"
            );
            Arc::new(NodeMetricsSource::new(system))
        }
    }
}
