//! Per-pod memory and swap figures from the cgroup v2 hierarchy
//!
//! Reads, for each pod and running container cgroup:
//! - memory.current and memory.stat (working set = current - inactive_file)
//! - memory.swap.current for swap usage
//!
//! Init containers are included only while running (restartable sidecars);
//! finished containers have no cgroup left to read.

use super::layout::{container_cgroup_path, pod_cgroup_path};
use super::MetricsSource;
use crate::cluster::PodLister;
use crate::error::{AgentError, Result};
use crate::models::{ContainerSummary, NodeSummary, PodSummary};
use crate::stats::SystemStatsSource;
use async_trait::async_trait;
use k8s_openapi::api::core::v1::Pod;
use kube::ResourceExt;
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tokio::fs;
use tracing::debug;

/// Metrics source reading the unified cgroup hierarchy
pub struct CgroupMetricsSource {
    cgroup_root: PathBuf,
    pods: Arc<dyn PodLister>,
    system: Arc<dyn SystemStatsSource>,
}

impl CgroupMetricsSource {
    pub fn new(
        cgroup_root: impl Into<PathBuf>,
        pods: Arc<dyn PodLister>,
        system: Arc<dyn SystemStatsSource>,
    ) -> Self {
        Self {
            cgroup_root: cgroup_root.into(),
            pods,
            system,
        }
    }

    /// Parse memory.stat file contents into a map of stat name to value
    pub fn parse_memory_stat(content: &str) -> HashMap<String, u64> {
        let mut stats = HashMap::new();

        for line in content.lines() {
            let parts: Vec<&str> = line.split_whitespace().collect();
            if parts.len() >= 2 {
                if let Ok(value) = parts[1].parse::<u64>() {
                    stats.insert(parts[0].to_string(), value);
                }
            }
        }

        stats
    }

    async fn read_cgroup_value(&self, cgroup_path: &Path, filename: &str) -> Result<u64> {
        let file_path = cgroup_path.join(filename);
        let content = fs::read_to_string(&file_path)
            .await
            .map_err(|e| AgentError::io(&file_path, e))?;

        content
            .trim()
            .parse()
            .map_err(|_| AgentError::Other(format!("failed to parse {}", file_path.display())))
    }

    /// Working set and swap usage of one cgroup
    async fn read_usage(&self, cgroup_path: &Path) -> Result<(u64, u64)> {
        let current = self.read_cgroup_value(cgroup_path, "memory.current").await?;

        let stat = fs::read_to_string(cgroup_path.join("memory.stat"))
            .await
            .unwrap_or_default();
        let inactive_file = Self::parse_memory_stat(&stat)
            .get("inactive_file")
            .copied()
            .unwrap_or(0);

        let swap = self
            .read_cgroup_value(cgroup_path, "memory.swap.current")
            .await
            .unwrap_or(0);

        Ok((current.saturating_sub(inactive_file), swap))
    }

    async fn read_container(&self, cgroup_path: &Path) -> Result<ContainerSummary> {
        let (working_set_bytes, swap_bytes) = self.read_usage(cgroup_path).await?;
        Ok(ContainerSummary {
            working_set_bytes,
            swap_bytes,
        })
    }

    fn abs_path(&self, relative: &str) -> PathBuf {
        self.cgroup_root.join(relative.trim_start_matches('/'))
    }
}

#[async_trait]
impl MetricsSource for CgroupMetricsSource {
    async fn pod_summary(&self, pod: &Pod) -> Result<PodSummary> {
        let pod_path = pod_cgroup_path(pod)?;
        let pod_cgroup = self.abs_path(&pod_path);
        let (working_set_bytes, swap_bytes) = self.read_usage(&pod_cgroup).await?;

        let mut containers = HashMap::new();
        let statuses: Vec<_> = pod
            .status
            .as_ref()
            .into_iter()
            .flat_map(|s| {
                s.container_statuses
                    .iter()
                    .flatten()
                    .chain(s.init_container_statuses.iter().flatten())
            })
            .collect();

        for status in statuses {
            let running = status
                .state
                .as_ref()
                .map(|s| s.running.is_some())
                .unwrap_or(false);
            let Some(container_id) = status.container_id.as_deref().filter(|_| running) else {
                continue;
            };

            let relative = match container_cgroup_path(&pod_path, container_id) {
                Ok(p) => p,
                Err(e) => {
                    debug!(container = %status.name, error = %e, "Skipping container");
                    continue;
                }
            };
            match self.read_container(&self.abs_path(&relative)).await {
                Ok(summary) => {
                    containers.insert(status.name.clone(), summary);
                }
                Err(e) => {
                    debug!(container = %status.name, error = %e, "Container cgroup unreadable");
                }
            }
        }

        if containers.is_empty() {
            return Err(AgentError::NoMetrics(format!(
                "{}/{}",
                pod.namespace().unwrap_or_default(),
                pod.name_any()
            )));
        }

        Ok(PodSummary {
            pod_uid: pod.uid().unwrap_or_default(),
            working_set_bytes,
            swap_bytes,
            containers,
        })
    }

    async fn list_pods_summary(&self) -> Result<Vec<PodSummary>> {
        let mut summaries = Vec::new();
        for pod in self.pods.list() {
            match self.pod_summary(&pod).await {
                Ok(summary) => summaries.push(summary),
                Err(e) => debug!(pod = %pod.name_any(), error = %e, "No summary for pod"),
            }
        }
        Ok(summaries)
    }

    async fn root_summary(&self) -> Result<NodeSummary> {
        super::node_summary_from(self.system.as_ref()).await
    }

    fn name(&self) -> &'static str {
        "cgroup"
    }
}
