//! Swap-Limit Manager
//!
//! Keeps every running container's `memory.swap.max` consistent with the
//! pod's QoS: burstable containers get a share of node swap proportional to
//! their memory request, everything else gets none. Pods arrive through
//! watch events and a periodic resync; a rate-limited queue retries pods
//! whose containers are not ready yet.

use super::cgroup::{cgroup_dir_for_pid, swap_allocation, write_swap_limit};
use super::cri::ContainerRuntime;
use super::queue::RateLimitedQueue;
use crate::cluster::PodLister;
use crate::error::{AgentError, Result};
use crate::health::{components, HealthRegistry};
use crate::models::PodKey;
use crate::observability::{AgentMetrics, StructuredLogger};
use crate::resources::{
    all_containers, container_memory_limit, container_memory_request, container_status,
    has_excluded_prefix, is_critical_pod, parse_container_id, qos_class, QosClass,
};
use crate::stats::MemInfo;
use k8s_openapi::api::core::v1::{Container, Pod};
use kube::ResourceExt;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::broadcast;
use tokio::time::{interval, MissedTickBehavior};
use tracing::{debug, info, warn};

/// Node memory and swap totals the allocation is proportional to
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct NodeCapacity {
    pub total_memory_bytes: u64,
    pub total_swap_bytes: u64,
}

impl From<&MemInfo> for NodeCapacity {
    fn from(info: &MemInfo) -> Self {
        Self {
            total_memory_bytes: info.mem_total,
            total_swap_bytes: info.swap_total,
        }
    }
}

#[derive(Debug, Clone)]
pub struct SwapManagerConfig {
    pub node_name: String,
    pub excluded_namespace_prefixes: Vec<String>,
    /// Host procfs, for `/proc/<pid>/cgroup`
    pub proc_root: PathBuf,
    pub cgroup_root: PathBuf,
    /// Period of the full re-enqueue (default: 20 seconds)
    pub resync_period: Duration,
    pub workers: usize,
    pub capacity: NodeCapacity,
}

impl Default for SwapManagerConfig {
    fn default() -> Self {
        Self {
            node_name: String::new(),
            excluded_namespace_prefixes: vec!["openshift".to_string(), "kube-system".to_string()],
            proc_root: PathBuf::from("/host/proc"),
            cgroup_root: PathBuf::from("/host/sys/fs/cgroup"),
            resync_period: Duration::from_secs(20),
            workers: 1,
            capacity: NodeCapacity::default(),
        }
    }
}

/// What happens to a key after it was reconciled
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EnqueueState {
    /// Done, or the pod is gone; drop the key and its backoff
    Forget,
    /// Retry after the key's exponential backoff
    BackOff,
    /// Retry without delay
    Immediate,
}

enum ContainerStep {
    Skip,
    Apply(String),
    Retry(&'static str),
}

fn container_step(pod: &Pod, container: &Container) -> ContainerStep {
    let Some(status) = container_status(pod, &container.name) else {
        return ContainerStep::Retry("no container status yet");
    };
    let state = status.state.as_ref();
    if state.map(|s| s.terminated.is_some()).unwrap_or(false) {
        return ContainerStep::Skip;
    }
    if !state.map(|s| s.running.is_some()).unwrap_or(false) {
        return ContainerStep::Retry("container not running");
    }

    match status.container_id.as_deref().and_then(parse_container_id) {
        Some((_, id)) => ContainerStep::Apply(id.to_string()),
        None => ContainerStep::Retry("container id not reported"),
    }
}

pub struct SwapLimitManager {
    config: SwapManagerConfig,
    pods: Arc<dyn PodLister>,
    runtime: Arc<dyn ContainerRuntime>,
    queue: RateLimitedQueue<PodKey>,
    metrics: AgentMetrics,
    logger: StructuredLogger,
    health: HealthRegistry,
}

impl SwapLimitManager {
    pub fn new(
        config: SwapManagerConfig,
        pods: Arc<dyn PodLister>,
        runtime: Arc<dyn ContainerRuntime>,
        metrics: AgentMetrics,
        health: HealthRegistry,
    ) -> Self {
        let logger = StructuredLogger::new(&config.node_name);
        Self {
            config,
            pods,
            runtime,
            queue: RateLimitedQueue::new(),
            metrics,
            logger,
            health,
        }
    }

    pub fn queue(&self) -> &RateLimitedQueue<PodKey> {
        &self.queue
    }

    /// Whether every container of the pod must run without swap
    pub fn force_zero_swap(&self, pod: &Pod) -> bool {
        qos_class(pod) != QosClass::Burstable
            || is_critical_pod(pod)
            || has_excluded_prefix(
                &pod.namespace().unwrap_or_default(),
                &self.config.excluded_namespace_prefixes,
            )
    }

    /// Swap ceiling for one container of a pod
    pub fn swap_limit_for(&self, container: &Container, force_zero: bool) -> u64 {
        let request = container_memory_request(container).unwrap_or(0);
        let limit = container_memory_limit(container).unwrap_or(0);

        if force_zero || (request == 0 && limit == 0) || request == limit {
            return 0;
        }
        swap_allocation(
            request,
            self.config.capacity.total_memory_bytes,
            self.config.capacity.total_swap_bytes,
        )
    }

    /// Queue the pod if it is scheduled on this node
    pub async fn enqueue_pod(&self, pod: &Pod) {
        let on_node = pod
            .spec
            .as_ref()
            .and_then(|s| s.node_name.as_deref())
            .map(|n| n == self.config.node_name)
            .unwrap_or(false);
        if on_node {
            self.queue
                .add(PodKey::new(pod.namespace().unwrap_or_default(), pod.name_any()))
                .await;
        }
    }

    /// Queue every cached pod on this node
    pub async fn enqueue_all_pods(&self) {
        for pod in self.pods.list() {
            self.enqueue_pod(&pod).await;
        }
        self.metrics.set_queue_depth(self.queue.len().await);
    }

    async fn apply_container(
        &self,
        pod: &Pod,
        container: &Container,
        container_id: &str,
        force_zero: bool,
    ) -> Result<u64> {
        let pid = self.runtime.container_pid(container_id).await?;
        let dir = cgroup_dir_for_pid(&self.config.proc_root, &self.config.cgroup_root, pid).await?;
        let limit = self.swap_limit_for(container, force_zero);

        if let Err(e) = write_swap_limit(&dir, limit).await {
            self.metrics.inc_swap_limit_write_failures();
            return Err(e);
        }
        self.metrics.inc_swap_limit_writes();
        self.logger.log_swap_limit_set(
            &pod.namespace().unwrap_or_default(),
            &pod.name_any(),
            &container.name,
            limit,
        );
        Ok(limit)
    }

    /// Bring the swap ceilings of one pod's containers in line with policy
    pub async fn reconcile(&self, key: &PodKey) -> Result<EnqueueState> {
        let Some(pod) = self.pods.get(&key.namespace, &key.name) else {
            debug!(pod = %key, "Pod no longer cached, dropping");
            return Ok(EnqueueState::Forget);
        };

        let force_zero = self.force_zero_swap(&pod);
        let mut retry = false;
        let mut first_error = None;

        for container in all_containers(&pod) {
            let container_id = match container_step(&pod, container) {
                ContainerStep::Skip => continue,
                ContainerStep::Retry(reason) => {
                    debug!(
                        pod = %key,
                        container = %container.name,
                        reason,
                        "Container not ready for swap limit"
                    );
                    retry = true;
                    continue;
                }
                ContainerStep::Apply(id) => id,
            };

            if let Err(e) = self
                .apply_container(&pod, container, &container_id, force_zero)
                .await
            {
                warn!(
                    pod = %key,
                    container = %container.name,
                    error = %e,
                    "Failed to set swap limit"
                );
                first_error.get_or_insert(e);
            }
        }

        // Any failed write fails the whole pod
        if let Some(e) = first_error {
            return Err(e);
        }
        Ok(if retry {
            EnqueueState::BackOff
        } else {
            EnqueueState::Forget
        })
    }

    pub async fn apply_outcome(&self, key: &PodKey, state: EnqueueState) {
        match state {
            EnqueueState::Forget => self.queue.forget(key).await,
            EnqueueState::BackOff => self.queue.add_rate_limited(key.clone()).await,
            EnqueueState::Immediate => self.queue.add(key.clone()).await,
        }
    }

    /// Reconcile the next queued pod; false once the queue has shut down
    pub async fn process_next_item(&self) -> bool {
        let Some(key) = self.queue.get().await else {
            return false;
        };

        let started = Instant::now();
        let result = self.reconcile(&key).await;
        self.metrics
            .observe_reconcile_latency(started.elapsed().as_secs_f64());

        let state = match &result {
            Ok(state) => *state,
            Err(e) => {
                debug!(pod = %key, error = %e, "Swap reconcile failed, backing off");
                EnqueueState::BackOff
            }
        };
        self.apply_outcome(&key, state).await;
        self.queue.done(&key).await;
        self.metrics.set_queue_depth(self.queue.len().await);
        self.health
            .report(components::SWAP_MANAGER, result.map(|_| ()))
            .await;
        true
    }

    /// Run the workers and the periodic resync until shutdown
    pub async fn run(self: Arc<Self>, mut shutdown: broadcast::Receiver<()>) {
        let workers = self.config.workers.max(1);
        info!(
            node = %self.config.node_name,
            workers,
            resync_secs = self.config.resync_period.as_secs(),
            total_memory_bytes = self.config.capacity.total_memory_bytes,
            total_swap_bytes = self.config.capacity.total_swap_bytes,
            "Starting swap limit manager"
        );

        let handles: Vec<_> = (0..workers)
            .map(|_| {
                let manager = self.clone();
                tokio::spawn(async move { while manager.process_next_item().await {} })
            })
            .collect();

        let mut ticker = interval(self.config.resync_period);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

        loop {
            tokio::select! {
                _ = ticker.tick() => self.enqueue_all_pods().await,
                _ = shutdown.recv() => {
                    info!("Shutting down swap limit manager");
                    break;
                }
            }
        }

        self.queue.shutdown().await;
        for handle in handles {
            if let Err(e) = handle.await {
                warn!(error = %e, "Swap worker task failed");
            }
        }
    }
}

/// Node totals from meminfo, refusing a node that reports no memory
pub fn node_capacity(info: &MemInfo) -> Result<NodeCapacity> {
    if info.mem_total == 0 {
        return Err(AgentError::Other("meminfo reports zero total memory".to_string()));
    }
    Ok(NodeCapacity::from(info))
}
