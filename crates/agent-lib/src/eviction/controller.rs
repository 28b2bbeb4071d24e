//! Eviction control loop
//!
//! Every resync tick the controller asks the shortage detector for a
//! verdict, reconciles the node's eviction taint with it and, while the
//! shortage persists, evicts the single highest-ranked candidate pod.

use super::filter::PodFilter;
use super::ranker::PodRanker;
use super::taint::{has_eviction_taint, with_eviction_taint, without_eviction_taint};
use super::PodEvictor;
use crate::cluster::ClusterClient;
use crate::detector::ShortageDetector;
use crate::error::{AgentError, Result};
use crate::health::{components, HealthRegistry};
use crate::models::PodKey;
use crate::observability::{AgentMetrics, StructuredLogger};
use crate::stats::StatsSampler;
use k8s_openapi::api::core::v1::Pod;
use kube::ResourceExt;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::broadcast;
use tokio::task::JoinHandle;
use tokio::time::{interval, MissedTickBehavior};
use tracing::{debug, error, info, warn};

/// Configuration for the eviction controller
#[derive(Debug, Clone)]
pub struct EvictionControllerConfig {
    pub node_name: String,
    pub taint_key: String,
    /// Period of the decision cycle (default: 5 seconds)
    pub resync_period: Duration,
    /// Period of the stats sampler (default: 1 second)
    pub sample_period: Duration,
}

impl Default for EvictionControllerConfig {
    fn default() -> Self {
        Self {
            node_name: String::new(),
            taint_key: "swapguard.io/evicting".to_string(),
            resync_period: Duration::from_secs(5),
            sample_period: Duration::from_secs(1),
        }
    }
}

/// What one decision cycle did
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CycleOutcome {
    /// No shortage and no taint to clear
    Idle,
    TaintRemoved,
    /// Shortage, but nothing eligible to evict
    NoCandidates,
    Evicted(PodKey),
}

/// A pod is alive unless it finished or every container has terminated
pub fn is_pod_alive(pod: &Pod) -> bool {
    let Some(status) = pod.status.as_ref() else {
        return true;
    };

    if matches!(status.phase.as_deref(), Some("Failed") | Some("Succeeded")) {
        return false;
    }

    let statuses = status.container_statuses.as_deref().unwrap_or(&[]);
    let all_terminated = !statuses.is_empty()
        && statuses.iter().all(|cs| {
            cs.state
                .as_ref()
                .map(|s| s.terminated.is_some())
                .unwrap_or(false)
        });
    !all_terminated
}

pub struct EvictionController {
    config: EvictionControllerConfig,
    cluster: Arc<dyn ClusterClient>,
    sampler: Arc<StatsSampler>,
    detector: Arc<dyn ShortageDetector>,
    filter: PodFilter,
    ranker: PodRanker,
    evictor: PodEvictor,
    metrics: AgentMetrics,
    logger: StructuredLogger,
    health: HealthRegistry,
}

impl EvictionController {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        config: EvictionControllerConfig,
        cluster: Arc<dyn ClusterClient>,
        sampler: Arc<StatsSampler>,
        detector: Arc<dyn ShortageDetector>,
        filter: PodFilter,
        ranker: PodRanker,
        metrics: AgentMetrics,
        health: HealthRegistry,
    ) -> Self {
        let logger = StructuredLogger::new(&config.node_name);
        let evictor = PodEvictor::new(cluster.clone());
        Self {
            config,
            cluster,
            sampler,
            detector,
            filter,
            ranker,
            evictor,
            metrics,
            logger,
            health,
        }
    }

    /// Run one decision cycle
    pub async fn handle_cycle(&self) -> Result<CycleOutcome> {
        let verdict = self.detector.evaluate().await?;
        let should_evict = verdict.is_shortage();
        self.metrics.set_shortage(should_evict);

        let node = self.cluster.get_node(&self.config.node_name).await?;
        let key = self.config.taint_key.as_str();
        let evicting = has_eviction_taint(&node, key);

        match (evicting, should_evict) {
            (true, false) => {
                self.cluster
                    .patch_node_taints(&node, without_eviction_taint(&node, key))
                    .await?;
                self.metrics.inc_taint_removed();
                self.logger.log_taint_removed(key);
                return Ok(CycleOutcome::TaintRemoved);
            }
            (false, true) => {
                match self
                    .cluster
                    .patch_node_taints(&node, with_eviction_taint(&node, key))
                    .await
                {
                    Ok(()) => {
                        self.metrics.inc_taint_added();
                        self.logger.log_taint_added(key);
                    }
                    Err(e) => warn!(error = %e, "Failed to add eviction taint"),
                }
                self.sampler.reset().await;
            }
            (false, false) => return Ok(CycleOutcome::Idle),
            (true, true) => {}
        }

        self.logger
            .log_shortage(verdict.high_traffic, verdict.high_utilization);

        let pods: Vec<Pod> = self
            .cluster
            .list_pods_on_node(&self.config.node_name)
            .await?
            .into_iter()
            .filter(is_pod_alive)
            .collect();

        let mut candidates = self.filter.filter(pods);
        if candidates.is_empty() {
            info!("No pod eligible for eviction");
            return Ok(CycleOutcome::NoCandidates);
        }

        if let Err(e) = self.ranker.rank(&mut candidates).await {
            warn!(error = %e, "Failed to rank pods, evicting in listed order");
        }

        let order: Vec<String> = candidates
            .iter()
            .map(|p| format!("{}/{}", p.namespace().unwrap_or_default(), p.name_any()))
            .collect();
        debug!(order = ?order, "Pods in eviction order");

        let target = &candidates[0];
        let target_key = PodKey::new(target.namespace().unwrap_or_default(), target.name_any());

        match self.evictor.evict(target).await {
            Ok(()) => {
                self.metrics.inc_evictions();
                self.logger
                    .log_pod_evicted(&target_key.namespace, &target_key.name);
                self.sampler.reset().await;
                Ok(CycleOutcome::Evicted(target_key))
            }
            Err(e) => {
                self.metrics.inc_eviction_failures();
                self.logger.log_eviction_failed(
                    &target_key.namespace,
                    &target_key.name,
                    &e.to_string(),
                );
                Err(e)
            }
        }
    }

    /// Start the sampler and the decision loop; both stop on the next broadcast
    ///
    /// Both receivers subscribe before either task is spawned, so a shutdown
    /// sent right after this returns is seen by each of them.
    pub fn spawn(self: Arc<Self>, shutdown: &broadcast::Sender<()>) -> JoinHandle<()> {
        let sampler = tokio::spawn(self.sampler.clone().run(
            self.config.sample_period,
            self.health.clone(),
            shutdown.subscribe(),
        ));
        tokio::spawn(self.run(sampler, shutdown.subscribe()))
    }

    async fn run(
        self: Arc<Self>,
        mut sampler: JoinHandle<()>,
        mut shutdown: broadcast::Receiver<()>,
    ) {
        info!(
            node = %self.config.node_name,
            resync_secs = self.config.resync_period.as_secs(),
            "Starting eviction controller"
        );

        let mut ticker = interval(self.config.resync_period);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
        let mut sampler_running = true;

        loop {
            tokio::select! {
                biased;
                _ = shutdown.recv() => {
                    info!("Shutting down eviction controller");
                    break;
                }
                result = &mut sampler, if sampler_running => {
                    sampler_running = false;
                    let message = match result {
                        Ok(()) => "stats sampler stopped".to_string(),
                        Err(e) => format!("stats sampler task failed: {}", e),
                    };
                    error!(error = %message, "Swap rates can no longer be computed");
                    self.health.set_unhealthy(components::SAMPLER, message).await;
                }
                _ = ticker.tick() => {
                    let result = match self.handle_cycle().await {
                        Ok(outcome) => {
                            debug!(?outcome, "Eviction cycle complete");
                            Ok(())
                        }
                        Err(AgentError::InsufficientData) => {
                            debug!("Not enough samples yet, skipping cycle");
                            Ok(())
                        }
                        Err(e) => {
                            warn!(error = %e, "Eviction cycle failed");
                            Err(e)
                        }
                    };
                    self.metrics.set_history_samples(self.sampler.len().await);
                    self.health.report(components::EVICTION_CONTROLLER, result).await;
                }
            }
        }

        if sampler_running {
            if let Err(e) = sampler.await {
                warn!(error = %e, "Stats sampler task failed");
            }
        }
    }
}
