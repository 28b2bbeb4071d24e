//! Process wiring
//!
//! Builds the collaborators, starts the pod watch, waits for the pod cache
//! and runs both control loops until a termination signal arrives.

use crate::api;
use crate::config::AgentConfig;
use crate::AGENT_VERSION;
use agent_lib::cluster::{KubeClusterClient, PodLister};
use agent_lib::detector::{ShortageDetector, SwapShortageDetector};
use agent_lib::eviction::{EvictionController, PodFilter, PodRanker};
use agent_lib::health::{components, HealthRegistry};
use agent_lib::metrics_source::create_metrics_source;
use agent_lib::observability::{AgentMetrics, StructuredLogger};
use agent_lib::stats::{ProcStatsSource, StatsSampler, SystemStatsSource};
use agent_lib::swap::{node_capacity, CriRuntimeClient, SwapLimitManager};
use anyhow::{Context, Result};
use futures::StreamExt;
use k8s_openapi::api::core::v1::Pod;
use kube::runtime::reflector::{self, store::Writer};
use kube::runtime::{watcher, WatchStreamExt};
use kube::{Api, Client};
use std::sync::Arc;
use tokio::signal::unix::{signal, SignalKind};
use tokio::sync::{broadcast, watch};
use tracing::{error, info, warn};

/// Feed the pod cache and the swap queue from a node-scoped pod watch
async fn watch_pods(
    pods: Api<Pod>,
    node_name: String,
    writer: Writer<Pod>,
    swap_manager: Arc<SwapLimitManager>,
    synced: watch::Sender<bool>,
    health: HealthRegistry,
    mut shutdown: broadcast::Receiver<()>,
) {
    let config = watcher::Config::default().fields(&format!("spec.nodeName={}", node_name));
    let mut events = reflector::reflector(writer, watcher(pods, config))
        .default_backoff()
        .boxed();

    loop {
        tokio::select! {
            event = events.next() => match event {
                Some(Ok(watcher::Event::Restarted(pods))) => {
                    for pod in &pods {
                        swap_manager.enqueue_pod(pod).await;
                    }
                    synced.send_replace(true);
                    health.set_healthy(components::POD_CACHE).await;
                }
                Some(Ok(watcher::Event::Applied(pod))) => swap_manager.enqueue_pod(&pod).await,
                Some(Ok(watcher::Event::Deleted(_))) => {}
                Some(Err(e)) => {
                    warn!(error = %e, "Pod watch error");
                    health.set_degraded(components::POD_CACHE, e.to_string()).await;
                }
                None => {
                    error!("Pod watch stream ended");
                    health
                        .set_unhealthy(components::POD_CACHE, "pod watch stream ended")
                        .await;
                    break;
                }
            },
            _ = shutdown.recv() => break,
        }
    }
    info!("Pod watch stopped");
}

async fn shutdown_signal() -> Result<&'static str> {
    let mut terminate =
        signal(SignalKind::terminate()).context("failed to install SIGTERM handler")?;
    tokio::select! {
        result = tokio::signal::ctrl_c() => {
            result.context("failed to listen for SIGINT")?;
            Ok("SIGINT received")
        }
        _ = terminate.recv() => Ok("SIGTERM received"),
    }
}

/// Run the agent until SIGINT/SIGTERM
pub async fn run(config: AgentConfig) -> Result<()> {
    let logger = StructuredLogger::new(&config.node_name);

    let health = HealthRegistry::new();
    health.register_all().await;
    let metrics = AgentMetrics::new().context("failed to register metrics")?;
    let (shutdown_tx, _) = broadcast::channel::<()>(1);

    let system: Arc<dyn SystemStatsSource> =
        Arc::new(ProcStatsSource::new(config.host_proc_path.clone()));
    let meminfo = system
        .meminfo()
        .await
        .context("failed to read node memory totals")?;
    let capacity = node_capacity(&meminfo)?;

    let client = Client::try_default()
        .await
        .context("failed to create Kubernetes client")?;

    let (reader, writer) = reflector::store::<Pod>();
    let pod_lister: Arc<dyn PodLister> = Arc::new(reader);

    let metrics_source = create_metrics_source(
        config.metrics_source_kind()?,
        &config.cgroup_root,
        pod_lister.clone(),
        system.clone(),
    )
    .await;
    logger.log_startup(AGENT_VERSION, metrics_source.name());

    let swap_manager = Arc::new(SwapLimitManager::new(
        config.swap_config(capacity),
        pod_lister,
        Arc::new(CriRuntimeClient::new(config.cri_socket.clone())),
        metrics.clone(),
        health.clone(),
    ));

    let (synced_tx, mut synced_rx) = watch::channel(false);
    let watch_handle = tokio::spawn(watch_pods(
        Api::all(client.clone()),
        config.node_name.clone(),
        writer,
        swap_manager.clone(),
        synced_tx,
        health.clone(),
        shutdown_tx.subscribe(),
    ));

    let app_state = Arc::new(api::AppState::new(health.clone(), metrics.clone()));
    let mut api_handle = tokio::spawn(api::serve(
        config.api_port,
        app_state,
        shutdown_tx.subscribe(),
    ));

    let synced = tokio::time::timeout(
        config.cache_sync_timeout(),
        synced_rx.wait_for(|synced| *synced),
    )
    .await
    .map(|result| result.is_ok());
    match synced {
        Ok(true) => info!("Pod cache synced"),
        Ok(false) => warn!("Pod watch ended before the cache synced"),
        Err(_) => {
            warn!(
                timeout_secs = config.cache_sync_timeout_secs,
                "Timed out waiting for pod cache sync, continuing"
            );
            health
                .set_degraded(components::POD_CACHE, "initial sync timed out")
                .await;
        }
    }
    health.set_ready(true).await;

    let sampler = Arc::new(StatsSampler::new(system));
    let detector: Arc<dyn ShortageDetector> = Arc::new(SwapShortageDetector::new(
        sampler.clone(),
        metrics_source.clone(),
        config.detector_config(),
    ));
    let controller = Arc::new(EvictionController::new(
        config.eviction_config(),
        Arc::new(KubeClusterClient::new(client)),
        sampler,
        detector,
        PodFilter::new(
            config.namespace.clone(),
            config.excluded_namespace_prefixes.clone(),
        ),
        PodRanker::new(metrics_source),
        metrics,
        health,
    ));

    let loops = [
        controller.spawn(&shutdown_tx),
        tokio::spawn(swap_manager.run(shutdown_tx.subscribe())),
        watch_handle,
    ];

    let reason = tokio::select! {
        signal = shutdown_signal() => signal?,
        result = &mut api_handle => match result {
            Ok(Ok(())) => "API server stopped",
            Ok(Err(e)) => {
                error!(error = %e, "API server failed");
                "API server failed"
            }
            Err(e) => {
                error!(error = %e, "API server task failed");
                "API server task failed"
            }
        },
    };

    logger.log_shutdown(reason);
    let _ = shutdown_tx.send(());

    for handle in loops {
        if let Err(e) = handle.await {
            warn!(error = %e, "Control loop task failed");
        }
    }
    if !api_handle.is_finished() {
        if let Ok(Err(e)) = api_handle.await {
            warn!(error = %e, "API server stopped with error");
        }
    }

    info!("Shutdown complete");
    Ok(())
}
