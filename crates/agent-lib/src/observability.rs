//! Observability infrastructure for the swap guard agent
//!
//! Provides:
//! - Prometheus metrics registered on an agent-owned registry
//! - Structured JSON logging with tracing

use prometheus::{
    Encoder, Histogram, HistogramOpts, IntCounter, IntCounterVec, IntGauge, Opts, Registry,
    TextEncoder,
};
use std::sync::Arc;
use tracing::{info, warn};

/// Histogram buckets for reconcile latency (in seconds)
const LATENCY_BUCKETS: &[f64] = &[
    0.0005, 0.001, 0.0025, 0.005, 0.01, 0.025, 0.05, 0.1, 0.25, 0.5, 1.0, 2.5,
];

struct AgentMetricsInner {
    registry: Registry,
    evictions: IntCounter,
    eviction_failures: IntCounter,
    taint_transitions: IntCounterVec,
    swap_limit_writes: IntCounter,
    swap_limit_write_failures: IntCounter,
    shortage_detected: IntGauge,
    history_samples: IntGauge,
    queue_depth: IntGauge,
    reconcile_latency_seconds: Histogram,
}

/// Agent metrics for Prometheus exposition
///
/// Clones share the same registry and collectors.
#[derive(Clone)]
pub struct AgentMetrics {
    inner: Arc<AgentMetricsInner>,
}

impl AgentMetrics {
    /// Create a metrics handle with a fresh registry
    pub fn new() -> prometheus::Result<Self> {
        let registry = Registry::new();

        let evictions = IntCounter::with_opts(Opts::new(
            "swapguard_pod_evictions_total",
            "Pods evicted to relieve memory pressure",
        ))?;
        let eviction_failures = IntCounter::with_opts(Opts::new(
            "swapguard_pod_eviction_failures_total",
            "Eviction attempts that failed",
        ))?;
        let taint_transitions = IntCounterVec::new(
            Opts::new(
                "swapguard_taint_transitions_total",
                "Eviction taint additions and removals",
            ),
            &["action"],
        )?;
        let swap_limit_writes = IntCounter::with_opts(Opts::new(
            "swapguard_swap_limit_writes_total",
            "Container swap limits written to cgroups",
        ))?;
        let swap_limit_write_failures = IntCounter::with_opts(Opts::new(
            "swapguard_swap_limit_write_failures_total",
            "Container swap limit updates that failed",
        ))?;
        let shortage_detected = IntGauge::with_opts(Opts::new(
            "swapguard_shortage_detected",
            "1 when the last detection cycle reported a memory shortage",
        ))?;
        let history_samples = IntGauge::with_opts(Opts::new(
            "swapguard_stats_history_samples",
            "Samples currently held by the stats sampler",
        ))?;
        let queue_depth = IntGauge::with_opts(Opts::new(
            "swapguard_swap_queue_depth",
            "Pods waiting in the swap-limit work queue",
        ))?;
        let reconcile_latency_seconds = Histogram::with_opts(
            HistogramOpts::new(
                "swapguard_swap_reconcile_duration_seconds",
                "Time spent reconciling the swap limits of one pod",
            )
            .buckets(LATENCY_BUCKETS.to_vec()),
        )?;

        registry.register(Box::new(evictions.clone()))?;
        registry.register(Box::new(eviction_failures.clone()))?;
        registry.register(Box::new(taint_transitions.clone()))?;
        registry.register(Box::new(swap_limit_writes.clone()))?;
        registry.register(Box::new(swap_limit_write_failures.clone()))?;
        registry.register(Box::new(shortage_detected.clone()))?;
        registry.register(Box::new(history_samples.clone()))?;
        registry.register(Box::new(queue_depth.clone()))?;
        registry.register(Box::new(reconcile_latency_seconds.clone()))?;

        Ok(Self {
            inner: Arc::new(AgentMetricsInner {
                registry,
                evictions,
                eviction_failures,
                taint_transitions,
                swap_limit_writes,
                swap_limit_write_failures,
                shortage_detected,
                history_samples,
                queue_depth,
                reconcile_latency_seconds,
            }),
        })
    }

    /// Render all metrics in the Prometheus text format
    pub fn encode(&self) -> prometheus::Result<Vec<u8>> {
        let mut buffer = Vec::new();
        TextEncoder::new().encode(&self.inner.registry.gather(), &mut buffer)?;
        Ok(buffer)
    }

    pub fn inc_evictions(&self) {
        self.inner.evictions.inc();
    }

    pub fn inc_eviction_failures(&self) {
        self.inner.eviction_failures.inc();
    }

    pub fn inc_taint_added(&self) {
        self.inner
            .taint_transitions
            .with_label_values(&["added"])
            .inc();
    }

    pub fn inc_taint_removed(&self) {
        self.inner
            .taint_transitions
            .with_label_values(&["removed"])
            .inc();
    }

    pub fn inc_swap_limit_writes(&self) {
        self.inner.swap_limit_writes.inc();
    }

    pub fn inc_swap_limit_write_failures(&self) {
        self.inner.swap_limit_write_failures.inc();
    }

    pub fn set_shortage(&self, shortage: bool) {
        self.inner.shortage_detected.set(i64::from(shortage));
    }

    pub fn set_history_samples(&self, samples: usize) {
        self.inner.history_samples.set(samples as i64);
    }

    pub fn set_queue_depth(&self, depth: usize) {
        self.inner.queue_depth.set(depth as i64);
    }

    /// Record one reconcile duration
    pub fn observe_reconcile_latency(&self, duration_secs: f64) {
        self.inner.reconcile_latency_seconds.observe(duration_secs);
    }
}

/// Structured logger for agent events
///
/// Every event carries a stable `event` field so log pipelines can key on it.
#[derive(Clone)]
pub struct StructuredLogger {
    node_name: String,
}

impl StructuredLogger {
    pub fn new(node_name: impl Into<String>) -> Self {
        Self {
            node_name: node_name.into(),
        }
    }

    /// Log agent startup
    pub fn log_startup(&self, version: &str, metrics_source: &str) {
        info!(
            event = "agent_started",
            node = %self.node_name,
            agent_version = %version,
            metrics_source = %metrics_source,
            "Swap guard agent started"
        );
    }

    /// Log agent shutdown
    pub fn log_shutdown(&self, reason: &str) {
        info!(
            event = "agent_shutdown",
            node = %self.node_name,
            reason = %reason,
            "Swap guard agent shutting down"
        );
    }

    pub fn log_shortage(&self, high_traffic: bool, high_utilization: bool) {
        warn!(
            event = "shortage_detected",
            node = %self.node_name,
            high_traffic = high_traffic,
            high_utilization = high_utilization,
            "Memory shortage detected"
        );
    }

    pub fn log_taint_added(&self, taint_key: &str) {
        info!(
            event = "taint_added",
            node = %self.node_name,
            taint_key = %taint_key,
            "Node entered evicting state"
        );
    }

    pub fn log_taint_removed(&self, taint_key: &str) {
        info!(
            event = "taint_removed",
            node = %self.node_name,
            taint_key = %taint_key,
            "Node left evicting state"
        );
    }

    /// Log a successful eviction
    pub fn log_pod_evicted(&self, namespace: &str, pod_name: &str) {
        info!(
            event = "pod_evicted",
            node = %self.node_name,
            namespace = %namespace,
            pod_name = %pod_name,
            "Evicted pod to relieve memory pressure"
        );
    }

    pub fn log_eviction_failed(&self, namespace: &str, pod_name: &str, error: &str) {
        warn!(
            event = "eviction_failed",
            node = %self.node_name,
            namespace = %namespace,
            pod_name = %pod_name,
            error = %error,
            "Pod eviction failed"
        );
    }

    /// Log a container swap limit write
    pub fn log_swap_limit_set(
        &self,
        namespace: &str,
        pod_name: &str,
        container: &str,
        swap_limit_bytes: u64,
    ) {
        info!(
            event = "swap_limit_set",
            node = %self.node_name,
            namespace = %namespace,
            pod_name = %pod_name,
            container = %container,
            swap_limit_bytes = swap_limit_bytes,
            "Container swap limit updated"
        );
    }
}
