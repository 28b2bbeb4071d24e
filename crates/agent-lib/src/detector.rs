//! Memory shortage detection
//!
//! A node is short on memory when it is either swapping heavily in both
//! directions (averaged over a window of samples) or its working set plus
//! swap usage exceeds physical memory plus an allowance of swap.

use crate::error::{AgentError, Result};
use crate::metrics_source::MetricsSource;
use crate::models::Sample;
use crate::stats::StatsSampler;
use async_trait::async_trait;
use std::sync::Arc;
use std::time::Duration;
use tracing::debug;

/// Outcome of one detection pass
#[derive(Debug, Clone, Copy, Default, PartialEq)]
pub struct Verdict {
    pub high_traffic: bool,
    pub high_utilization: bool,
    pub swap_in_rate: f64,
    pub swap_out_rate: f64,
}

impl Verdict {
    pub fn is_shortage(&self) -> bool {
        self.high_traffic || self.high_utilization
    }
}

#[async_trait]
pub trait ShortageDetector: Send + Sync {
    /// Evaluate both shortage conditions against current data
    async fn evaluate(&self) -> Result<Verdict>;

    /// Whether the node should evict a pod this cycle
    async fn should_evict(&self) -> Result<bool> {
        Ok(self.evaluate().await?.is_shortage())
    }
}

/// Thresholds for shortage detection
#[derive(Debug, Clone)]
pub struct DetectorConfig {
    pub max_average_swap_in_pages_per_second: f64,
    pub max_average_swap_out_pages_per_second: f64,
    /// Fraction of total swap counted as usable capacity, in (0, 1]
    pub swap_utilization_threshold_factor: f64,
    pub average_window: Duration,
    /// Minimum age of the averaging baseline relative to the newest sample
    pub min_sample_interval: Duration,
}

impl Default for DetectorConfig {
    fn default() -> Self {
        Self {
            max_average_swap_in_pages_per_second: 1000.0,
            max_average_swap_out_pages_per_second: 1000.0,
            swap_utilization_threshold_factor: 0.8,
            average_window: Duration::from_secs(30),
            min_sample_interval: Duration::from_secs(5),
        }
    }
}

/// Detector over the sampler history and a metrics source
pub struct SwapShortageDetector {
    sampler: Arc<StatsSampler>,
    metrics: Arc<dyn MetricsSource>,
    config: DetectorConfig,
}

impl SwapShortageDetector {
    pub fn new(
        sampler: Arc<StatsSampler>,
        metrics: Arc<dyn MetricsSource>,
        config: DetectorConfig,
    ) -> Self {
        Self {
            sampler,
            metrics,
            config,
        }
    }

    /// Pick the averaging baseline for `history[0]`
    ///
    /// Walks back from the newest sample, keeping the oldest sample at least
    /// `min_interval` old, and stops at the first one at least `window` old.
    pub fn find_baseline<'a>(
        history: &'a [Sample],
        min_interval: Duration,
        window: Duration,
    ) -> Option<&'a Sample> {
        let newest = history.first()?;
        let min_ms = min_interval.as_millis() as i64;
        let window_ms = window.as_millis() as i64;

        let mut baseline = None;
        for sample in history.iter().skip(1) {
            let age_ms = (newest.time - sample.time).num_milliseconds();
            if age_ms >= min_ms {
                baseline = Some(sample);
            }
            if age_ms >= window_ms {
                break;
            }
        }
        baseline
    }

    /// Average (swap-in, swap-out) pages per second between two samples
    pub fn swap_rates(newest: &Sample, baseline: &Sample) -> (f64, f64) {
        let seconds = (newest.time - baseline.time).num_milliseconds() as f64 / 1000.0;
        if seconds <= 0.0 {
            return (0.0, 0.0);
        }
        let swap_in = newest.swap_in.saturating_sub(baseline.swap_in) as f64 / seconds;
        let swap_out = newest.swap_out.saturating_sub(baseline.swap_out) as f64 / seconds;
        (swap_in, swap_out)
    }
}

#[async_trait]
impl ShortageDetector for SwapShortageDetector {
    async fn evaluate(&self) -> Result<Verdict> {
        let history = self.sampler.history().await;
        if history.len() < 2 {
            return Err(AgentError::InsufficientData);
        }

        let baseline = Self::find_baseline(
            &history,
            self.config.min_sample_interval,
            self.config.average_window,
        )
        .ok_or(AgentError::InsufficientData)?;

        let (swap_in_rate, swap_out_rate) = Self::swap_rates(&history[0], baseline);
        let high_traffic = swap_in_rate > self.config.max_average_swap_in_pages_per_second
            && swap_out_rate > self.config.max_average_swap_out_pages_per_second;

        let node = self.metrics.root_summary().await?;
        let capacity = node.total_memory_bytes as f64
            + self.config.swap_utilization_threshold_factor * node.total_swap_bytes as f64;
        let used = node.used_virtual_memory_bytes();
        let high_utilization = used as f64 > capacity;

        debug!(
            swap_in_rate,
            swap_out_rate,
            used_virtual_memory_bytes = used,
            capacity_bytes = capacity as u64,
            high_traffic,
            high_utilization,
            "Shortage detection pass"
        );

        Ok(Verdict {
            high_traffic,
            high_utilization,
            swap_in_rate,
            swap_out_rate,
        })
    }
}
