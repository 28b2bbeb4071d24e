//! Bounded, newest-first history of node swap/memory samples

use super::procfs::SystemStatsSource;
use crate::error::Result;
use crate::health::{components, HealthRegistry};
use crate::models::Sample;
use std::collections::VecDeque;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{broadcast, RwLock};
use tokio::time::{interval, MissedTickBehavior};
use tracing::{debug, info, warn};

/// Maximum number of samples kept in history
pub const DEFAULT_HISTORY_CAPACITY: usize = 10_000;

/// Periodically records system swap counters into a bounded ring
///
/// Index 0 of the history is always the most recent sample. Every read,
/// append and flush holds the lock for its full duration.
pub struct StatsSampler {
    source: Arc<dyn SystemStatsSource>,
    history: RwLock<VecDeque<Sample>>,
    capacity: usize,
}

impl StatsSampler {
    pub fn new(source: Arc<dyn SystemStatsSource>) -> Self {
        Self::with_capacity(source, DEFAULT_HISTORY_CAPACITY)
    }

    pub fn with_capacity(source: Arc<dyn SystemStatsSource>, capacity: usize) -> Self {
        Self {
            source,
            history: RwLock::new(VecDeque::with_capacity(capacity.min(1024))),
            capacity: capacity.max(1),
        }
    }

    /// Read the current counters and prepend them to the history
    pub async fn sample(&self) -> Result<()> {
        let stats = self.source.read().await?;
        self.record(Sample {
            time: chrono::Utc::now(),
            swap_in: stats.swap_in_pages,
            swap_out: stats.swap_out_pages,
            swap_used_bytes: stats.memory.swap_used(),
            available_memory_bytes: stats.memory.mem_available,
            inactive_file_bytes: stats.memory.inactive_file,
        })
        .await;
        Ok(())
    }

    /// Prepend a sample, dropping the oldest entries past capacity
    pub async fn record(&self, sample: Sample) {
        let mut history = self.history.write().await;
        history.push_front(sample);
        history.truncate(self.capacity);
    }

    /// Snapshot of the history, newest first
    pub async fn history(&self) -> Vec<Sample> {
        self.history.read().await.iter().cloned().collect()
    }

    pub async fn len(&self) -> usize {
        self.history.read().await.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.history.read().await.is_empty()
    }

    /// Drop every recorded sample
    pub async fn reset(&self) {
        self.history.write().await.clear();
    }

    /// Sample on a fixed period until shutdown
    ///
    /// A failed read is logged and the tick skipped, leaving a gap in history.
    pub async fn run(
        self: Arc<Self>,
        period: Duration,
        health: HealthRegistry,
        mut shutdown: broadcast::Receiver<()>,
    ) {
        info!(period_ms = period.as_millis() as u64, "Starting stats sampler");

        let mut ticker = interval(period);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

        loop {
            tokio::select! {
                _ = ticker.tick() => {
                    let result = self.sample().await;
                    if let Err(e) = &result {
                        warn!(error = %e, "Failed to sample system stats");
                    } else {
                        debug!("Recorded system stats sample");
                    }
                    health.report(components::SAMPLER, result).await;
                }
                _ = shutdown.recv() => {
                    info!("Shutting down stats sampler");
                    break;
                }
            }
        }
    }
}
