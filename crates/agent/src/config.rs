//! Agent configuration

use agent_lib::detector::DetectorConfig;
use agent_lib::eviction::EvictionControllerConfig;
use agent_lib::metrics_source::MetricsSourceKind;
use agent_lib::swap::{NodeCapacity, SwapManagerConfig};
use anyhow::{ensure, Context, Result};
use serde::Deserialize;
use std::path::PathBuf;
use std::time::Duration;

const CONFIG_FILE: &str = "/etc/swapguard/agent";
const SERVICE_ACCOUNT_NAMESPACE: &str = "/var/run/secrets/kubernetes.io/serviceaccount/namespace";

/// Agent configuration
#[derive(Debug, Clone, Deserialize)]
pub struct AgentConfig {
    /// Node name from Kubernetes downward API
    #[serde(default = "default_node_name")]
    pub node_name: String,

    /// Namespace the agent runs in; its pods are never evicted
    #[serde(default = "default_namespace")]
    pub namespace: String,

    /// API server port for health/metrics
    #[serde(default = "default_api_port")]
    pub api_port: u16,

    #[serde(default = "default_max_swap_rate")]
    pub max_average_swap_in_pages_per_second: f64,

    #[serde(default = "default_max_swap_rate")]
    pub max_average_swap_out_pages_per_second: f64,

    /// Share of node swap that may be used before memory is considered overcommitted
    #[serde(default = "default_swap_utilization_threshold_factor")]
    pub swap_utilization_threshold_factor: f64,

    #[serde(default = "default_average_window_size")]
    pub average_window_size_seconds: u64,

    #[serde(default = "default_min_sample_interval")]
    pub min_sample_interval_seconds: u64,

    #[serde(default = "default_sample_interval")]
    pub sample_interval_secs: u64,

    #[serde(default = "default_eviction_resync")]
    pub eviction_resync_secs: u64,

    #[serde(default = "default_swap_resync")]
    pub swap_resync_secs: u64,

    #[serde(default = "default_swap_workers")]
    pub swap_workers: usize,

    /// Namespace prefixes that are never evicted and never get swap
    #[serde(default = "default_excluded_namespace_prefixes")]
    pub excluded_namespace_prefixes: Vec<String>,

    #[serde(default = "default_eviction_taint_key")]
    pub eviction_taint_key: String,

    /// `cgroup` or `node`
    #[serde(default = "default_metrics_source")]
    pub metrics_source: String,

    #[serde(default = "default_host_proc_path")]
    pub host_proc_path: PathBuf,

    #[serde(default = "default_cgroup_root")]
    pub cgroup_root: PathBuf,

    /// Container runtime CRI socket
    #[serde(default = "default_cri_socket")]
    pub cri_socket: PathBuf,

    #[serde(default = "default_cache_sync_timeout")]
    pub cache_sync_timeout_secs: u64,
}

fn default_node_name() -> String {
    std::env::var("NODE_NAME").unwrap_or_else(|_| "unknown".to_string())
}

fn default_namespace() -> String {
    std::env::var("POD_NAMESPACE")
        .ok()
        .or_else(|| {
            std::fs::read_to_string(SERVICE_ACCOUNT_NAMESPACE)
                .ok()
                .map(|ns| ns.trim().to_string())
        })
        .filter(|ns| !ns.is_empty())
        .unwrap_or_else(|| "swapguard".to_string())
}

fn default_api_port() -> u16 {
    8080
}

fn default_max_swap_rate() -> f64 {
    1000.0
}

fn default_swap_utilization_threshold_factor() -> f64 {
    0.8
}

fn default_average_window_size() -> u64 {
    30
}

fn default_min_sample_interval() -> u64 {
    5
}

fn default_sample_interval() -> u64 {
    1
}

fn default_eviction_resync() -> u64 {
    5
}

fn default_swap_resync() -> u64 {
    20
}

fn default_swap_workers() -> usize {
    1
}

fn default_excluded_namespace_prefixes() -> Vec<String> {
    vec!["openshift".to_string(), "kube-system".to_string()]
}

fn default_eviction_taint_key() -> String {
    "swapguard.io/evicting".to_string()
}

fn default_metrics_source() -> String {
    "cgroup".to_string()
}

fn default_host_proc_path() -> PathBuf {
    PathBuf::from("/host/proc")
}

fn default_cgroup_root() -> PathBuf {
    PathBuf::from("/host/sys/fs/cgroup")
}

fn default_cri_socket() -> PathBuf {
    PathBuf::from("/host/var/run/crio/crio.sock")
}

fn default_cache_sync_timeout() -> u64 {
    10
}

/// `SWAPGUARD_*` environment source; list values are comma separated
fn environment() -> config::Environment {
    config::Environment::with_prefix("SWAPGUARD")
        .try_parsing(true)
        .list_separator(",")
        .with_list_parse_key("excluded_namespace_prefixes")
}

impl AgentConfig {
    /// Load configuration from environment and config file
    pub fn load() -> Result<Self> {
        Self::from_sources(
            config::File::with_name(CONFIG_FILE).required(false),
            environment(),
        )
    }

    fn from_sources<F>(file: F, env: config::Environment) -> Result<Self>
    where
        F: config::Source + Send + Sync + 'static,
    {
        let config = config::Config::builder()
            .add_source(file)
            .add_source(env)
            .build()
            .context("failed to read configuration")?;

        let config: AgentConfig = config
            .try_deserialize()
            .context("invalid configuration")?;
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<()> {
        ensure!(
            self.swap_utilization_threshold_factor > 0.0
                && self.swap_utilization_threshold_factor <= 1.0,
            "swap_utilization_threshold_factor must be in (0, 1], got {}",
            self.swap_utilization_threshold_factor
        );
        ensure!(
            self.average_window_size_seconds >= self.min_sample_interval_seconds,
            "average_window_size_seconds ({}) must not be shorter than min_sample_interval_seconds ({})",
            self.average_window_size_seconds,
            self.min_sample_interval_seconds
        );
        ensure!(
            self.sample_interval_secs > 0
                && self.eviction_resync_secs > 0
                && self.swap_resync_secs > 0,
            "sample and resync intervals must be positive"
        );
        ensure!(self.swap_workers >= 1, "swap_workers must be at least 1");
        self.metrics_source_kind()?;
        Ok(())
    }

    pub fn metrics_source_kind(&self) -> Result<MetricsSourceKind> {
        Ok(self.metrics_source.parse()?)
    }

    pub fn detector_config(&self) -> DetectorConfig {
        DetectorConfig {
            max_average_swap_in_pages_per_second: self.max_average_swap_in_pages_per_second,
            max_average_swap_out_pages_per_second: self.max_average_swap_out_pages_per_second,
            swap_utilization_threshold_factor: self.swap_utilization_threshold_factor,
            average_window: Duration::from_secs(self.average_window_size_seconds),
            min_sample_interval: Duration::from_secs(self.min_sample_interval_seconds),
        }
    }

    pub fn eviction_config(&self) -> EvictionControllerConfig {
        EvictionControllerConfig {
            node_name: self.node_name.clone(),
            taint_key: self.eviction_taint_key.clone(),
            resync_period: Duration::from_secs(self.eviction_resync_secs),
            sample_period: Duration::from_secs(self.sample_interval_secs),
        }
    }

    pub fn swap_config(&self, capacity: NodeCapacity) -> SwapManagerConfig {
        SwapManagerConfig {
            node_name: self.node_name.clone(),
            excluded_namespace_prefixes: self.excluded_namespace_prefixes.clone(),
            proc_root: self.host_proc_path.clone(),
            cgroup_root: self.cgroup_root.clone(),
            resync_period: Duration::from_secs(self.swap_resync_secs),
            workers: self.swap_workers,
            capacity,
        }
    }

    pub fn cache_sync_timeout(&self) -> Duration {
        Duration::from_secs(self.cache_sync_timeout_secs)
    }
}
