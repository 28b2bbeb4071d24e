//! Swap guard agent binary

use anyhow::Result;
use swapguard_agent::{app, config::AgentConfig};
use tracing::info;
use tracing_subscriber::{fmt, prelude::*, EnvFilter};

#[tokio::main]
async fn main() -> Result<()> {
    // Initialize tracing with JSON output and env filter
    tracing_subscriber::registry()
        .with(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .with(fmt::layer().json())
        .init();

    info!("Starting swapguard-agent");

    let config = AgentConfig::load()?;
    info!(
        node_name = %config.node_name,
        namespace = %config.namespace,
        metrics_source = %config.metrics_source,
        "Agent configured"
    );

    app::run(config).await
}
