//! # Sentinel Mesh Node Runtime
//!
//! Runs one security node: a coordinator or a worker, depending on
//! configuration.
//!
//! ## Startup Sequence
//!
//! 1. Install the tracing subscriber (`RUST_LOG`, default `info`)
//! 2. Load configuration (file, then `SENTINEL_*` overrides)
//! 3. Build the node with the TCP transport and the tracing alert logger.
//!    The runtime hosts the `logger` role only; other configured roles are
//!    dropped with a warning.
//! 4. Start, wait for Ctrl+C, stop
//!
//! ```bash
//! SENTINEL_NODE_TYPE=coordinator SENTINEL_ROLES=logger node-runtime
//! SENTINEL_COORDINATOR=127.0.0.1:5555 SENTINEL_PORT=5557 node-runtime
//! node-runtime /etc/sentinel/node.toml
//! ```

mod config;

use anyhow::{Context, Result};
use tracing::info;
use tracing_subscriber::{fmt, EnvFilter};

use mesh_coordination::SecurityNode;

#[tokio::main]
async fn main() -> Result<()> {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    fmt()
        .with_env_filter(filter)
        .with_target(true)
        .with_thread_ids(true)
        .try_init()
        .map_err(|e| anyhow::anyhow!("failed to install tracing subscriber: {e}"))?;

    let args: Vec<String> = std::env::args().collect();
    let config = config::load_config(&args, |key| std::env::var(key).ok())?;

    let node = SecurityNode::builder(config)
        .build()
        .context("failed to build security node")?;

    info!("===========================================");
    info!("  Sentinel Mesh Node v{}", env!("CARGO_PKG_VERSION"));
    info!("===========================================");

    node.start().await.context("failed to start node")?;

    let snapshot = node.snapshot();
    info!(
        node_id = %snapshot.node_id,
        node_type = %snapshot.node_type,
        roles = %snapshot.roles,
        message_address = node.message_address().as_deref().unwrap_or("-"),
        discovery_address = node.discovery_address().as_deref().unwrap_or("-"),
        "node is running, press Ctrl+C to stop"
    );

    tokio::signal::ctrl_c()
        .await
        .context("failed to listen for Ctrl+C")?;

    info!("shutdown requested");
    node.stop().await.context("failed to stop node")?;
    info!(node_id = %snapshot.node_id, "node stopped");

    Ok(())
}
