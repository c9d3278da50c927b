//! ring-store node
//!
//! Composition root: reads the environment, binds one ring member and runs
//! it until the process is told to stop.

use ring_store::config::load_config;
use ring_store::infrastructure::{shutdown_signal, SystemClock};
use ring_store::replication::Coordinator;
use std::sync::Arc;
use tracing_subscriber::fmt::format::FmtSpan;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Load configuration from environment
    let cfg = load_config()?;

    // Setup logging
    let log_level = if cfg.debug {
        tracing::Level::DEBUG
    } else {
        tracing::Level::INFO
    };

    tracing_subscriber::fmt()
        .with_max_level(log_level)
        .with_span_events(FmtSpan::CLOSE)
        .init();

    let replication = cfg.replication_config()?;
    let join_addr = replication.join_addr.clone();

    let node = Coordinator::bind(replication, Arc::new(SystemClock::new()))?;
    tracing::info!(
        "starting ring-store node={} addr={} redundancy={}",
        cfg.node_id,
        node.addr(),
        cfg.redundancy
    );

    node.start()?;

    if let Some(seed) = join_addr {
        node.join(&seed).await?;
        tracing::info!("joined ring via {}", seed);
    }

    shutdown_signal().await;
    node.stop();

    Ok(())
}
