//! Firework node agent binary.
//!
//! Runs on each host: polls the configuration store for this node's
//! descriptor and converges the local microVM population toward it.

use std::path::PathBuf;
use std::sync::Arc;

use anyhow::Result;
use clap::Parser;
use firework_store::DirStore;
use tokio::signal::unix::{signal, SignalKind};
use tokio::sync::watch;
use tracing::info;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

use firework_agent::{Agent, AgentConfig};

#[derive(Debug, Parser)]
#[command(name = "firework-agent", about = "Per-node microVM reconciliation agent")]
struct Args {
    /// Path to the agent configuration file.
    #[arg(long, default_value = "/etc/firework/agent.yaml")]
    config: PathBuf,
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();
    let cfg = AgentConfig::load(&args.config)?;

    tracing_subscriber::registry()
        .with(
            EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| EnvFilter::new(cfg.log_level.clone())),
        )
        .with(tracing_subscriber::fmt::layer().json())
        .init();

    info!(
        node = %cfg.node_name,
        store_dir = %cfg.store_dir.display(),
        "starting firework agent"
    );

    let store = Arc::new(DirStore::new(&cfg.store_dir));

    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    tokio::spawn(async move {
        let mut term = match signal(SignalKind::terminate()) {
            Ok(term) => term,
            Err(e) => {
                tracing::error!(error = %e, "failed to install SIGTERM handler");
                return;
            }
        };
        tokio::select! {
            _ = tokio::signal::ctrl_c() => {}
            _ = term.recv() => {}
        }
        info!("shutdown signal received");
        let _ = shutdown_tx.send(true);
    });

    let agent = Agent::new(cfg, store).await?;
    agent.run(shutdown_rx).await
}
