//! Firework enricher binary.
//!
//! Reads user-authored service specs and tenant overlays from an input
//! tree, enriches them into per-node descriptors, and publishes the
//! descriptors to the configuration store directory. With a node
//! inventory, placement replaces node-type grouping.

use std::path::PathBuf;
use std::sync::Arc;

use anyhow::Result;
use clap::Parser;
use firework_scheduler::{NodeInventory, StaticInventory};
use tracing::info;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

use firework_enricher::resolver::{PeerResolver, StaticResolver};
use firework_enricher::{run, RunOptions};

#[derive(Debug, Parser)]
#[command(name = "firework-enricher", about = "Enrich service specs into node descriptors")]
struct Args {
    /// Directory holding defaults.yaml, services/, and tenants/.
    #[arg(long)]
    input_dir: PathBuf,

    /// Store directory to publish node descriptors into.
    #[arg(long)]
    output_dir: PathBuf,

    /// Node inventory file (list of instance_id + capacity entries).
    /// Enables scheduler placement instead of node-type grouping.
    #[arg(long)]
    nodes_file: Option<PathBuf>,

    /// Peer address file (instance id → private address map) used to
    /// resolve cross-node links.
    #[arg(long)]
    peers_file: Option<PathBuf>,

    /// Run the pipeline without publishing.
    #[arg(long)]
    dry_run: bool,
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::registry()
        .with(EnvFilter::try_from_default_env().unwrap_or_else(|_| "info".into()))
        .with(tracing_subscriber::fmt::layer().json())
        .init();

    let args = Args::parse();

    let inventory: Option<Arc<dyn NodeInventory>> = match &args.nodes_file {
        Some(path) => Some(Arc::new(StaticInventory::load(path)?)),
        None => None,
    };
    let resolver: Option<Arc<dyn PeerResolver>> = match &args.peers_file {
        Some(path) => Some(Arc::new(StaticResolver::load(path)?)),
        None => None,
    };

    let opts = RunOptions {
        input_dir: args.input_dir,
        output_dir: args.output_dir,
        inventory,
        resolver,
        dry_run: args.dry_run,
    };

    let outcome = run(&opts).await?;
    info!(
        node_descriptors = outcome.node_descriptors.len(),
        warnings = outcome.warnings.len(),
        "enrichment complete"
    );

    Ok(())
}
