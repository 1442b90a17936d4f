//! Aggregation node daemon.
//!
//! Attaches the kernel hooks for this node's position in the tree, keeps
//! them live, and logs datapath counters until interrupted. The training
//! process talks to the datapath through the fragment sender and the pinned
//! table, not through this daemon.

use std::path::PathBuf;
use std::time::Duration;

use agg_node::topology::Topology;
use agg_node::AggNode;
use anyhow::Result;
use clap::Parser;
use tracing::info;
use tracing_subscriber::EnvFilter;

#[derive(Parser, Debug)]
#[command(name = "aggd")]
#[command(about = "In-network gradient aggregation node daemon")]
struct Args {
    /// Topology description for this node
    #[arg(short, long, default_value = "topology.json")]
    config: PathBuf,

    /// Override the interface named in the topology
    #[arg(short, long)]
    interface: Option<String>,

    /// Compiled kernel object
    #[arg(long, default_value = agg_node::DEFAULT_OBJ_PATH)]
    object: PathBuf,

    /// bpffs directory for the pinned fragment table
    #[arg(long, default_value = agg_node::DEFAULT_PIN_DIR)]
    pin_dir: PathBuf,

    /// Seconds between stats reports (0 disables)
    #[arg(long, default_value = "2")]
    stats_interval: u64,
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();

    let args = Args::parse();

    let mut topology = Topology::from_file(&args.config)?;
    if let Some(interface) = args.interface {
        topology.interface = interface;
    }

    info!(
        "starting node {} as {:?} on {} ({} children, {} workers)",
        topology.host.id,
        topology.role(),
        topology.interface,
        topology.children.len(),
        topology.worker_num,
    );

    let node = AggNode::attach(&topology, &args.object, &args.pin_dir)?;

    if args.stats_interval > 0 {
        let mut ticker = tokio::time::interval(Duration::from_secs(args.stats_interval));
        loop {
            tokio::select! {
                _ = ticker.tick() => {
                    let s = node.stats()?;
                    info!(
                        seen = s.seen,
                        accepted = s.accepted,
                        finalized = s.finalized,
                        absorbed = s.absorbed,
                        forwarded_up = s.forwarded_up,
                        relay_hops = s.relay_hops,
                        local = s.local_redirects,
                        dropped = s.duplicate + s.stale + s.busy + s.malformed,
                        "datapath"
                    );
                }
                _ = tokio::signal::ctrl_c() => break,
            }
        }
    } else {
        tokio::signal::ctrl_c().await?;
    }

    info!("interrupt received, detaching");
    drop(node);
    Ok(())
}
