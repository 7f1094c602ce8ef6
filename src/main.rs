use std::net::SocketAddr;
use std::str::FromStr;

use anyhow::{Context, Result};
use clap::Parser;
use tokio::time::Duration;
use tracing::{info, warn};
use tracing_subscriber::{fmt, EnvFilter};

use ringvault::{Identity, Keypair, Node, NodeConfig, Outcome, PeerRecord};

#[derive(Clone, Debug)]
struct BootstrapPeer {
    addr: SocketAddr,
    identity: Identity,
}

impl FromStr for BootstrapPeer {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Self> {
        let (addr_part, id_part) = s
            .rsplit_once('/')
            .context("bootstrap peer must include Identity (format: IP:PORT/IDENTITY)")?;

        let addr: SocketAddr = addr_part.parse().context("invalid socket address")?;
        let identity = Identity::from_hex(id_part)
            .context("Identity must be 64 hex characters (32 bytes)")?;

        Ok(BootstrapPeer { addr, identity })
    }
}

#[derive(Parser, Debug)]
#[command(name = "ringvault")]
#[command(author, version, about, long_about = None)]
struct Args {
    #[arg(short, long, default_value = "0.0.0.0:0")]
    bind: SocketAddr,

    #[arg(short = 'B', long = "bootstrap", value_name = "PEER")]
    bootstrap: Vec<BootstrapPeer>,

    /// Ring width in bits.
    #[arg(long, default_value_t = ringvault::DEFAULT_RING_BITS)]
    ring_bits: u8,

    /// Nodes that hold each address.
    #[arg(short, long, default_value_t = ringvault::DEFAULT_REDUNDANCY)]
    redundancy: usize,

    /// Upper bound on request-handling workers.
    #[arg(short, long, default_value_t = ringvault::DEFAULT_MAX_WORKERS)]
    workers: usize,

    /// Seconds between telemetry lines; 0 disables them.
    #[arg(short, long, default_value = "300")]
    telemetry_interval: u64,
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();

    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));

    fmt()
        .with_env_filter(filter)
        .with_target(true)
        .with_thread_ids(false)
        .with_file(false)
        .with_line_number(false)
        .with_writer(std::io::stderr)
        .init();

    if args.ring_bits == 0 || args.ring_bits > ringvault::MAX_RING_BITS {
        anyhow::bail!("ring bits must be between 1 and {}", ringvault::MAX_RING_BITS);
    }
    let defaults = NodeConfig::default();
    let config = NodeConfig {
        ring_bits: args.ring_bits,
        redundancy: args.redundancy.max(1),
        max_workers: args.workers.max(1),
        min_workers: defaults.min_workers.min(args.workers.max(1)),
        telemetry_interval: (args.telemetry_interval > 0)
            .then(|| Duration::from_secs(args.telemetry_interval)),
        ..defaults
    };

    let keypair = Keypair::generate();
    let node = Node::bind(config, &keypair, args.bind).await?;
    info!("Node identity: {}", node.identity());
    info!("Listening on {}", node.record().endpoint);

    for peer in &args.bootstrap {
        info!("Bootstrapping from {}/{}", peer.addr, peer.identity.short());
        let accessed = node.bootstrap(PeerRecord::new(peer.identity, peer.addr)).await;
        match accessed.outcome {
            Outcome::Success => info!(peers = accessed.peers.len(), "Bootstrap complete"),
            outcome => warn!(?outcome, "Bootstrap failed"),
        }
    }

    // Graceful shutdown on Ctrl+C
    if let Err(e) = tokio::signal::ctrl_c().await {
        warn!(error = %e, "failed to listen for shutdown signal");
    }
    info!("Received shutdown signal, exiting gracefully");
    node.shutdown().await;

    Ok(())
}
