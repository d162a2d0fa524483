pub mod api;
pub mod config;
pub mod daemon;
pub mod node;
pub mod stubs;
pub mod transport;

use clap::{Parser, Subcommand};
use tracing::{error, info};
use tracing_subscriber::EnvFilter;

use crate::config::{DaemonConfig, DataLayout};

#[derive(Parser)]
#[command(name = "x0mesh")]
#[command(about = "Self-healing post-quantum mesh node")]
struct Cli {
    /// Emit logs as JSON.
    #[arg(long, global = true)]
    json_logs: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Run the mesh node in the foreground
    Run,
    /// Start the mesh node as a background daemon
    Start,
    /// Stop the background daemon
    Stop,
    /// Show daemon status and last reported state
    Status,
    /// Generate (or show) this node's identity and print its public keys
    Keygen,
}

fn init_tracing(json: bool) {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    if json {
        tracing_subscriber::fmt().with_env_filter(filter).json().init();
    } else {
        tracing_subscriber::fmt().with_env_filter(filter).init();
    }
}

fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();
    init_tracing(cli.json_logs);
    let layout = DataLayout::resolve();

    match cli.command {
        Commands::Run => {
            let config = DaemonConfig::load_or_init(&layout)?;
            daemon::claim_pid_file(&layout)?;
            let runtime = tokio::runtime::Runtime::new()?;
            let result = runtime.block_on(node::run_node(config, layout.clone()));
            daemon::release_pid_file(&layout);
            if let Err(e) = &result {
                error!(error = %e, "node exited with error");
            }
            result
        }
        Commands::Start => daemon::start(&layout),
        Commands::Stop => daemon::stop(&layout),
        Commands::Status => {
            daemon::status(&layout);
            Ok(())
        }
        Commands::Keygen => keygen(&layout),
    }
}

/// Create the identity if absent and print the public halves for peers'
/// trusted_peers configuration.
fn keygen(layout: &DataLayout) -> anyhow::Result<()> {
    use x0mesh_core::clock::{ClockSource, SystemClock};
    use x0mesh_core::identity::Identity;
    use x0mesh_core::pqc::PqcEngine;

    let config = DaemonConfig::load_or_init(layout)?;
    let engine = PqcEngine::new(&config.mesh.crypto).map_err(|e| anyhow::anyhow!(e))?;
    let identity = Identity::load_or_generate(
        &layout.identity(),
        &engine,
        config.mesh.crypto.rotation_interval_secs * 1_000,
        config.mesh.crypto.grace_period_secs * 1_000,
        SystemClock.now_ms(),
    )
    .map_err(|e| anyhow::anyhow!("identity init: {e}"))?;

    info!(node_id = %identity.node_id().to_hex(), "node id");
    println!("node_id           : {}", identity.node_id().to_hex());
    println!("sig_pubkey        : {}", hex::encode(&identity.sig_public().0));
    println!("classical_pubkey  : {}", hex::encode(identity.classical_public()));
    println!("epoch             : {}", identity.epoch());
    Ok(())
}
