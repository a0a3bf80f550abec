use anyhow::{bail, Result};
use clap::{Args, Parser, Subcommand};
use std::net::IpAddr;
use std::path::PathBuf;
use std::time::Duration;
use synapse::Identity;
use tracing::info;
use tracing_subscriber::EnvFilter;

mod api;
mod config;
mod node;
mod relay;
mod types;

use config::NodeConfig;

#[derive(Parser)]
#[command(name = "swarm-node", version, about = "Relay-assisted compute mesh")]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Run the signaling relay.
    Relay {
        #[arg(long, env = "SWARM_RELAY_PORT", default_value = "3001")]
        port: u16,
    },
    /// Join the mesh and serve the node API.
    Start(StartArgs),
    /// Write a fresh identity file and print its session id.
    Keygen {
        #[arg(long, default_value = "swarm-identity.json")]
        out: PathBuf,
        /// Overwrite an existing file.
        #[arg(long)]
        force: bool,
    },
}

#[derive(Args)]
struct StartArgs {
    #[arg(long, env = "SWARM_RELAY", default_value = "ws://127.0.0.1:3001/ws")]
    relay: String,

    #[arg(long, env = "SWARM_IDENTITY", default_value = "swarm-identity.json")]
    identity: PathBuf,

    /// Worker count; defaults to the number of logical CPUs.
    #[arg(long, env = "SWARM_WORKERS")]
    workers: Option<usize>,

    #[arg(long, env = "SWARM_HTTP_PORT", default_value = "3000")]
    http_port: u16,

    #[arg(long, default_value = "5000")]
    task_timeout_ms: u64,

    /// Address peer connections are accepted on.
    #[arg(long, default_value = "0.0.0.0")]
    bind: IpAddr,

    /// Addresses offered to peers as connection candidates.
    #[arg(long = "advertise-ip", default_value = "127.0.0.1")]
    advertise: Vec<IpAddr>,

    /// Directory whose filesystem is reported as storage.
    #[arg(long, default_value = ".")]
    storage_path: PathBuf,
}

impl From<StartArgs> for NodeConfig {
    fn from(args: StartArgs) -> Self {
        Self {
            relay_url: args.relay,
            identity_path: args.identity,
            workers: args
                .workers
                .unwrap_or_else(|| hive::PoolConfig::default().size),
            task_timeout: Duration::from_millis(args.task_timeout_ms),
            http_port: args.http_port,
            bind: args.bind,
            advertise: args.advertise,
            storage_path: args.storage_path,
        }
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| "info".into()))
        .init();

    let cli = Cli::parse();
    match cli.command {
        Commands::Relay { port } => relay::run_relay(port).await?,
        Commands::Start(args) => node::run_node(args.into()).await?,
        Commands::Keygen { out, force } => {
            if out.exists() && !force {
                bail!("{} already exists; pass --force to replace it", out.display());
            }
            let identity = Identity::generate();
            identity.save(&out)?;
            info!(path = %out.display(), "identity written");
            println!("{}", identity.session_id());
        }
    }
    Ok(())
}
