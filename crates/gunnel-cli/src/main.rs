//! Gunnel CLI: `gunnel server` runs a hub, `gunnel client` runs an agent.

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use gunnel_agent::{Agent, AgentConfig};
use gunnel_hub::{Hub, HubConfig};
use gunnel_metrics::MetricsRegistry;
use std::path::PathBuf;
use tokio_util::sync::CancellationToken;
use tracing::info;
use tracing_subscriber::EnvFilter;

#[derive(Parser, Debug)]
#[command(name = "gunnel", version)]
#[command(about = "Expose local services behind NAT at subdomain-addressable endpoints")]
struct Args {
    /// Log level (trace, debug, info, warn, error)
    #[arg(long, global = true, default_value = "info")]
    log_level: String,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Run the public hub (QUIC listener + HTTP front-end)
    Server {
        /// Hub configuration file (YAML)
        #[arg(long, short = 'c', default_value = "gunnel-server.yaml")]
        config: PathBuf,
    },
    /// Run an agent that exposes local backends through a hub
    Client {
        /// Agent configuration file (YAML)
        #[arg(long, short = 'c', default_value = "gunnel.yaml")]
        config: PathBuf,
    },
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();

    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(args.log_level.clone()));
    tracing_subscriber::fmt().with_env_filter(filter).init();

    rustls::crypto::ring::default_provider()
        .install_default()
        .ok();

    let shutdown = CancellationToken::new();
    spawn_signal_handler(shutdown.clone());

    match args.command {
        Command::Server { config } => run_server(&config, shutdown).await,
        Command::Client { config } => run_client(&config, shutdown).await,
    }
}

fn spawn_signal_handler(shutdown: CancellationToken) {
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            info!("received interrupt signal, shutting down");
            shutdown.cancel();
        }
    });
}

async fn run_server(config_path: &std::path::Path, shutdown: CancellationToken) -> Result<()> {
    let config = HubConfig::load(config_path)
        .with_context(|| format!("failed to load hub config from {}", config_path.display()))?;

    // The dashboard and ACME collaborators install their handlers through
    // `hub.manager()` before this point in a full deployment.
    let hub = Hub::new(config)?;
    hub.run(shutdown).await?;
    Ok(())
}

async fn run_client(config_path: &std::path::Path, shutdown: CancellationToken) -> Result<()> {
    let config = AgentConfig::load(config_path)
        .with_context(|| format!("failed to load agent config from {}", config_path.display()))?;

    let mut agent = Agent::new(config, MetricsRegistry::new());
    agent.run(shutdown).await?;
    Ok(())
}
