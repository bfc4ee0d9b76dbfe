//! The Portage gateway node daemon

use std::path::PathBuf;
use std::sync::Arc;

use anyhow::Context;
use clap::Parser;
use tokio_util::sync::CancellationToken;
use tracing::info;
use tracing_subscriber::EnvFilter;

use portage_node::{NodeConfig, Supervisor};

#[derive(Parser)]
#[command(name = "portage-node", about = "Store-and-forward gateway node for private networks")]
struct Cli {
    /// Path to the TOML configuration file
    #[arg(short, long)]
    config: Option<PathBuf>,

    /// Override the data directory
    #[arg(long)]
    data_dir: Option<PathBuf>,

    /// Override the public gateway URL
    #[arg(long)]
    gateway_url: Option<String>,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| "info".into()))
        .init();

    let cli = Cli::parse();
    let mut config = match &cli.config {
        Some(path) => NodeConfig::load(path)
            .with_context(|| format!("loading configuration from {}", path.display()))?,
        None => NodeConfig::default(),
    };
    if let Some(data_dir) = cli.data_dir {
        config.data_dir = data_dir;
    }
    if let Some(gateway_url) = cli.gateway_url {
        config.gateway_url = gateway_url;
    }

    let supervisor = Arc::new(
        Supervisor::new(config)
            .await
            .context("initializing node state")?,
    );

    let shutdown = CancellationToken::new();
    let signal_token = shutdown.clone();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            info!("Interrupt received");
            signal_token.cancel();
        }
    });

    supervisor.run(shutdown).await.context("running node")?;
    Ok(())
}
