//! stevedored - serves the image API over a Unix domain socket.

use std::path::PathBuf;
use std::sync::Arc;

use anyhow::Context;
use clap::Parser;
use tracing_subscriber::EnvFilter;

use stevedore_core::config::{stevedore_home, EngineConfig};
use stevedore_gateway::{GatewayServer, ImageService};

/// Stevedore image daemon
#[derive(Parser, Debug)]
#[command(name = "stevedored", version, about = "Stevedore image API server")]
struct Args {
    /// Path to the YAML configuration file
    #[arg(long)]
    config: Option<PathBuf>,

    /// Unix socket to listen on (overrides the configuration)
    #[arg(long)]
    socket: Option<PathBuf>,

    /// Image store directory (overrides the configuration)
    #[arg(long)]
    store_dir: Option<PathBuf>,

    /// Emit logs as JSON
    #[arg(long)]
    log_json: bool,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let args = Args::parse();

    let config_path = args
        .config
        .clone()
        .unwrap_or_else(|| stevedore_home().join("config.yaml"));
    let mut config = EngineConfig::load(&config_path)
        .with_context(|| format!("loading {}", config_path.display()))?;
    if let Some(socket) = args.socket {
        config.socket = socket;
    }
    if let Some(store_dir) = args.store_dir {
        config.store_dir = store_dir;
    }

    // Initialize tracing
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(config.log_level.as_filter()));
    if args.log_json {
        tracing_subscriber::fmt()
            .json()
            .with_env_filter(filter)
            .init();
    } else {
        tracing_subscriber::fmt().with_env_filter(filter).init();
    }

    tracing::info!(
        socket = %config.socket.display(),
        store = %config.store_dir.display(),
        registries = ?config.registries,
        "Starting stevedored"
    );

    let service = Arc::new(ImageService::from_config(&config).context("opening image store")?);
    let server = GatewayServer::new(config.socket.clone(), service);

    tokio::select! {
        result = server.serve() => result?,
        _ = tokio::signal::ctrl_c() => {
            tracing::info!("Shutting down");
        }
    }

    let _ = std::fs::remove_file(&config.socket);
    Ok(())
}
