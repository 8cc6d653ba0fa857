use std::{net::SocketAddr, path::PathBuf};

use anyhow::Result;
use clap::Parser;
use fx_control_plane::config::Config;

#[derive(Parser, Debug)]
#[command(about = "Serverless control plane: permissions, task scheduling and invocation dispatch")]
struct Args {
    /// Overrides CONTROL_PLANE_BIND_ADDR.
    #[arg(long)]
    bind_addr: Option<SocketAddr>,
    /// Overrides CONTROL_PLANE_SEED_PATH.
    #[arg(long)]
    seed: Option<PathBuf>,
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();
    let mut config = Config::from_env()?;
    if let Some(bind_addr) = args.bind_addr {
        config.bind_addr = bind_addr;
    }
    if let Some(seed) = args.seed {
        config.seed_path = Some(seed);
    }

    let filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new(&config.log_filter));
    if config.log_json {
        tracing_subscriber::fmt()
            .with_env_filter(filter)
            .json()
            .init();
    } else {
        tracing_subscriber::fmt().with_env_filter(filter).init();
    }

    fx_control_plane::serve(config).await
}
