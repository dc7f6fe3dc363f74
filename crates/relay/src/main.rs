use std::sync::Arc;

use clap::Parser;
use tokio::sync::RwLock;
use tracing::error;

use hail_common::config::{load_config, RelayConfig};

use crate::server::RelayServer;
use crate::state::RelayState;

mod dispatch;
mod errors;
mod registry;
mod rides;
mod server;
mod state;
mod status;

#[derive(Parser, Debug)]
#[command(name = "hail-relay")]
struct Args {
    #[arg(long, default_value = "config/relay.toml")]
    config: String,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info")),
        )
        .init();

    let args = Args::parse();
    let config: RelayConfig = load_config(&args.config)?;
    let state = Arc::new(RwLock::new(RelayState::new()));

    let status_addr = config.status_addr.clone();
    let status_state = Arc::clone(&state);
    tokio::spawn(async move {
        if let Err(err) = status::serve(status_addr, status_state).await {
            error!("status endpoint failed: {err}");
        }
    });

    let server = RelayServer::new(config, state);
    server.run().await
}
