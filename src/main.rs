//! Broadside Server
//!
//! Binary entry point: logging, configuration from the environment,
//! and the accept loop.

use tracing::info;
use tracing_subscriber::EnvFilter;

use broadside::{Server, ServerConfig, VERSION};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();

    let config = ServerConfig::from_env();
    info!("Broadside Server v{VERSION}");
    info!("Bind address: {}", config.bind_addr);
    info!(
        "Matchmaking window: {} | rating delta: {}",
        config.match_window, config.rating_delta
    );

    let server = Server::new(config)?;
    server.run().await?;
    Ok(())
}
