//! Ledger gateway server binary

use anyhow::Context;
use ledger_gateway::{network::WebSocketClient, Config, Gateway};
use std::sync::Arc;
use std::time::Duration;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Initialize tracing
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::from_default_env()
                .add_directive(tracing::Level::INFO.into()),
        )
        .init();

    tracing::info!("Starting ledger gateway");

    // Load configuration
    let config = match std::env::var("GATEWAY_CONFIG") {
        Ok(path) => Config::from_file(&path)
            .with_context(|| format!("Failed to load config from {}", path))?,
        Err(_) => Config::from_env().context("Failed to load config from environment")?,
    };
    config.validate().context("Invalid configuration")?;

    let client = Arc::new(WebSocketClient::new(Duration::from_secs(
        config.network.request_timeout_secs,
    )));

    // Open gateway
    let gateway = Gateway::open(config, client)
        .await
        .context("Failed to open gateway")?;

    if let Err(e) = gateway.start().await {
        tracing::error!(error = %e, "Unable to reach the ledger network");
        gateway.shutdown().await?;
        return Err(e).context("Startup failed");
    }

    tracing::info!("Gateway started; waiting for ledger confirmation");

    // HTTP routes are served by the embedding application
    tokio::signal::ctrl_c().await?;

    tracing::info!("Shutting down ledger gateway");
    gateway.shutdown().await?;
    Ok(())
}
