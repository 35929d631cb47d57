//! convotalk-relay
//!
//! Coordinating server: WebSocket event bus, presence broadcast and call
//! signaling relay. Configured through `RELAY_ADDR` / `RELAY_HISTORY_LIMIT`.

use anyhow::Context;
use convotalk_lib::config::RelayConfig;
use convotalk_lib::hub::RelayHub;
use tokio::net::TcpListener;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    convotalk_lib::init_tracing();
    tracing::info!("Starting convotalk relay v{}", env!("CARGO_PKG_VERSION"));

    let config = RelayConfig::from_env().context("invalid relay configuration")?;
    tracing::info!(?config, "Loaded configuration");
    let listener = TcpListener::bind(config.listen_addr)
        .await
        .with_context(|| format!("failed to bind {}", config.listen_addr))?;

    let hub = RelayHub::new(&config);

    tokio::select! {
        result = hub.serve(listener) => result.context("relay listener failed")?,
        _ = tokio::signal::ctrl_c() => {
            tracing::info!("Shutting down relay");
        }
    }

    Ok(())
}
