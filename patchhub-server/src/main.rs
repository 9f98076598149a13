//! patchhub server binary.
//!
//! Configuration comes from the environment (see `patchhub::config`).
//! Logging follows `RUST_LOG`, defaulting to `info`.

use log::{error, info};
use patchhub::{ServerConfig, SyncServer};
use tokio::net::TcpListener;

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info")).init();

    let config = ServerConfig::from_env()?;
    let server = SyncServer::new(config)?;
    let listener = TcpListener::bind(server.bind_addr()).await?;

    server
        .serve_until(listener, async {
            if let Err(e) = tokio::signal::ctrl_c().await {
                error!("Failed to listen for shutdown signal: {e}");
                std::future::pending::<()>().await;
            }
            info!("Shutdown signal received");
        })
        .await?;

    Ok(())
}
