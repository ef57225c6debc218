//! Relay process entry point.
//!
//! Reads configuration from the environment, connects to the bus/KV
//! broker, and serves until SIGINT or SIGTERM. Shutdown persists every
//! resident room before the listener closes and the broker connections
//! drop.

use std::sync::Arc;

use collab_relay::bus::RedisTransport;
use collab_relay::config::RelayConfig;
use collab_relay::server::RelayServer;

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error + Send + Sync>> {
    env_logger::init();

    let config = RelayConfig::from_env();
    let transport = Arc::new(RedisTransport::connect(&config.redis_url).await?);

    let listener = tokio::net::TcpListener::bind(("0.0.0.0", config.port)).await?;
    log::info!(
        "relay listening on {} (instance {})",
        listener.local_addr()?,
        config.instance_id
    );

    let server = RelayServer::new(config, transport.clone(), transport);
    server.run(listener, shutdown_signal()).await?;

    log::info!("shutdown complete");
    Ok(())
}

/// Resolves on SIGINT or SIGTERM.
async fn shutdown_signal() {
    let ctrl_c = tokio::signal::ctrl_c();

    #[cfg(unix)]
    {
        let mut terminate = tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate())
            .expect("failed to install SIGTERM handler");
        tokio::select! {
            _ = ctrl_c => {}
            _ = terminate.recv() => {}
        }
    }
    #[cfg(not(unix))]
    {
        let _ = ctrl_c.await;
    }

    log::info!("termination signal received");
}
