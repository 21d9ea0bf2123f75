//! Waypoint discovery daemon

use discovery_server::{Config, DiscoveryServer, LogFormat};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Configuration decides the log format, so it loads before tracing is up
    let config = match Config::load() {
        Ok(cfg) => cfg,
        Err(e) => {
            eprintln!("Configuration error: {}", e);
            eprintln!("Using default configuration");
            Config::default()
        }
    };

    common::logging::init_with(
        &config.logging.level,
        config.logging.format == LogFormat::Json,
    );

    tracing::info!(
        listen_addr = %config.server.listen_addr,
        "Waypoint discovery daemon starting"
    );

    let server = DiscoveryServer::new(config)?;
    server.run().await
}
