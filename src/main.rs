#![forbid(unsafe_code)]

use anyhow::Result;
use meetsignal::config::ServerConfig;
use meetsignal::signaling::SignalingServer;
use tracing::info;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

#[tokio::main]
async fn main() -> Result<()> {
    // Initialize tracing
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "meetsignal=debug,tower_http=info".into()),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();

    info!("meetsignal - Starting server");

    let config = ServerConfig::from_env();
    info!(
        "Listening on {} (idle timeout {}s, {} msg/s per connection, channel capacity {})",
        config.listen_addr(),
        config.idle_timeout.as_secs(),
        config.rate_limit_per_sec,
        config.channel_capacity
    );
    if config.cors_origins.is_empty() {
        info!("CORS: any origin");
    } else {
        info!("CORS: {}", config.cors_origins.join(", "));
    }
    if config.metrics_token.is_none() {
        info!("METRICS_TOKEN not set - /metrics is open");
    }

    let signaling_server = SignalingServer::new(config);
    let handle = signaling_server.clone();

    // Run server with graceful shutdown
    tokio::select! {
        result = signaling_server.serve() => {
            if let Err(e) = result {
                tracing::error!("Signaling server error: {}", e);
            }
        }
        _ = tokio::signal::ctrl_c() => {
            info!("Received Ctrl+C, shutting down...");
            handle.shutdown().await;
        }
    }

    info!("Server shutdown complete");
    Ok(())
}
