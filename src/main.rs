//! Image Relay Server
//!
//! Loads configuration, sets up logging, and starts the HTTP front end.

use anyhow::Context;
use image_relay::{RelayConfig, RelayServer};
use std::env;
use std::sync::Arc;
use tracing::{error, info};

/// Main entry point for the image relay server
///
/// # Usage
/// ```bash
/// # Start with default config (image_relay.yaml)
/// cargo run
///
/// # Start with custom config
/// cargo run -- /path/to/config.yaml
/// ```
#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let config_path = env::args()
        .nth(1)
        .unwrap_or_else(|| "image_relay.yaml".to_string());

    let config = RelayConfig::from_file(&config_path)
        .with_context(|| format!("Failed to load configuration from {}", config_path))?;

    let level = if config.debug {
        tracing::Level::DEBUG
    } else {
        tracing::Level::INFO
    };
    tracing_subscriber::fmt()
        .with_max_level(level)
        .with_target(false)
        .with_thread_ids(true)
        .with_line_number(true)
        .init();

    info!("Starting image relay");
    info!("Configuration loaded from: {}", config_path);
    info!("  - Listen address: {}", config.listen_address);
    info!("  - Loaders: {}", backend_kinds(&config.loaders));
    info!("  - Storages: {}", backend_kinds(&config.storages));
    info!("  - Result storages: {}", backend_kinds(&config.result_storages));
    info!("  - Request timeout: {}s", config.request_timeout_secs);
    info!("  - Process concurrency: {}", config.process_concurrency);
    info!("  - Unsafe requests allowed: {}", config.allow_unsafe);

    let addr = config.socket_addr()?;
    let orchestrator = Arc::new(config.build_orchestrator()?);
    orchestrator.startup().await?;

    let server = RelayServer::new(Arc::clone(&orchestrator), addr);
    tokio::select! {
        result = server.start() => {
            if let Err(e) = result {
                error!("Server error: {}", e);
            }
        }
        _ = tokio::signal::ctrl_c() => {
            info!("Shutdown signal received");
        }
    }

    if let Err(e) = orchestrator.shutdown().await {
        error!("Shutdown error: {}", e);
    }
    info!("Image relay stopped");
    Ok(())
}

fn backend_kinds(backends: &[image_relay::BackendConfig]) -> String {
    if backends.is_empty() {
        return "none".to_string();
    }
    backends
        .iter()
        .map(|b| b.kind())
        .collect::<Vec<_>>()
        .join(", ")
}
