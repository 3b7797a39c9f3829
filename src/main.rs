// src/main.rs

//! The main entry point for the DriftMQ broker.

use anyhow::Result;
use driftmq::config::BrokerConfig;
use driftmq::core::metadata::MemoryMetadataStore;
use driftmq::server::BrokerServer;
use std::env;
use std::sync::Arc;
use tracing::info;
use tracing_subscriber::filter::EnvFilter;

#[tokio::main]
async fn main() -> Result<()> {
    const VERSION: &str = env!("CARGO_PKG_VERSION");

    let args: Vec<String> = env::args().collect();
    if args.contains(&"--version".to_string()) {
        println!("DriftMQ version {VERSION}");
        return Ok(());
    }

    let log_level = std::env::var("RUST_LOG").unwrap_or_else(|_| "info".to_string());
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::new(log_level))
        .compact()
        .with_ansi(true)
        .init();

    let config = match args.get(1) {
        Some(path) => BrokerConfig::from_file(path)?,
        None => {
            info!("no config file given, using defaults");
            BrokerConfig::default()
        }
    };

    info!("Starting DriftMQ broker v{VERSION}...");
    // The single-process broker runs against the in-memory metadata store;
    // clustered deployments plug an external store into BrokerServer.
    let meta = Arc::new(MemoryMetadataStore::new());
    let server = BrokerServer::start(config, meta).await?;

    tokio::signal::ctrl_c().await?;
    info!("shutdown signal received");
    server.shutdown().await;
    Ok(())
}
