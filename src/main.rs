#![forbid(unsafe_code)]

use std::sync::Arc;

use anyhow::Result;
use clap::Parser;
use tokio::sync::mpsc;
use tracing::{error, info};

mod bridge;
mod cli;
mod config;
mod db;
mod matrix;
mod media;
mod message;
mod utils;
mod web;

use config::Config;
use web::WebServer;

#[tokio::main]
async fn main() -> Result<()> {
    let args = cli::Cli::parse();

    let mut config = Config::load_from_file(&args.config)?;
    if let Some(level) = args.log_level {
        config.logging.level = level;
    }
    utils::logging::init_tracing(&config.logging);
    let config = Arc::new(config);

    info!("matrix appservice bridge starting up");

    let db_manager = db::DatabaseManager::new(&config.database).await?;
    db_manager.migrate().await?;

    let (gateway_tx, mut gateway_rx) = mpsc::channel(256);
    let bridge = Arc::new(bridge::BridgeCore::new(
        config.clone(),
        db_manager,
        gateway_tx,
    )?);
    bridge.init().await?;

    let web_server = WebServer::new(config.clone(), bridge.clone())?;
    let web_handle = tokio::spawn(async move {
        if let Err(e) = web_server.start().await {
            error!("web server error: {}", e);
        }
    });

    // Outbound seam: an embedding gateway would take the receiver and feed
    // its own messages through `bridge.send`. Standalone, translated Matrix
    // traffic is drained here so the bus never backs up.
    let gateway_handle = tokio::spawn(async move {
        while let Some(msg) = gateway_rx.recv().await {
            info!(
                "=> gateway message channel={} event={:?} user={}",
                msg.channel, msg.event, msg.username
            );
        }
    });

    tokio::select! {
        _ = web_handle => {},
        _ = gateway_handle => {},
    }

    info!("matrix appservice bridge shutting down");
    Ok(())
}
