mod api;
mod config;
mod credits;
mod dedup;
mod error;
mod geo;
mod models;
mod orchestrator;
mod pulse;
mod race;
mod rollup;
mod rpc;
mod vitality;

use std::net::SocketAddr;
use std::sync::Arc;

use clap::Parser;
use tracing::info;
use tracing_subscriber::EnvFilter;

use crate::config::{load_config, AppConfig};

/// CLI arguments
#[derive(Parser)]
#[command(name = "network-pulse", about = "Storage network pulse aggregator")]
struct Cli {
    /// Path to the TOML configuration file
    #[arg(long, default_value = "config.toml")]
    config: String,

    /// IP address to bind the server to
    #[arg(long)]
    listen_ip: Option<String>,

    /// Port to bind the server to
    #[arg(long)]
    port: Option<u16>,
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .init();

    let args = Cli::parse();
    let mut config: AppConfig = load_config(&args.config)?;

    // CLI flags win over the file
    if let Some(ip) = args.listen_ip {
        config.server.listen_ip = Some(ip);
    }
    if let Some(port) = args.port {
        config.server.port = Some(port);
    }

    let engine = Arc::new(config.build_engine()?);
    let _discovery = engine.start_background(config.discovery_interval());

    let app = api::router(Arc::clone(&engine));

    let ip = config
        .server
        .listen_ip
        .unwrap_or_else(|| "127.0.0.1".to_string());
    let port = config.server.port.unwrap_or(3000);
    let addr: SocketAddr = format!("{}:{}", ip, port).parse()?;

    info!(%addr, "network pulse listening");
    axum::Server::bind(&addr)
        .serve(app.into_make_service())
        .await?;

    Ok(())
}
