//! Line Chat Server - Entry Point
//!
//! Loads configuration, starts the ChatServer and runs until Ctrl+C.

use std::path::PathBuf;

use clap::Parser;
use tracing::{error, info};
use tracing_subscriber::EnvFilter;

use line_chat::{ChatServer, Protocol, ServerConfig};

#[derive(Parser, Debug)]
#[command(name = "line_chat")]
#[command(about = "Multi-client line chat server", long_about = None)]
struct Args {
    /// JSON configuration file
    #[arg(short, long)]
    config: Option<PathBuf>,

    /// Host address to bind (overrides the config file)
    #[arg(short = 'H', long)]
    host: Option<String>,

    /// Port to listen on (overrides the config file)
    #[arg(short, long)]
    port: Option<u16>,

    /// Serve WebSocket clients instead of raw TCP
    #[arg(long)]
    websocket: bool,
}

impl Args {
    fn into_config(self) -> Result<ServerConfig, line_chat::AppError> {
        let mut config = match &self.config {
            Some(path) => ServerConfig::from_json_file(path)?,
            None => ServerConfig::default(),
        };
        if let Some(host) = self.host {
            config.host = host;
        }
        if let Some(port) = self.port {
            config.port = port;
        }
        if self.websocket {
            config.protocol = Protocol::Websocket;
        }
        config.validate()?;
        Ok(config)
    }
}

async fn shutdown_signal() {
    if let Err(e) = tokio::signal::ctrl_c().await {
        error!("Failed to listen for Ctrl+C: {}", e);
        // Without a signal handler, run until killed
        std::future::pending::<()>().await;
    }
    info!("Ctrl+C received");
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    // Initialize logging with environment filter
    // Use RUST_LOG env var to control log level
    // e.g., RUST_LOG=debug or RUST_LOG=line_chat=trace
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("line_chat=info")),
        )
        .init();

    let config = Args::parse().into_config()?;
    let port = config.port;

    let mut server = ChatServer::new(config);
    if let Err(e) = server.run_until(port, shutdown_signal()).await {
        error!("Server failed: {}", e);
        return Err(e.into());
    }

    Ok(())
}
