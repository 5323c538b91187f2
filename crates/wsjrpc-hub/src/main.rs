//! # wsjrpc-hub
//!
//! Hub binary: loads settings, starts the WebSocket hub, and runs until
//! Ctrl-C.

#![deny(unsafe_code)]

use anyhow::{Context, Result};
use clap::Parser;
use wsjrpc_logging::{LogFormat, LogLevel};
use wsjrpc_server::{HubServer, ServerConfig};
use wsjrpc_settings::WsjrpcSettings;

/// JSON-RPC hub over WebSocket.
#[derive(Parser, Debug)]
#[command(name = "wsjrpc-hub", about = "JSON-RPC hub over WebSocket")]
struct Cli {
    /// Host to bind (overrides settings).
    #[arg(long)]
    host: Option<String>,

    /// Port to bind, 0 for auto-assign (overrides settings).
    #[arg(long)]
    port: Option<u16>,

    /// Deadline for calls forwarded between peers, in milliseconds.
    #[arg(long)]
    call_timeout_ms: Option<u64>,

    /// Log level: trace, debug, info, warn, error.
    #[arg(long)]
    log_level: Option<String>,

    /// Log format: pretty or json.
    #[arg(long)]
    log_format: Option<String>,
}

impl Cli {
    /// Layer command-line flags over loaded settings.
    fn apply(&self, settings: &mut WsjrpcSettings) {
        if let Some(host) = &self.host {
            settings.server.host.clone_from(host);
        }
        if let Some(port) = self.port {
            settings.server.port = port;
        }
        if let Some(ms) = self.call_timeout_ms {
            settings.rpc.call_timeout_ms = ms;
        }
        if let Some(level) = &self.log_level {
            settings.logging.level = LogLevel::from_str_lossy(level);
        }
        if let Some(format) = &self.log_format {
            settings.logging.format = LogFormat::from_str_lossy(format);
        }
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Cli::parse();

    let mut settings = wsjrpc_settings::load_settings().context("Failed to load settings")?;
    args.apply(&mut settings);
    wsjrpc_logging::init_subscriber(settings.logging.level, settings.logging.format);

    let metrics_handle =
        wsjrpc_server::metrics::install_recorder().context("Failed to install metrics recorder")?;

    let server = HubServer::new(ServerConfig::from_settings(&settings), metrics_handle);
    let (addr, handle) = server.listen().await.context("Failed to bind hub")?;
    tracing::info!(%addr, "hub ready on ws://{addr}");

    tokio::signal::ctrl_c()
        .await
        .context("Failed to listen for ctrl-c")?;

    tracing::info!("shutting down");
    server.shutdown().graceful_shutdown(vec![handle], None).await;
    tracing::info!("shutdown complete");
    Ok(())
}
