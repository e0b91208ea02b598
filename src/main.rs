//! telemsink: a TCP server that acknowledges framed telemetry packets.
//!
//! Remote devices stream self-delimited binary frames over TCP; the server
//! reassembles them, confirms every record of every packet with a response
//! frame, and aggregates throughput statistics across connections.
//!
//! Features:
//! - One session task per connection with idle and write deadlines
//! - Strictly ordered per-connection confirmations
//! - Windowed cross-connection statistics
//! - Graceful shutdown that drains active sessions
//! - Configuration via CLI arguments or TOML file

mod config;
mod protocol;
mod response;
mod sequence;
mod server;
mod session;
mod stats;

use config::Config;
use server::Server;
use tokio::sync::watch;
use tracing::{error, info};
use tracing_subscriber::EnvFilter;

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    // Load configuration
    let config = Config::load()?;

    // Initialize logging
    let filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(&config.log_level));

    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(false)
        .init();

    info!(
        listen = %config.listen,
        max_packets = ?config.max_packets,
        idle_timeout = config.idle_timeout,
        report_interval = config.report_interval,
        flush_interval = config.flush_interval,
        "Starting telemsink server"
    );

    // Ctrl-C flips the shutdown signal; the server drains and returns.
    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    tokio::spawn(async move {
        match tokio::signal::ctrl_c().await {
            Ok(()) => {
                info!("interrupt received, shutting down");
                let _ = shutdown_tx.send(true);
            }
            Err(e) => error!(error = %e, "failed to listen for shutdown signal"),
        }
    });

    let server = Server::new(config);
    server.run(shutdown_rx).await
}
