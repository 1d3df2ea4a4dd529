//! OCPP 1.6 Central System node
//!
//! Accepts charge point WebSocket connections, negotiates the `ocpp1.6`
//! subprotocol, and runs one engine session per connection.
//!
//! # Usage
//!
//! ```bash
//! # Listen on the default port (8000, or $PORT when set)
//! ocpp16-csms
//!
//! # Custom bind address and boot interval
//! ocpp16-csms --host 127.0.0.1 --port 9000 --heartbeat-interval 60
//! ```

use std::sync::Arc;

use clap::Parser;
use ocpp16_core::CentralSystem;
use tracing::{info, Level};
use tracing_subscriber::FmtSubscriber;

mod server;

/// OCPP 1.6 Central System
#[derive(Parser, Debug)]
#[command(author, version, about, long_about = None)]
struct Args {
    /// Bind address
    #[arg(long, default_value = "0.0.0.0")]
    host: String,

    /// Listen port (falls back to $PORT, then 8000)
    #[arg(short, long)]
    port: Option<u16>,

    /// Heartbeat interval advertised in BootNotification responses
    #[arg(long, default_value = "30")]
    heartbeat_interval: i32,

    /// Log level (trace, debug, info, warn, error)
    #[arg(short, long, default_value = "info")]
    log_level: String,
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    let args = Args::parse();

    let level = match args.log_level.as_str() {
        "trace" => Level::TRACE,
        "debug" => Level::DEBUG,
        "info" => Level::INFO,
        "warn" => Level::WARN,
        "error" => Level::ERROR,
        _ => Level::INFO,
    };

    let subscriber = FmtSubscriber::builder()
        .with_max_level(level)
        .with_target(false)
        .finish();
    tracing::subscriber::set_global_default(subscriber)?;

    let port = args
        .port
        .or_else(|| std::env::var("PORT").ok().and_then(|p| p.parse().ok()))
        .unwrap_or(8000);

    let central = Arc::new(
        CentralSystem::new().with_heartbeat_interval(args.heartbeat_interval),
    );

    // Periodic operator-facing summary of connected charge points.
    let registry = central.registry().clone();
    tokio::spawn(async move {
        let mut interval = tokio::time::interval(std::time::Duration::from_secs(60));
        interval.tick().await;
        loop {
            interval.tick().await;
            let identities = registry.identities().await;
            info!(connected = identities.len(), ?identities, "charge point summary");
        }
    });

    server::serve(central, &args.host, port).await?;
    Ok(())
}
