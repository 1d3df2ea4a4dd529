//! OCPP 1.6 charge point simulator
//!
//! Connects to a Central System, walks through a full charging session
//! (boot, status, authorize, start/stop transaction, meter values), then
//! heartbeats until disconnected. Reconnects with exponential backoff.
//!
//! # Usage
//!
//! ```bash
//! # Connect to a local central system as CP_1
//! ocpp16-cp --url ws://localhost:8000 --id CP_1
//!
//! # Custom vendor info
//! ocpp16-cp --id CP_2 --vendor MyVendor --model MyModel
//! ```

use std::time::Duration;

use clap::Parser;
use rand::Rng;
use tracing::{error, info, Level};
use tracing_subscriber::FmtSubscriber;

mod charge_point;

use charge_point::{ChargePoint, ChargePointConfig};

/// OCPP 1.6 charge point simulator
#[derive(Parser, Debug)]
#[command(author, version, about, long_about = None)]
struct Args {
    /// Central System WebSocket URL (charge point id is appended)
    #[arg(long, default_value = "ws://localhost:8000")]
    url: String,

    /// Charge point identity
    #[arg(long, default_value = "CP_1")]
    id: String,

    /// Vendor name for BootNotification
    #[arg(long, default_value = "MyVendor")]
    vendor: String,

    /// Model name for BootNotification
    #[arg(long, default_value = "MyModel")]
    model: String,

    /// Connector to report on
    #[arg(long, default_value = "1")]
    connector_id: i32,

    /// Request timeout in seconds
    #[arg(long, default_value = "30")]
    request_timeout: u64,

    /// Initial reconnect delay in seconds
    #[arg(long, default_value = "5")]
    reconnect_delay: u64,

    /// Maximum reconnect delay in seconds
    #[arg(long, default_value = "300")]
    max_reconnect_delay: u64,

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

    info!(url = %args.url, id = %args.id, "starting charge point simulator");

    let charge_point = ChargePoint::new(ChargePointConfig {
        url: args.url,
        identity: args.id,
        vendor: args.vendor,
        model: args.model,
        connector_id: args.connector_id,
        call_timeout: Duration::from_secs(args.request_timeout),
    });

    let mut reconnect_delay = Duration::from_secs(args.reconnect_delay);
    let max_reconnect_delay = Duration::from_secs(args.max_reconnect_delay);

    loop {
        match charge_point.run().await {
            Ok(()) => {
                info!("connection closed gracefully");
                reconnect_delay = Duration::from_secs(args.reconnect_delay);
            }
            Err(e) => {
                error!(error = %e, "connection lost");
            }
        }

        // Exponential backoff with a little jitter so a fleet of
        // simulators does not reconnect in lockstep.
        let jitter = Duration::from_millis(rand::thread_rng().gen_range(0..1000));
        info!(delay = ?(reconnect_delay + jitter), "reconnecting");
        tokio::time::sleep(reconnect_delay + jitter).await;
        reconnect_delay = std::cmp::min(reconnect_delay * 2, max_reconnect_delay);
    }
}
