//! RDP listener.
//!
//! # Architecture Overview
//!
//! ```text
//!   Client ──TCP──▶ net::listener ──Event::Accepted──▶ server::engine
//!                                                         │ admission, ids
//!                                                         ▼
//!   net::tcp I/O task ◀──read/write/TLS── server::connection
//!          │                                   ▲          │
//!          └──────────Event::Io (dispatch)─────┘          ▼
//!                                               framing::FramingDelegate
//!
//!   Cross-cutting: config · lifecycle · observability
//! ```

use std::path::PathBuf;
use std::time::Duration;

use clap::Parser;

use rdp_listener::config::{load_config, validate_config, GatewayConfig};
use rdp_listener::framing::FramingDelegate;
use rdp_listener::lifecycle::{self, signals, Shutdown};
use rdp_listener::observability::{logging, metrics};

#[derive(Parser)]
#[command(name = "rdp-listener")]
#[command(about = "TLS-terminating RDP connection listener", long_about = None)]
struct Cli {
    /// Path to a TOML configuration file
    #[arg(short, long)]
    config: Option<PathBuf>,

    /// Override the listener bind address
    #[arg(short, long)]
    bind: Option<String>,
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    let cli = Cli::parse();

    let mut config = match &cli.config {
        Some(path) => load_config(path)?,
        None => GatewayConfig::default(),
    };
    if let Some(bind) = cli.bind {
        config.listener.bind_address = bind;
        validate_config(&config).map_err(|errors| {
            errors
                .iter()
                .map(ToString::to_string)
                .collect::<Vec<_>>()
                .join(", ")
        })?;
    }

    logging::init_logging(&config.observability.log_level);
    tracing::info!("rdp-listener v{} starting", env!("CARGO_PKG_VERSION"));

    tracing::info!(
        bind_address = %config.listener.bind_address,
        max_connections = config.listener.max_connections,
        idle_timeout_secs = config.keepalive.idle_timeout_secs,
        "Configuration loaded"
    );

    if config.observability.metrics_enabled {
        match config.observability.metrics_address.parse() {
            Ok(addr) => metrics::init_metrics(addr),
            Err(_) => tracing::error!(
                metrics_address = %config.observability.metrics_address,
                "Failed to parse metrics address"
            ),
        }
    }

    let idle_timeout = match config.keepalive.idle_timeout_secs {
        0 => None,
        secs => Some(Duration::from_secs(secs)),
    };
    let event_loop = lifecycle::start(&config, Box::new(FramingDelegate::new(idle_timeout))).await?;

    let shutdown = Shutdown::new();
    signals::spawn_signal_handler(shutdown.clone());
    event_loop.run(shutdown.subscribe()).await;

    tracing::info!("Shutdown complete");
    Ok(())
}
