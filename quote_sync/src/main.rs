//! Quote Sync: keeps the prices of an asset catalog current from a real-time market
//! data feed.
//!
//! It reads a JSON catalog, logs in to the provider over TCP, requests a snapshot of
//! every catalog ticker each interval and writes the last trade price back to the
//! catalog file.
//!
//! Usage example (CLI):
//! ```bash
//! QUOTE_FEED_USER=desk QUOTE_FEED_PASSWORD=secret \
//!     quote_sync --catalog ./assets.json --interval 60 --timeout 20
//! ```
//!
//! Point `--host 127.0.0.1 --port 8181` at `quote_simulator` for a local run.
#![warn(missing_docs)]
mod args;

use std::time::Duration;

use clap::Parser;
use log::{error, info, warn};
use quote_common::net::addr;
use quote_common::{Result, SyncError};
use quote_sync::{
    Credentials, EngineConfig, JsonPriceStore, QuoteSyncEngine, SymbolRules, TcpTransport,
};

use crate::args::{Args, normalize_path};

fn main() -> Result<()> {
    init_logger();
    let args = Args::parse();

    let catalog_path = normalize_path(&args.catalog);
    if !catalog_path.is_file() {
        error!("Catalog file not found: {}", catalog_path.display());
        return Err(SyncError::Config(format!(
            "catalog file not found: {}",
            catalog_path.display()
        )));
    }
    let store = JsonPriceStore::open(&catalog_path)?;

    let rules = match &args.rules {
        Some(path) => SymbolRules::load(&normalize_path(path))?,
        None => SymbolRules::default(),
    };

    let config = EngineConfig {
        interval: Duration::from_secs(args.interval),
        cycle_timeout: Duration::from_secs(args.timeout),
        connect_timeout: Duration::from_secs(args.connect_timeout),
        request_delay: Duration::from_millis(args.request_delay_ms),
        reconnect: args.reconnect,
        reconnect_delay: Duration::from_secs(args.reconnect_delay),
        credentials: Credentials {
            software_key: args.software_key.trim().to_string(),
            username: args.username.trim().to_string(),
            password: args.password.clone(),
        },
        ..EngineConfig::default()
    };

    let address = addr(args.host.trim(), args.port);
    info!("Quote provider: {}", address);
    let mut engine = QuoteSyncEngine::new(config, TcpTransport::new(&address), store, rules)?;

    {
        let stop = engine.stop_signal();
        if let Err(e) = ctrlc::set_handler(move || {
            info!("Ctrl+C received. Shutting down...");
            stop.raise();
        }) {
            warn!("Could not install Ctrl+C handler: {}", e);
        }
    }

    if args.single_run {
        let report = engine.run_once(Duration::from_secs(args.timeout))?;
        info!(
            "Single run finished: {} ({}/{} prices updated)",
            report.outcome, report.received, report.expected
        );
        return Ok(());
    }

    engine.start(
        Duration::from_secs(args.interval),
        Duration::from_secs(args.timeout),
    )?;
    info!("Sync is running. Press Ctrl+C to exit.");

    let stop = engine.stop_signal();
    while !engine.is_finished() {
        if stop.wait(Duration::from_millis(500)) {
            break;
        }
    }
    engine.stop()
}

fn init_logger() {
    env_logger::Builder::new()
        .filter_level(log::LevelFilter::Info)
        .parse_default_env()
        .init();
}
