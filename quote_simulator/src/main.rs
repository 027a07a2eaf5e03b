//! Quote simulator server.
//!
//! Lists the symbols of a ticker file and serves snapshot requests until Ctrl+C.
//!
//! Usage example (CLI):
//! ```bash
//! quote_simulator --symbols ./tickers.txt --username demo --password demo --silent BBAS3
//! ```
#![warn(missing_docs)]
use std::collections::HashSet;
use std::fs::File;
use std::io::BufReader;
use std::path::PathBuf;
use std::time::Duration;

use clap::Parser;
use crossbeam_channel::bounded;
use log::{info, warn};
use quote_common::net::{SIMULATOR_PORT, addr};
use quote_common::tickers::{TickerList, TickerParser};
use quote_common::{Result, SyncError};
use quote_simulator::{ProviderSimulator, SimulatorConfig};
use rust_decimal::Decimal;

/// Parsed command-line arguments.
#[derive(Debug, Parser)]
#[command(version, about, long_about = None)]
struct Args {
    /// Address to bind.
    #[clap(long, default_value = "127.0.0.1")]
    bind: String,

    /// Port to listen on.
    #[clap(long, default_value_t = SIMULATOR_PORT)]
    port: u16,

    /// Text file with the listed symbols, separated by commas, spaces or new lines.
    #[clap(long)]
    symbols: String,

    /// Accepted account.
    #[clap(long, default_value = "demo")]
    username: String,

    /// Accepted password.
    #[clap(long, default_value = "demo")]
    password: String,

    /// Required software key; any key is accepted when omitted.
    #[clap(long)]
    software_key: Option<String>,

    /// Listed symbols that never answer (comma separated).
    #[clap(long, value_delimiter = ',')]
    silent: Vec<String>,

    /// Answer with a decimal point instead of a decimal comma.
    #[clap(long)]
    decimal_point: bool,

    /// Starting price of every symbol.
    #[clap(long, default_value = "100.00")]
    initial_price: Decimal,

    /// Milliseconds to wait before each answer.
    #[clap(long, default_value_t = 0)]
    reply_delay_ms: u64,
}

fn main() -> Result<()> {
    init_logger();
    let args = Args::parse();

    let path = PathBuf::from(args.symbols.trim());
    let file = File::open(&path).map_err(|e| {
        SyncError::Config(format!("cannot open symbols file {}: {}", path.display(), e))
    })?;
    let symbols = TickerList::parse_from_file(BufReader::new(file))?;
    if symbols.is_empty() {
        warn!("No symbols listed in {}; every request will be refused", path.display());
    }
    info!("Listing {} symbols", symbols.len());

    let silent: HashSet<String> = args.silent.iter().map(|s| s.trim().to_string()).collect();
    let config = SimulatorConfig {
        username: args.username,
        password: args.password,
        software_key: args.software_key,
        symbols,
        silent,
        comma_decimals: !args.decimal_point,
        initial_price: args.initial_price,
        reply_delay: Duration::from_millis(args.reply_delay_ms),
    };

    let mut simulator = ProviderSimulator::bind(&addr(&args.bind, args.port), config)?;

    let (stop_tx, stop_rx) = bounded::<()>(1);
    ctrlc::set_handler(move || {
        info!("Ctrl+C received. Shutting down simulator...");
        let _ = stop_tx.try_send(());
    })
    .map_err(|e| SyncError::Config(format!("cannot install Ctrl+C handler: {}", e)))?;

    info!("Simulator is running. Press Ctrl+C to exit.");
    let _ = stop_rx.recv();
    simulator.shutdown();
    info!("Served {} connections", simulator.accepted());
    Ok(())
}

fn init_logger() {
    env_logger::Builder::from_default_env()
        .filter_level(log::LevelFilter::Info)
        .init();
}
