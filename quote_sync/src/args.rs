//! Command-line arguments for the sync daemon.
use std::path::PathBuf;

use clap::Parser;
use quote_common::net::{PROVIDER_HOST, PROVIDER_PORT};
use quote_sync::ReconnectPolicy;

/// Parsed command-line arguments.
#[derive(Debug, Parser)]
#[command(version, about, long_about = None)]
pub struct Args {
    /// JSON catalog of assets (array of `{ticker, display_name, ...}`); prices are
    /// written back to it.
    #[clap(long)]
    pub catalog: String,

    /// Optional JSON file with symbol overrides and denylist. Built-in rules when absent.
    #[clap(long)]
    pub rules: Option<String>,

    /// Provider host.
    #[clap(long, default_value = PROVIDER_HOST)]
    pub host: String,

    /// Provider port.
    #[clap(long, default_value_t = PROVIDER_PORT)]
    pub port: u16,

    /// Provider account.
    #[clap(long, env = "QUOTE_FEED_USER")]
    pub username: String,

    /// Provider password.
    #[clap(long, env = "QUOTE_FEED_PASSWORD", hide_env_values = true)]
    pub password: String,

    /// Software key sent before the account; empty when the account needs none.
    #[clap(long, env = "QUOTE_FEED_SOFTWARE_KEY", default_value = "", hide_env_values = true)]
    pub software_key: String,

    /// Seconds between cycle starts.
    #[clap(long, default_value_t = 60)]
    pub interval: u64,

    /// Seconds a cycle waits for answers after its requests went out.
    #[clap(long, default_value_t = 20)]
    pub timeout: u64,

    /// Seconds allowed for connect plus login.
    #[clap(long, default_value_t = 10)]
    pub connect_timeout: u64,

    /// Session strategy across cycles.
    #[clap(long, value_enum, default_value_t = ReconnectPolicy::FixedDelay)]
    pub reconnect: ReconnectPolicy,

    /// Seconds between connect attempts (at least 1).
    #[clap(long, default_value_t = 5)]
    pub reconnect_delay: u64,

    /// Milliseconds between two snapshot requests.
    #[clap(long, default_value_t = 200)]
    pub request_delay_ms: u64,

    /// Run one cycle and exit.
    #[clap(long)]
    pub single_run: bool,
}

/// Normalize a CLI-provided path string by trimming whitespace and matching quotes.
///
/// This allows passing Windows paths in quotes without breaking parsing.
pub fn normalize_path(raw: &str) -> PathBuf {
    let trimmed = raw.trim();
    let no_quotes = trimmed
        .strip_prefix('"')
        .and_then(|s| s.strip_suffix('"'))
        .unwrap_or(trimmed);
    PathBuf::from(no_quotes)
}
