//! Line protocol spoken between the sync engine and the quote provider.
//!
//! Every message is one newline-terminated text line. The client logs in with three
//! lines (software key, username, password) and then issues snapshot requests such as
//! `SQT PETR4 N`. The provider answers with colon-delimited tick frames
//! (`T:PETR4:101500:2:30,15:3:30,14`) or error frames (`E:...`).
use std::fmt;
use std::str::FromStr;

use strum_macros::{Display, EnumString};

use crate::error::SyncError;

/// Prefix of a tick frame.
pub const TICK_PREFIX: &str = "T:";
/// Prefix of an error frame.
pub const ERROR_PREFIX: &str = "E:";
/// Field code carrying the last trade price inside a tick frame.
pub const LAST_TRADE_FIELD: &str = "2";
/// Field code carrying the best bid inside a tick frame.
pub const BID_FIELD: &str = "3";
/// Field code carrying the best ask inside a tick frame.
pub const ASK_FIELD: &str = "4";
/// Snapshot quote request keyword.
pub const SNAPSHOT_QUOTE: &str = "SQT";
/// Session end keyword.
pub const QUIT: &str = "quit";
/// Line the provider sends once the login is accepted.
pub const LOGIN_ACCEPTED: &str = "You are connected";

/// Provider replies that mean the credentials or entitlement will never work.
/// Compared case-insensitively against the trimmed line.
pub const FATAL_AUTH_MESSAGES: &[&str] = &[
    "invalid login.",
    "software key not found.",
    "software key revoked.",
    "you don't have any permission for this software.",
];

/// Returns `true` when `line` is one of the provider's terminal login refusals.
pub fn is_fatal_auth_message(line: &str) -> bool {
    let line = line.trim();
    FATAL_AUTH_MESSAGES
        .iter()
        .any(|known| line.eq_ignore_ascii_case(known))
}

/// Delivery mode flag appended to a quote request.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Display, EnumString)]
pub enum QuoteMode {
    /// One-shot answer, no subscription.
    #[strum(serialize = "N")]
    Snapshot,
    /// Continuous updates until unsubscribed.
    #[strum(serialize = "S")]
    Streaming,
}

/// Commands a client sends after login.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Command {
    /// `SQT <symbol> <mode>`.
    Quote {
        /// Provider symbol.
        symbol: String,
        /// Delivery mode.
        mode: QuoteMode,
    },
    /// Ends the session.
    Quit,
}

impl Command {
    /// Creates a snapshot (`N`) quote request for `symbol`.
    pub fn snapshot(symbol: &str) -> Self {
        Command::Quote {
            symbol: String::from(symbol),
            mode: QuoteMode::Snapshot,
        }
    }
}

impl fmt::Display for Command {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Command::Quote { symbol, mode } => write!(f, "{} {} {}", SNAPSHOT_QUOTE, symbol, mode),
            Command::Quit => f.write_str(QUIT),
        }
    }
}

impl FromStr for Command {
    type Err = SyncError;

    fn from_str(line: &str) -> Result<Self, Self::Err> {
        let mut parts = line.split_whitespace();
        match parts.next() {
            Some(keyword) if keyword.eq_ignore_ascii_case(SNAPSHOT_QUOTE) => {
                let symbol = parts
                    .next()
                    .ok_or_else(|| SyncError::Format(format!("missing symbol in '{}'", line)))?;
                let mode = match parts.next() {
                    Some(flag) => flag
                        .parse::<QuoteMode>()
                        .map_err(|e| SyncError::Format(format!("bad mode '{}': {}", flag, e)))?,
                    None => QuoteMode::Snapshot,
                };
                Ok(Command::Quote {
                    symbol: String::from(symbol),
                    mode,
                })
            }
            Some(keyword) if keyword.eq_ignore_ascii_case(QUIT) => Ok(Command::Quit),
            Some(keyword) => Err(SyncError::Format(format!("unknown command '{}'", keyword))),
            None => Err(SyncError::Format(String::from("empty command"))),
        }
    }
}

/// Builder for an outgoing tick frame.
#[derive(Debug, Clone)]
pub struct TickFrame {
    symbol: String,
    time: String,
    fields: Vec<(String, String)>,
}

impl TickFrame {
    /// Starts a frame for `symbol` stamped with `time` (`hhmmss`).
    pub fn new(symbol: &str, time: &str) -> Self {
        Self {
            symbol: String::from(symbol),
            time: String::from(time),
            fields: Vec::new(),
        }
    }

    /// Appends an `index:value` pair.
    pub fn field(mut self, index: &str, value: impl Into<String>) -> Self {
        self.fields.push((String::from(index), value.into()));
        self
    }
}

impl fmt::Display for TickFrame {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}{}:{}", TICK_PREFIX, self.symbol, self.time)?;
        for (index, value) in &self.fields {
            write!(f, ":{}:{}", index, value)?;
        }
        Ok(())
    }
}
