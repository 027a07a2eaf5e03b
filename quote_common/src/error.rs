//! Error types shared by the sync engine and the provider simulator.
//!
//! The `SyncError` enum unifies I/O, serialization and lock failures with the
//! domain conditions of a provider session (rejected login, connect timeout, lost
//! session) and of the price store, so every crate in the workspace can propagate a
//! single error type with `?`.
use std::io;
use std::string::FromUtf8Error;
use std::sync::PoisonError;
use std::time::Duration;

use thiserror::Error;

/// Unified error type shared by the engine, the store and the simulator.
#[derive(Error, Debug)]
pub enum SyncError {
    /// I/O error originating from the standard library or sockets/files.
    #[error("I/O error: {0}")]
    Io(#[from] io::Error),

    /// Generic formatting/validation error with a human-readable message.
    #[error("Format error: {0}")]
    Format(String),

    /// UTF-8 conversion error when handling text content.
    #[error("UTF-8 error: {0}")]
    Utf8(#[from] FromUtf8Error),

    /// Failure while encoding/decoding JSON via serde_json.
    #[error("JSON serialization/deserialization error: {0}")]
    SerdeJson(#[from] serde_json::Error),

    /// Invalid configuration value (bad path, out-of-range duration, ...).
    #[error("Configuration error: {0}")]
    Config(String),

    /// The provider refused the session for a reason retrying cannot fix.
    #[error("Authentication rejected by provider: {0}")]
    AuthRejected(String),

    /// Connect and login did not finish inside the connect timeout.
    #[error("Connect timed out after {0:?}")]
    ConnectTimeout(Duration),

    /// A command was issued while no session was established.
    #[error("Not connected to provider")]
    NotConnected,

    /// The provider session ended while it was still needed.
    #[error("Provider session lost: {0}")]
    Disconnected(String),

    /// The price store has no row for the ticker.
    #[error("Unknown ticker: {0}")]
    UnknownTicker(String),

    /// Price store read or write failure.
    #[error("Price store error: {0}")]
    Store(String),

    /// The engine is already running its loop on the scheduler thread.
    #[error("Engine is already running")]
    EngineBusy,

    /// A stop request interrupted the operation.
    #[error("Stopped before completion")]
    Stopped,

    /// A worker thread panicked; contains the thread name.
    #[error("Worker thread panicked: {0}")]
    WorkerPanicked(String),

    /// Error indicating a poisoned mutex/lock was encountered.
    #[error("Mutex Lock Poisoned: {0}")]
    MutexLock(String),
}

impl SyncError {
    /// `true` for failures that must stop all reconnect attempts.
    pub fn is_fatal(&self) -> bool {
        matches!(self, SyncError::AuthRejected(_))
    }
}

impl<T> From<PoisonError<T>> for SyncError {
    fn from(err: PoisonError<T>) -> Self {
        SyncError::MutexLock(err.to_string())
    }
}
