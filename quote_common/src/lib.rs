//!
//! Common types and utilities shared by the sync engine and the provider simulator.
//!
//! This crate aggregates:
//! - `error`: unified error type `SyncError` used across the workspace.
//! - `result`: handy `Result<T, SyncError>` alias.
//! - `asset`: asset catalog rows and the price columns the engine writes.
//! - `tickers`: ticker list file parsing.
//! - `protocol`: line protocol commands, frame markers and login texts.
//! - `net`: networking constants and small helpers.
#![warn(missing_docs)]
pub mod asset;
pub mod error;
pub mod net;
pub mod protocol;
pub mod result;
pub mod tickers;

pub use asset::{Asset, PriceUpdate};
pub use error::SyncError;
pub use protocol::Command;
pub use result::Result;
