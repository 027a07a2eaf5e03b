//! Periodic price synchronization against a line-oriented market data feed.
//!
//! Every cycle the engine sends one snapshot request per catalog ticker, collects the
//! `T:` frames the provider answers with on its reader thread, and upserts the last
//! trade price of each ticker into a `PriceStore`. The pieces, bottom-up:
//!
//! - `queue`: hand-off buffer between the transport thread and the scheduler;
//! - `parser`: provider line to `QuoteEvent`;
//! - `symbol_mapper`: catalog ticker to provider symbol and back;
//! - `transport` / `connection`: session lifecycle and login;
//! - `store`: catalog and price persistence;
//! - `scheduler`: the update cycle state machine;
//! - `engine`: start/stop/run-once control from the caller's thread.
#![warn(missing_docs)]
pub mod config;
pub mod connection;
pub mod engine;
pub mod parser;
pub mod queue;
pub mod scheduler;
pub mod signal;
pub mod store;
pub mod symbol_mapper;
pub mod transport;

pub use config::{Credentials, EngineConfig, ReconnectPolicy, SymbolRules};
pub use engine::QuoteSyncEngine;
pub use scheduler::{CycleOutcome, CycleReport, CycleScheduler, CycleState};
pub use store::{JsonPriceStore, MemoryPriceStore, PriceStore};
pub use transport::{TcpTransport, Transport};
