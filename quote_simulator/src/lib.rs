//! A local stand-in for the real-time quote provider.
//!
//! Speaks the same newline-delimited protocol as the production feed: a three-line
//! login (software key, account, password) answered with `You are connected` or a
//! refusal, then `SQT <symbol> N` snapshot requests answered with one
//! `T:<symbol>:<hhmmss>:2:<last>:3:<bid>:4:<ask>` frame, or an `E:` frame for symbols
//! it does not list.
#![warn(missing_docs)]
pub mod model;
pub mod server;
pub mod session;

pub use model::config::SimulatorConfig;
pub use server::ProviderSimulator;
