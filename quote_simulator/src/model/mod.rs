//! Simulator state shared by all sessions.
//!
//! - `market`: last prices per symbol and the random walk that moves them.
//! - `config`: what the simulator accepts and how it answers.
pub mod config;
pub mod market;
