//! Result type alias shared across the workspace.
//!
//! This module defines a convenient alias that defaults the error type to the
//! common `SyncError`, so functions can simply return `Result<T>`.
use crate::error::SyncError;

/// Workspace-wide `Result` alias with `SyncError` as the default error.
pub type Result<T, E = SyncError> = std::result::Result<T, E>;
