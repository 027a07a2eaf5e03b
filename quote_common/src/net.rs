//! Shared networking constants and helpers used by the engine and the simulator.

/// Host of the production quote provider.
pub const PROVIDER_HOST: &str = "datafeed1.cedrotech.com";
/// TCP port of the production quote provider.
pub const PROVIDER_PORT: u16 = 81;
/// TCP port the local simulator listens on by default.
pub const SIMULATOR_PORT: u16 = 8181;

/// Helper to format a host and port like "host:port".
pub fn addr(host: &str, port: u16) -> String {
    format!("{}:{}", host, port)
}
