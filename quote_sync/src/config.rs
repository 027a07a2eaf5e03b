//! Engine configuration: cycle timing, reconnect policy, credentials and the static
//! symbol rules (override table and denylist).
use std::collections::{HashMap, HashSet};
use std::fmt;
use std::fs::File;
use std::io::BufReader;
use std::path::Path;
use std::time::Duration;

use clap::ValueEnum;
use quote_common::{Result, SyncError};
use serde::{Deserialize, Serialize};
use strum_macros::{Display, EnumString};

/// Smallest delay allowed between two connect attempts.
pub const MIN_RECONNECT_DELAY: Duration = Duration::from_secs(1);
/// Largest poll interval; stop requests must be seen within one poll.
pub const MAX_POLL_INTERVAL: Duration = Duration::from_secs(1);

/// How the provider session is kept across cycles.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Display, EnumString, ValueEnum)]
#[strum(serialize_all = "kebab-case")]
pub enum ReconnectPolicy {
    /// Connect once and keep the session; a lost session ends the run loop.
    #[strum(serialize = "none")]
    #[value(name = "none")]
    NoRetry,
    /// Keep the session warm and re-establish it with fixed-delay retries.
    #[default]
    FixedDelay,
    /// Open a fresh session every cycle and close it when the cycle ends.
    ReconnectPerCycle,
}

/// Provider login.
#[derive(Clone, Default)]
pub struct Credentials {
    /// Software key line sent before the username; may be empty.
    pub software_key: String,
    /// Account name.
    pub username: String,
    /// Account password.
    pub password: String,
}

impl Credentials {
    /// Credentials without a software key.
    pub fn new(username: &str, password: &str) -> Self {
        Self {
            software_key: String::new(),
            username: String::from(username),
            password: String::from(password),
        }
    }
}

impl fmt::Debug for Credentials {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Credentials")
            .field("software_key", &"***")
            .field("username", &self.username)
            .field("password", &"***")
            .finish()
    }
}

/// Timing and session settings of the sync engine.
#[derive(Debug, Clone)]
pub struct EngineConfig {
    /// Time between cycle starts.
    pub interval: Duration,
    /// Longest a cycle waits for answers after its requests went out.
    pub cycle_timeout: Duration,
    /// Bound on connect plus login.
    pub connect_timeout: Duration,
    /// Queue poll granularity; also the stop-signal latency.
    pub poll_interval: Duration,
    /// Pause between two snapshot requests.
    pub request_delay: Duration,
    /// Session strategy across cycles.
    pub reconnect: ReconnectPolicy,
    /// Pause between connect attempts (raised to `MIN_RECONNECT_DELAY` if lower).
    pub reconnect_delay: Duration,
    /// Connect attempts per acquisition for retrying policies.
    pub connect_attempts: u32,
    /// Bounded queue capacity; `None` for an unbounded queue.
    pub queue_capacity: Option<usize>,
    /// Provider login.
    pub credentials: Credentials,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            interval: Duration::from_secs(60),
            cycle_timeout: Duration::from_secs(20),
            connect_timeout: Duration::from_secs(10),
            poll_interval: Duration::from_millis(250),
            request_delay: Duration::from_millis(200),
            reconnect: ReconnectPolicy::default(),
            reconnect_delay: Duration::from_secs(5),
            connect_attempts: 3,
            queue_capacity: None,
            credentials: Credentials::default(),
        }
    }
}

impl EngineConfig {
    /// Checks the values the scheduler relies on.
    pub fn validate(&self) -> Result<()> {
        if self.interval.is_zero() {
            return Err(SyncError::Config(String::from("interval must be positive")));
        }
        if self.cycle_timeout.is_zero() {
            return Err(SyncError::Config(String::from("cycle timeout must be positive")));
        }
        if self.connect_timeout.is_zero() {
            return Err(SyncError::Config(String::from("connect timeout must be positive")));
        }
        if self.poll_interval.is_zero() || self.poll_interval > MAX_POLL_INTERVAL {
            return Err(SyncError::Config(format!(
                "poll interval must be in (0, {:?}], got {:?}",
                MAX_POLL_INTERVAL, self.poll_interval
            )));
        }
        if self.connect_attempts == 0 {
            return Err(SyncError::Config(String::from("connect attempts must be at least 1")));
        }
        if self.queue_capacity == Some(0) {
            return Err(SyncError::Config(String::from("queue capacity must be positive")));
        }
        Ok(())
    }

    /// Delay actually used between connect attempts.
    pub fn effective_reconnect_delay(&self) -> Duration {
        self.reconnect_delay.max(MIN_RECONNECT_DELAY)
    }

    /// Connect attempts per acquisition under the configured policy.
    pub fn attempts_per_acquire(&self) -> u32 {
        match self.reconnect {
            ReconnectPolicy::NoRetry => 1,
            ReconnectPolicy::FixedDelay | ReconnectPolicy::ReconnectPerCycle => {
                self.connect_attempts.max(1)
            }
        }
    }
}

/// Static symbol translation rules.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SymbolRules {
    /// Catalog ticker -> provider symbol exceptions.
    #[serde(default)]
    pub overrides: HashMap<String, String>,
    /// Catalog tickers the provider does not carry.
    #[serde(default)]
    pub denylist: HashSet<String>,
}

impl Default for SymbolRules {
    fn default() -> Self {
        let overrides = [
            ("BOVA11.SA", "BOVA11"),
            ("XFIX11.SA", "XFIX11"),
            ("IB5M11.SA", "IB5M11"),
            ("B5P211.SA", "B5P211"),
            ("FIXA11.SA", "FIXA11"),
            ("USDBRL=X", "USD/BRL"),
        ]
        .into_iter()
        .map(|(t, s)| (String::from(t), String::from(s)))
        .collect();
        let denylist = ["CDI", "USDBRL=X"].into_iter().map(String::from).collect();
        Self {
            overrides,
            denylist,
        }
    }
}

impl SymbolRules {
    /// Loads rules from a JSON file (`{"overrides": {..}, "denylist": [..]}`).
    pub fn load(path: &Path) -> Result<Self> {
        let file = File::open(path).map_err(|e| {
            SyncError::Config(format!("cannot open rules file {}: {}", path.display(), e))
        })?;
        let rules: SymbolRules = serde_json::from_reader(BufReader::new(file))?;
        Ok(rules)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    #[test]
    fn defaults_are_valid() {
        let config = EngineConfig::default();
        config.validate().unwrap();
        assert_eq!(config.interval, Duration::from_secs(60));
        assert_eq!(config.cycle_timeout, Duration::from_secs(20));
        assert_eq!(config.reconnect, ReconnectPolicy::FixedDelay);
    }

    #[test]
    fn rejects_bad_values() {
        let mut config = EngineConfig::default();
        config.poll_interval = Duration::from_secs(2);
        assert!(matches!(config.validate(), Err(SyncError::Config(_))));

        let mut config = EngineConfig::default();
        config.connect_attempts = 0;
        assert!(config.validate().is_err());

        let mut config = EngineConfig::default();
        config.cycle_timeout = Duration::ZERO;
        assert!(config.validate().is_err());
    }

    #[test]
    fn reconnect_delay_has_a_floor() {
        let mut config = EngineConfig::default();
        config.reconnect_delay = Duration::from_millis(10);
        assert_eq!(config.effective_reconnect_delay(), MIN_RECONNECT_DELAY);
    }

    #[test]
    fn no_retry_policy_makes_one_attempt() {
        let mut config = EngineConfig::default();
        config.reconnect = ReconnectPolicy::NoRetry;
        assert_eq!(config.attempts_per_acquire(), 1);
        config.reconnect = ReconnectPolicy::ReconnectPerCycle;
        assert_eq!(config.attempts_per_acquire(), 3);
    }

    #[test]
    fn policy_names_are_kebab_case() {
        assert_eq!(ReconnectPolicy::ReconnectPerCycle.to_string(), "reconnect-per-cycle");
        assert_eq!("fixed-delay".parse::<ReconnectPolicy>().unwrap(), ReconnectPolicy::FixedDelay);
        assert_eq!("none".parse::<ReconnectPolicy>().unwrap(), ReconnectPolicy::NoRetry);
    }

    #[test]
    fn credentials_debug_hides_secrets() {
        let rendered = format!("{:?}", Credentials::new("desk", "hunter2"));
        assert!(rendered.contains("desk"));
        assert!(!rendered.contains("hunter2"));
    }

    #[test]
    fn loads_rules_file() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        write!(file, r#"{{"overrides": {{"^BVSP": "IBOV"}}, "denylist": ["CDI"]}}"#).unwrap();
        let rules = SymbolRules::load(file.path()).unwrap();
        assert_eq!(rules.overrides.get("^BVSP").map(String::as_str), Some("IBOV"));
        assert!(rules.denylist.contains("CDI"));
    }

    #[test]
    fn default_rules_cover_known_exceptions() {
        let rules = SymbolRules::default();
        assert_eq!(rules.overrides.get("USDBRL=X").map(String::as_str), Some("USD/BRL"));
        assert!(rules.denylist.contains("CDI"));
    }
}
