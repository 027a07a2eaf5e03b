//! Simulator behaviour switches.
use std::collections::HashSet;
use std::time::Duration;

use rust_decimal::Decimal;

/// Accepted login and answer style of a simulator instance.
#[derive(Debug, Clone)]
pub struct SimulatorConfig {
    /// Accepted account.
    pub username: String,
    /// Accepted password.
    pub password: String,
    /// Required software key; `None` accepts any key line.
    pub software_key: Option<String>,
    /// Listed symbols.
    pub symbols: Vec<String>,
    /// Listed symbols that never answer.
    pub silent: HashSet<String>,
    /// Render prices with a decimal comma (`30,15`).
    pub comma_decimals: bool,
    /// Starting price of every symbol.
    pub initial_price: Decimal,
    /// Pause before each answer.
    pub reply_delay: Duration,
}

impl Default for SimulatorConfig {
    fn default() -> Self {
        Self {
            username: String::from("demo"),
            password: String::from("demo"),
            software_key: None,
            symbols: Vec::new(),
            silent: HashSet::new(),
            comma_decimals: true,
            initial_price: Decimal::new(10000, 2),
            reply_delay: Duration::ZERO,
        }
    }
}

impl SimulatorConfig {
    /// Default login with `symbols` listed.
    pub fn with_symbols(symbols: &[&str]) -> Self {
        Self {
            symbols: symbols.iter().map(|s| String::from(*s)).collect(),
            ..Self::default()
        }
    }

    /// Formats a price the way this instance answers.
    pub fn render_price(&self, price: Decimal) -> String {
        let text = price.to_string();
        if self.comma_decimals {
            text.replace('.', ",")
        } else {
            text
        }
    }
}
