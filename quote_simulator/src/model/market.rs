//! Synthetic last-trade prices.
//!
//! Every snapshot request moves the requested symbol by a small random walk, so two
//! cycles never see exactly the same book. All sessions share one `Market`, and
//! therefore one price sequence per symbol.
use std::collections::HashMap;
use std::sync::Mutex;

use rand::Rng;
use rust_decimal::Decimal;

/// Largest step of the random walk, in basis points (1%).
const MAX_STEP_BP: i64 = 100;
/// Floor price; keeps the walk strictly positive.
const MIN_PRICE: Decimal = Decimal::from_parts(1, 0, 0, false, 2);

/// Calculate the next synthetic price with a random step in `[-1%, +1%]`, rounded to
/// cents and clamped to a minimum positive value.
pub fn next_price(current_price: Decimal) -> Decimal {
    let step_bp = rand::rng().random_range(-MAX_STEP_BP..=MAX_STEP_BP);
    let change = Decimal::new(step_bp, 4);
    (current_price * (Decimal::ONE + change))
        .round_dp(2)
        .max(MIN_PRICE)
}

/// Last prices of the simulated book.
pub struct Market {
    prices: Mutex<HashMap<String, Decimal>>,
}

impl Market {
    /// Book with every symbol at `initial_price`.
    pub fn new(symbols: &[String], initial_price: Decimal) -> Self {
        let prices = symbols
            .iter()
            .map(|s| (s.clone(), initial_price.max(MIN_PRICE)))
            .collect();
        Self {
            prices: Mutex::new(prices),
        }
    }

    /// Moves `symbol` one step and returns its new price; `None` for unlisted symbols.
    pub fn tick(&self, symbol: &str) -> Option<Decimal> {
        let mut prices = match self.prices.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        };
        let price = prices.get_mut(symbol)?;
        *price = next_price(*price);
        Some(*price)
    }
}
