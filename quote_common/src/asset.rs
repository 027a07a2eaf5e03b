//! Asset catalog rows as stored by the price store.
//!
//! An `Asset` is created by whoever maintains the catalog; the sync engine only reads
//! tickers from it and writes the price columns through a `PriceUpdate`.
use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};

/// One row of the asset catalog.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Asset {
    /// Internal ticker, unique within the catalog (e.g. `PETR4.SA`).
    pub ticker: String,
    /// Human-readable name.
    #[serde(default)]
    pub display_name: String,
    /// Last price written by the engine.
    #[serde(default)]
    pub current_price: Option<Decimal>,
    /// When `current_price` was written.
    #[serde(default)]
    pub last_updated_at: Option<DateTime<Utc>>,
}

impl Asset {
    /// Creates a catalog row with no price yet.
    pub fn new(ticker: &str, display_name: &str) -> Self {
        Self {
            ticker: String::from(ticker),
            display_name: String::from(display_name),
            current_price: None,
            last_updated_at: None,
        }
    }

    /// Overwrites the price columns with `update`.
    pub fn apply(&mut self, update: &PriceUpdate) {
        self.current_price = Some(update.current_price);
        self.last_updated_at = Some(update.last_updated_at);
    }
}

/// Price columns written for a single ticker.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct PriceUpdate {
    /// Last trade price.
    pub current_price: Decimal,
    /// Time the engine resolved the price.
    pub last_updated_at: DateTime<Utc>,
}

impl PriceUpdate {
    /// Update stamped with the current time.
    pub fn now(current_price: Decimal) -> Self {
        Self {
            current_price,
            last_updated_at: Utc::now(),
        }
    }
}
