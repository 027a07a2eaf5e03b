//! Translation between internal catalog tickers and provider symbols.
//!
//! The catalog spells tickers the way the historical data source did (`PETR4.SA`,
//! `USDBRL=X`); the provider uses its own conventions. A curated override table wins,
//! everything else goes through `derive_provider_symbol`. The reverse direction
//! (provider symbol -> ticker) must stay a bijection because it is what correlates
//! incoming frames, so collisions are resolved here and always logged:
//!
//! - an override entry beats a derived entry regardless of catalog order;
//! - between two entries of the same kind, the later catalog row wins.
use std::collections::{HashMap, HashSet};

use log::{debug, info, warn};
use quote_common::Asset;

/// Fallback translation: drop everything from the first `.` (venue suffix) and strip
/// `=` currency-pair markers, keeping whatever follows them (`EURBRL=X` -> `EURBRLX`).
pub fn derive_provider_symbol(ticker: &str) -> String {
    let base = ticker.split('.').next().unwrap_or(ticker);
    base.replace('=', "")
}

/// One resolved ticker/symbol pair.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SymbolMapping {
    /// Catalog ticker.
    pub internal_ticker: String,
    /// Provider symbol.
    pub provider_symbol: String,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Origin {
    Override,
    Derived,
}

/// Bidirectional ticker/symbol table built from the catalog.
#[derive(Debug, Clone, Default)]
pub struct SymbolTable {
    by_symbol: HashMap<String, (String, Origin)>,
    by_ticker: HashMap<String, String>,
    order: Vec<String>,
    excluded: Vec<String>,
}

impl SymbolTable {
    /// Builds the table for every catalog asset that is not denylisted.
    pub fn build(
        assets: &[Asset],
        overrides: &HashMap<String, String>,
        denylist: &HashSet<String>,
    ) -> Self {
        let mut table = SymbolTable::default();

        for asset in assets {
            let ticker = asset.ticker.trim();
            if ticker.is_empty() {
                continue;
            }
            if denylist.contains(ticker) {
                debug!("{} is denylisted, not requesting it", ticker);
                table.excluded.push(String::from(ticker));
                continue;
            }
            if table.by_ticker.contains_key(ticker) {
                debug!("Duplicate catalog row for {} ignored", ticker);
                continue;
            }

            let (symbol, origin) = match overrides.get(ticker) {
                Some(symbol) => (symbol.trim().to_string(), Origin::Override),
                None => (derive_provider_symbol(ticker), Origin::Derived),
            };
            if symbol.is_empty() {
                warn!("{} maps to an empty provider symbol, skipping", ticker);
                continue;
            }

            table.insert(ticker, symbol, origin);
        }

        info!(
            "Symbol table built: {} mapped, {} denylisted",
            table.order.len(),
            table.excluded.len()
        );
        table
    }

    fn insert(&mut self, ticker: &str, symbol: String, origin: Origin) {
        if let Some((previous, previous_origin)) = self.by_symbol.get(&symbol).cloned() {
            if previous_origin == Origin::Override && origin == Origin::Derived {
                warn!(
                    "Provider symbol {} collision: keeping override for {}, dropping {}",
                    symbol, previous, ticker
                );
                return;
            }
            warn!(
                "Provider symbol {} collision: {} replaces {}",
                symbol, ticker, previous
            );
            self.by_ticker.remove(&previous);
            self.order.retain(|t| t != &previous);
        }

        debug!("Mapping: {} -> {}", ticker, symbol);
        self.by_ticker.insert(String::from(ticker), symbol.clone());
        self.by_symbol.insert(symbol, (String::from(ticker), origin));
        self.order.push(String::from(ticker));
    }

    /// Catalog ticker for a provider symbol; `None` for symbols this table never mapped.
    pub fn resolve(&self, provider_symbol: &str) -> Option<&str> {
        self.by_symbol
            .get(provider_symbol)
            .map(|(ticker, _)| ticker.as_str())
    }

    /// Provider symbol for a catalog ticker.
    pub fn provider_symbol(&self, ticker: &str) -> Option<&str> {
        self.by_ticker.get(ticker).map(String::as_str)
    }

    /// Pairs to request each cycle, in catalog order, denylisted tickers excluded.
    pub fn requests(&self) -> Vec<SymbolMapping> {
        self.order
            .iter()
            .filter_map(|ticker| {
                self.by_ticker.get(ticker).map(|symbol| SymbolMapping {
                    internal_ticker: ticker.clone(),
                    provider_symbol: symbol.clone(),
                })
            })
            .collect()
    }

    /// Catalog tickers skipped because of the denylist.
    pub fn excluded(&self) -> &[String] {
        &self.excluded
    }

    /// Number of mapped tickers.
    pub fn len(&self) -> usize {
        self.order.len()
    }

    /// `true` when nothing is mapped.
    pub fn is_empty(&self) -> bool {
        self.order.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn assets(tickers: &[&str]) -> Vec<Asset> {
        tickers.iter().map(|t| Asset::new(t, t)).collect()
    }

    fn overrides(pairs: &[(&str, &str)]) -> HashMap<String, String> {
        pairs
            .iter()
            .map(|(t, s)| (String::from(*t), String::from(*s)))
            .collect()
    }

    fn denylist(tickers: &[&str]) -> HashSet<String> {
        tickers.iter().map(|t| String::from(*t)).collect()
    }

    #[test]
    fn derives_symbols_from_catalog_spelling() {
        assert_eq!(derive_provider_symbol("PETR4.SA"), "PETR4");
        assert_eq!(derive_provider_symbol("EURBRL=X"), "EURBRLX");
        assert_eq!(derive_provider_symbol("VALE3"), "VALE3");
        assert_eq!(derive_provider_symbol("A.B.C"), "A");
    }

    #[test]
    fn override_table_wins_over_transform() {
        let table = SymbolTable::build(
            &assets(&["USDBRL=X", "PETR4.SA"]),
            &overrides(&[("USDBRL=X", "USD/BRL")]),
            &HashSet::new(),
        );
        assert_eq!(table.provider_symbol("USDBRL=X"), Some("USD/BRL"));
        assert_eq!(table.resolve("USD/BRL"), Some("USDBRL=X"));
        assert_eq!(table.provider_symbol("PETR4.SA"), Some("PETR4"));
    }

    #[test]
    fn unknown_symbols_resolve_to_none() {
        let table = SymbolTable::build(&assets(&["PETR4.SA"]), &HashMap::new(), &HashSet::new());
        assert_eq!(table.resolve("XPTO3"), None);
        assert_eq!(table.resolve("PETR4.SA"), None);
    }

    #[test]
    fn denylisted_tickers_are_not_requested() {
        let table = SymbolTable::build(
            &assets(&["CDI", "PETR4.SA", "USDBRL=X"]),
            &HashMap::new(),
            &denylist(&["CDI", "USDBRL=X"]),
        );
        let requested: Vec<String> = table
            .requests()
            .into_iter()
            .map(|m| m.internal_ticker)
            .collect();
        assert_eq!(requested, vec!["PETR4.SA"]);
        assert_eq!(table.excluded(), ["CDI", "USDBRL=X"]);
        assert_eq!(table.resolve("CDI"), None);
    }

    #[test]
    fn round_trips_collision_free_tickers() {
        let tickers = ["PETR4.SA", "VALE3.SA", "ITUB4.SA", "EURBRL=X", "BBAS3"];
        let table = SymbolTable::build(&assets(&tickers), &HashMap::new(), &HashSet::new());
        for ticker in tickers {
            let symbol = table.provider_symbol(ticker).unwrap();
            assert_eq!(table.resolve(symbol), Some(ticker));
        }
        assert_eq!(table.len(), tickers.len());
        assert_eq!(table.provider_symbol("EURBRL=X"), Some("EURBRLX"));
        assert_eq!(table.resolve("EURBRLX"), Some("EURBRL=X"));
    }

    #[test]
    fn derived_collision_keeps_the_later_row() {
        let table = SymbolTable::build(
            &assets(&["PETR4.SA", "PETR4.XX"]),
            &HashMap::new(),
            &HashSet::new(),
        );
        assert_eq!(table.resolve("PETR4"), Some("PETR4.XX"));
        assert_eq!(table.provider_symbol("PETR4.SA"), None);
        assert_eq!(table.requests().len(), 1);
    }

    #[test]
    fn override_survives_later_derived_collision() {
        let table = SymbolTable::build(
            &assets(&["BOVA11.SA", "BOVA11.XX"]),
            &overrides(&[("BOVA11.SA", "BOVA11")]),
            &HashSet::new(),
        );
        assert_eq!(table.resolve("BOVA11"), Some("BOVA11.SA"));
        assert_eq!(table.provider_symbol("BOVA11.XX"), None);
    }

    #[test]
    fn override_replaces_earlier_derived_entry() {
        let table = SymbolTable::build(
            &assets(&["IBOV", "^BVSP"]),
            &overrides(&[("^BVSP", "IBOV")]),
            &HashSet::new(),
        );
        assert_eq!(table.resolve("IBOV"), Some("^BVSP"));
        assert_eq!(table.provider_symbol("IBOV"), None);
        assert_eq!(table.len(), 1);
    }
}
