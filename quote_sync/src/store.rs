//! Persistence boundary for resolved prices.
//!
//! The engine needs three things from storage: the asset catalog (to build the symbol
//! table, re-read through `reload` when the mapping is refreshed), a row lookup, and a
//! last-write-wins price upsert. Rows are never created
//! here; upserting a ticker the catalog does not contain is an `UnknownTicker` error.
use std::fs::{self, File};
use std::io::{BufReader, BufWriter, Write};
use std::path::{Path, PathBuf};

use log::debug;
use quote_common::{Asset, PriceUpdate, Result, SyncError};

/// Storage the engine reads the catalog from and writes prices to.
pub trait PriceStore: Send {
    /// Every catalog row, in catalog order.
    fn assets(&self) -> Result<Vec<Asset>>;

    /// The row for `ticker`, if any.
    fn get(&self, ticker: &str) -> Result<Option<Asset>>;

    /// Writes the price columns of an existing row.
    fn upsert(&mut self, ticker: &str, update: PriceUpdate) -> Result<()>;

    /// Picks up catalog changes made outside the engine.
    fn reload(&mut self) -> Result<()> {
        Ok(())
    }
}

/// Catalog held in memory.
#[derive(Debug, Clone, Default)]
pub struct MemoryPriceStore {
    rows: Vec<Asset>,
    writes: usize,
}

impl MemoryPriceStore {
    /// Store over `rows`.
    pub fn new(rows: Vec<Asset>) -> Self {
        Self { rows, writes: 0 }
    }

    /// Store with one unpriced row per ticker.
    pub fn with_tickers(tickers: &[&str]) -> Self {
        Self::new(tickers.iter().map(|t| Asset::new(t, t)).collect())
    }

    /// Successful upserts since creation.
    pub fn writes(&self) -> usize {
        self.writes
    }
}

impl PriceStore for MemoryPriceStore {
    fn assets(&self) -> Result<Vec<Asset>> {
        Ok(self.rows.clone())
    }

    fn get(&self, ticker: &str) -> Result<Option<Asset>> {
        Ok(self.rows.iter().find(|a| a.ticker == ticker).cloned())
    }

    fn upsert(&mut self, ticker: &str, update: PriceUpdate) -> Result<()> {
        let row = self
            .rows
            .iter_mut()
            .find(|a| a.ticker == ticker)
            .ok_or_else(|| SyncError::UnknownTicker(String::from(ticker)))?;
        row.apply(&update);
        self.writes += 1;
        Ok(())
    }
}

/// Catalog kept in a JSON file holding an array of assets.
///
/// Each upsert rewrites the file through a temporary sibling and a rename, so a crash
/// never leaves a half-written catalog behind.
#[derive(Debug)]
pub struct JsonPriceStore {
    path: PathBuf,
    rows: Vec<Asset>,
}

impl JsonPriceStore {
    /// Loads the catalog at `path`.
    pub fn open(path: &Path) -> Result<Self> {
        Ok(Self {
            path: path.to_path_buf(),
            rows: read_catalog(path)?,
        })
    }

    /// Catalog file location.
    pub fn path(&self) -> &Path {
        &self.path
    }

    fn persist(&self) -> Result<()> {
        let mut tmp_name = self.path.as_os_str().to_owned();
        tmp_name.push(".tmp");
        let tmp_path = PathBuf::from(tmp_name);

        let file = File::create(&tmp_path)?;
        let mut writer = BufWriter::new(file);
        serde_json::to_writer_pretty(&mut writer, &self.rows)?;
        writer.write_all(b"\n")?;
        writer.flush()?;
        drop(writer);

        fs::rename(&tmp_path, &self.path)?;
        Ok(())
    }
}

fn read_catalog(path: &Path) -> Result<Vec<Asset>> {
    let file = File::open(path)
        .map_err(|e| SyncError::Store(format!("cannot open catalog {}: {}", path.display(), e)))?;
    let rows: Vec<Asset> = serde_json::from_reader(BufReader::new(file))?;
    debug!("Loaded {} assets from {}", rows.len(), path.display());
    Ok(rows)
}

impl PriceStore for JsonPriceStore {
    fn assets(&self) -> Result<Vec<Asset>> {
        Ok(self.rows.clone())
    }

    fn get(&self, ticker: &str) -> Result<Option<Asset>> {
        Ok(self.rows.iter().find(|a| a.ticker == ticker).cloned())
    }

    fn upsert(&mut self, ticker: &str, update: PriceUpdate) -> Result<()> {
        let index = self
            .rows
            .iter()
            .position(|a| a.ticker == ticker)
            .ok_or_else(|| SyncError::UnknownTicker(String::from(ticker)))?;
        let previous = self.rows[index].clone();
        self.rows[index].apply(&update);
        if let Err(e) = self.persist() {
            self.rows[index] = previous;
            return Err(SyncError::Store(format!(
                "writing {} failed: {}",
                self.path.display(),
                e
            )));
        }
        Ok(())
    }

    fn reload(&mut self) -> Result<()> {
        self.rows = read_catalog(&self.path)?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rust_decimal::Decimal;

    #[test]
    fn memory_store_updates_existing_rows_only() {
        let mut store = MemoryPriceStore::with_tickers(&["PETR4.SA"]);
        let update = PriceUpdate::now(Decimal::new(3015, 2));
        store.upsert("PETR4.SA", update).unwrap();
        let row = store.get("PETR4.SA").unwrap().unwrap();
        assert_eq!(row.current_price, Some(Decimal::new(3015, 2)));
        assert_eq!(row.last_updated_at, Some(update.last_updated_at));

        assert!(matches!(
            store.upsert("VALE3.SA", update),
            Err(SyncError::UnknownTicker(_))
        ));
        assert_eq!(store.writes(), 1);
    }

    #[test]
    fn upsert_is_last_write_wins() {
        let mut store = MemoryPriceStore::with_tickers(&["PETR4.SA"]);
        store.upsert("PETR4.SA", PriceUpdate::now(Decimal::ONE)).unwrap();
        store.upsert("PETR4.SA", PriceUpdate::now(Decimal::TWO)).unwrap();
        assert_eq!(
            store.get("PETR4.SA").unwrap().unwrap().current_price,
            Some(Decimal::TWO)
        );
    }

    #[test]
    fn json_store_round_trips_through_the_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("assets.json");
        fs::write(
            &path,
            r#"[{"ticker": "PETR4.SA", "display_name": "Petrobras PN"}, {"ticker": "CDI"}]"#,
        )
        .unwrap();

        let mut store = JsonPriceStore::open(&path).unwrap();
        assert_eq!(store.assets().unwrap().len(), 2);
        store
            .upsert("PETR4.SA", PriceUpdate::now(Decimal::new(3015, 2)))
            .unwrap();

        let reopened = JsonPriceStore::open(&path).unwrap();
        let row = reopened.get("PETR4.SA").unwrap().unwrap();
        assert_eq!(row.display_name, "Petrobras PN");
        assert_eq!(row.current_price, Some(Decimal::new(3015, 2)));
        assert!(row.last_updated_at.is_some());
        assert_eq!(reopened.get("CDI").unwrap().unwrap().current_price, None);
    }

    #[test]
    fn json_store_reload_sees_rows_added_to_the_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("assets.json");
        fs::write(&path, r#"[{"ticker": "PETR4.SA"}]"#).unwrap();
        let mut store = JsonPriceStore::open(&path).unwrap();

        fs::write(&path, r#"[{"ticker": "PETR4.SA"}, {"ticker": "VALE3.SA"}]"#).unwrap();
        assert_eq!(store.assets().unwrap().len(), 1);
        store.reload().unwrap();
        assert_eq!(store.assets().unwrap().len(), 2);
        store
            .upsert("VALE3.SA", PriceUpdate::now(Decimal::new(6102, 2)))
            .unwrap();
    }

    #[test]
    fn json_store_keeps_rows_when_reload_fails() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("assets.json");
        fs::write(&path, r#"[{"ticker": "PETR4.SA"}]"#).unwrap();
        let mut store = JsonPriceStore::open(&path).unwrap();

        fs::write(&path, "not json").unwrap();
        assert!(store.reload().is_err());
        assert_eq!(store.assets().unwrap().len(), 1);
    }

    #[test]
    fn json_store_reports_missing_catalog() {
        let dir = tempfile::tempdir().unwrap();
        let err = JsonPriceStore::open(&dir.path().join("missing.json")).unwrap_err();
        assert!(matches!(err, SyncError::Store(_)));
    }
}
