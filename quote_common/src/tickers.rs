//! Ticker list parsing shared by the engine and the simulator.

use std::io::BufRead;

use crate::error::SyncError;

/// Trait providing file parsing for ticker lists.
pub trait TickerParser {
    /// Parses tickers from a buffered reader.
    ///
    /// Tickers may be separated by commas, spaces or new lines. Empty entries and lines
    /// starting with `#` are skipped; duplicates keep their first position.
    fn parse_from_file<R: BufRead>(reader: R) -> Result<Vec<String>, SyncError>;
}

/// Plain-text ticker list (`tickers.txt` style).
pub struct TickerList;

impl TickerParser for TickerList {
    fn parse_from_file<R: BufRead>(reader: R) -> Result<Vec<String>, SyncError> {
        let mut tickers: Vec<String> = Vec::new();

        for line_result in reader.lines() {
            let line = line_result.map_err(SyncError::Io)?;
            let trimmed_line = line.trim();
            if trimmed_line.is_empty() || trimmed_line.starts_with('#') {
                continue;
            }

            for entry in trimmed_line.split(|c: char| c == ',' || c.is_whitespace()) {
                if entry.is_empty() {
                    continue;
                }
                if entry.contains(':') {
                    return Err(SyncError::Format(format!(
                        "ticker '{}' contains the frame delimiter ':'",
                        entry
                    )));
                }
                if !tickers.iter().any(|t| t == entry) {
                    tickers.push(String::from(entry));
                }
            }
        }
        Ok(tickers)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Cursor;

    #[test]
    fn splits_on_commas_spaces_and_lines() {
        let input = "# B3 basket\nPETR4, VALE3\nBOVA11 PETR4\n\n";
        let tickers = TickerList::parse_from_file(Cursor::new(input)).unwrap();
        assert_eq!(tickers, vec!["PETR4", "VALE3", "BOVA11"]);
    }

    #[test]
    fn rejects_frame_delimiter() {
        let err = TickerList::parse_from_file(Cursor::new("BAD:X\n")).unwrap_err();
        assert!(matches!(err, SyncError::Format(_)));
    }
}
