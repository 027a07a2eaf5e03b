//! Decoding of provider lines into typed quote events.
//!
//! Parsing never fails: every line maps to a `ParseOutcome`. Lines that carry nothing
//! usable are either `Ignored` (expected traffic such as partial updates) or
//! `Discarded` (damaged or invalid data), and the parser logs them at the matching
//! level so the caller only has to act on `ParseOutcome::Event`.
use std::str::FromStr;

use log::{debug, warn};
use quote_common::protocol::{ERROR_PREFIX, LAST_TRADE_FIELD, TICK_PREFIX, is_fatal_auth_message};
use rust_decimal::Decimal;

/// Index of the first `index:value` pair in a tick frame (`T:<symbol>:<time>:...`).
const FIRST_PAIR: usize = 3;

/// A decoded provider message.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum QuoteEvent {
    /// Last trade price for a provider symbol.
    Tick {
        /// Symbol as the provider spells it.
        provider_symbol: String,
        /// Strictly positive last trade price.
        last_price: Decimal,
    },
    /// Error frame or login refusal.
    Error {
        /// Full message text.
        text: String,
        /// `true` for refusals that no retry can fix.
        fatal: bool,
    },
}

impl QuoteEvent {
    /// `true` for `QuoteEvent::Error`.
    pub fn is_error(&self) -> bool {
        matches!(self, QuoteEvent::Error { .. })
    }
}

/// Expected traffic that carries no price.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Ignored {
    /// Tick frame updating fields other than the last trade price.
    Partial {
        /// Symbol the frame was about.
        provider_symbol: String,
    },
    /// Banner, keep-alive or any other non-frame line.
    Unrecognized,
}

/// Data that was meant to be a price but cannot be used.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Discarded {
    /// Blank line.
    Empty,
    /// Tick frame without a symbol.
    Malformed,
    /// Price field that is zero or negative.
    NonPositivePrice {
        /// Symbol the frame was about.
        provider_symbol: String,
        /// The rejected value.
        price: Decimal,
    },
    /// Price field that is not a decimal number.
    BadDecimal {
        /// Symbol the frame was about.
        provider_symbol: String,
        /// The raw field text.
        raw: String,
    },
}

/// Result of decoding one provider line.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ParseOutcome {
    /// A usable event.
    Event(QuoteEvent),
    /// Nothing to do.
    Ignored(Ignored),
    /// Invalid data, already logged.
    Discarded(Discarded),
}

/// Decodes one provider line.
pub fn parse_message(raw: &str) -> ParseOutcome {
    let line = raw.trim_end_matches(['\r', '\n']);
    if line.trim().is_empty() {
        debug!("Discarding blank provider line");
        return ParseOutcome::Discarded(Discarded::Empty);
    }

    if is_fatal_auth_message(line) {
        return ParseOutcome::Event(QuoteEvent::Error {
            text: String::from(line.trim()),
            fatal: true,
        });
    }

    if line.starts_with(ERROR_PREFIX) {
        return ParseOutcome::Event(QuoteEvent::Error {
            text: String::from(line),
            fatal: false,
        });
    }

    if line.starts_with(TICK_PREFIX) {
        return parse_tick(line);
    }

    debug!("Ignoring unrecognized provider line: {}", line);
    ParseOutcome::Ignored(Ignored::Unrecognized)
}

fn parse_tick(line: &str) -> ParseOutcome {
    let fields: Vec<&str> = line.split(':').collect();

    let provider_symbol = match fields.get(1).map(|s| s.trim()) {
        Some(symbol) if !symbol.is_empty() => String::from(symbol),
        _ => {
            debug!("Discarding tick frame without symbol: {}", line);
            return ParseOutcome::Discarded(Discarded::Malformed);
        }
    };

    let raw_price = fields.get(FIRST_PAIR..).and_then(|pairs| {
        pairs
            .chunks(2)
            .find(|pair| pair[0] == LAST_TRADE_FIELD)
            .and_then(|pair| pair.get(1).copied())
    });

    let Some(raw_price) = raw_price else {
        debug!("Ignoring partial update for {}: {}", provider_symbol, line);
        return ParseOutcome::Ignored(Ignored::Partial { provider_symbol });
    };

    let normalized = raw_price.trim().replace(',', ".");
    let price = match Decimal::from_str(&normalized) {
        Ok(price) => price,
        Err(e) => {
            warn!(
                "Could not parse price '{}' for {}: {}",
                raw_price, provider_symbol, e
            );
            return ParseOutcome::Discarded(Discarded::BadDecimal {
                provider_symbol,
                raw: String::from(raw_price),
            });
        }
    };

    if price <= Decimal::ZERO {
        warn!("Invalid price for {}: {}", provider_symbol, price);
        return ParseOutcome::Discarded(Discarded::NonPositivePrice {
            provider_symbol,
            price,
        });
    }

    ParseOutcome::Event(QuoteEvent::Tick {
        provider_symbol,
        last_price: price,
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    fn tick(symbol: &str, price: Decimal) -> ParseOutcome {
        ParseOutcome::Event(QuoteEvent::Tick {
            provider_symbol: String::from(symbol),
            last_price: price,
        })
    }

    #[test]
    fn extracts_last_trade_price() {
        assert_eq!(
            parse_message("T:PETR4:101500:1:20240110:2:30.15:3:30.14:4:30.16"),
            tick("PETR4", Decimal::new(3015, 2))
        );
    }

    #[test]
    fn price_runs_to_end_of_line() {
        assert_eq!(
            parse_message("T:VALE3:101500:2:61.2"),
            tick("VALE3", Decimal::new(612, 1))
        );
    }

    #[test]
    fn normalizes_comma_decimal_separator() {
        assert_eq!(
            parse_message("T:BOVA11:101500:3:120,01:2:120,05\r\n"),
            tick("BOVA11", Decimal::new(12005, 2))
        );
    }

    #[test]
    fn keeps_exact_decimal_values() {
        for (text, expected) in [
            ("0.01", Decimal::new(1, 2)),
            ("10.50", Decimal::new(1050, 2)),
            ("1234,5678", Decimal::new(12345678, 4)),
            ("7", Decimal::new(7, 0)),
        ] {
            let frame = format!("T:ABC:093000:2:{}:5:100", text);
            assert_eq!(parse_message(&frame), tick("ABC", expected), "{}", frame);
        }
    }

    #[test]
    fn frames_without_last_trade_are_partial() {
        for frame in [
            "T:PETR4:101500:3:30.14:4:30.16",
            "T:PETR4:101500",
            "T:PETR4:101500:2",
            "T:PETR4:101500:8:2:9:15",
        ] {
            assert_eq!(
                parse_message(frame),
                ParseOutcome::Ignored(Ignored::Partial {
                    provider_symbol: String::from("PETR4")
                }),
                "{}",
                frame
            );
        }
    }

    #[test]
    fn rejects_non_positive_prices() {
        assert_eq!(
            parse_message("T:BBB:101500:2:0:3:1"),
            ParseOutcome::Discarded(Discarded::NonPositivePrice {
                provider_symbol: String::from("BBB"),
                price: Decimal::ZERO,
            })
        );
        assert!(matches!(
            parse_message("T:BBB:101500:2:-1,5"),
            ParseOutcome::Discarded(Discarded::NonPositivePrice { .. })
        ));
    }

    #[test]
    fn rejects_unparsable_prices() {
        assert_eq!(
            parse_message("T:CCC:101500:2:abc:3:1"),
            ParseOutcome::Discarded(Discarded::BadDecimal {
                provider_symbol: String::from("CCC"),
                raw: String::from("abc"),
            })
        );
        assert!(matches!(
            parse_message("T:CCC:101500:2:"),
            ParseOutcome::Discarded(Discarded::BadDecimal { .. })
        ));
    }

    #[test]
    fn error_frames_are_events() {
        let outcome = parse_message("E:1:Symbol not found: XYZ");
        assert_eq!(
            outcome,
            ParseOutcome::Event(QuoteEvent::Error {
                text: String::from("E:1:Symbol not found: XYZ"),
                fatal: false,
            })
        );
        if let ParseOutcome::Event(event) = outcome {
            assert!(event.is_error());
        }
    }

    #[test]
    fn login_refusals_are_fatal_errors() {
        assert_eq!(
            parse_message("Invalid login."),
            ParseOutcome::Event(QuoteEvent::Error {
                text: String::from("Invalid login."),
                fatal: true,
            })
        );
    }

    #[test]
    fn junk_never_panics() {
        assert_eq!(parse_message(""), ParseOutcome::Discarded(Discarded::Empty));
        assert_eq!(parse_message("   \r\n"), ParseOutcome::Discarded(Discarded::Empty));
        assert_eq!(parse_message("T:"), ParseOutcome::Discarded(Discarded::Malformed));
        assert_eq!(parse_message("T::1:2:3"), ParseOutcome::Discarded(Discarded::Malformed));
        assert_eq!(
            parse_message("Welcome to the feed"),
            ParseOutcome::Ignored(Ignored::Unrecognized)
        );
    }
}
