// =============================================================================
// Watchlist — curated symbol universe loaded from CSV
// =============================================================================
//
// Two files: the equity list (`symbol,tier`) driving the ORB engine, and the
// 0DTE index list for the options sub-engine. Symbol attributes that the
// signal and sizing paths need (leverage, inverse pairing, strike increment)
// are derived from a small static table keyed by ticker.
// =============================================================================

use std::collections::HashMap;
use std::path::Path;

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use tracing::info;

/// Leveraged ETFs get a relaxed volatility-percentile threshold in the
/// options eligibility filter.
const LEVERAGED_ETFS: &[&str] = &[
    "TQQQ", "SPXL", "UPRO", "SSO", "QLD", "SQQQ", "SPXU", "SPXS", "SDS", "QID",
];

/// Inverse pairs for symmetric signal handling (long the inverse instead of
/// shorting the base).
const INVERSE_PAIRS: &[(&str, &str)] = &[
    ("SQQQ", "TQQQ"),
    ("SPXU", "SPXL"),
    ("SPXS", "SPXL"),
    ("SDS", "SSO"),
    ("QID", "QLD"),
];

/// One watched symbol with its static attributes.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WatchedSymbol {
    pub ticker: String,
    /// Priority tier from the CSV (1 = core).
    pub tier: u8,
    pub is_leveraged: bool,
    /// The peer this symbol is the inverse of, when applicable.
    pub is_inverse_of: Option<String>,
    /// Options strike increment in dollars.
    pub strike_increment: f64,
}

impl WatchedSymbol {
    fn from_ticker(ticker: &str, tier: u8) -> Self {
        let upper = ticker.to_uppercase();
        let is_inverse_of = INVERSE_PAIRS
            .iter()
            .find(|(inv, _)| *inv == upper)
            .map(|(_, base)| base.to_string());
        Self {
            is_leveraged: LEVERAGED_ETFS.contains(&upper.as_str()),
            is_inverse_of,
            strike_increment: strike_increment_for(&upper),
            ticker: upper,
            tier,
        }
    }
}

/// Strike grid spacing by symbol; SPX trades a $5 grid, everything else $1.
pub fn strike_increment_for(ticker: &str) -> f64 {
    match ticker {
        "SPX" => 5.0,
        _ => 1.0,
    }
}

/// Raw CSV row shape: `symbol,tier`.
#[derive(Debug, Deserialize)]
struct WatchlistRow {
    symbol: String,
    #[serde(default = "default_tier")]
    tier: u8,
}

fn default_tier() -> u8 {
    1
}

/// The loaded symbol universe.
#[derive(Debug, Clone, Default)]
pub struct Watchlist {
    symbols: Vec<WatchedSymbol>,
    by_ticker: HashMap<String, usize>,
}

impl Watchlist {
    /// Load a watchlist CSV. Duplicate tickers keep the first row.
    pub fn load(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let mut reader = csv::Reader::from_path(path)
            .with_context(|| format!("failed to open watchlist {}", path.display()))?;

        let mut list = Self::default();
        for row in reader.deserialize() {
            let row: WatchlistRow =
                row.with_context(|| format!("malformed watchlist row in {}", path.display()))?;
            let symbol = WatchedSymbol::from_ticker(row.symbol.trim(), row.tier);
            if symbol.ticker.is_empty() || list.by_ticker.contains_key(&symbol.ticker) {
                continue;
            }
            list.by_ticker.insert(symbol.ticker.clone(), list.symbols.len());
            list.symbols.push(symbol);
        }

        info!(path = %path.display(), count = list.symbols.len(), "watchlist loaded");
        Ok(list)
    }

    /// Build a watchlist from tickers directly (tests, defaults).
    pub fn from_tickers(tickers: &[&str]) -> Self {
        let mut list = Self::default();
        for t in tickers {
            let symbol = WatchedSymbol::from_ticker(t, 1);
            if list.by_ticker.contains_key(&symbol.ticker) {
                continue;
            }
            list.by_ticker.insert(symbol.ticker.clone(), list.symbols.len());
            list.symbols.push(symbol);
        }
        list
    }

    pub fn symbols(&self) -> &[WatchedSymbol] {
        &self.symbols
    }

    pub fn tickers(&self) -> Vec<String> {
        self.symbols.iter().map(|s| s.ticker.clone()).collect()
    }

    pub fn get(&self, ticker: &str) -> Option<&WatchedSymbol> {
        self.by_ticker.get(ticker).map(|&i| &self.symbols[i])
    }

    pub fn contains(&self, ticker: &str) -> bool {
        self.by_ticker.contains_key(ticker)
    }

    pub fn len(&self) -> usize {
        self.symbols.len()
    }

    pub fn is_empty(&self) -> bool {
        self.symbols.is_empty()
    }
}

// =============================================================================
// Tests
// =============================================================================
#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    #[test]
    fn load_from_csv() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("watchlist.csv");
        let mut f = std::fs::File::create(&path).unwrap();
        writeln!(f, "symbol,tier").unwrap();
        writeln!(f, "SPY,1").unwrap();
        writeln!(f, "tqqq,2").unwrap();
        writeln!(f, "SPY,3").unwrap(); // duplicate, ignored
        drop(f);

        let list = Watchlist::load(&path).unwrap();
        assert_eq!(list.len(), 2);
        assert_eq!(list.get("SPY").unwrap().tier, 1);
        // Lower-case input is normalised.
        let tqqq = list.get("TQQQ").unwrap();
        assert_eq!(tqqq.tier, 2);
        assert!(tqqq.is_leveraged);
    }

    #[test]
    fn inverse_pairs_resolve() {
        let list = Watchlist::from_tickers(&["SQQQ", "TQQQ"]);
        assert_eq!(
            list.get("SQQQ").unwrap().is_inverse_of.as_deref(),
            Some("TQQQ")
        );
        assert!(list.get("TQQQ").unwrap().is_inverse_of.is_none());
    }

    #[test]
    fn strike_increments() {
        assert_eq!(strike_increment_for("SPX"), 5.0);
        assert_eq!(strike_increment_for("SPY"), 1.0);
        assert_eq!(strike_increment_for("IWM"), 1.0);
    }

    #[test]
    fn plain_etf_is_not_leveraged() {
        let list = Watchlist::from_tickers(&["SPY"]);
        assert!(!list.get("SPY").unwrap().is_leveraged);
    }
}
