// =============================================================================
// Opening-range capture
// =============================================================================
//
// The first 15-minute RTH bar defines the day's opening range per symbol:
// its high/low become the breakout levels, its volume the baseline the
// volume-ratio checks compare against. Capture happens strictly at
// open + 15m from a sealed bar; a partial bar is never used, and the data
// is immutable for the rest of the day.
// =============================================================================

use std::collections::HashMap;

use chrono::{DateTime, NaiveDate, Utc};
use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use tracing::{info, warn};

use crate::market::candles::CandleStore;

/// One symbol's opening range for a trading date. Immutable once captured.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct OrbData {
    pub ticker: String,
    pub trading_date: NaiveDate,
    pub orb_high: f64,
    pub orb_low: f64,
    pub orb_range: f64,
    /// The opening bar's volume, the baseline for volume-ratio checks.
    pub orb_volume_avg: f64,
    /// Range as a fraction of the low (0.005 = 0.5%).
    pub orb_range_pct: f64,
}

impl OrbData {
    pub fn midpoint(&self) -> f64 {
        (self.orb_high + self.orb_low) / 2.0
    }
}

/// The day's captured ranges, keyed by ticker.
#[derive(Debug, Default)]
pub struct OrbBook {
    ranges: RwLock<HashMap<String, OrbData>>,
}

impl OrbBook {
    pub fn new() -> Self {
        Self::default()
    }

    /// Drop yesterday's ranges at the start of a new session.
    pub fn reset(&self) {
        self.ranges.write().clear();
    }

    /// Capture the opening range for `ticker` from the sealed 15-minute bar
    /// opening at `session_open`. Returns the data, or `None` when the bar
    /// is not complete (capture is never retried from a partial bar later —
    /// the symbol simply has no ORB today).
    pub fn capture(
        &self,
        store: &CandleStore,
        ticker: &str,
        trading_date: NaiveDate,
        session_open: DateTime<Utc>,
    ) -> Option<OrbData> {
        if self.ranges.read().contains_key(ticker) {
            return self.get(ticker);
        }

        let bar = match store.fifteen_minute_bar_at(ticker, session_open) {
            Some(bar) => bar,
            None => {
                warn!(ticker, "opening bar incomplete at capture time — no ORB today");
                return None;
            }
        };

        if bar.low <= 0.0 || bar.high < bar.low {
            warn!(ticker, high = bar.high, low = bar.low, "degenerate opening bar");
            return None;
        }

        let orb_range = bar.high - bar.low;
        let data = OrbData {
            ticker: ticker.to_string(),
            trading_date,
            orb_high: bar.high,
            orb_low: bar.low,
            orb_range,
            orb_volume_avg: bar.volume,
            orb_range_pct: orb_range / bar.low,
        };

        info!(
            ticker,
            orb_high = data.orb_high,
            orb_low = data.orb_low,
            range_pct = format!("{:.3}%", data.orb_range_pct * 100.0),
            volume = data.orb_volume_avg,
            "opening range captured"
        );

        self.ranges.write().insert(ticker.to_string(), data.clone());
        Some(data)
    }

    pub fn get(&self, ticker: &str) -> Option<OrbData> {
        self.ranges.read().get(ticker).cloned()
    }

    pub fn captured_count(&self) -> usize {
        self.ranges.read().len()
    }
}

// =============================================================================
// Tests
// =============================================================================
#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    fn t(h: u32, m: u32, s: u32) -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2026, 1, 6, h, m, s).unwrap()
    }

    fn date() -> NaiveDate {
        NaiveDate::from_ymd_opt(2026, 1, 6).unwrap()
    }

    /// Feed one print per minute across the opening window and past it.
    fn feed_opening_bar(store: &CandleStore, ticker: &str, prices: &[f64]) {
        for (i, price) in prices.iter().enumerate() {
            store.record_quote(
                ticker,
                t(14, 30 + i as u32, 10),
                *price,
                0.0,
                0.0,
                (i as f64 + 1.0) * 10_000.0,
            );
        }
        // A print past open+15m seals the window.
        store.record_quote(ticker, t(14, 45, 10), prices[prices.len() - 1], 0.0, 0.0, 200_000.0);
    }

    #[test]
    fn captures_high_low_and_volume() {
        let store = CandleStore::new();
        let prices: Vec<f64> = vec![
            184.5, 184.8, 185.0, 184.6, 184.2, 184.4, 184.9, 184.7, 184.3, 184.6, 184.8, 184.5,
            184.9, 184.4, 184.7,
        ];
        feed_opening_bar(&store, "AAPL", &prices);

        let book = OrbBook::new();
        let orb = book.capture(&store, "AAPL", date(), t(14, 30, 0)).unwrap();

        assert!((orb.orb_high - 185.0).abs() < 1e-9);
        assert!((orb.orb_low - 184.2).abs() < 1e-9);
        assert!((orb.orb_range - 0.8).abs() < 1e-9);
        assert!((orb.orb_range_pct - 0.8 / 184.2).abs() < 1e-9);
        assert!(orb.orb_volume_avg > 0.0);
    }

    #[test]
    fn capture_is_idempotent() {
        let store = CandleStore::new();
        feed_opening_bar(&store, "SPY", &[500.0; 15]);

        let book = OrbBook::new();
        let first = book.capture(&store, "SPY", date(), t(14, 30, 0)).unwrap();

        // More prints arrive; a second capture must not change anything.
        store.record_quote("SPY", t(14, 50, 0), 520.0, 0.0, 0.0, 500_000.0);
        let second = book.capture(&store, "SPY", date(), t(14, 30, 0)).unwrap();
        assert_eq!(first.orb_high, second.orb_high);
        assert_eq!(first.orb_low, second.orb_low);
    }

    #[test]
    fn no_partial_capture() {
        let store = CandleStore::new();
        // Only 5 minutes of prints, window incomplete.
        for i in 0..5 {
            store.record_quote("QQQ", t(14, 30 + i, 10), 420.0, 0.0, 0.0, 1000.0);
        }
        let book = OrbBook::new();
        assert!(book.capture(&store, "QQQ", date(), t(14, 30, 0)).is_none());
        assert_eq!(book.captured_count(), 0);
    }

    #[test]
    fn midpoint() {
        let orb = OrbData {
            ticker: "SPY".into(),
            trading_date: date(),
            orb_high: 502.0,
            orb_low: 500.0,
            orb_range: 2.0,
            orb_volume_avg: 1000.0,
            orb_range_pct: 0.004,
        };
        assert!((orb.midpoint() - 501.0).abs() < 1e-12);
    }
}
