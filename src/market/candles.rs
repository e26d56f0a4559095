// =============================================================================
// Intraday candle store — quote-poll aggregation per symbol
// =============================================================================
//
// Quotes arrive from the broker on the minute tick; there is no streaming
// feed. Each `record_quote` folds the print into the in-progress 1-minute
// bar; when the minute rolls over the bar is sealed and appended. 15-minute
// bars are rolled up from sealed minute bars on demand.
//
// The store also maintains the running intraday VWAP numerator/denominator
// and the session low/high, which the ORB and exit engines consume.
// =============================================================================

use std::collections::HashMap;

use chrono::{DateTime, Duration, DurationRound, Utc};
use parking_lot::RwLock;
use serde::{Deserialize, Serialize};

/// A sealed or in-progress OHLCV bar.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Candle {
    /// Bar open instant (UTC), aligned to the interval.
    pub open_time: DateTime<Utc>,
    pub open: f64,
    pub high: f64,
    pub low: f64,
    pub close: f64,
    pub volume: f64,
}

impl Candle {
    /// Green bar: closed at or above its open.
    pub fn is_bullish(&self) -> bool {
        self.close >= self.open
    }

    /// Typical price used for VWAP accumulation.
    pub fn typical_price(&self) -> f64 {
        (self.high + self.low + self.close) / 3.0
    }
}

/// Per-symbol intraday series state.
#[derive(Debug, Default)]
struct SymbolSeries {
    /// Sealed 1-minute bars, oldest first.
    minute_bars: Vec<Candle>,
    /// The bar currently being built, if any.
    live: Option<Candle>,
    /// Cumulative volume at the start of the live bar (quote volume fields
    /// are session-cumulative, so per-bar volume is a difference).
    volume_basis: f64,
    /// Last session-cumulative volume seen.
    last_cum_volume: f64,
    /// Running VWAP accumulators.
    vwap_pv: f64,
    vwap_vol: f64,
    /// Session extremes.
    session_high: f64,
    session_low: f64,
    last_price: f64,
    last_bid: f64,
    last_ask: f64,
}

/// A snapshot of a symbol's intraday tape.
#[derive(Debug, Clone, Serialize)]
pub struct TapeSnapshot {
    pub last_price: f64,
    pub bid: f64,
    pub ask: f64,
    pub vwap: f64,
    pub session_high: f64,
    pub session_low: f64,
    pub cumulative_volume: f64,
}

impl TapeSnapshot {
    /// Bid-ask spread as a fraction of the mid, or 0 when unquoted.
    pub fn spread_pct(&self) -> f64 {
        let mid = (self.bid + self.ask) / 2.0;
        if mid > 0.0 && self.ask >= self.bid {
            (self.ask - self.bid) / mid
        } else {
            0.0
        }
    }
}

/// Thread-safe store of per-symbol intraday series.
#[derive(Debug, Default)]
pub struct CandleStore {
    series: RwLock<HashMap<String, SymbolSeries>>,
}

impl CandleStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Clear all series at the start of a new trading day.
    pub fn reset(&self) {
        self.series.write().clear();
    }

    /// Fold a quote into the symbol's series.
    ///
    /// `cum_volume` is the session-cumulative share volume as reported by the
    /// quote feed; per-bar volume is derived from its increments.
    pub fn record_quote(
        &self,
        symbol: &str,
        at: DateTime<Utc>,
        last: f64,
        bid: f64,
        ask: f64,
        cum_volume: f64,
    ) {
        if last <= 0.0 {
            return;
        }

        let minute = at
            .duration_trunc(Duration::minutes(1))
            .unwrap_or(at);

        let mut map = self.series.write();
        let s = map.entry(symbol.to_string()).or_default();

        s.last_price = last;
        s.last_bid = bid;
        s.last_ask = ask;

        if s.session_high == 0.0 || last > s.session_high {
            s.session_high = last;
        }
        if s.session_low == 0.0 || last < s.session_low {
            s.session_low = last;
        }

        let prev_cum = s.last_cum_volume;
        let monotonic_volume = cum_volume.max(prev_cum);
        s.last_cum_volume = monotonic_volume;

        match &mut s.live {
            Some(bar) if bar.open_time == minute => {
                bar.high = bar.high.max(last);
                bar.low = bar.low.min(last);
                bar.close = last;
                bar.volume = (monotonic_volume - s.volume_basis).max(0.0);
            }
            _ => {
                let first_bar = s.live.is_none() && s.minute_bars.is_empty();
                // Seal the previous bar, then open a new one.
                if let Some(done) = s.live.take() {
                    s.vwap_pv += done.typical_price() * done.volume;
                    s.vwap_vol += done.volume;
                    s.minute_bars.push(done);
                }
                // Volume printed between the sealing poll and this one belongs
                // to the new bar; pre-session volume before the first bar is
                // never attributed.
                s.volume_basis = if first_bar { monotonic_volume } else { prev_cum };
                let basis = s.volume_basis;
                s.live = Some(Candle {
                    open_time: minute,
                    open: last,
                    high: last,
                    low: last,
                    close: last,
                    volume: (monotonic_volume - basis).max(0.0),
                });
            }
        }
    }

    /// Sealed 1-minute bars, oldest first, at most `count` of the most recent.
    pub fn minute_bars(&self, symbol: &str, count: usize) -> Vec<Candle> {
        let map = self.series.read();
        match map.get(symbol) {
            Some(s) => {
                let start = s.minute_bars.len().saturating_sub(count);
                s.minute_bars[start..].to_vec()
            }
            None => Vec::new(),
        }
    }

    /// Roll sealed minute bars into 15-minute bars aligned to the session.
    /// Only complete windows are returned.
    pub fn fifteen_minute_bars(&self, symbol: &str) -> Vec<Candle> {
        let map = self.series.read();
        let Some(s) = map.get(symbol) else {
            return Vec::new();
        };

        let mut out: Vec<Candle> = Vec::new();
        for bar in &s.minute_bars {
            let window = bar
                .open_time
                .duration_trunc(Duration::minutes(15))
                .unwrap_or(bar.open_time);
            match out.last_mut() {
                Some(agg) if agg.open_time == window => {
                    agg.high = agg.high.max(bar.high);
                    agg.low = agg.low.min(bar.low);
                    agg.close = bar.close;
                    agg.volume += bar.volume;
                }
                _ => out.push(Candle {
                    open_time: window,
                    open: bar.open,
                    high: bar.high,
                    low: bar.low,
                    close: bar.close,
                    volume: bar.volume,
                }),
            }
        }

        // The last window is complete only once a minute bar beyond it has
        // been sealed (or the live bar has moved past it).
        if let Some(last_window) = out.last().map(|c| c.open_time) {
            let live_past = s
                .live
                .as_ref()
                .map(|l| l.open_time >= last_window + Duration::minutes(15))
                .unwrap_or(false);
            if !live_past {
                out.pop();
            }
        }
        out
    }

    /// The sealed 15-minute bar opening exactly at `window_open`, if complete.
    pub fn fifteen_minute_bar_at(
        &self,
        symbol: &str,
        window_open: DateTime<Utc>,
    ) -> Option<Candle> {
        self.fifteen_minute_bars(symbol)
            .into_iter()
            .find(|c| c.open_time == window_open)
    }

    /// Current tape snapshot: last/bid/ask, VWAP, session extremes.
    pub fn tape(&self, symbol: &str) -> Option<TapeSnapshot> {
        let map = self.series.read();
        let s = map.get(symbol)?;
        if s.last_price <= 0.0 {
            return None;
        }

        // Include the live bar in the VWAP so the figure tracks the tape.
        let (mut pv, mut vol) = (s.vwap_pv, s.vwap_vol);
        if let Some(live) = &s.live {
            pv += live.typical_price() * live.volume;
            vol += live.volume;
        }
        let vwap = if vol > 0.0 { pv / vol } else { s.last_price };

        Some(TapeSnapshot {
            last_price: s.last_price,
            bid: s.last_bid,
            ask: s.last_ask,
            vwap,
            session_high: s.session_high,
            session_low: s.session_low,
            cumulative_volume: s.last_cum_volume,
        })
    }

    /// Last traded price, if the symbol has printed.
    pub fn last_price(&self, symbol: &str) -> Option<f64> {
        let map = self.series.read();
        map.get(symbol).map(|s| s.last_price).filter(|p| *p > 0.0)
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

    #[test]
    fn quotes_fold_into_minute_bars() {
        let store = CandleStore::new();
        store.record_quote("SPY", t(14, 30, 5), 500.0, 499.9, 500.1, 1000.0);
        store.record_quote("SPY", t(14, 30, 35), 500.5, 500.4, 500.6, 1500.0);
        store.record_quote("SPY", t(14, 31, 5), 500.2, 500.1, 500.3, 1800.0);

        let bars = store.minute_bars("SPY", 10);
        assert_eq!(bars.len(), 1, "first minute sealed when second opened");
        let bar = &bars[0];
        assert!((bar.open - 500.0).abs() < 1e-9);
        assert!((bar.high - 500.5).abs() < 1e-9);
        assert!((bar.close - 500.5).abs() < 1e-9);
        assert!((bar.volume - 500.0).abs() < 1e-9);
    }

    #[test]
    fn session_extremes_track_prints() {
        let store = CandleStore::new();
        store.record_quote("QQQ", t(14, 30, 0), 420.0, 419.9, 420.1, 100.0);
        store.record_quote("QQQ", t(14, 31, 0), 417.5, 417.4, 417.6, 200.0);
        store.record_quote("QQQ", t(14, 32, 0), 421.0, 420.9, 421.1, 300.0);

        let tape = store.tape("QQQ").unwrap();
        assert!((tape.session_low - 417.5).abs() < 1e-9);
        assert!((tape.session_high - 421.0).abs() < 1e-9);
        assert!((tape.last_price - 421.0).abs() < 1e-9);
    }

    #[test]
    fn fifteen_minute_rollup_requires_complete_window() {
        let store = CandleStore::new();
        // Fill 14:30..14:45 with one print per minute, then one past it.
        for m in 0..15 {
            store.record_quote(
                "SPY",
                t(14, 30 + m, 10),
                500.0 + m as f64 * 0.1,
                0.0,
                0.0,
                (m as f64 + 1.0) * 100.0,
            );
        }
        // Nothing sealed past the window yet: incomplete.
        assert!(store.fifteen_minute_bars("SPY").is_empty());

        // A print in 14:45 seals minute 14:44 and moves the live bar past
        // the window.
        store.record_quote("SPY", t(14, 45, 10), 501.6, 0.0, 0.0, 1700.0);
        let bars = store.fifteen_minute_bars("SPY");
        assert_eq!(bars.len(), 1);
        assert_eq!(bars[0].open_time, t(14, 30, 0));
        assert!((bars[0].open - 500.0).abs() < 1e-9);
        assert!((bars[0].close - 501.4).abs() < 1e-9);
    }

    #[test]
    fn vwap_weights_by_volume() {
        let store = CandleStore::new();
        // Two sealed bars with very different volumes.
        store.record_quote("IWM", t(14, 30, 10), 200.0, 0.0, 0.0, 0.0);
        store.record_quote("IWM", t(14, 30, 50), 200.0, 0.0, 0.0, 1000.0);
        store.record_quote("IWM", t(14, 31, 10), 210.0, 0.0, 0.0, 1010.0);
        store.record_quote("IWM", t(14, 31, 50), 210.0, 0.0, 0.0, 1020.0);
        store.record_quote("IWM", t(14, 32, 10), 205.0, 0.0, 0.0, 1030.0);

        let tape = store.tape("IWM").unwrap();
        // The heavy bar printed at 200, so VWAP sits near 200, not 205.
        assert!(tape.vwap < 202.0, "vwap {} should be near 200", tape.vwap);
    }

    #[test]
    fn spread_pct_from_tape() {
        let store = CandleStore::new();
        store.record_quote("SPY", t(14, 30, 0), 500.0, 499.5, 500.5, 100.0);
        let tape = store.tape("SPY").unwrap();
        assert!((tape.spread_pct() - 0.002).abs() < 1e-6);
    }

    #[test]
    fn unknown_symbol_yields_nothing() {
        let store = CandleStore::new();
        assert!(store.tape("XYZ").is_none());
        assert!(store.last_price("XYZ").is_none());
        assert!(store.minute_bars("XYZ", 5).is_empty());
    }
}
