// =============================================================================
// ORB signal generation — Standard Order and Opening Range Reversal
// =============================================================================
//
// Two families per symbol per day, each emitted at most once:
//
//   SO   evaluated exactly once at open+45m. Bullish requires the last print
//        0.2% beyond the ORB high AND the previous 15-minute candle
//        ([open+30m, open+45m)) to have closed above the ORB high and above
//        its own open. Bearish is symmetric around the ORB low with a red
//        candle. A symbol gets bullish or bearish, never both.
//
//   ORR  bullish only, first-crossing inside [open+45m, open+5h45m]: the
//        session printed strictly below the ORB low earlier, and the last
//        print is strictly above the ORB high. Rebreaks after the first
//        emission are ignored; ORR never produces a short.
//
// The engine remembers emissions per (symbol, family) for the day, so tick
// frequency cannot produce duplicates.
// =============================================================================

use std::collections::HashSet;

use chrono::{DateTime, NaiveDate, Utc};
use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use tracing::{debug, info};

use super::range::{OrbBook, OrbData};
use crate::indicators::IndicatorSnapshot;
use crate::market::candles::CandleStore;
use crate::ranker;
use crate::types::{Side, SignalType};

/// Price must clear the ORB extreme by this fraction for an SO.
pub const SO_BREAKOUT_CONFIRM: f64 = 0.002;

/// SO evaluation minute (from session open).
pub const SO_EVAL_MINUTE: i64 = 45;
/// ORR window in minutes from session open, inclusive.
pub const ORR_WINDOW: (i64, i64) = (45, 345);

/// Minimum equity eligibility score for an SO to pass its gate.
const MIN_ELIGIBILITY: f64 = 0.5;

/// One emitted breakout signal with its full market snapshot.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct OrbSignal {
    pub ticker: String,
    pub trading_date: NaiveDate,
    pub signal_type: SignalType,
    pub side: Side,
    pub price_at_emit: f64,
    pub vwap: f64,
    /// Volume over the trailing 15 minutes, the comparable window to the
    /// opening bar.
    pub volume: f64,
    /// `volume / orb.orb_volume_avg`.
    pub volume_ratio: f64,
    pub indicators: IndicatorSnapshot,
    pub eligibility_score: f64,
    pub confidence: f64,
    pub orb: OrbData,
    pub emitted_at: DateTime<Utc>,
}

impl OrbSignal {
    /// Percent the emit price sits beyond the broken ORB extreme.
    pub fn breakout_pct(&self) -> f64 {
        match self.side {
            Side::Long => {
                if self.orb.orb_high > 0.0 {
                    (self.price_at_emit - self.orb.orb_high) / self.orb.orb_high * 100.0
                } else {
                    0.0
                }
            }
            Side::Short => {
                if self.orb.orb_low > 0.0 {
                    (self.orb.orb_low - self.price_at_emit) / self.orb.orb_low * 100.0
                } else {
                    0.0
                }
            }
        }
    }
}

/// Equity eligibility score in [0, 1]: volume participation, range quality,
/// and directional momentum.
pub fn eligibility_score(
    volume_ratio: f64,
    orb_range_pct: f64,
    indicators: &IndicatorSnapshot,
    side: Side,
) -> f64 {
    let volume_score = ranker::norm_volume_ratio(volume_ratio);
    let range_score = ranker::norm_range_pct(orb_range_pct * 100.0);

    let macd = indicators.macd_histogram.unwrap_or(0.0);
    let momentum_ok = match side {
        Side::Long => macd > 0.0 || indicators.rs_vs_spy > 0.0,
        Side::Short => macd < 0.0 || indicators.rs_vs_spy < 0.0,
    };
    let momentum_score = if momentum_ok { 1.0 } else { 0.0 };

    0.40 * volume_score + 0.35 * range_score + 0.25 * momentum_score
}

/// Per-day emission memory and signal construction.
#[derive(Debug, Default)]
pub struct SignalEngine {
    emitted: RwLock<HashSet<(String, SignalType)>>,
}

impl SignalEngine {
    pub fn new() -> Self {
        Self::default()
    }

    /// Forget all emissions at the start of a new trading day.
    pub fn reset(&self) {
        self.emitted.write().clear();
    }

    pub fn has_emitted(&self, ticker: &str, signal_type: SignalType) -> bool {
        self.emitted
            .read()
            .contains(&(ticker.to_string(), signal_type))
    }

    fn mark_emitted(&self, ticker: &str, signal_type: SignalType) {
        self.emitted
            .write()
            .insert((ticker.to_string(), signal_type));
    }

    /// Trailing-15-minute volume, the window comparable to the opening bar.
    fn trailing_volume(store: &CandleStore, ticker: &str) -> f64 {
        store
            .minute_bars(ticker, 15)
            .iter()
            .map(|b| b.volume)
            .sum()
    }

    fn build_signal(
        &self,
        store: &CandleStore,
        orb: &OrbData,
        signal_type: SignalType,
        side: Side,
        now: DateTime<Utc>,
        spy_return_pct: f64,
    ) -> Option<OrbSignal> {
        let tape = store.tape(&orb.ticker)?;
        let bars = store.minute_bars(&orb.ticker, 120);

        let session_return_pct = if bars.first().map(|b| b.open).unwrap_or(0.0) > 0.0 {
            let open = bars[0].open;
            (tape.last_price - open) / open * 100.0
        } else {
            0.0
        };

        let indicators = IndicatorSnapshot::compute(
            &bars,
            tape.last_price,
            tape.vwap,
            session_return_pct,
            spy_return_pct,
        );

        let volume = Self::trailing_volume(store, &orb.ticker);
        let volume_ratio = if orb.orb_volume_avg > 0.0 {
            volume / orb.orb_volume_avg
        } else {
            0.0
        };

        let eligibility = eligibility_score(volume_ratio, orb.orb_range_pct, &indicators, side);

        let mut signal = OrbSignal {
            ticker: orb.ticker.clone(),
            trading_date: orb.trading_date,
            signal_type,
            side,
            price_at_emit: tape.last_price,
            vwap: tape.vwap,
            volume,
            volume_ratio,
            indicators,
            eligibility_score: eligibility,
            confidence: 0.0,
            orb: orb.clone(),
            emitted_at: now,
        };

        // Confidence blends the same normalized reads the ranker weighs.
        signal.confidence = (ranker::norm_breakout_pct(signal.breakout_pct())
            + ranker::norm_range_pct(orb.orb_range_pct * 100.0)
            + ranker::norm_volume_ratio(volume_ratio))
            / 3.0;

        Some(signal)
    }

    /// Evaluate the once-per-day SO at open+45m. `confirm_bar` is the sealed
    /// 15-minute candle covering [open+30m, open+45m).
    pub fn evaluate_so(
        &self,
        store: &CandleStore,
        orb_book: &OrbBook,
        ticker: &str,
        session_open: DateTime<Utc>,
        now: DateTime<Utc>,
        spy_return_pct: f64,
    ) -> Option<OrbSignal> {
        if self.has_emitted(ticker, SignalType::So) {
            return None;
        }
        let orb = orb_book.get(ticker)?;
        let tape = store.tape(ticker)?;
        let confirm_bar = store.fifteen_minute_bar_at(
            ticker,
            session_open + chrono::Duration::minutes(30),
        )?;

        let last = tape.last_price;

        let bullish = last >= orb.orb_high * (1.0 + SO_BREAKOUT_CONFIRM)
            && confirm_bar.close > orb.orb_high
            && confirm_bar.close > confirm_bar.open;

        let bearish = !bullish
            && last <= orb.orb_low * (1.0 - SO_BREAKOUT_CONFIRM)
            && confirm_bar.close < orb.orb_low
            && confirm_bar.close < confirm_bar.open;

        let side = if bullish {
            Side::Long
        } else if bearish {
            Side::Short
        } else {
            debug!(ticker, last, "SO conditions not met");
            return None;
        };

        let signal =
            self.build_signal(store, &orb, SignalType::So, side, now, spy_return_pct)?;

        if signal.eligibility_score < MIN_ELIGIBILITY {
            debug!(
                ticker,
                score = signal.eligibility_score,
                "SO rejected by eligibility gate"
            );
            return None;
        }

        self.mark_emitted(ticker, SignalType::So);
        info!(
            ticker,
            side = %side,
            price = signal.price_at_emit,
            confidence = format!("{:.2}", signal.confidence),
            "SO signal emitted"
        );
        Some(signal)
    }

    /// Scan for the first ORR crossing. Callable every tick inside the ORR
    /// window; emits at most once per symbol per day.
    pub fn scan_orr(
        &self,
        store: &CandleStore,
        orb_book: &OrbBook,
        ticker: &str,
        minutes_since_open: i64,
        now: DateTime<Utc>,
        spy_return_pct: f64,
    ) -> Option<OrbSignal> {
        if minutes_since_open < ORR_WINDOW.0 || minutes_since_open > ORR_WINDOW.1 {
            return None;
        }
        if self.has_emitted(ticker, SignalType::Orr) {
            return None;
        }
        let orb = orb_book.get(ticker)?;
        let tape = store.tape(ticker)?;

        // The V: a print strictly below the ORB low earlier in the session,
        // and the tape now strictly above the ORB high. The dip is
        // necessarily in the past because the last print is above the range.
        let dipped = tape.session_low < orb.orb_low;
        let recovered = tape.last_price > orb.orb_high;
        if !(dipped && recovered) {
            return None;
        }

        let signal =
            self.build_signal(store, &orb, SignalType::Orr, Side::Long, now, spy_return_pct)?;

        self.mark_emitted(ticker, SignalType::Orr);
        info!(
            ticker,
            price = signal.price_at_emit,
            session_low = tape.session_low,
            orb_low = orb.orb_low,
            "ORR signal emitted"
        );
        Some(signal)
    }
}
