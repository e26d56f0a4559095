// =============================================================================
// Technical Indicators
// =============================================================================
//
// Pure, side-effect-free calculations over candle/close slices. Every public
// function returns `Option<T>` so callers handle insufficient data and
// numerical edge cases explicitly.

pub mod atr;
pub mod bollinger;
pub mod ema;
pub mod macd;
pub mod rsi;

use serde::{Deserialize, Serialize};

use crate::market::candles::Candle;

/// The indicator snapshot attached to every emitted signal.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct IndicatorSnapshot {
    pub rsi_14: Option<f64>,
    pub macd_histogram: Option<f64>,
    pub atr_14: Option<f64>,
    pub bollinger_width: Option<f64>,
    pub ema_9: Option<f64>,
    pub ema_21: Option<f64>,
    /// Percent distance of last price from intraday VWAP (signed).
    pub vwap_distance_pct: f64,
    /// Relative strength vs SPY: own session return minus SPY's, in percent.
    pub rs_vs_spy: f64,
}

impl IndicatorSnapshot {
    /// Compute the snapshot from sealed minute bars plus tape context.
    ///
    /// `session_return_pct` / `spy_return_pct` are since-open returns used
    /// for the relative-strength read.
    pub fn compute(
        minute_bars: &[Candle],
        last_price: f64,
        vwap: f64,
        session_return_pct: f64,
        spy_return_pct: f64,
    ) -> Self {
        let closes: Vec<f64> = minute_bars.iter().map(|c| c.close).collect();

        let vwap_distance_pct = if vwap > 0.0 {
            (last_price - vwap) / vwap * 100.0
        } else {
            0.0
        };

        Self {
            rsi_14: rsi::latest(&closes, 14),
            macd_histogram: macd::latest(&closes).map(|m| m.histogram),
            atr_14: atr::latest(minute_bars, 14),
            bollinger_width: bollinger::latest(&closes, 20, 2.0).map(|b| b.width),
            ema_9: ema::latest(&closes, 9),
            ema_21: ema::latest(&closes, 21),
            vwap_distance_pct,
            rs_vs_spy: session_return_pct - spy_return_pct,
        }
    }
}
