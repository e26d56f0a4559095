// =============================================================================
// Average True Range (ATR) — Wilder's smoothing
// =============================================================================
//
//   TR    = max(H - L, |H - prevClose|, |L - prevClose|)
//   ATR_0 = SMA of the first `period` TR values
//   ATR_t = (ATR_{t-1} * (period - 1) + TR_t) / period
//
// =============================================================================

use crate::market::candles::Candle;

fn true_range(bar: &Candle, prev_close: f64) -> f64 {
    let hl = bar.high - bar.low;
    let hc = (bar.high - prev_close).abs();
    let lc = (bar.low - prev_close).abs();
    hl.max(hc).max(lc)
}

/// Most recent ATR over `bars` (oldest first). Needs `period + 1` bars because
/// each true range consumes the previous close.
pub fn latest(bars: &[Candle], period: usize) -> Option<f64> {
    if period == 0 || bars.len() < period + 1 {
        return None;
    }

    let trs: Vec<f64> = bars
        .windows(2)
        .map(|w| true_range(&w[1], w[0].close))
        .collect();

    let mut atr = trs[..period].iter().sum::<f64>() / period as f64;
    if !atr.is_finite() {
        return None;
    }

    let period_f = period as f64;
    for &tr in &trs[period..] {
        atr = (atr * (period_f - 1.0) + tr) / period_f;
        if !atr.is_finite() {
            return None;
        }
    }

    Some(atr)
}

/// ATR as a percentage of the latest close. Comparable across price scales.
pub fn latest_pct(bars: &[Candle], period: usize) -> Option<f64> {
    let atr = latest(bars, period)?;
    let close = bars.last()?.close;
    (close > 0.0).then(|| atr / close * 100.0)
}
