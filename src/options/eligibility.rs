// =============================================================================
// Convex eligibility filter — hard gates over ORB signals
// =============================================================================
//
// A signal reaches the options pipeline only when ALL gates hold:
//
//   1. Not a red day.
//   2. ORB range ≥ 0.25% OR the 5-minute ATR ≥ 0.25% of price.
//   3. The breakout is real: long above the ORB high, short below the low.
//   4. Current bar volume above the opening-bar baseline.
//   5. Price on the right side of VWAP for the direction.
//   6. Momentum confirmation (MACD histogram, RS vs SPY, or VWAP distance).
//   7. Market regime in {trend, impulse}; rotation tapes are rejected.
//
// Volatility participation is ranked against the whole batch; leveraged
// ETFs get a 10-point-lower percentile bar. On top of the gates a weighted
// score is computed and must clear 0.75.
// =============================================================================

use serde::Serialize;
use tracing::debug;

use crate::orb::signals::OrbSignal;
use crate::types::Side;

/// Minimum ORB range (percent) or ATR (percent of price).
const MIN_RANGE_PCT: f64 = 0.25;
/// Volatility percentile bar; leveraged ETFs get this minus 0.10.
const VOLATILITY_PERCENTILE: f64 = 0.70;
const LEVERAGED_PERCENTILE_FLOOR: f64 = 0.60;
/// Overall score threshold.
const MIN_SCORE: f64 = 0.75;

/// VWAP-distance percent that counts as momentum confirmation.
const MOMENTUM_VWAP_DISTANCE: f64 = 0.5;
/// Regime inference thresholds.
const TREND_VWAP_DISTANCE: f64 = 1.0;
const TREND_RS: f64 = 2.0;

/// Inferred market regime for gate 7.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum MarketRegime {
    Trend,
    Impulse,
    Rotation,
}

/// Infer the regime from VWAP stretch and relative strength.
pub fn infer_regime(vwap_distance_pct: f64, rs_vs_spy: f64) -> MarketRegime {
    if vwap_distance_pct.abs() > TREND_VWAP_DISTANCE {
        MarketRegime::Trend
    } else if rs_vs_spy.abs() > TREND_RS {
        MarketRegime::Impulse
    } else {
        MarketRegime::Rotation
    }
}

/// The filter's verdict on one signal.
#[derive(Debug, Clone, Serialize)]
pub struct ConvexVerdict {
    pub ticker: String,
    pub eligible: bool,
    pub score: f64,
    pub passes: Vec<&'static str>,
    pub rejections: Vec<&'static str>,
}

/// Batch-independent inputs per signal.
#[derive(Debug, Clone, Copy)]
pub struct ConvexInputs {
    pub is_red_day: bool,
    pub is_leveraged: bool,
    /// The signal's volatility-participation percentile within the batch
    /// (0 = weakest, 1 = strongest).
    pub volatility_percentile: f64,
}

/// Percentile of each signal's volume ratio within the batch.
pub fn volatility_percentiles(signals: &[OrbSignal]) -> Vec<f64> {
    let n = signals.len();
    if n <= 1 {
        return vec![1.0; n];
    }
    signals
        .iter()
        .map(|s| {
            let below = signals
                .iter()
                .filter(|o| o.volume_ratio < s.volume_ratio)
                .count();
            below as f64 / (n - 1) as f64
        })
        .collect()
}

/// Apply the filter to one signal.
pub fn evaluate(signal: &OrbSignal, inputs: ConvexInputs) -> ConvexVerdict {
    let mut passes = Vec::new();
    let mut rejections = Vec::new();

    // ── Gate 1: red day ─────────────────────────────────────────────────
    if inputs.is_red_day {
        rejections.push("red_day");
    } else {
        passes.push("not_red_day");
    }

    // ── Gate 2: range or ATR ────────────────────────────────────────────
    let range_pct = signal.orb.orb_range_pct * 100.0;
    let atr_pct = signal
        .indicators
        .atr_14
        .map(|atr| {
            if signal.price_at_emit > 0.0 {
                atr / signal.price_at_emit * 100.0
            } else {
                0.0
            }
        })
        .unwrap_or(0.0);
    let range_ok = range_pct >= MIN_RANGE_PCT;
    let atr_ok = atr_pct >= MIN_RANGE_PCT;
    if range_ok || atr_ok {
        passes.push("range_or_atr");
    } else {
        rejections.push("range_or_atr");
    }

    // ── Gate 3: real breakout ───────────────────────────────────────────
    let break_ok = match signal.side {
        Side::Long => signal.price_at_emit > signal.orb.orb_high,
        Side::Short => signal.price_at_emit < signal.orb.orb_low,
    };
    if break_ok {
        passes.push("orb_break");
    } else {
        rejections.push("orb_break");
    }

    // ── Gate 4: volume ──────────────────────────────────────────────────
    if signal.volume_ratio > 1.0 {
        passes.push("volume");
    } else {
        rejections.push("volume");
    }

    // ── Gate 5: VWAP side ───────────────────────────────────────────────
    let vwap_ok = match signal.side {
        Side::Long => signal.price_at_emit >= signal.vwap,
        Side::Short => signal.price_at_emit <= signal.vwap,
    };
    if vwap_ok {
        passes.push("vwap");
    } else {
        rejections.push("vwap");
    }

    // ── Gate 6: momentum confirmation ───────────────────────────────────
    let macd = signal.indicators.macd_histogram.unwrap_or(0.0);
    let momentum_ok = match signal.side {
        Side::Long => {
            macd > 0.0
                || signal.indicators.rs_vs_spy > 0.0
                || signal.indicators.vwap_distance_pct > MOMENTUM_VWAP_DISTANCE
        }
        Side::Short => {
            macd < 0.0
                || signal.indicators.rs_vs_spy < 0.0
                || signal.indicators.vwap_distance_pct < -MOMENTUM_VWAP_DISTANCE
        }
    };
    if momentum_ok {
        passes.push("momentum");
    } else {
        rejections.push("momentum");
    }

    // ── Gate 7: regime ──────────────────────────────────────────────────
    let regime = infer_regime(
        signal.indicators.vwap_distance_pct,
        signal.indicators.rs_vs_spy,
    );
    if regime != MarketRegime::Rotation {
        passes.push("regime");
    } else {
        rejections.push("regime");
    }

    // ── Volatility participation percentile ─────────────────────────────
    let percentile_bar = if inputs.is_leveraged {
        (VOLATILITY_PERCENTILE - 0.10).max(LEVERAGED_PERCENTILE_FLOOR)
    } else {
        VOLATILITY_PERCENTILE
    };
    let volatility_ok = inputs.volatility_percentile >= percentile_bar;
    if volatility_ok {
        passes.push("volatility");
    } else {
        rejections.push("volatility");
    }

    // ── Weighted score ──────────────────────────────────────────────────
    let mut score = 0.0;
    if volatility_ok {
        score += 0.40;
    }
    if range_ok {
        score += 0.25 * (range_pct / MIN_RANGE_PCT * 0.5).min(1.0);
    } else if atr_ok {
        score += 0.20;
    }
    if !inputs.is_red_day {
        score += 0.15;
    }
    if momentum_ok {
        score += 0.10;
    }
    if regime != MarketRegime::Rotation {
        score += 0.10;
    }

    let eligible = rejections.is_empty() && score >= MIN_SCORE;

    debug!(
        ticker = %signal.ticker,
        eligible,
        score = format!("{score:.2}"),
        rejections = ?rejections,
        "convex filter evaluated"
    );

    ConvexVerdict {
        ticker: signal.ticker.clone(),
        eligible,
        score,
        passes,
        rejections,
    }
}

// =============================================================================
// Tests
// =============================================================================
#[cfg(test)]
mod tests {
    use super::*;
    use crate::indicators::IndicatorSnapshot;
    use crate::orb::range::OrbData;
    use crate::types::SignalType;
    use chrono::{NaiveDate, TimeZone, Utc};

    /// A signal engineered to pass every gate.
    fn strong_signal() -> OrbSignal {
        OrbSignal {
            ticker: "SPY".into(),
            trading_date: NaiveDate::from_ymd_opt(2026, 1, 6).unwrap(),
            signal_type: SignalType::So,
            side: Side::Long,
            price_at_emit: 502.5,
            vwap: 500.0,
            volume: 3_000_000.0,
            volume_ratio: 2.5,
            indicators: IndicatorSnapshot {
                rsi_14: Some(62.0),
                macd_histogram: Some(0.15),
                atr_14: Some(1.6), // 0.32% of price
                bollinger_width: Some(0.8),
                ema_9: Some(501.0),
                ema_21: Some(500.0),
                vwap_distance_pct: 1.4,
                rs_vs_spy: 0.0,
            },
            eligibility_score: 0.8,
            confidence: 0.7,
            orb: OrbData {
                ticker: "SPY".into(),
                trading_date: NaiveDate::from_ymd_opt(2026, 1, 6).unwrap(),
                orb_high: 501.5,
                orb_low: 500.0,
                orb_range: 1.5,
                orb_volume_avg: 1_200_000.0,
                orb_range_pct: 0.003, // 0.30%
            },
            emitted_at: Utc.with_ymd_and_hms(2026, 1, 6, 15, 15, 0).unwrap(),
        }
    }

    fn inputs() -> ConvexInputs {
        ConvexInputs {
            is_red_day: false,
            is_leveraged: false,
            volatility_percentile: 0.85,
        }
    }

    #[test]
    fn strong_signal_is_eligible() {
        let verdict = evaluate(&strong_signal(), inputs());
        assert!(verdict.eligible, "rejections: {:?}", verdict.rejections);
        assert!(verdict.score >= MIN_SCORE);
    }

    #[test]
    fn red_day_rejects() {
        let mut i = inputs();
        i.is_red_day = true;
        let verdict = evaluate(&strong_signal(), i);
        assert!(!verdict.eligible);
        assert!(verdict.rejections.contains(&"red_day"));
    }

    #[test]
    fn tight_range_without_atr_rejects() {
        let mut s = strong_signal();
        s.orb.orb_range_pct = 0.001; // 0.10%
        s.indicators.atr_14 = Some(0.5); // 0.10% of price
        let verdict = evaluate(&s, inputs());
        assert!(!verdict.eligible);
        assert!(verdict.rejections.contains(&"range_or_atr"));
    }

    #[test]
    fn atr_alternative_satisfies_range_gate() {
        let mut s = strong_signal();
        s.orb.orb_range_pct = 0.001; // range fails
        s.indicators.atr_14 = Some(1.6); // ATR passes
        let verdict = evaluate(&s, inputs());
        assert!(
            !verdict.rejections.contains(&"range_or_atr"),
            "ATR should satisfy the gate"
        );
    }

    #[test]
    fn failed_breakout_rejects() {
        let mut s = strong_signal();
        s.price_at_emit = 501.0; // back inside the range
        let verdict = evaluate(&s, inputs());
        assert!(verdict.rejections.contains(&"orb_break"));
    }

    #[test]
    fn weak_volume_rejects() {
        let mut s = strong_signal();
        s.volume_ratio = 0.8;
        let verdict = evaluate(&s, inputs());
        assert!(verdict.rejections.contains(&"volume"));
    }

    #[test]
    fn wrong_side_of_vwap_rejects() {
        let mut s = strong_signal();
        s.vwap = 503.0; // long below VWAP
        let verdict = evaluate(&s, inputs());
        assert!(verdict.rejections.contains(&"vwap"));
    }

    #[test]
    fn rotation_regime_rejects() {
        let mut s = strong_signal();
        s.indicators.vwap_distance_pct = 0.3;
        s.indicators.rs_vs_spy = 0.5;
        let verdict = evaluate(&s, inputs());
        assert!(verdict.rejections.contains(&"regime"));
    }

    #[test]
    fn momentum_via_rs_or_vwap_distance() {
        let mut s = strong_signal();
        // Kill MACD; RS carries the gate.
        s.indicators.macd_histogram = Some(-0.1);
        s.indicators.rs_vs_spy = 2.5;
        let verdict = evaluate(&s, inputs());
        assert!(!verdict.rejections.contains(&"momentum"));
    }

    #[test]
    fn leveraged_gets_lower_percentile_bar() {
        let mut i = inputs();
        i.volatility_percentile = 0.65;

        // Plain ETF at 0.65 misses the 0.70 bar.
        let verdict = evaluate(&strong_signal(), i);
        assert!(verdict.rejections.contains(&"volatility"));

        // Leveraged at the same percentile clears 0.60.
        i.is_leveraged = true;
        let verdict = evaluate(&strong_signal(), i);
        assert!(!verdict.rejections.contains(&"volatility"));
    }

    #[test]
    fn percentiles_rank_the_batch() {
        let mut a = strong_signal();
        a.volume_ratio = 1.0;
        let mut b = strong_signal();
        b.volume_ratio = 2.0;
        let mut c = strong_signal();
        c.volume_ratio = 3.0;

        let ps = volatility_percentiles(&[a, b, c]);
        assert_eq!(ps, vec![0.0, 0.5, 1.0]);
    }

    #[test]
    fn regime_inference() {
        assert_eq!(infer_regime(1.5, 0.0), MarketRegime::Trend);
        assert_eq!(infer_regime(0.2, 2.5), MarketRegime::Impulse);
        assert_eq!(infer_regime(0.2, 0.5), MarketRegime::Rotation);
    }

    #[test]
    fn short_side_gates_mirror() {
        let mut s = strong_signal();
        s.side = Side::Short;
        s.price_at_emit = 499.0; // below the ORB low
        s.vwap = 499.5; // short above... no: short needs last ≤ vwap
        s.indicators.macd_histogram = Some(-0.2);
        s.indicators.vwap_distance_pct = -1.4;
        let verdict = evaluate(&s, inputs());
        assert!(verdict.eligible, "rejections: {:?}", verdict.rejections);
    }
}
