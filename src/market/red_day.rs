// =============================================================================
// Red-day detector — signal-batch risk assessment
// =============================================================================
//
// Before capital deploys, the day itself is scored. The detector looks at
// the emitted signal batch plus the index tape and grades the risk that the
// session is a "red day" where breakouts fail en masse:
//
//   * market context   SPY below its open and below VWAP
//   * technical        overbought RSI share and MACD weakness across signals
//   * participation    average volume ratio of the batch
//
// The composite risk score maps to a recommendation: trade full size, scale
// down, or stand down entirely. The 0DTE convex filter consumes the binary
// `is_red_day` view; the equity sizer can consume the multiplier.
// =============================================================================

use serde::Serialize;
use tracing::{debug, info};

use crate::orb::signals::OrbSignal;
use crate::types::Side;

/// RSI above this counts a signal as overbought at entry.
const RSI_OVERBOUGHT: f64 = 70.0;
/// Risk score thresholds.
const RISK_HIGH: f64 = 0.75;
const RISK_MEDIUM_HIGH: f64 = 0.60;
const RISK_MEDIUM: f64 = 0.45;
const RISK_LOW_MEDIUM: f64 = 0.30;
/// Batch average volume ratio below this is a participation collapse.
const VOLUME_COLLAPSE_RATIO: f64 = 0.5;

/// Final position-size guidance for the day.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum DayRecommendation {
    /// Stand down: no new entries.
    SkipDay,
    /// Cut size hard (25% of normal).
    ReduceMajor,
    /// Half size.
    Reduce,
    /// Slightly reduced (75%).
    ReduceMinor,
    /// Full size.
    Proceed,
}

impl DayRecommendation {
    /// Size multiplier applied to allocations for the day.
    pub fn size_multiplier(&self) -> f64 {
        match self {
            Self::SkipDay => 0.0,
            Self::ReduceMajor => 0.25,
            Self::Reduce => 0.50,
            Self::ReduceMinor => 0.75,
            Self::Proceed => 1.0,
        }
    }
}

/// The detector's full assessment.
#[derive(Debug, Clone, Serialize)]
pub struct RedDayAssessment {
    pub risk_score: f64,
    pub is_red_day: bool,
    pub recommendation: DayRecommendation,
    /// Fraction of signals carrying an overbought RSI.
    pub rsi_weakness_pct: f64,
    /// Fraction of signals with MACD leaning against their direction.
    pub macd_weakness_pct: f64,
    pub avg_volume_ratio: f64,
    pub spy_below_open: bool,
    pub spy_below_vwap: bool,
}

/// Index tape context supplied by the engine.
#[derive(Debug, Clone, Copy, Default)]
pub struct IndexContext {
    /// SPY session return since open, percent.
    pub spy_return_pct: f64,
    /// SPY last relative to its intraday VWAP, percent.
    pub spy_vwap_distance_pct: f64,
}

/// Grade the day from the signal batch and index context.
pub fn assess(signals: &[OrbSignal], index: IndexContext) -> RedDayAssessment {
    // ── Technical weakness across the batch ─────────────────────────────
    let n = signals.len().max(1) as f64;
    let rsi_weak = signals
        .iter()
        .filter(|s| s.indicators.rsi_14.map(|r| r >= RSI_OVERBOUGHT).unwrap_or(false))
        .count() as f64
        / n;
    let macd_weak = signals
        .iter()
        .filter(|s| {
            let hist = s.indicators.macd_histogram.unwrap_or(0.0);
            match s.side {
                Side::Long => hist < 0.0,
                Side::Short => hist > 0.0,
            }
        })
        .count() as f64
        / n;
    let avg_volume_ratio = if signals.is_empty() {
        1.0
    } else {
        signals.iter().map(|s| s.volume_ratio).sum::<f64>() / n
    };

    // ── Context ─────────────────────────────────────────────────────────
    let spy_below_open = index.spy_return_pct < 0.0;
    let spy_below_vwap = index.spy_vwap_distance_pct < 0.0;

    // ── Composite score ─────────────────────────────────────────────────
    let technical_score = 0.6 * rsi_weak + 0.4 * macd_weak;
    let context_score = match (spy_below_open, spy_below_vwap) {
        (true, true) => 1.0,
        (true, false) | (false, true) => 0.5,
        (false, false) => 0.0,
    };
    let volume_score = if avg_volume_ratio <= VOLUME_COLLAPSE_RATIO {
        1.0
    } else if avg_volume_ratio < 1.0 {
        (1.0 - avg_volume_ratio) / (1.0 - VOLUME_COLLAPSE_RATIO)
    } else {
        0.0
    };

    let risk_score = (0.40 * technical_score + 0.35 * context_score + 0.25 * volume_score)
        .clamp(0.0, 1.0);

    let recommendation = if risk_score >= RISK_HIGH {
        DayRecommendation::SkipDay
    } else if risk_score >= RISK_MEDIUM_HIGH {
        DayRecommendation::ReduceMajor
    } else if risk_score >= RISK_MEDIUM {
        DayRecommendation::Reduce
    } else if risk_score >= RISK_LOW_MEDIUM {
        DayRecommendation::ReduceMinor
    } else {
        DayRecommendation::Proceed
    };

    let assessment = RedDayAssessment {
        risk_score,
        is_red_day: risk_score >= RISK_MEDIUM_HIGH,
        recommendation,
        rsi_weakness_pct: rsi_weak,
        macd_weakness_pct: macd_weak,
        avg_volume_ratio,
        spy_below_open,
        spy_below_vwap,
    };

    if assessment.is_red_day {
        info!(
            risk = format!("{risk_score:.2}"),
            recommendation = ?recommendation,
            "red day detected"
        );
    } else {
        debug!(risk = format!("{risk_score:.2}"), "day risk assessed");
    }
    assessment
}
