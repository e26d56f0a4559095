// =============================================================================
// Signal quality grading and batch composition
// =============================================================================
//
// Two reads over an emitted batch before capital commits:
//
//   * Per-signal grade (A+ through D) from confidence, participation, and
//     range quality. The grade travels in logs and the open report so the
//     operator sees at a glance what kind of day the engine is having.
//   * Batch composition: how leveraged-heavy the batch is, how concentrated
//     in one direction, and the average conviction. A batch that is all
//     3x longs in one sector is a different risk than four independent
//     breakouts, at the same individual scores.
// =============================================================================

use serde::Serialize;

use super::signals::OrbSignal;
use crate::types::Side;
use crate::watchlist::Watchlist;

/// Letter grade for one signal.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize)]
pub enum SignalGrade {
    D,
    C,
    B,
    A,
    APlus,
}

impl std::fmt::Display for SignalGrade {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::APlus => write!(f, "A+"),
            Self::A => write!(f, "A"),
            Self::B => write!(f, "B"),
            Self::C => write!(f, "C"),
            Self::D => write!(f, "D"),
        }
    }
}

/// Grade a signal from its conviction and participation reads.
pub fn grade(signal: &OrbSignal) -> SignalGrade {
    // Blend the three quality axes; each is already in [0, 1]-ish space.
    let volume_axis = (signal.volume_ratio / 3.0).min(1.0);
    let range_axis = (signal.orb.orb_range_pct * 100.0 / 0.5).min(1.0);
    let composite = 0.5 * signal.confidence + 0.3 * volume_axis + 0.2 * range_axis;

    if composite >= 0.80 {
        SignalGrade::APlus
    } else if composite >= 0.65 {
        SignalGrade::A
    } else if composite >= 0.50 {
        SignalGrade::B
    } else if composite >= 0.35 {
        SignalGrade::C
    } else {
        SignalGrade::D
    }
}

/// Composition analysis over a batch.
#[derive(Debug, Clone, Serialize)]
pub struct BatchComposition {
    pub total: usize,
    pub long_count: usize,
    pub short_count: usize,
    /// Fraction of the batch on leveraged products.
    pub leveraged_pct: f64,
    pub avg_confidence: f64,
    pub avg_volume_ratio: f64,
    /// Strongest grade present in the batch.
    pub best_grade: Option<SignalGrade>,
    /// True when every signal points the same way on leveraged products —
    /// the concentration shape that amplifies a reversal.
    pub one_way_leveraged: bool,
}

/// Analyze a batch against the watchlist's static attributes.
pub fn analyze(signals: &[OrbSignal], watchlist: &Watchlist) -> BatchComposition {
    let total = signals.len();
    let long_count = signals.iter().filter(|s| s.side == Side::Long).count();
    let short_count = total - long_count;

    let leveraged = signals
        .iter()
        .filter(|s| {
            watchlist
                .get(&s.ticker)
                .map(|w| w.is_leveraged)
                .unwrap_or(false)
        })
        .count();

    let n = total.max(1) as f64;
    let avg_confidence = signals.iter().map(|s| s.confidence).sum::<f64>() / n;
    let avg_volume_ratio = signals.iter().map(|s| s.volume_ratio).sum::<f64>() / n;
    let best_grade = signals.iter().map(grade).max();

    let one_way = total > 0 && (long_count == total || short_count == total);
    let leveraged_pct = leveraged as f64 / n;

    BatchComposition {
        total,
        long_count,
        short_count,
        leveraged_pct,
        avg_confidence,
        avg_volume_ratio,
        best_grade,
        one_way_leveraged: one_way && leveraged_pct >= 0.5,
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

    fn signal(ticker: &str, side: Side, confidence: f64, volume_ratio: f64, range_pct: f64) -> OrbSignal {
        OrbSignal {
            ticker: ticker.into(),
            trading_date: NaiveDate::from_ymd_opt(2026, 1, 6).unwrap(),
            signal_type: SignalType::So,
            side,
            price_at_emit: 100.0,
            vwap: 99.5,
            volume: 1_000_000.0,
            volume_ratio,
            indicators: IndicatorSnapshot::default(),
            eligibility_score: 0.8,
            confidence,
            orb: OrbData {
                ticker: ticker.into(),
                trading_date: NaiveDate::from_ymd_opt(2026, 1, 6).unwrap(),
                orb_high: 99.0,
                orb_low: 98.0,
                orb_range: 98.0 * range_pct / 100.0,
                orb_volume_avg: 500_000.0,
                orb_range_pct: range_pct / 100.0,
            },
            emitted_at: Utc.with_ymd_and_hms(2026, 1, 6, 15, 15, 0).unwrap(),
        }
    }

    #[test]
    fn grades_order_by_quality() {
        let strong = grade(&signal("TQQQ", Side::Long, 0.9, 3.5, 0.6));
        let middling = grade(&signal("SPY", Side::Long, 0.5, 1.5, 0.3));
        let weak = grade(&signal("IWM", Side::Long, 0.1, 0.8, 0.1));

        assert_eq!(strong, SignalGrade::APlus);
        assert!(strong > middling, "{strong} should outrank {middling}");
        assert!(middling > weak, "{middling} should outrank {weak}");
    }

    #[test]
    fn grade_boundaries() {
        // confidence 0.5, volume 1.5/3 = 0.5, range 0.25/0.5 = 0.5 →
        // composite exactly 0.5 → B.
        let s = signal("SPY", Side::Long, 0.5, 1.5, 0.25);
        assert_eq!(grade(&s), SignalGrade::B);
    }

    #[test]
    fn composition_counts_directions() {
        let list = Watchlist::from_tickers(&["SPY", "TQQQ", "SQQQ"]);
        let batch = vec![
            signal("SPY", Side::Long, 0.6, 1.5, 0.3),
            signal("TQQQ", Side::Long, 0.7, 2.0, 0.4),
            signal("SQQQ", Side::Short, 0.5, 1.2, 0.3),
        ];
        let c = analyze(&batch, &list);
        assert_eq!(c.total, 3);
        assert_eq!(c.long_count, 2);
        assert_eq!(c.short_count, 1);
        assert!((c.leveraged_pct - 2.0 / 3.0).abs() < 1e-9);
        assert!(!c.one_way_leveraged, "mixed directions");
    }

    #[test]
    fn one_way_leveraged_flag() {
        let list = Watchlist::from_tickers(&["TQQQ", "SPXL"]);
        let batch = vec![
            signal("TQQQ", Side::Long, 0.7, 2.0, 0.4),
            signal("SPXL", Side::Long, 0.6, 1.8, 0.35),
        ];
        let c = analyze(&batch, &list);
        assert!(c.one_way_leveraged);
    }

    #[test]
    fn empty_batch_is_neutral() {
        let list = Watchlist::from_tickers(&["SPY"]);
        let c = analyze(&[], &list);
        assert_eq!(c.total, 0);
        assert!(c.best_grade.is_none());
        assert!(!c.one_way_leveraged);
    }
}
