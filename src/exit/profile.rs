// =============================================================================
// Trailing profiles — regime-bound stop distance
// =============================================================================
//
// Each position carries the regime it was tagged with at entry; the regime
// picks the trailing distance curve:
//
//   explosive  starts at max(1.0×ATR, 0.6% of price) and compresses
//              linearly as the peak favorable excursion grows, never below
//              0.35% of price. Fast movers give back little.
//   moon       starts at max(1.5×ATR, 0.9% of price); tightens to 75% of
//              the base after +7% and to 50% after +15%. Room to run, then
//              protection once the move is real.
//   balanced   constant max(1.0×ATR, 0.5% of price).
//
// Whatever the curve says, the distance is floored by a spread guard
// (2× the current bid-ask spread) and a one-cent tick floor. Positions in
// PARTIAL trail the remainder 25% tighter.
// =============================================================================

use crate::types::TradeRegime;

/// Explosive: fraction of the base distance shed per 1% of peak gain.
const EXPLOSIVE_COMPRESSION_PER_PCT: f64 = 0.06;
/// Explosive floor as a fraction of price.
const EXPLOSIVE_FLOOR_PCT: f64 = 0.0035;

/// Moon staged tightening thresholds (peak favorable %).
const MOON_FIRST_TIGHTEN_PCT: f64 = 7.0;
const MOON_SECOND_TIGHTEN_PCT: f64 = 15.0;

/// Runner (post-partial) distance multiplier.
const RUNNER_TIGHTEN_FACTOR: f64 = 0.75;

/// Absolute minimum distance in dollars.
const TICK_FLOOR: f64 = 0.01;

/// Inputs for one distance calculation.
#[derive(Debug, Clone, Copy)]
pub struct TrailInputs {
    pub regime: TradeRegime,
    /// Current ATR in price units.
    pub atr: f64,
    /// Current price.
    pub price: f64,
    /// Best favorable excursion percent seen since entry.
    pub peak_gain_pct: f64,
    /// Current bid-ask spread in price units.
    pub spread: f64,
    /// Whether the position has already scaled out (runner).
    pub is_runner: bool,
}

/// The trailing distance for the inputs, in price units.
pub fn trailing_distance(inputs: TrailInputs) -> f64 {
    let TrailInputs {
        regime,
        atr,
        price,
        peak_gain_pct,
        spread,
        is_runner,
    } = inputs;

    let peak = peak_gain_pct.max(0.0);

    let mut distance = match regime {
        TradeRegime::Explosive => {
            let base = (1.0 * atr).max(0.006 * price);
            let compressed = base * (1.0 - EXPLOSIVE_COMPRESSION_PER_PCT * peak);
            compressed.max(EXPLOSIVE_FLOOR_PCT * price)
        }
        TradeRegime::Moon => {
            let base = (1.5 * atr).max(0.009 * price);
            if peak >= MOON_SECOND_TIGHTEN_PCT {
                base * 0.50
            } else if peak >= MOON_FIRST_TIGHTEN_PCT {
                base * 0.75
            } else {
                base
            }
        }
        TradeRegime::Balanced => (1.0 * atr).max(0.005 * price),
    };

    if is_runner {
        distance *= RUNNER_TIGHTEN_FACTOR;
    }

    // Spread guard and tick floor apply in every regime.
    distance.max(2.0 * spread.max(0.0)).max(TICK_FLOOR)
}

// =============================================================================
// Tests
// =============================================================================
#[cfg(test)]
mod tests {
    use super::*;

    fn inputs(regime: TradeRegime, atr: f64, price: f64, peak: f64) -> TrailInputs {
        TrailInputs {
            regime,
            atr,
            price,
            peak_gain_pct: peak,
            spread: 0.02,
            is_runner: false,
        }
    }

    #[test]
    fn explosive_starts_at_documented_base() {
        // ATR dominates: 1.0 × 0.50 = 0.50 > 0.6% × 50 = 0.30.
        let d = trailing_distance(inputs(TradeRegime::Explosive, 0.50, 50.0, 0.0));
        assert!((d - 0.50).abs() < 1e-9);

        // Percent floor dominates on a quiet tape.
        let d = trailing_distance(inputs(TradeRegime::Explosive, 0.10, 50.0, 0.0));
        assert!((d - 0.30).abs() < 1e-9);
    }

    #[test]
    fn explosive_compresses_with_peak_gain() {
        let fresh = trailing_distance(inputs(TradeRegime::Explosive, 0.50, 50.0, 0.0));
        let extended = trailing_distance(inputs(TradeRegime::Explosive, 0.50, 50.0, 5.0));
        assert!(extended < fresh, "{extended} should be tighter than {fresh}");

        // Never below the 0.35% floor.
        let deep = trailing_distance(inputs(TradeRegime::Explosive, 0.50, 50.0, 50.0));
        assert!((deep - 0.0035 * 50.0).abs() < 1e-9);
    }

    #[test]
    fn moon_tightens_in_stages() {
        let base = trailing_distance(inputs(TradeRegime::Moon, 0.40, 50.0, 0.0));
        let after7 = trailing_distance(inputs(TradeRegime::Moon, 0.40, 50.0, 8.0));
        let after15 = trailing_distance(inputs(TradeRegime::Moon, 0.40, 50.0, 16.0));

        assert!((after7 - base * 0.75).abs() < 1e-9);
        assert!((after15 - base * 0.50).abs() < 1e-9);
    }

    #[test]
    fn balanced_ignores_peak() {
        let a = trailing_distance(inputs(TradeRegime::Balanced, 0.50, 100.0, 0.0));
        let b = trailing_distance(inputs(TradeRegime::Balanced, 0.50, 100.0, 20.0));
        assert!((a - b).abs() < 1e-12);
        assert!((a - 0.50).abs() < 1e-9);
    }

    #[test]
    fn spread_guard_floors_every_regime() {
        for regime in [TradeRegime::Explosive, TradeRegime::Moon, TradeRegime::Balanced] {
            let d = trailing_distance(TrailInputs {
                regime,
                atr: 0.01,
                price: 10.0,
                peak_gain_pct: 30.0,
                spread: 0.50, // brutal spread
                is_runner: false,
            });
            assert!(d >= 1.0, "{regime}: {d} under the spread guard");
        }
    }

    #[test]
    fn tick_floor_holds_on_degenerate_inputs() {
        let d = trailing_distance(TrailInputs {
            regime: TradeRegime::Balanced,
            atr: 0.0,
            price: 0.0,
            peak_gain_pct: 0.0,
            spread: 0.0,
            is_runner: false,
        });
        assert!((d - TICK_FLOOR).abs() < 1e-12);
    }

    #[test]
    fn runner_trails_tighter() {
        let mut i = inputs(TradeRegime::Balanced, 0.50, 100.0, 4.0);
        let normal = trailing_distance(i);
        i.is_runner = true;
        let runner = trailing_distance(i);
        assert!((runner - normal * RUNNER_TIGHTEN_FACTOR).abs() < 1e-9);
    }
}
