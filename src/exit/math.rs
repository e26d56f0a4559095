// =============================================================================
// Side-aware excursion math
// =============================================================================
//
// Every distance, comparison, and P&L in the exit engine goes through these
// helpers. No other component re-implements direction handling; a LONG/SHORT
// bug here would be a bug everywhere, so the functions stay tiny and fully
// covered.
// =============================================================================

use crate::types::Side;

/// Favorable excursion percent from entry: positive when the trade is
/// winning, regardless of side.
pub fn favorable_pct(side: Side, entry: f64, current: f64) -> f64 {
    if entry <= 0.0 {
        return 0.0;
    }
    side.direction() * (current - entry) / entry * 100.0
}

/// Signed dollar P&L for a quantity.
pub fn unrealized_pnl(side: Side, entry: f64, current: f64, quantity: f64) -> f64 {
    side.direction() * (current - entry) * quantity
}

/// A protective stop sitting `distance` away on the losing side of `price`.
pub fn stop_at_distance(side: Side, price: f64, distance: f64) -> f64 {
    match side {
        Side::Long => price - distance,
        Side::Short => price + distance,
    }
}

/// Whether `candidate` is at least as protective as `incumbent` for the
/// side. Equal stops count as "no worse".
pub fn stop_no_worse(side: Side, candidate: f64, incumbent: f64) -> bool {
    match side {
        Side::Long => candidate >= incumbent,
        Side::Short => candidate <= incumbent,
    }
}

/// How much more protective `candidate` is than `incumbent`, in price units
/// (negative when it would loosen the stop).
pub fn stop_improvement(side: Side, candidate: f64, incumbent: f64) -> f64 {
    match side {
        Side::Long => candidate - incumbent,
        Side::Short => incumbent - candidate,
    }
}

/// Whether the last print has crossed the stop.
pub fn stop_hit(side: Side, last: f64, stop: f64) -> bool {
    match side {
        Side::Long => last <= stop,
        Side::Short => last >= stop,
    }
}

/// Whether the last print has reached a profit target.
pub fn target_hit(side: Side, last: f64, target: f64) -> bool {
    match side {
        Side::Long => last >= target,
        Side::Short => last <= target,
    }
}

/// Whether `level` has been reclaimed against the position (price back on
/// the wrong side of a reference such as VWAP or the ORB midpoint).
pub fn reclaimed_against(side: Side, last: f64, level: f64) -> bool {
    match side {
        Side::Long => last < level,
        Side::Short => last > level,
    }
}
