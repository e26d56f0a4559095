// =============================================================================
// Exit triggers — strict-priority evaluation per monitor tick
// =============================================================================
//
// `evaluate_exit` inspects one position snapshot against the current market
// context and returns the first trigger that fires, in this order:
//
//   1. Fail-safe      liquidity collapse (spread blowout vs entry)
//   2. Hard stop      last print through the committed stop
//   3. Gap risk       drop from the 45-minute time-weighted peak while the
//                     position is already TRAILING/PARTIAL
//   4. Invalidation   VWAP reclaim, ORB-midpoint reclaim, breakout fully
//                     retraced, or a momentum flip against the position
//   5. Time stop      no meaningful favorable move inside the grace window
//   6. Profit ladder  +3% → close 50%, +7% → close 25%, remainder runs
//   7. Runner exit    PARTIAL only: structural reclaim or the EOD cutoff
//   8. EOD            mandatory close 5 minutes before the bell
//
// The function is pure: no locks, no I/O. Stop *placement* (trailing,
// breakeven promotion) lives in `desired_stop`, which the monitor applies
// separately when no trigger fires.
// =============================================================================

use chrono::{DateTime, Utc};
use serde::Serialize;

use super::math;
use super::profile::{trailing_distance, TrailInputs};
use super::registry::{LifecyclePhase, Position};

/// Why a position is being (partially) closed.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum ExitReason {
    FailSafe,
    HardStop,
    GapRisk,
    VwapReclaim,
    MidpointReclaim,
    BreakoutRetraced,
    MomentumFlip,
    TimeStop,
    ProfitTarget1,
    ProfitTarget2,
    RunnerExit,
    EndOfDay,
}

impl std::fmt::Display for ExitReason {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            Self::FailSafe => "FAIL_SAFE",
            Self::HardStop => "HARD_STOP",
            Self::GapRisk => "GAP_RISK",
            Self::VwapReclaim => "VWAP_RECLAIM",
            Self::MidpointReclaim => "MIDPOINT_RECLAIM",
            Self::BreakoutRetraced => "BREAKOUT_RETRACED",
            Self::MomentumFlip => "MOMENTUM_FLIP",
            Self::TimeStop => "TIME_STOP",
            Self::ProfitTarget1 => "PROFIT_TARGET_1",
            Self::ProfitTarget2 => "PROFIT_TARGET_2",
            Self::RunnerExit => "RUNNER_EXIT",
            Self::EndOfDay => "EOD",
        };
        f.write_str(s)
    }
}

/// What the monitor should do with the position this tick.
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum ExitAction {
    Hold,
    /// Close `fraction_of_remaining` of the open quantity.
    PartialClose {
        fraction_of_remaining: f64,
        rung: u8,
        reason: ExitReason,
    },
    Close { reason: ExitReason },
}

/// Market context for one evaluation, assembled by the monitor.
#[derive(Debug, Clone, Copy)]
pub struct MarketContext {
    pub last: f64,
    /// Bid-ask spread as a fraction of mid.
    pub spread_pct: f64,
    pub vwap: f64,
    pub orb_high: f64,
    pub orb_low: f64,
    pub orb_midpoint: f64,
    /// Current ATR in price units.
    pub atr: f64,
    /// Drop from the time-weighted peak exceeded the gap threshold.
    pub gap_detected: bool,
    /// Momentum flipped hard against the position.
    pub momentum_flip: bool,
    pub minutes_to_close: i64,
    pub now: DateTime<Utc>,
}

/// Tunables for the equity exit path.
#[derive(Debug, Clone, Copy)]
pub struct ExitConfig {
    /// Spread-blowout multiple of the entry spread that trips the fail-safe.
    pub fail_safe_spread_mult: f64,
    /// Absolute spread floor under which the fail-safe never fires.
    pub fail_safe_spread_floor: f64,
    /// Grace window before the time stop applies.
    pub time_stop_minutes: i64,
    /// Peak favorable % that exempts a position from the time stop.
    pub time_stop_min_gain_pct: f64,
    /// Profit ladder rungs (favorable %, fraction of remaining to close).
    pub first_target_pct: f64,
    pub second_target_pct: f64,
    /// Minutes before close at which runners are cut.
    pub runner_cutoff_minutes: i64,
    /// Minutes before close for the mandatory EOD sweep.
    pub eod_minutes: i64,
    /// Margin past the ORB extreme that counts as "fully retraced".
    pub retrace_confirm: f64,
    /// Minutes after entry before a position leaves FRESH.
    pub fresh_minutes: i64,
    /// Peak favorable % that promotes the stop to breakeven.
    pub breakeven_trigger_pct: f64,
    /// Peak favorable % that activates trailing.
    pub trailing_activation_pct: f64,
}

impl Default for ExitConfig {
    fn default() -> Self {
        Self {
            fail_safe_spread_mult: 1.5,
            fail_safe_spread_floor: 0.002,
            time_stop_minutes: 25,
            time_stop_min_gain_pct: 5.0,
            first_target_pct: 3.0,
            second_target_pct: 7.0,
            runner_cutoff_minutes: 15,
            eod_minutes: 5,
            retrace_confirm: 0.002,
            fresh_minutes: 30,
            breakeven_trigger_pct: 0.5,
            trailing_activation_pct: 1.0,
        }
    }
}

/// First-match evaluation in strict priority order.
pub fn evaluate_exit(p: &Position, ctx: &MarketContext, cfg: &ExitConfig) -> ExitAction {
    // ── 1. Fail-safe: liquidity collapse ────────────────────────────────
    let spread_trip = (p.entry_spread_pct * cfg.fail_safe_spread_mult)
        .max(cfg.fail_safe_spread_floor);
    if ctx.spread_pct > spread_trip {
        return ExitAction::Close {
            reason: ExitReason::FailSafe,
        };
    }

    // ── 2. Hard stop ────────────────────────────────────────────────────
    if math::stop_hit(p.side, ctx.last, p.current_stop_loss) {
        return ExitAction::Close {
            reason: ExitReason::HardStop,
        };
    }

    // ── 3. Gap risk (only once the position is in its trailing life) ────
    if ctx.gap_detected
        && matches!(p.phase, LifecyclePhase::Trailing | LifecyclePhase::Partial)
    {
        return ExitAction::Close {
            reason: ExitReason::GapRisk,
        };
    }

    // ── 4. Structural invalidation ──────────────────────────────────────
    if ctx.vwap > 0.0 && math::reclaimed_against(p.side, ctx.last, ctx.vwap) {
        return ExitAction::Close {
            reason: ExitReason::VwapReclaim,
        };
    }
    if ctx.orb_midpoint > 0.0 && math::reclaimed_against(p.side, ctx.last, ctx.orb_midpoint) {
        return ExitAction::Close {
            reason: ExitReason::MidpointReclaim,
        };
    }
    let retraced = match p.side {
        crate::types::Side::Long => ctx.last < ctx.orb_high * (1.0 - cfg.retrace_confirm),
        crate::types::Side::Short => ctx.last > ctx.orb_low * (1.0 + cfg.retrace_confirm),
    };
    if ctx.orb_high > 0.0 && retraced {
        return ExitAction::Close {
            reason: ExitReason::BreakoutRetraced,
        };
    }
    if ctx.momentum_flip {
        return ExitAction::Close {
            reason: ExitReason::MomentumFlip,
        };
    }

    // ── 5. Time stop ────────────────────────────────────────────────────
    let age_minutes = (ctx.now - p.entry_time).num_minutes();
    if age_minutes >= cfg.time_stop_minutes && p.peak_gain_pct < cfg.time_stop_min_gain_pct {
        return ExitAction::Close {
            reason: ExitReason::TimeStop,
        };
    }

    // ── 6. Profit ladder ────────────────────────────────────────────────
    let gain = math::favorable_pct(p.side, p.entry_price, ctx.last);
    if !p.first_target_hit && gain >= cfg.first_target_pct {
        return ExitAction::PartialClose {
            fraction_of_remaining: 0.5,
            rung: 1,
            reason: ExitReason::ProfitTarget1,
        };
    }
    if p.first_target_hit && !p.second_target_hit && gain >= cfg.second_target_pct {
        // Half of the remaining half is 25% of the original size.
        return ExitAction::PartialClose {
            fraction_of_remaining: 0.5,
            rung: 2,
            reason: ExitReason::ProfitTarget2,
        };
    }

    // ── 7. Runner exit ──────────────────────────────────────────────────
    if p.phase == LifecyclePhase::Partial && ctx.minutes_to_close <= cfg.runner_cutoff_minutes {
        return ExitAction::Close {
            reason: ExitReason::RunnerExit,
        };
    }

    // ── 8. EOD sweep ────────────────────────────────────────────────────
    if ctx.minutes_to_close <= cfg.eod_minutes {
        return ExitAction::Close {
            reason: ExitReason::EndOfDay,
        };
    }

    ExitAction::Hold
}

/// The lifecycle phase the position should be in, from age and excursion.
pub fn desired_phase(p: &Position, now: DateTime<Utc>, cfg: &ExitConfig) -> LifecyclePhase {
    if p.phase == LifecyclePhase::Partial || p.phase == LifecyclePhase::Closed {
        return p.phase;
    }
    if p.peak_gain_pct >= cfg.trailing_activation_pct {
        return LifecyclePhase::Trailing;
    }
    if p.peak_gain_pct >= cfg.breakeven_trigger_pct {
        return LifecyclePhase::Breakeven;
    }
    if (now - p.entry_time).num_minutes() >= cfg.fresh_minutes {
        return LifecyclePhase::Armed;
    }
    LifecyclePhase::Fresh
}

/// The stop the engine wants committed this tick, or `None` to leave the
/// stop alone. Monotonicity/hysteresis enforcement belongs to the book.
pub fn desired_stop(p: &Position, ctx: &MarketContext) -> Option<f64> {
    match p.phase {
        LifecyclePhase::Fresh | LifecyclePhase::Armed | LifecyclePhase::Closed => None,
        LifecyclePhase::Breakeven => {
            // Entry plus one tick of daylight.
            Some(match p.side {
                crate::types::Side::Long => p.entry_price + 0.01,
                crate::types::Side::Short => p.entry_price - 0.01,
            })
        }
        LifecyclePhase::Trailing | LifecyclePhase::Partial => {
            let anchor = match p.side {
                crate::types::Side::Long => p.highest_price,
                crate::types::Side::Short => p.lowest_price,
            };
            let distance = trailing_distance(TrailInputs {
                regime: p.regime,
                atr: if ctx.atr > 0.0 { ctx.atr } else { p.entry_bar_volatility },
                price: ctx.last,
                peak_gain_pct: p.peak_gain_pct,
                spread: ctx.spread_pct * ctx.last,
                is_runner: p.phase == LifecyclePhase::Partial,
            });
            let candidate = math::stop_at_distance(p.side, anchor, distance);
            // A runner's stop never sits worse than entry.
            let floored = if p.phase == LifecyclePhase::Partial {
                match p.side {
                    crate::types::Side::Long => candidate.max(p.entry_price),
                    crate::types::Side::Short => candidate.min(p.entry_price),
                }
            } else {
                candidate
            };
            Some(floored)
        }
    }
}
