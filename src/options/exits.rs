// =============================================================================
// Options exit framework — multi-layer, type-specific thresholds
// =============================================================================
//
// Same priority ladder as the equity engine, with premium-denominated
// thresholds per structure:
//
//                    debit spread   credit spread   lotto
//   hard stop            −45%           −50%         −55%
//   time stop           25 min         25 min       12 min
//   fail-safe            −60%           −60%         −60%
//   first target    +60% → close 50%  (same)        (same)
//   second target  +120% → close 25%  (same)        (same)
//
// P&L convention: debit structures gain when value rises; credit spreads
// gain when the cost to close falls below the credit received (the
// `OptionsPosition::pnl_pct` helper owns the sign).
//
// The options book mirrors the equity registry's single-writer discipline:
// only this module mutates options position state.
// =============================================================================

use std::collections::HashMap;

use chrono::{DateTime, Utc};
use parking_lot::RwLock;
use serde::Serialize;
use tracing::{debug, info};

use super::types::{OptionsPosition, OptionsPositionStatus, OptionsStructure};

/// Liquidity fail-safe: spread over this fraction of mid is a collapse.
const FAIL_SAFE_SPREAD_PCT: f64 = 0.10;
/// Spread widening vs entry that trips the fail-safe.
const FAIL_SAFE_SPREAD_MULT: f64 = 1.5;
/// Minimum favorable move that exempts a position from the time stop.
const TIME_STOP_MIN_GAIN_PCT: f64 = 5.0;
/// Minutes before the close at which every options position is swept.
const EOD_MINUTES: i64 = 5;
/// Runner cutoff near the close.
const RUNNER_CUTOFF_MINUTES: i64 = 15;

/// Per-structure thresholds.
#[derive(Debug, Clone, Copy)]
pub struct OptionsThresholds {
    pub hard_stop_pct: f64,
    pub time_stop_minutes: i64,
    pub fail_safe_pct: f64,
    pub first_target_pct: f64,
    pub first_target_close: f64,
    pub second_target_pct: f64,
    pub second_target_close: f64,
}

impl OptionsThresholds {
    pub fn for_structure(structure: &OptionsStructure) -> Self {
        let hard_stop_pct = match structure {
            OptionsStructure::DebitSpread(_) => -45.0,
            OptionsStructure::CreditSpread(_) => -50.0,
            OptionsStructure::Lotto(_) => -55.0,
        };
        let time_stop_minutes = match structure {
            OptionsStructure::Lotto(_) => 12,
            _ => 25,
        };
        Self {
            hard_stop_pct,
            time_stop_minutes,
            fail_safe_pct: -60.0,
            first_target_pct: 60.0,
            first_target_close: 0.5,
            second_target_pct: 120.0,
            second_target_close: 0.25,
        }
    }
}

/// Why an options position is being (partially) closed.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum OptionsExitReason {
    FailSafe,
    HardStop,
    UnderlyingReclaim,
    TimeStop,
    FirstTarget,
    SecondTarget,
    RunnerExit,
    EndOfDay,
}

impl std::fmt::Display for OptionsExitReason {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            Self::FailSafe => "FAIL_SAFE",
            Self::HardStop => "HARD_STOP",
            Self::UnderlyingReclaim => "UNDERLYING_RECLAIM",
            Self::TimeStop => "TIME_STOP",
            Self::FirstTarget => "FIRST_TARGET",
            Self::SecondTarget => "SECOND_TARGET",
            Self::RunnerExit => "RUNNER_EXIT",
            Self::EndOfDay => "EOD",
        };
        f.write_str(s)
    }
}

/// Evaluation verdict.
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum OptionsExitAction {
    Hold,
    PartialClose {
        fraction_of_remaining: f64,
        rung: u8,
        reason: OptionsExitReason,
    },
    Close { reason: OptionsExitReason },
}

/// Market context for one options evaluation.
#[derive(Debug, Clone, Copy)]
pub struct OptionsContext {
    /// Current value per contract under the structure's convention
    /// (mark for debit/lotto, cost-to-close for credit).
    pub current_value: f64,
    /// Current structure bid-ask spread as a fraction of mid.
    pub spread_pct: f64,
    /// Underlying reclaimed VWAP or the ORB midpoint against the trade.
    pub underlying_reclaim: bool,
    pub minutes_to_close: i64,
    pub now: DateTime<Utc>,
}

/// Strict-priority evaluation for one options position.
pub fn evaluate_options_exit(p: &OptionsPosition, ctx: &OptionsContext) -> OptionsExitAction {
    let t = OptionsThresholds::for_structure(&p.structure);
    let pnl_pct = p.pnl_pct(ctx.current_value);

    // ── 1. Fail-safe: catastrophic loss or liquidity collapse ───────────
    let spread_blowout = ctx.spread_pct > FAIL_SAFE_SPREAD_PCT
        || (p.entry_spread_pct > 0.0 && ctx.spread_pct > p.entry_spread_pct * FAIL_SAFE_SPREAD_MULT);
    if pnl_pct <= t.fail_safe_pct || spread_blowout {
        return OptionsExitAction::Close {
            reason: OptionsExitReason::FailSafe,
        };
    }

    // ── 2. Hard stop ────────────────────────────────────────────────────
    if pnl_pct <= t.hard_stop_pct {
        return OptionsExitAction::Close {
            reason: OptionsExitReason::HardStop,
        };
    }

    // ── 3. Structural invalidation of the underlying ────────────────────
    if ctx.underlying_reclaim {
        return OptionsExitAction::Close {
            reason: OptionsExitReason::UnderlyingReclaim,
        };
    }

    // ── 4. Time stop ────────────────────────────────────────────────────
    let age_minutes = (ctx.now - p.entry_time).num_minutes();
    if age_minutes >= t.time_stop_minutes && p.peak_pnl_pct < TIME_STOP_MIN_GAIN_PCT {
        return OptionsExitAction::Close {
            reason: OptionsExitReason::TimeStop,
        };
    }

    // ── 5. Profit ladder ────────────────────────────────────────────────
    if !p.first_target_hit && pnl_pct >= t.first_target_pct {
        return OptionsExitAction::PartialClose {
            fraction_of_remaining: t.first_target_close,
            rung: 1,
            reason: OptionsExitReason::FirstTarget,
        };
    }
    if p.first_target_hit && !p.second_target_hit && pnl_pct >= t.second_target_pct {
        // 25% of the original size is half of what remains after rung 1.
        return OptionsExitAction::PartialClose {
            fraction_of_remaining: t.second_target_close / (1.0 - t.first_target_close),
            rung: 2,
            reason: OptionsExitReason::SecondTarget,
        };
    }

    // ── 6. Runner exit ──────────────────────────────────────────────────
    if p.status == OptionsPositionStatus::Partial
        && ctx.minutes_to_close <= RUNNER_CUTOFF_MINUTES
    {
        return OptionsExitAction::Close {
            reason: OptionsExitReason::RunnerExit,
        };
    }

    // ── 7. EOD sweep ────────────────────────────────────────────────────
    if ctx.minutes_to_close <= EOD_MINUTES {
        return OptionsExitAction::Close {
            reason: OptionsExitReason::EndOfDay,
        };
    }

    OptionsExitAction::Hold
}

// =============================================================================
// Options position book
// =============================================================================

/// The options registry; same single-writer rules as the equity book.
#[derive(Debug, Default)]
pub struct OptionsBook {
    positions: RwLock<HashMap<String, OptionsPosition>>,
}

impl OptionsBook {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(&self, position: OptionsPosition) {
        info!(
            id = %position.position_id,
            symbol = %position.symbol,
            kind = position.structure.label(),
            entry = position.entry_price,
            quantity = position.quantity,
            "options position registered"
        );
        self.positions
            .write()
            .insert(position.position_id.clone(), position);
    }

    pub fn snapshot(&self, id: &str) -> Option<OptionsPosition> {
        self.positions.read().get(id).cloned()
    }

    pub fn open_positions(&self) -> Vec<OptionsPosition> {
        self.positions
            .read()
            .values()
            .filter(|p| p.status != OptionsPositionStatus::Closed)
            .cloned()
            .collect()
    }

    pub fn open_count(&self) -> usize {
        self.open_positions().len()
    }

    /// Fold a value mark into the position.
    pub fn update_value(&self, id: &str, current_value: f64) {
        let mut map = self.positions.write();
        if let Some(p) = map.get_mut(id) {
            if p.status == OptionsPositionStatus::Closed {
                return;
            }
            p.current_value = current_value;
            let pnl_pct = p.pnl_pct(current_value);
            p.peak_pnl_pct = p.peak_pnl_pct.max(pnl_pct);
            p.unrealized_pnl =
                pnl_pct / 100.0 * p.entry_price * p.quantity as f64 * 100.0;
        }
    }

    /// Settle a partial close at `fill_value` per contract.
    pub fn apply_partial(
        &self,
        id: &str,
        closed_contracts: u32,
        fill_value: f64,
        rung: u8,
    ) -> Option<OptionsPosition> {
        let mut map = self.positions.write();
        let p = map.get_mut(id)?;
        if p.status == OptionsPositionStatus::Closed {
            return None;
        }

        let closed = closed_contracts.min(p.quantity);
        let pnl_per_contract = p.pnl_pct(fill_value) / 100.0 * p.entry_price;
        let realized = pnl_per_contract * closed as f64 * 100.0;

        p.quantity -= closed;
        p.realized_pnl += realized;
        p.status = OptionsPositionStatus::Partial;
        match rung {
            1 => p.first_target_hit = true,
            _ => p.second_target_hit = true,
        }

        info!(
            id,
            closed,
            remaining = p.quantity,
            realized,
            "options partial close applied"
        );
        Some(p.clone())
    }

    /// Terminal close; returns total realized P&L in dollars.
    pub fn mark_closed(&self, id: &str, fill_value: f64, reason: &str) -> Option<f64> {
        let mut map = self.positions.write();
        let p = map.get_mut(id)?;
        if p.status == OptionsPositionStatus::Closed {
            return None;
        }

        let pnl_per_contract = p.pnl_pct(fill_value) / 100.0 * p.entry_price;
        p.realized_pnl += pnl_per_contract * p.quantity as f64 * 100.0;
        p.quantity = 0;
        p.unrealized_pnl = 0.0;
        p.status = OptionsPositionStatus::Closed;

        info!(id, reason, realized = p.realized_pnl, "options position closed");
        Some(p.realized_pnl)
    }

    pub fn dump(&self) -> Vec<OptionsPosition> {
        self.positions.read().values().cloned().collect()
    }

    /// Persist the day's options positions (open and closed) as the history
    /// record. Atomic tmp + rename.
    pub fn persist_history(&self, path: &std::path::Path) -> anyhow::Result<()> {
        use anyhow::Context;
        let content = serde_json::to_string_pretty(&self.dump())
            .context("failed to serialise options history")?;
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)
                .with_context(|| format!("failed to create {}", parent.display()))?;
        }
        let tmp = path.with_extension("json.tmp");
        std::fs::write(&tmp, content)
            .with_context(|| format!("failed to write {}", tmp.display()))?;
        std::fs::rename(&tmp, path)
            .with_context(|| format!("failed to rename into {}", path.display()))?;
        Ok(())
    }
}

/// Convenience: current structure value from its marks.
pub fn structure_mark(structure: &OptionsStructure) -> f64 {
    match structure {
        OptionsStructure::DebitSpread(s) => s.long_leg.mid() - s.short_leg.mid(),
        OptionsStructure::CreditSpread(s) => s.short_leg.mid() - s.long_leg.mid(),
        OptionsStructure::Lotto(c) => c.mid(),
    }
}

/// Debug helper used by the status surface.
pub fn describe(p: &OptionsPosition) -> String {
    let pnl = p.pnl_pct(p.current_value);
    debug!(id = %p.position_id, pnl_pct = pnl, "options position described");
    format!(
        "{} {} x{} entry {:.2} now {:.2} ({:+.1}%)",
        p.symbol,
        p.structure.label(),
        p.quantity,
        p.entry_price,
        p.current_value,
        pnl
    )
}
