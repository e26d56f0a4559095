// =============================================================================
// Position book — the authoritative registry, single-writer discipline
// =============================================================================
//
// The exit engine is the only component allowed to mutate
// `current_stop_loss`, `current_take_profit`, `status`, and the lifecycle
// phase. Everything else reads copy-on-read snapshots.
//
// Stop commits enforce three rules:
//
//   1. Monotonicity — a stop never loosens for the position's side. An
//      attempt to do so is an invariant violation: the position is flagged
//      and force-closed rather than trusted.
//   2. Hysteresis — a promotion must improve the stop by at least
//      max(0.02% of price, 0.25 × the ATR floor) or it is ignored; the
//      stop does not chatter tick by tick.
//   3. Cooldown — at most one committed promotion per cooldown window
//      (default 30 s) per position.
//
// Every mutation bumps a version counter; the monitor's snapshot/commit
// cycle uses it for optimistic concurrency (one retry on conflict).
// =============================================================================

use std::collections::HashMap;

use chrono::{DateTime, Utc};
use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use tracing::{debug, error, info};
use uuid::Uuid;

use super::math;
use crate::types::{Side, SignalType, TradeRegime};

/// Lifecycle substate of a position.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum LifecyclePhase {
    /// Under 30 minutes old; entry stop only, no trailing.
    Fresh,
    /// Seasoned but not yet profitable enough for breakeven promotion.
    Armed,
    /// Stop promoted to entry after the first ≥ +0.5% excursion.
    Breakeven,
    /// Mode-bound trailing distance in force.
    Trailing,
    /// At least one scale-out done; the runner trails tighter.
    Partial,
    Closed,
}

impl std::fmt::Display for LifecyclePhase {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Fresh => write!(f, "FRESH"),
            Self::Armed => write!(f, "ARMED"),
            Self::Breakeven => write!(f, "BREAKEVEN"),
            Self::Trailing => write!(f, "TRAILING"),
            Self::Partial => write!(f, "PARTIAL"),
            Self::Closed => write!(f, "CLOSED"),
        }
    }
}

/// Coarse status mirrored to the outside world.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum PositionStatus {
    Open,
    Partial,
    Closed,
}

/// A tracked equity position.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Position {
    pub position_id: String,
    pub symbol: String,
    pub side: Side,
    pub signal_type: SignalType,
    pub regime: TradeRegime,
    /// Remaining open quantity (reduced on partial close).
    pub quantity: f64,
    pub entry_price: f64,
    pub entry_time: DateTime<Utc>,
    pub current_price: f64,
    pub current_stop_loss: f64,
    pub current_take_profit: Option<f64>,
    /// Best price seen since entry (highest for longs).
    pub highest_price: f64,
    /// Worst price seen since entry (lowest for longs).
    pub lowest_price: f64,
    pub unrealized_pnl: f64,
    pub realized_pnl: f64,
    pub status: PositionStatus,
    pub phase: LifecyclePhase,
    pub trailing_activated: bool,
    pub breakeven_achieved: bool,
    /// ATR in price units at entry time.
    pub entry_bar_volatility: f64,
    /// Bid-ask spread fraction at entry, for the fail-safe spread check.
    pub entry_spread_pct: f64,
    /// Dollar value committed at open (for the compound engine).
    pub position_value: f64,
    /// Peak favorable excursion percent since entry.
    pub peak_gain_pct: f64,
    pub first_target_hit: bool,
    pub second_target_hit: bool,
    /// Escalated positions are force-closed at EOD regardless of state.
    pub escalated: bool,
    /// Last committed stop promotion (for the cooldown).
    pub last_stop_commit: Option<DateTime<Utc>>,
    pub last_monitor_ts: Option<DateTime<Utc>>,
    /// Optimistic-concurrency version; bumped on every mutation.
    pub version: u64,
}

/// Inputs for registering a fresh position.
#[derive(Debug, Clone)]
pub struct NewPosition {
    pub symbol: String,
    pub side: Side,
    pub signal_type: SignalType,
    pub regime: TradeRegime,
    pub quantity: f64,
    pub entry_price: f64,
    pub entry_time: DateTime<Utc>,
    pub entry_bar_volatility: f64,
    pub entry_spread_pct: f64,
    pub position_value: f64,
}

/// Initial fixed stop: the wider of 1.5× the entry-bar ATR and 1% of entry.
fn initial_stop(side: Side, entry: f64, entry_atr: f64) -> f64 {
    let distance = (1.5 * entry_atr).max(0.01 * entry);
    math::stop_at_distance(side, entry, distance)
}

/// Outcome of a stop-commit attempt.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StopCommit {
    Committed,
    /// Improvement below the hysteresis threshold.
    BelowHysteresis,
    /// Inside the cooldown window.
    InCooldown,
    /// The candidate would loosen the stop — invariant violation.
    Rejected,
}

/// Hysteresis: minimum improvement required to commit a promotion.
pub fn hysteresis_threshold(price: f64, atr_floor: f64) -> f64 {
    (0.0002 * price).max(0.25 * atr_floor)
}

/// The registry. Interior mutability behind one RwLock; all writes go
/// through methods on this type.
#[derive(Debug, Default)]
pub struct PositionBook {
    positions: RwLock<HashMap<String, Position>>,
    cooldown_secs: i64,
}

impl PositionBook {
    pub fn new(cooldown_secs: u64) -> Self {
        Self {
            positions: RwLock::new(HashMap::new()),
            cooldown_secs: cooldown_secs as i64,
        }
    }

    // -------------------------------------------------------------------------
    // Registration (called by the execution manager)
    // -------------------------------------------------------------------------

    /// Register a freshly filled position and return its id.
    pub fn register(&self, new: NewPosition) -> String {
        let position_id = Uuid::new_v4().to_string();
        let stop = initial_stop(new.side, new.entry_price, new.entry_bar_volatility);

        let position = Position {
            position_id: position_id.clone(),
            symbol: new.symbol.clone(),
            side: new.side,
            signal_type: new.signal_type,
            regime: new.regime,
            quantity: new.quantity,
            entry_price: new.entry_price,
            entry_time: new.entry_time,
            current_price: new.entry_price,
            current_stop_loss: stop,
            current_take_profit: None,
            highest_price: new.entry_price,
            lowest_price: new.entry_price,
            unrealized_pnl: 0.0,
            realized_pnl: 0.0,
            status: PositionStatus::Open,
            phase: LifecyclePhase::Fresh,
            trailing_activated: false,
            breakeven_achieved: false,
            entry_bar_volatility: new.entry_bar_volatility,
            entry_spread_pct: new.entry_spread_pct,
            position_value: new.position_value,
            peak_gain_pct: 0.0,
            first_target_hit: false,
            second_target_hit: false,
            escalated: false,
            last_stop_commit: None,
            last_monitor_ts: None,
            version: 1,
        };

        info!(
            id = %position_id,
            symbol = %new.symbol,
            side = %new.side,
            quantity = new.quantity,
            entry = new.entry_price,
            stop,
            regime = %new.regime,
            "position registered"
        );

        self.positions.write().insert(position_id.clone(), position);
        position_id
    }

    /// Restore a persisted position on restart.
    pub fn restore(&self, position: Position) {
        self.positions
            .write()
            .insert(position.position_id.clone(), position);
    }

    // -------------------------------------------------------------------------
    // Reads (copy-on-read for every other component)
    // -------------------------------------------------------------------------

    pub fn snapshot(&self, position_id: &str) -> Option<Position> {
        self.positions.read().get(position_id).cloned()
    }

    pub fn open_positions(&self) -> Vec<Position> {
        self.positions
            .read()
            .values()
            .filter(|p| p.status != PositionStatus::Closed)
            .cloned()
            .collect()
    }

    pub fn open_count(&self) -> usize {
        self.positions
            .read()
            .values()
            .filter(|p| p.status != PositionStatus::Closed)
            .count()
    }

    /// Whether an open position already exists for (symbol, signal type).
    pub fn has_open(&self, symbol: &str, signal_type: SignalType) -> bool {
        self.positions
            .read()
            .values()
            .any(|p| p.status != PositionStatus::Closed && p.symbol == symbol && p.signal_type == signal_type)
    }

    // -------------------------------------------------------------------------
    // Mutation (exit engine only)
    // -------------------------------------------------------------------------

    /// Fold a price update into the position: current price, extremes, peak
    /// excursion, unrealized P&L, and phase promotion by excursion/time.
    pub fn update_price(&self, position_id: &str, price: f64, now: DateTime<Utc>) {
        let mut map = self.positions.write();
        let Some(p) = map.get_mut(position_id) else {
            return;
        };
        if p.status == PositionStatus::Closed || price <= 0.0 {
            return;
        }

        p.current_price = price;
        p.highest_price = p.highest_price.max(price);
        p.lowest_price = p.lowest_price.min(price);
        p.unrealized_pnl = math::unrealized_pnl(p.side, p.entry_price, price, p.quantity);

        let gain = math::favorable_pct(p.side, p.entry_price, price);
        p.peak_gain_pct = p.peak_gain_pct.max(gain);
        p.last_monitor_ts = Some(now);
        p.version += 1;
    }

    /// Promote the lifecycle phase. Only forward transitions commit.
    pub fn set_phase(&self, position_id: &str, phase: LifecyclePhase) {
        let mut map = self.positions.write();
        let Some(p) = map.get_mut(position_id) else {
            return;
        };
        let order = |ph: LifecyclePhase| match ph {
            LifecyclePhase::Fresh => 0,
            LifecyclePhase::Armed => 1,
            LifecyclePhase::Breakeven => 2,
            LifecyclePhase::Trailing => 3,
            LifecyclePhase::Partial => 4,
            LifecyclePhase::Closed => 5,
        };
        if order(phase) > order(p.phase) {
            debug!(id = %position_id, from = %p.phase, to = %phase, "phase promoted");
            p.phase = phase;
            if phase == LifecyclePhase::Breakeven {
                p.breakeven_achieved = true;
            }
            if phase == LifecyclePhase::Trailing {
                p.trailing_activated = true;
            }
            p.version += 1;
        }
    }

    /// Attempt a stop promotion under monotonicity, hysteresis, and
    /// cooldown. `expected_version` gates optimistic concurrency: a stale
    /// snapshot returns `None` so the caller can re-snapshot and retry once.
    pub fn commit_stop(
        &self,
        position_id: &str,
        candidate: f64,
        expected_version: u64,
        now: DateTime<Utc>,
    ) -> Option<StopCommit> {
        let mut map = self.positions.write();
        let p = map.get_mut(position_id)?;

        if p.version != expected_version {
            return None;
        }
        if p.status == PositionStatus::Closed {
            return Some(StopCommit::Rejected);
        }

        if !math::stop_no_worse(p.side, candidate, p.current_stop_loss) {
            error!(
                id = %position_id,
                side = %p.side,
                old = p.current_stop_loss,
                candidate,
                "stop would loosen — invariant violation, escalating"
            );
            p.escalated = true;
            p.version += 1;
            return Some(StopCommit::Rejected);
        }

        let improvement = math::stop_improvement(p.side, candidate, p.current_stop_loss);
        let threshold = hysteresis_threshold(p.current_price, p.entry_bar_volatility);
        if improvement < threshold {
            return Some(StopCommit::BelowHysteresis);
        }

        if let Some(last) = p.last_stop_commit {
            if (now - last).num_seconds() < self.cooldown_secs {
                return Some(StopCommit::InCooldown);
            }
        }

        debug!(
            id = %position_id,
            old = p.current_stop_loss,
            new = candidate,
            "stop promoted"
        );
        p.current_stop_loss = candidate;
        p.last_stop_commit = Some(now);
        p.version += 1;
        Some(StopCommit::Committed)
    }

    /// Set the take-profit level (exit engine only).
    pub fn set_take_profit(&self, position_id: &str, tp: Option<f64>) {
        let mut map = self.positions.write();
        if let Some(p) = map.get_mut(position_id) {
            p.current_take_profit = tp;
            p.version += 1;
        }
    }

    /// Record a partial fill: reduce quantity, bank realized P&L, move the
    /// position into PARTIAL.
    pub fn apply_partial(
        &self,
        position_id: &str,
        closed_quantity: f64,
        fill_price: f64,
        ladder_rung: u8,
    ) -> Option<Position> {
        let mut map = self.positions.write();
        let p = map.get_mut(position_id)?;
        if p.status == PositionStatus::Closed {
            return None;
        }

        let closed_quantity = closed_quantity.min(p.quantity);
        let pnl = math::unrealized_pnl(p.side, p.entry_price, fill_price, closed_quantity);
        p.quantity -= closed_quantity;
        p.realized_pnl += pnl;
        p.status = PositionStatus::Partial;
        p.phase = LifecyclePhase::Partial;
        match ladder_rung {
            1 => p.first_target_hit = true,
            _ => p.second_target_hit = true,
        }
        p.version += 1;

        info!(
            id = %position_id,
            closed = closed_quantity,
            remaining = p.quantity,
            pnl,
            rung = ladder_rung,
            "partial close applied"
        );
        Some(p.clone())
    }

    /// Terminal close. Returns the total realized P&L.
    pub fn mark_closed(
        &self,
        position_id: &str,
        fill_price: f64,
        reason: &str,
    ) -> Option<f64> {
        let mut map = self.positions.write();
        let p = map.get_mut(position_id)?;
        if p.status == PositionStatus::Closed {
            return None;
        }

        let pnl = math::unrealized_pnl(p.side, p.entry_price, fill_price, p.quantity);
        p.realized_pnl += pnl;
        p.quantity = 0.0;
        p.unrealized_pnl = 0.0;
        p.current_price = fill_price;
        p.status = PositionStatus::Closed;
        p.phase = LifecyclePhase::Closed;
        p.version += 1;

        info!(
            id = %position_id,
            symbol = %p.symbol,
            reason,
            fill_price,
            realized_pnl = p.realized_pnl,
            "position closed"
        );
        Some(p.realized_pnl)
    }

    /// Flag a position for mandatory EOD close after repeated exit errors.
    pub fn escalate(&self, position_id: &str) {
        let mut map = self.positions.write();
        if let Some(p) = map.get_mut(position_id) {
            p.escalated = true;
            p.version += 1;
        }
    }

    /// All positions (including closed) for snapshot persistence.
    pub fn dump(&self) -> Vec<Position> {
        self.positions.read().values().cloned().collect()
    }
}

// =============================================================================
// Tests
// =============================================================================
#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    fn t0() -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2026, 1, 6, 15, 30, 0).unwrap()
    }

    fn new_position(side: Side) -> NewPosition {
        NewPosition {
            symbol: "TQQQ".into(),
            side,
            signal_type: SignalType::So,
            regime: TradeRegime::Explosive,
            quantity: 100.0,
            entry_price: 50.0,
            entry_time: t0(),
            entry_bar_volatility: 0.50,
            entry_spread_pct: 0.0004,
            position_value: 5_000.0,
        }
    }

    fn book() -> PositionBook {
        PositionBook::new(30)
    }

    #[test]
    fn register_sets_initial_stop_below_entry_for_long() {
        let book = book();
        let id = book.register(new_position(Side::Long));
        let p = book.snapshot(&id).unwrap();
        // 1.5 × 0.50 = 0.75 > 1% × 50 = 0.50, so stop = 49.25.
        assert!((p.current_stop_loss - 49.25).abs() < 1e-9);
        assert_eq!(p.phase, LifecyclePhase::Fresh);
        assert_eq!(p.status, PositionStatus::Open);
    }

    #[test]
    fn register_sets_initial_stop_above_entry_for_short() {
        let book = book();
        let id = book.register(new_position(Side::Short));
        let p = book.snapshot(&id).unwrap();
        assert!((p.current_stop_loss - 50.75).abs() < 1e-9);
    }

    #[test]
    fn price_updates_track_extremes_and_peak() {
        let book = book();
        let id = book.register(new_position(Side::Long));
        book.update_price(&id, 51.0, t0());
        book.update_price(&id, 49.5, t0());
        book.update_price(&id, 50.5, t0());

        let p = book.snapshot(&id).unwrap();
        assert!((p.highest_price - 51.0).abs() < 1e-9);
        assert!((p.lowest_price - 49.5).abs() < 1e-9);
        assert!((p.peak_gain_pct - 2.0).abs() < 1e-9);
        assert!((p.unrealized_pnl - 50.0).abs() < 1e-9);
    }

    #[test]
    fn stop_commit_respects_monotonicity() {
        let book = book();
        let id = book.register(new_position(Side::Long));
        let p = book.snapshot(&id).unwrap();

        // Loosening the stop is rejected and escalates.
        let result = book.commit_stop(&id, 48.0, p.version, t0());
        assert_eq!(result, Some(StopCommit::Rejected));
        assert!(book.snapshot(&id).unwrap().escalated);
    }

    #[test]
    fn stop_commit_applies_hysteresis() {
        let book = book();
        let id = book.register(new_position(Side::Long));
        let p = book.snapshot(&id).unwrap();

        // Threshold = max(0.02% × 50, 0.25 × 0.50) = 0.125.
        let tiny = p.current_stop_loss + 0.05;
        assert_eq!(
            book.commit_stop(&id, tiny, p.version, t0()),
            Some(StopCommit::BelowHysteresis)
        );

        let meaningful = p.current_stop_loss + 0.20;
        assert_eq!(
            book.commit_stop(&id, meaningful, p.version, t0()),
            Some(StopCommit::Committed)
        );
        assert!((book.snapshot(&id).unwrap().current_stop_loss - meaningful).abs() < 1e-9);
    }

    #[test]
    fn stop_commit_honors_cooldown() {
        let book = book();
        let id = book.register(new_position(Side::Long));
        let p = book.snapshot(&id).unwrap();

        let first = p.current_stop_loss + 0.20;
        assert_eq!(
            book.commit_stop(&id, first, p.version, t0()),
            Some(StopCommit::Committed)
        );

        // 10 seconds later: inside the 30 s cooldown.
        let p = book.snapshot(&id).unwrap();
        let second = first + 0.20;
        assert_eq!(
            book.commit_stop(&id, second, p.version, t0() + chrono::Duration::seconds(10)),
            Some(StopCommit::InCooldown)
        );

        // 40 seconds later: allowed.
        let p = book.snapshot(&id).unwrap();
        assert_eq!(
            book.commit_stop(&id, second, p.version, t0() + chrono::Duration::seconds(40)),
            Some(StopCommit::Committed)
        );
    }

    #[test]
    fn stale_version_returns_none_for_retry() {
        let book = book();
        let id = book.register(new_position(Side::Long));
        let p = book.snapshot(&id).unwrap();

        // A concurrent price update bumps the version.
        book.update_price(&id, 50.5, t0());

        assert_eq!(book.commit_stop(&id, 49.5, p.version, t0()), None);
        // Retry with the fresh snapshot succeeds.
        let fresh = book.snapshot(&id).unwrap();
        assert_eq!(
            book.commit_stop(&id, 49.5, fresh.version, t0()),
            Some(StopCommit::Committed)
        );
    }

    #[test]
    fn stop_monotone_across_full_trace() {
        // Property 5: across any evaluation trace the stop never loosens.
        let book = book();
        let id = book.register(new_position(Side::Long));
        let mut last_stop = book.snapshot(&id).unwrap().current_stop_loss;
        let mut now = t0();

        for (i, candidate) in [49.5, 49.3, 49.8, 49.6, 50.1, 49.9, 50.4].iter().enumerate() {
            now += chrono::Duration::seconds(31);
            let p = book.snapshot(&id).unwrap();
            let _ = book.commit_stop(&id, *candidate, p.version, now);
            let stop = book.snapshot(&id).unwrap().current_stop_loss;
            assert!(
                stop >= last_stop - 1e-12,
                "step {i}: stop regressed {last_stop} -> {stop}"
            );
            last_stop = stop;
        }
    }

    #[test]
    fn phase_transitions_are_forward_only() {
        let book = book();
        let id = book.register(new_position(Side::Long));

        book.set_phase(&id, LifecyclePhase::Trailing);
        assert_eq!(book.snapshot(&id).unwrap().phase, LifecyclePhase::Trailing);
        assert!(book.snapshot(&id).unwrap().trailing_activated);

        // Trying to demote back to Armed is ignored.
        book.set_phase(&id, LifecyclePhase::Armed);
        assert_eq!(book.snapshot(&id).unwrap().phase, LifecyclePhase::Trailing);
    }

    #[test]
    fn partial_reduces_quantity_and_banks_pnl() {
        let book = book();
        let id = book.register(new_position(Side::Long));

        let p = book.apply_partial(&id, 50.0, 51.5, 1).unwrap();
        assert!((p.quantity - 50.0).abs() < 1e-9);
        assert!((p.realized_pnl - 75.0).abs() < 1e-9);
        assert_eq!(p.status, PositionStatus::Partial);
        assert!(p.first_target_hit);
    }

    #[test]
    fn close_is_terminal() {
        let book = book();
        let id = book.register(new_position(Side::Long));

        let pnl = book.mark_closed(&id, 51.0, "TEST").unwrap();
        assert!((pnl - 100.0).abs() < 1e-9);

        // Second close is a no-op.
        assert!(book.mark_closed(&id, 55.0, "TEST").is_none());
        assert_eq!(book.open_count(), 0);
    }

    #[test]
    fn snapshots_are_copy_on_read() {
        // Single-writer property: other components only ever hold clones;
        // mutating a snapshot cannot move the authoritative stop/status.
        let book = book();
        let id = book.register(new_position(Side::Long));

        let mut outside_copy = book.snapshot(&id).unwrap();
        outside_copy.current_stop_loss = 1.0;
        outside_copy.status = PositionStatus::Closed;
        outside_copy.current_take_profit = Some(999.0);

        let authoritative = book.snapshot(&id).unwrap();
        assert!((authoritative.current_stop_loss - 49.25).abs() < 1e-9);
        assert_eq!(authoritative.status, PositionStatus::Open);
        assert!(authoritative.current_take_profit.is_none());
    }

    #[test]
    fn per_symbol_signal_type_lookup() {
        let book = book();
        let _ = book.register(new_position(Side::Long));
        assert!(book.has_open("TQQQ", SignalType::So));
        assert!(!book.has_open("TQQQ", SignalType::Orr));
        assert!(!book.has_open("SPY", SignalType::So));
    }
}
