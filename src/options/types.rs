// =============================================================================
// Options data model — contracts, verticals, positions
// =============================================================================

use chrono::{DateTime, NaiveDate, Utc};
use serde::{Deserialize, Serialize};

use crate::types::Side;

/// Call or put.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum OptionKind {
    Call,
    Put,
}

impl OptionKind {
    /// The kind a directional trade buys: calls for longs, puts for shorts.
    pub fn for_side(side: Side) -> Self {
        match side {
            Side::Long => Self::Call,
            Side::Short => Self::Put,
        }
    }
}

impl std::fmt::Display for OptionKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Call => write!(f, "CALL"),
            Self::Put => write!(f, "PUT"),
        }
    }
}

/// One quoted contract from the chain, greeks included.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct OptionContract {
    pub symbol: String,
    pub strike: f64,
    pub expiry: NaiveDate,
    pub kind: OptionKind,
    pub bid: f64,
    pub ask: f64,
    pub last: f64,
    pub volume: u64,
    pub open_interest: u64,
    pub delta: f64,
    pub gamma: f64,
    pub theta: f64,
    pub vega: f64,
    pub iv: f64,
}

impl OptionContract {
    pub fn mid(&self) -> f64 {
        (self.bid + self.ask) / 2.0
    }

    /// Bid-ask spread as a fraction of the mid; infinite when unquoted.
    pub fn spread_pct(&self) -> f64 {
        let mid = self.mid();
        if mid > 0.0 {
            (self.ask - self.bid) / mid
        } else {
            f64::INFINITY
        }
    }
}

/// A net-debit vertical: long the near leg, short the far leg.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DebitSpread {
    pub symbol: String,
    pub expiry: NaiveDate,
    pub kind: OptionKind,
    pub long_leg: OptionContract,
    pub short_leg: OptionContract,
    pub debit_cost: f64,
    pub max_profit: f64,
    pub max_loss: f64,
    pub break_even: f64,
}

impl DebitSpread {
    /// Assemble a debit vertical from its legs, deriving the economics.
    pub fn build(long_leg: OptionContract, short_leg: OptionContract) -> Self {
        let width = (short_leg.strike - long_leg.strike).abs();
        let debit_cost = long_leg.mid() - short_leg.mid();
        let max_profit = width - debit_cost;
        let break_even = match long_leg.kind {
            OptionKind::Call => long_leg.strike + debit_cost,
            OptionKind::Put => long_leg.strike - debit_cost,
        };
        Self {
            symbol: long_leg.symbol.clone(),
            expiry: long_leg.expiry,
            kind: long_leg.kind,
            debit_cost,
            max_profit,
            max_loss: debit_cost,
            break_even,
            long_leg,
            short_leg,
        }
    }

    pub fn spread_width(&self) -> f64 {
        (self.short_leg.strike - self.long_leg.strike).abs()
    }

    pub fn risk_reward(&self) -> f64 {
        if self.max_loss > 0.0 {
            self.max_profit / self.max_loss
        } else {
            0.0
        }
    }
}

/// A net-credit vertical: short the near leg, long the far leg.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CreditSpread {
    pub symbol: String,
    pub expiry: NaiveDate,
    pub kind: OptionKind,
    pub short_leg: OptionContract,
    pub long_leg: OptionContract,
    pub credit_received: f64,
    pub max_profit: f64,
    pub max_loss: f64,
    pub break_even: f64,
}

impl CreditSpread {
    pub fn build(short_leg: OptionContract, long_leg: OptionContract) -> Self {
        let width = (long_leg.strike - short_leg.strike).abs();
        let credit_received = short_leg.mid() - long_leg.mid();
        let max_loss = width - credit_received;
        let break_even = match short_leg.kind {
            OptionKind::Call => short_leg.strike + credit_received,
            OptionKind::Put => short_leg.strike - credit_received,
        };
        Self {
            symbol: short_leg.symbol.clone(),
            expiry: short_leg.expiry,
            kind: short_leg.kind,
            credit_received,
            max_profit: credit_received,
            max_loss,
            break_even,
            short_leg,
            long_leg,
        }
    }

    pub fn spread_width(&self) -> f64 {
        (self.long_leg.strike - self.short_leg.strike).abs()
    }

    pub fn risk_reward(&self) -> f64 {
        if self.max_loss > 0.0 {
            self.max_profit / self.max_loss
        } else {
            0.0
        }
    }
}

/// Structure an options position trades.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub enum OptionsStructure {
    DebitSpread(DebitSpread),
    CreditSpread(CreditSpread),
    /// Single-leg long option, cheap premium, low delta.
    Lotto(OptionContract),
}

impl OptionsStructure {
    pub fn label(&self) -> &'static str {
        match self {
            Self::DebitSpread(_) => "debit_spread",
            Self::CreditSpread(_) => "credit_spread",
            Self::Lotto(_) => "lotto",
        }
    }
}

/// Lifecycle status shared with equity positions.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum OptionsPositionStatus {
    Open,
    Partial,
    Closed,
}

/// An open options position, mutated only by the options exit engine.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct OptionsPosition {
    pub position_id: String,
    pub symbol: String,
    pub structure: OptionsStructure,
    /// Debit paid (debit/lotto) or credit received (credit spreads), per
    /// contract.
    pub entry_price: f64,
    pub entry_time: DateTime<Utc>,
    pub quantity: u32,
    pub current_value: f64,
    pub unrealized_pnl: f64,
    pub realized_pnl: f64,
    pub status: OptionsPositionStatus,
    /// Entry bid-ask spread fraction, for the liquidity fail-safe.
    pub entry_spread_pct: f64,
    /// Best favorable P&L percentage seen since entry.
    pub peak_pnl_pct: f64,
    pub first_target_hit: bool,
    pub second_target_hit: bool,
}

impl OptionsPosition {
    /// Signed P&L percentage under the structure's convention: for debit
    /// structures value gains are profit; for credit spreads cost-to-close
    /// falling below the credit received is profit.
    pub fn pnl_pct(&self, current: f64) -> f64 {
        if self.entry_price <= 0.0 {
            return 0.0;
        }
        match self.structure {
            OptionsStructure::CreditSpread(_) => {
                (self.entry_price - current) / self.entry_price * 100.0
            }
            _ => (current - self.entry_price) / self.entry_price * 100.0,
        }
    }
}

// =============================================================================
// Tests
// =============================================================================
#[cfg(test)]
mod tests {
    use super::*;

    pub(crate) fn contract(strike: f64, bid: f64, ask: f64, kind: OptionKind) -> OptionContract {
        OptionContract {
            symbol: "SPY".into(),
            strike,
            expiry: NaiveDate::from_ymd_opt(2026, 1, 6).unwrap(),
            kind,
            bid,
            ask,
            last: (bid + ask) / 2.0,
            volume: 500,
            open_interest: 1000,
            delta: 0.20,
            gamma: 0.05,
            theta: -0.10,
            vega: 0.08,
            iv: 0.25,
        }
    }

    #[test]
    fn mid_and_spread_pct() {
        let c = contract(500.0, 0.40, 0.44, OptionKind::Call);
        assert!((c.mid() - 0.42).abs() < 1e-12);
        assert!((c.spread_pct() - 0.04 / 0.42).abs() < 1e-9);
    }

    #[test]
    fn unquoted_contract_has_infinite_spread() {
        let c = contract(500.0, 0.0, 0.0, OptionKind::Call);
        assert!(c.spread_pct().is_infinite());
    }

    #[test]
    fn debit_spread_economics() {
        let long = contract(501.0, 0.38, 0.42, OptionKind::Call); // mid 0.40
        let short = contract(502.0, 0.18, 0.22, OptionKind::Call); // mid 0.20
        let spread = DebitSpread::build(long, short);

        assert!((spread.debit_cost - 0.20).abs() < 1e-9);
        assert!((spread.max_loss - 0.20).abs() < 1e-9, "max loss equals the debit");
        assert!((spread.max_profit - 0.80).abs() < 1e-9);
        assert!((spread.break_even - 501.20).abs() < 1e-9);
        assert!((spread.risk_reward() - 4.0).abs() < 1e-9);
    }

    #[test]
    fn put_debit_break_even_is_below_strike() {
        let long = contract(499.0, 0.38, 0.42, OptionKind::Put);
        let short = contract(498.0, 0.18, 0.22, OptionKind::Put);
        let spread = DebitSpread::build(long, short);
        assert!((spread.break_even - 498.80).abs() < 1e-9);
    }

    #[test]
    fn credit_spread_economics() {
        let short = contract(502.0, 0.48, 0.52, OptionKind::Call); // mid 0.50
        let long = contract(503.0, 0.18, 0.22, OptionKind::Call); // mid 0.20
        let spread = CreditSpread::build(short, long);

        assert!((spread.credit_received - 0.30).abs() < 1e-9);
        assert!((spread.max_profit - 0.30).abs() < 1e-9);
        // max_loss = width - credit = 1.0 - 0.30
        assert!((spread.max_loss - 0.70).abs() < 1e-9);
        assert!((spread.break_even - 502.30).abs() < 1e-9);
    }

    #[test]
    fn credit_pnl_sign_convention() {
        let short = contract(502.0, 0.48, 0.52, OptionKind::Call);
        let long = contract(503.0, 0.18, 0.22, OptionKind::Call);
        let pos = OptionsPosition {
            position_id: "p1".into(),
            symbol: "SPY".into(),
            structure: OptionsStructure::CreditSpread(CreditSpread::build(short, long)),
            entry_price: 0.30,
            entry_time: Utc::now(),
            quantity: 1,
            current_value: 0.30,
            unrealized_pnl: 0.0,
            realized_pnl: 0.0,
            status: OptionsPositionStatus::Open,
            entry_spread_pct: 0.05,
            peak_pnl_pct: 0.0,
            first_target_hit: false,
            second_target_hit: false,
        };
        // Cost to close fell to 0.12: profit.
        assert!((pos.pnl_pct(0.12) - 60.0).abs() < 1e-9);
        // Cost to close rose to 0.45: loss.
        assert!((pos.pnl_pct(0.45) + 50.0).abs() < 1e-9);
    }

    #[test]
    fn debit_pnl_sign_convention() {
        let long = contract(501.0, 0.38, 0.42, OptionKind::Call);
        let short = contract(502.0, 0.18, 0.22, OptionKind::Call);
        let pos = OptionsPosition {
            position_id: "p2".into(),
            symbol: "SPY".into(),
            structure: OptionsStructure::DebitSpread(DebitSpread::build(long, short)),
            entry_price: 0.20,
            entry_time: Utc::now(),
            quantity: 2,
            current_value: 0.20,
            unrealized_pnl: 0.0,
            realized_pnl: 0.0,
            status: OptionsPositionStatus::Open,
            entry_spread_pct: 0.05,
            peak_pnl_pct: 0.0,
            first_target_hit: false,
            second_target_hit: false,
        };
        assert!((pos.pnl_pct(0.32) - 60.0).abs() < 1e-9);
        assert!((pos.pnl_pct(0.11) + 45.0).abs() < 1e-9);
    }

    #[test]
    fn kind_for_side() {
        assert_eq!(OptionKind::for_side(Side::Long), OptionKind::Call);
        assert_eq!(OptionKind::for_side(Side::Short), OptionKind::Put);
    }
}
