// =============================================================================
// Compound engine — intraday capital tracking and availability
// =============================================================================
//
// Tracks deployed and freed capital through the day and answers "how much is
// available for a new position?". It does NOT size positions — that is the
// ranker/sizer's job.
//
//   * 90% of the account is deployable; 10% stays in reserve.
//   * Closing a position frees `position_value + pnl` immediately for new
//     ORR trades (compounding), and realized P&L moves the account total.
//   * SO draws only on its base pool; ORR may additionally borrow unused SO
//     headroom and the freed-capital pool.
//
// Single writer per process; readers take the read lock.
// =============================================================================

use chrono::{DateTime, Utc};
use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};

use crate::types::SignalType;

/// Deployable fraction of the account.
const DEPLOYABLE_PCT: f64 = 0.90;

/// A closed-position ledger entry.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CompoundLedgerEntry {
    pub symbol: String,
    pub signal_type: SignalType,
    pub exit_reason: String,
    pub position_value: f64,
    pub pnl: f64,
    pub freed: f64,
    pub at: DateTime<Utc>,
}

/// Snapshot of the capital state.
#[derive(Debug, Clone, Copy, Serialize)]
pub struct CompoundSnapshot {
    pub total_account: f64,
    pub so_deployed: f64,
    pub orr_deployed: f64,
    pub freed_capital: f64,
    pub reserved: f64,
    pub total_deployed: f64,
    pub deployment_pct: f64,
    pub available_for_so: f64,
    pub available_for_orr: f64,
}

#[derive(Debug)]
struct Inner {
    total_account: f64,
    so_deployed: f64,
    orr_deployed: f64,
    freed_capital: f64,
    /// Freed capital consumed by ORR opens (for the deployment invariant).
    freed_consumed: f64,
    active_positions: u32,
    compound_count: u64,
    total_compounded: f64,
    ledger: Vec<CompoundLedgerEntry>,
}

/// The compound engine.
pub struct CompoundEngine {
    state: RwLock<Inner>,
}

impl CompoundEngine {
    pub fn new(total_account: f64) -> Self {
        info!(
            total_account,
            deployable = total_account * DEPLOYABLE_PCT,
            reserve = total_account * (1.0 - DEPLOYABLE_PCT),
            "compound engine initialised"
        );
        Self {
            state: RwLock::new(Inner {
                total_account,
                so_deployed: 0.0,
                orr_deployed: 0.0,
                freed_capital: 0.0,
                freed_consumed: 0.0,
                active_positions: 0,
                compound_count: 0,
                total_compounded: 0.0,
                ledger: Vec::new(),
            }),
        }
    }

    // -------------------------------------------------------------------------
    // Open / close tracking
    // -------------------------------------------------------------------------

    /// Record a position open. ORR opens consume the freed-capital pool
    /// before touching base capital.
    pub fn on_position_opened(&self, symbol: &str, position_value: f64, signal_type: SignalType) {
        let mut s = self.state.write();
        match signal_type {
            SignalType::So => s.so_deployed += position_value,
            SignalType::Orr => {
                s.orr_deployed += position_value;
                let from_freed = s.freed_capital.min(position_value);
                if from_freed > 0.0 {
                    s.freed_capital -= from_freed;
                    s.freed_consumed += from_freed;
                    debug!(symbol, compounded = from_freed, "freed capital consumed by ORR open");
                }
            }
        }
        s.active_positions += 1;

        debug!(
            symbol,
            so_deployed = s.so_deployed,
            orr_deployed = s.orr_deployed,
            freed = s.freed_capital,
            "capital state after open"
        );
    }

    /// Record a position close: releases the deployed value, frees
    /// `position_value + pnl` for compounding, and moves the account total
    /// by the realized P&L.
    pub fn on_position_closed(
        &self,
        symbol: &str,
        position_value: f64,
        signal_type: SignalType,
        exit_reason: &str,
        pnl: f64,
    ) -> f64 {
        let mut s = self.state.write();
        match signal_type {
            SignalType::So => s.so_deployed = (s.so_deployed - position_value).max(0.0),
            SignalType::Orr => s.orr_deployed = (s.orr_deployed - position_value).max(0.0),
        }

        let freed = (position_value + pnl).max(0.0);
        s.freed_capital += freed;
        s.total_account += pnl;
        s.total_compounded += freed;
        s.compound_count += 1;
        s.active_positions = s.active_positions.saturating_sub(1);

        s.ledger.push(CompoundLedgerEntry {
            symbol: symbol.to_string(),
            signal_type,
            exit_reason: exit_reason.to_string(),
            position_value,
            pnl,
            freed,
            at: Utc::now(),
        });

        if pnl >= 0.0 {
            info!(symbol, pnl, total_account = s.total_account, freed, "capital compounded");
        } else {
            warn!(symbol, pnl, total_account = s.total_account, freed, "account reduced by loss");
        }

        freed
    }

    // -------------------------------------------------------------------------
    // Availability queries
    // -------------------------------------------------------------------------

    /// Capital available for a new SO position.
    pub fn available_for_so(&self) -> f64 {
        let s = self.state.read();
        let base = s.total_account * DEPLOYABLE_PCT;
        (base - s.so_deployed).max(0.0).min(self.remaining_capacity(&s))
    }

    /// Capital available for a new ORR position: base ORR pool plus freed
    /// capital plus unused SO headroom, all bounded by remaining capacity.
    pub fn available_for_orr(&self) -> f64 {
        let s = self.state.read();
        self.remaining_capacity(&s) + s.freed_capital
    }

    fn remaining_capacity(&self, s: &Inner) -> f64 {
        (s.total_account * DEPLOYABLE_PCT - s.so_deployed - s.orr_deployed).max(0.0)
    }

    /// Whether `required` dollars can be committed to a `signal_type` open.
    pub fn can_open(&self, required: f64, signal_type: SignalType) -> bool {
        let available = match signal_type {
            SignalType::So => self.available_for_so(),
            SignalType::Orr => self.available_for_orr(),
        };
        let ok = available >= required;
        if !ok {
            debug!(required, available, signal = %signal_type, "insufficient capital");
        }
        ok
    }

    pub fn total_account(&self) -> f64 {
        self.state.read().total_account
    }

    pub fn freed_capital(&self) -> f64 {
        self.state.read().freed_capital
    }

    pub fn snapshot(&self) -> CompoundSnapshot {
        let s = self.state.read();
        let total_deployed = s.so_deployed + s.orr_deployed;
        let base = s.total_account * DEPLOYABLE_PCT;
        let capacity = (base - total_deployed).max(0.0);
        CompoundSnapshot {
            total_account: s.total_account,
            so_deployed: s.so_deployed,
            orr_deployed: s.orr_deployed,
            freed_capital: s.freed_capital,
            reserved: s.total_account * (1.0 - DEPLOYABLE_PCT),
            total_deployed,
            deployment_pct: if s.total_account > 0.0 {
                total_deployed / s.total_account * 100.0
            } else {
                0.0
            },
            available_for_so: (base - s.so_deployed).max(0.0).min(capacity),
            available_for_orr: capacity + s.freed_capital,
        }
    }

    pub fn ledger(&self) -> Vec<CompoundLedgerEntry> {
        self.state.read().ledger.clone()
    }

    // -------------------------------------------------------------------------
    // Persistence (intraday restart)
    // -------------------------------------------------------------------------

    /// Persist the capital state and the day's ledger.
    pub fn persist(&self, path: &std::path::Path, trading_date: chrono::NaiveDate) -> anyhow::Result<()> {
        use anyhow::Context;

        let file = {
            let s = self.state.read();
            CompoundStateFile {
                trading_date,
                total_account: s.total_account,
                so_deployed: s.so_deployed,
                orr_deployed: s.orr_deployed,
                freed_capital: s.freed_capital,
                freed_consumed: s.freed_consumed,
                ledger: s.ledger.clone(),
            }
        };
        let content =
            serde_json::to_string_pretty(&file).context("failed to serialise compound state")?;
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

    /// Restore an engine from a same-day state file; `None` when the file is
    /// absent, unreadable, or from a previous session date.
    pub fn restore(path: &std::path::Path, trading_date: chrono::NaiveDate) -> Option<Self> {
        let content = std::fs::read_to_string(path).ok()?;
        let file: CompoundStateFile = serde_json::from_str(&content).ok()?;
        if file.trading_date != trading_date {
            return None;
        }
        info!(
            total_account = file.total_account,
            freed = file.freed_capital,
            "compound state restored from same-day snapshot"
        );
        Some(Self {
            state: RwLock::new(Inner {
                total_account: file.total_account,
                so_deployed: file.so_deployed,
                orr_deployed: file.orr_deployed,
                freed_capital: file.freed_capital,
                freed_consumed: file.freed_consumed,
                active_positions: 0,
                compound_count: file.ledger.len() as u64,
                total_compounded: file.ledger.iter().map(|e| e.freed).sum(),
                ledger: file.ledger,
            }),
        })
    }
}

/// On-disk shape of the compound state.
#[derive(Debug, Serialize, Deserialize)]
struct CompoundStateFile {
    trading_date: chrono::NaiveDate,
    total_account: f64,
    so_deployed: f64,
    orr_deployed: f64,
    freed_capital: f64,
    freed_consumed: f64,
    ledger: Vec<CompoundLedgerEntry>,
}
