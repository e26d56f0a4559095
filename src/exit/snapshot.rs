// =============================================================================
// Position snapshots — restart persistence for the book
// =============================================================================
//
// The monitor persists the full book every N ticks and on every settlement,
// so a restart resumes managing open positions without re-discovering state.
// Atomic tmp + rename writes, same as every other state file.
// =============================================================================

use std::path::PathBuf;

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use tracing::info;

use super::registry::{Position, PositionBook, PositionStatus};

#[derive(Debug, Serialize, Deserialize)]
struct SnapshotFile {
    positions: Vec<Position>,
    saved_at: chrono::DateTime<chrono::Utc>,
}

/// Writes and restores book snapshots at a fixed path.
#[derive(Debug, Clone)]
pub struct SnapshotWriter {
    path: PathBuf,
}

impl SnapshotWriter {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    /// Persist the current book (open and closed positions alike; closed
    /// entries carry the day's realized results).
    pub fn persist(&self, book: &PositionBook) -> Result<()> {
        let file = SnapshotFile {
            positions: book.dump(),
            saved_at: chrono::Utc::now(),
        };
        let content =
            serde_json::to_string_pretty(&file).context("failed to serialise position snapshot")?;

        if let Some(parent) = self.path.parent() {
            std::fs::create_dir_all(parent)
                .with_context(|| format!("failed to create {}", parent.display()))?;
        }
        let tmp = self.path.with_extension("json.tmp");
        std::fs::write(&tmp, content)
            .with_context(|| format!("failed to write {}", tmp.display()))?;
        std::fs::rename(&tmp, &self.path)
            .with_context(|| format!("failed to rename into {}", self.path.display()))?;
        Ok(())
    }

    /// Restore open positions into `book`. Closed entries are skipped.
    /// Returns the number restored.
    pub fn restore(&self, book: &PositionBook) -> Result<usize> {
        if !self.path.exists() {
            return Ok(0);
        }
        let content = std::fs::read_to_string(&self.path)
            .with_context(|| format!("failed to read {}", self.path.display()))?;
        let file: SnapshotFile = serde_json::from_str(&content)
            .with_context(|| format!("failed to parse {}", self.path.display()))?;

        let mut restored = 0;
        for position in file.positions {
            if position.status != PositionStatus::Closed {
                book.restore(position);
                restored += 1;
            }
        }
        if restored > 0 {
            info!(count = restored, "open positions restored from snapshot");
        }
        Ok(restored)
    }
}

// =============================================================================
// Tests
// =============================================================================
#[cfg(test)]
mod tests {
    use super::*;
    use crate::exit::registry::NewPosition;
    use crate::types::{Side, SignalType, TradeRegime};
    use chrono::{TimeZone, Utc};

    fn new_position(symbol: &str) -> NewPosition {
        NewPosition {
            symbol: symbol.into(),
            side: Side::Long,
            signal_type: SignalType::So,
            regime: TradeRegime::Balanced,
            quantity: 10.0,
            entry_price: 100.0,
            entry_time: Utc.with_ymd_and_hms(2026, 1, 6, 15, 30, 0).unwrap(),
            entry_bar_volatility: 1.0,
            entry_spread_pct: 0.0005,
            position_value: 1_000.0,
        }
    }

    #[test]
    fn persist_and_restore_open_positions() {
        let dir = tempfile::tempdir().unwrap();
        let writer = SnapshotWriter::new(dir.path().join("positions.json"));

        let book = PositionBook::new(30);
        let open_id = book.register(new_position("SPY"));
        let closed_id = book.register(new_position("QQQ"));
        book.mark_closed(&closed_id, 101.0, "TEST");

        writer.persist(&book).unwrap();

        let restored_book = PositionBook::new(30);
        let count = writer.restore(&restored_book).unwrap();
        assert_eq!(count, 1, "only the open position comes back");

        let p = restored_book.snapshot(&open_id).unwrap();
        assert_eq!(p.symbol, "SPY");
        assert!((p.entry_price - 100.0).abs() < 1e-9);
    }

    #[test]
    fn restore_without_file_is_empty() {
        let dir = tempfile::tempdir().unwrap();
        let writer = SnapshotWriter::new(dir.path().join("none.json"));
        let book = PositionBook::new(30);
        assert_eq!(writer.restore(&book).unwrap(), 0);
    }

    #[test]
    fn persisted_state_survives_stop_promotion() {
        let dir = tempfile::tempdir().unwrap();
        let writer = SnapshotWriter::new(dir.path().join("positions.json"));

        let book = PositionBook::new(30);
        let id = book.register(new_position("SPY"));
        let p = book.snapshot(&id).unwrap();
        book.commit_stop(
            &id,
            p.current_stop_loss + 0.5,
            p.version,
            Utc.with_ymd_and_hms(2026, 1, 6, 16, 0, 0).unwrap(),
        );
        let promoted_stop = book.snapshot(&id).unwrap().current_stop_loss;

        writer.persist(&book).unwrap();
        let fresh = PositionBook::new(30);
        writer.restore(&fresh).unwrap();
        assert!(
            (fresh.snapshot(&id).unwrap().current_stop_loss - promoted_stop).abs() < 1e-9
        );
    }
}
