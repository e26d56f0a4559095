// =============================================================================
// Exit monitoring collector — per-position evaluation history
// =============================================================================
//
// Every monitor tick produces a decision; the collector keeps a bounded
// trail of them per position and rolls completed positions into a daily
// summary record on close. The record answers post-mortem questions the
// live log cannot: how long a position sat in each phase, how often the
// stop moved, the peak excursion against the final outcome.
//
// Flushed to disk on every exit and on demand; the file is the analytical
// input for end-of-day review.
// =============================================================================

use std::collections::HashMap;
use std::path::PathBuf;

use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use tracing::debug;

/// Retained ticks per open position.
const MAX_TICKS_PER_POSITION: usize = 480;

/// One recorded monitor evaluation.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MonitorTick {
    pub at: DateTime<Utc>,
    pub price: f64,
    pub stop: f64,
    pub phase: String,
    pub gain_pct: f64,
    pub stop_moved: bool,
}

/// The rolled-up record for a completed position.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ExitRecord {
    pub position_id: String,
    pub symbol: String,
    pub exit_reason: String,
    pub entry_price: f64,
    pub exit_price: f64,
    pub realized_pnl: f64,
    pub peak_gain_pct: f64,
    pub worst_gain_pct: f64,
    pub ticks_observed: usize,
    pub stop_promotions: usize,
    pub opened_at: Option<DateTime<Utc>>,
    pub closed_at: DateTime<Utc>,
}

#[derive(Debug, Default)]
struct Inner {
    ticks: HashMap<String, Vec<MonitorTick>>,
    records: Vec<ExitRecord>,
}

/// The collector.
pub struct ExitCollector {
    inner: Mutex<Inner>,
    path: PathBuf,
}

impl ExitCollector {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self {
            inner: Mutex::new(Inner::default()),
            path: path.into(),
        }
    }

    /// Record one monitor evaluation for a position.
    pub fn record_tick(&self, position_id: &str, tick: MonitorTick) {
        let mut inner = self.inner.lock();
        let trail = inner.ticks.entry(position_id.to_string()).or_default();
        trail.push(tick);
        if trail.len() > MAX_TICKS_PER_POSITION {
            trail.remove(0);
        }
    }

    /// Roll a closed position into its exit record and flush.
    #[allow(clippy::too_many_arguments)]
    pub fn record_exit(
        &self,
        position_id: &str,
        symbol: &str,
        exit_reason: &str,
        entry_price: f64,
        exit_price: f64,
        realized_pnl: f64,
        closed_at: DateTime<Utc>,
    ) {
        let record = {
            let mut inner = self.inner.lock();
            let trail = inner.ticks.remove(position_id).unwrap_or_default();

            let peak = trail.iter().map(|t| t.gain_pct).fold(f64::MIN, f64::max);
            let worst = trail.iter().map(|t| t.gain_pct).fold(f64::MAX, f64::min);
            let record = ExitRecord {
                position_id: position_id.to_string(),
                symbol: symbol.to_string(),
                exit_reason: exit_reason.to_string(),
                entry_price,
                exit_price,
                realized_pnl,
                peak_gain_pct: if trail.is_empty() { 0.0 } else { peak },
                worst_gain_pct: if trail.is_empty() { 0.0 } else { worst },
                ticks_observed: trail.len(),
                stop_promotions: trail.iter().filter(|t| t.stop_moved).count(),
                opened_at: trail.first().map(|t| t.at),
                closed_at,
            };
            inner.records.push(record.clone());
            record
        };

        debug!(
            id = %record.position_id,
            symbol = %record.symbol,
            reason = %record.exit_reason,
            ticks = record.ticks_observed,
            "exit record collected"
        );

        if let Err(e) = self.flush() {
            debug!(error = %e, "exit record flush failed");
        }
    }

    /// Persist all completed records.
    pub fn flush(&self) -> Result<()> {
        let content = {
            let inner = self.inner.lock();
            serde_json::to_string_pretty(&inner.records)
                .context("failed to serialise exit records")?
        };
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

    /// Aggregate view for the status surface.
    pub fn day_summary(&self) -> DaySummary {
        let inner = self.inner.lock();
        let n = inner.records.len();
        let wins = inner.records.iter().filter(|r| r.realized_pnl > 0.0).count();
        let total_pnl: f64 = inner.records.iter().map(|r| r.realized_pnl).sum();
        let mut by_reason: HashMap<String, usize> = HashMap::new();
        for r in &inner.records {
            *by_reason.entry(r.exit_reason.clone()).or_default() += 1;
        }
        DaySummary {
            closed_positions: n,
            wins,
            win_rate: if n > 0 { wins as f64 / n as f64 } else { 0.0 },
            total_pnl,
            exits_by_reason: by_reason,
        }
    }
}

/// Day-level aggregate over exit records.
#[derive(Debug, Clone, Serialize)]
pub struct DaySummary {
    pub closed_positions: usize,
    pub wins: usize,
    pub win_rate: f64,
    pub total_pnl: f64,
    pub exits_by_reason: HashMap<String, usize>,
}

// =============================================================================
// Tests
// =============================================================================
#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    fn t(minute: i64) -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2026, 1, 6, 15, 0, 0).unwrap() + chrono::Duration::minutes(minute)
    }

    fn tick(minute: i64, price: f64, stop: f64, gain: f64, moved: bool) -> MonitorTick {
        MonitorTick {
            at: t(minute),
            price,
            stop,
            phase: "TRAILING".into(),
            gain_pct: gain,
            stop_moved: moved,
        }
    }

    fn collector() -> (tempfile::TempDir, ExitCollector) {
        let dir = tempfile::tempdir().unwrap();
        let c = ExitCollector::new(dir.path().join("exit_records.json"));
        (dir, c)
    }

    #[test]
    fn exit_record_rolls_up_the_trail() {
        let (_dir, c) = collector();
        c.record_tick("p1", tick(0, 50.0, 49.25, 0.0, false));
        c.record_tick("p1", tick(1, 51.0, 49.5, 2.0, true));
        c.record_tick("p1", tick(2, 50.5, 49.8, 1.0, true));

        c.record_exit("p1", "TQQQ", "HARD_STOP", 50.0, 49.8, -20.0, t(3));

        let summary = c.day_summary();
        assert_eq!(summary.closed_positions, 1);
        assert_eq!(summary.wins, 0);
        assert_eq!(summary.exits_by_reason.get("HARD_STOP"), Some(&1));

        let inner = c.inner.lock();
        let record = &inner.records[0];
        assert!((record.peak_gain_pct - 2.0).abs() < 1e-9);
        assert_eq!(record.stop_promotions, 2);
        assert_eq!(record.ticks_observed, 3);
        assert!(inner.ticks.is_empty(), "trail consumed on exit");
    }

    #[test]
    fn trail_is_bounded() {
        let (_dir, c) = collector();
        for i in 0..(MAX_TICKS_PER_POSITION + 50) {
            c.record_tick("p1", tick(i as i64, 50.0, 49.0, 0.0, false));
        }
        assert_eq!(c.inner.lock().ticks["p1"].len(), MAX_TICKS_PER_POSITION);
    }

    #[test]
    fn flush_writes_records_to_disk() {
        let (dir, c) = collector();
        c.record_tick("p1", tick(0, 50.0, 49.0, 0.5, false));
        c.record_exit("p1", "SPY", "EOD", 50.0, 50.2, 20.0, t(1));

        let raw = std::fs::read_to_string(dir.path().join("exit_records.json")).unwrap();
        let parsed: Vec<ExitRecord> = serde_json::from_str(&raw).unwrap();
        assert_eq!(parsed.len(), 1);
        assert_eq!(parsed[0].symbol, "SPY");
    }

    #[test]
    fn summary_tracks_win_rate() {
        let (_dir, c) = collector();
        c.record_exit("a", "SPY", "PROFIT_TARGET_1", 100.0, 103.0, 150.0, t(1));
        c.record_exit("b", "QQQ", "HARD_STOP", 100.0, 99.0, -100.0, t(2));
        c.record_exit("c", "IWM", "EOD", 100.0, 101.0, 50.0, t(3));

        let s = c.day_summary();
        assert_eq!(s.closed_positions, 3);
        assert_eq!(s.wins, 2);
        assert!((s.win_rate - 2.0 / 3.0).abs() < 1e-9);
        assert!((s.total_pnl - 100.0).abs() < 1e-9);
    }

    #[test]
    fn exit_without_trail_still_records() {
        let (_dir, c) = collector();
        c.record_exit("ghost", "SPY", "EOD", 100.0, 100.0, 0.0, t(1));
        let inner = c.inner.lock();
        assert_eq!(inner.records[0].ticks_observed, 0);
        assert_eq!(inner.records[0].peak_gain_pct, 0.0);
    }
}
