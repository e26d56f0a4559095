// =============================================================================
// Exit monitor — the evaluation loop and close-intent worker
// =============================================================================
//
// The monitor wakes on a fixed cadence (default 30 s) and, for every open
// position:
//
//   1. Snapshots the position and assembles the market context (tape, ORB
//      levels, gap tracker, momentum read).
//   2. Promotes the lifecycle phase, folds in the latest price, and commits
//      the desired stop under the book's monotonicity/hysteresis/cooldown
//      rules — retrying once when the optimistic version check fails.
//   3. Evaluates the exit triggers and, when one fires, enqueues a close
//      intent. The loop never talks to the broker itself.
//
// A separate worker drains the bounded intent queue, submits orders through
// the broker seam, settles the book, reports freed capital to the compound
// engine, and publishes settlement events. Order trouble escalates the
// position (flagged for the EOD sweep) instead of wedging the loop.
//
// Ticks that overrun the cadence are skipped, not queued.
// =============================================================================

use std::collections::HashMap;
use std::sync::Arc;

use chrono::Utc;
use parking_lot::Mutex;
use tokio::sync::{mpsc, watch};
use tracing::{debug, error, info, warn};

use super::collector::{ExitCollector, MonitorTick};
use super::gap::PeakTracker;
use super::registry::{PositionBook, StopCommit};
use super::snapshot::SnapshotWriter;
use super::triggers::{self, ExitAction, ExitConfig, ExitReason, MarketContext};
use crate::broker::types::{EquityAction, OrderRequest, PriceType};
use crate::broker::Broker;
use crate::compound::CompoundEngine;
use crate::events::{EngineEvent, EventSink};
use crate::market::candles::CandleStore;
use crate::market::clock::MarketClock;
use crate::orb::OrbBook;
use crate::types::Side;

/// Persist a book snapshot every this many ticks.
const SNAPSHOT_EVERY_TICKS: u64 = 10;
/// Close-intent queue depth; a full queue escalates, never blocks.
pub const INTENT_QUEUE_DEPTH: usize = 64;

/// What the worker should do for a position.
#[derive(Debug, Clone)]
pub struct CloseIntent {
    pub position_id: String,
    pub symbol: String,
    pub side: Side,
    pub quantity: f64,
    /// `None` closes the full remaining quantity.
    pub ladder_rung: Option<u8>,
    pub reason: ExitReason,
}

/// Momentum flip: MACD histogram leaning hard against the position.
pub fn momentum_flipped(side: Side, macd_histogram: Option<f64>, atr: f64) -> bool {
    let Some(hist) = macd_histogram else {
        return false;
    };
    let magnitude_floor = 0.15 * atr.max(1e-9);
    match side {
        Side::Long => hist < -magnitude_floor,
        Side::Short => hist > magnitude_floor,
    }
}

/// Shared pieces the monitor reads every tick.
pub struct ExitMonitor {
    pub book: Arc<PositionBook>,
    pub store: Arc<CandleStore>,
    pub orb_book: Arc<OrbBook>,
    pub clock: Arc<MarketClock>,
    pub config: ExitConfig,
    /// Gap threshold in percent.
    pub gap_pct: f64,
    pub intents: mpsc::Sender<CloseIntent>,
    pub snapshots: SnapshotWriter,
    pub collector: Arc<ExitCollector>,
    trackers: Mutex<HashMap<String, PeakTracker>>,
}

impl ExitMonitor {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        book: Arc<PositionBook>,
        store: Arc<CandleStore>,
        orb_book: Arc<OrbBook>,
        clock: Arc<MarketClock>,
        config: ExitConfig,
        gap_pct: f64,
        intents: mpsc::Sender<CloseIntent>,
        snapshots: SnapshotWriter,
        collector: Arc<ExitCollector>,
    ) -> Self {
        Self {
            book,
            store,
            orb_book,
            clock,
            config,
            gap_pct,
            intents,
            snapshots,
            collector,
            trackers: Mutex::new(HashMap::new()),
        }
    }

    /// One evaluation pass over every open position. Public so tests drive
    /// ticks directly without the timer.
    pub fn tick(&self, now: chrono::DateTime<Utc>) {
        let open = self.book.open_positions();
        if open.is_empty() {
            return;
        }

        let minutes_to_close = (self.clock.next_close(now) - now).num_minutes();

        for position in open {
            let Some(tape) = self.store.tape(&position.symbol) else {
                debug!(symbol = %position.symbol, "no tape — skipping evaluation");
                continue;
            };
            if tape.last_price <= 0.0 {
                continue;
            }

            // Fold the print into the position and the gap tracker first.
            self.book.update_price(&position.position_id, tape.last_price, now);
            let gap_detected = {
                let mut trackers = self.trackers.lock();
                let tracker = trackers
                    .entry(position.position_id.clone())
                    .or_insert_with(PeakTracker::new);
                match position.side {
                    Side::Long => {
                        tracker.record(now, tape.last_price);
                        tracker.gap_detected(now, tape.last_price, self.gap_pct)
                    }
                    Side::Short => {
                        // Adverse for a short is a gap *up*: track the
                        // inverse so the same peak math applies.
                        tracker.record(now, 1.0 / tape.last_price);
                        tracker.gap_detected(now, 1.0 / tape.last_price, self.gap_pct)
                    }
                }
            };

            // Re-snapshot after the price fold.
            let Some(mut p) = self.book.snapshot(&position.position_id) else {
                continue;
            };

            // Phase promotion by age/excursion.
            let target_phase = triggers::desired_phase(&p, now, &self.config);
            if target_phase != p.phase {
                self.book.set_phase(&p.position_id, target_phase);
                p = match self.book.snapshot(&p.position_id) {
                    Some(fresh) => fresh,
                    None => continue,
                };
            }

            let orb = self.orb_book.get(&p.symbol);
            let bars = self.store.minute_bars(&p.symbol, 60);
            let atr =
                crate::indicators::atr::latest(&bars, 14).unwrap_or(p.entry_bar_volatility);
            let closes: Vec<f64> = bars.iter().map(|b| b.close).collect();
            let macd = crate::indicators::macd::latest(&closes).map(|m| m.histogram);

            let ctx = MarketContext {
                last: tape.last_price,
                spread_pct: tape.spread_pct(),
                vwap: tape.vwap,
                orb_high: orb.as_ref().map(|o| o.orb_high).unwrap_or(0.0),
                orb_low: orb.as_ref().map(|o| o.orb_low).unwrap_or(0.0),
                orb_midpoint: orb.as_ref().map(|o| o.midpoint()).unwrap_or(0.0),
                atr,
                gap_detected,
                momentum_flip: momentum_flipped(p.side, macd, atr),
                minutes_to_close,
                now,
            };

            let action = triggers::evaluate_exit(&p, &ctx, &self.config);

            match action {
                ExitAction::Hold => {
                    // No trigger: manage the stop.
                    if let Some(candidate) = triggers::desired_stop(&p, &ctx) {
                        self.commit_with_retry(&p.position_id, candidate, p.version, now);
                    }
                }
                ExitAction::PartialClose {
                    fraction_of_remaining,
                    rung,
                    reason,
                } => {
                    let quantity = (p.quantity * fraction_of_remaining).floor().max(1.0);
                    self.enqueue(CloseIntent {
                        position_id: p.position_id.clone(),
                        symbol: p.symbol.clone(),
                        side: p.side,
                        quantity,
                        ladder_rung: Some(rung),
                        reason,
                    });
                }
                ExitAction::Close { reason } => {
                    self.enqueue(CloseIntent {
                        position_id: p.position_id.clone(),
                        symbol: p.symbol.clone(),
                        side: p.side,
                        quantity: p.quantity,
                        ladder_rung: None,
                        reason,
                    });
                }
            }

            // Feed the post-mortem trail.
            let after = self.book.snapshot(&p.position_id);
            let stop_now = after
                .as_ref()
                .map(|a| a.current_stop_loss)
                .unwrap_or(p.current_stop_loss);
            self.collector.record_tick(
                &p.position_id,
                MonitorTick {
                    at: now,
                    price: ctx.last,
                    stop: stop_now,
                    phase: p.phase.to_string(),
                    gain_pct: super::math::favorable_pct(p.side, p.entry_price, ctx.last),
                    stop_moved: (stop_now - p.current_stop_loss).abs() > 1e-12,
                },
            );
        }
    }

    fn commit_with_retry(
        &self,
        position_id: &str,
        candidate: f64,
        version: u64,
        now: chrono::DateTime<Utc>,
    ) {
        match self.book.commit_stop(position_id, candidate, version, now) {
            None => {
                // Version raced; retry once against the fresh snapshot.
                if let Some(fresh) = self.book.snapshot(position_id) {
                    let _ = self
                        .book
                        .commit_stop(position_id, candidate, fresh.version, now);
                }
            }
            Some(StopCommit::Rejected) => {
                warn!(id = %position_id, "stop commit rejected — position escalated");
            }
            _ => {}
        }
    }

    fn enqueue(&self, intent: CloseIntent) {
        let id = intent.position_id.clone();
        if let Err(e) = self.intents.try_send(intent) {
            error!(id = %id, error = %e, "close-intent queue full — escalating position");
            self.book.escalate(&id);
        }
    }

    /// The timer loop. Ticks that overrun the cadence are skipped.
    pub async fn run(self: Arc<Self>, interval_secs: u64, mut shutdown: watch::Receiver<bool>) {
        info!(interval_secs, "exit monitor started");
        let mut ticker =
            tokio::time::interval(std::time::Duration::from_secs(interval_secs.max(5)));
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);

        let mut tick_count: u64 = 0;
        loop {
            tokio::select! {
                _ = ticker.tick() => {}
                _ = shutdown.changed() => {
                    if *shutdown.borrow() {
                        info!("exit monitor stopping");
                        let _ = self.snapshots.persist(&self.book);
                        return;
                    }
                }
            }

            self.tick(Utc::now());
            tick_count += 1;
            if tick_count % SNAPSHOT_EVERY_TICKS == 0 {
                if let Err(e) = self.snapshots.persist(&self.book) {
                    warn!(error = %e, "snapshot persistence failed");
                }
            }
        }
    }
}

// =============================================================================
// Close-intent worker
// =============================================================================

/// Drain the intent queue: submit the order, settle the book, free capital,
/// publish events. Bounded retries per intent; failures escalate.
#[allow(clippy::too_many_arguments)]
pub async fn run_close_worker(
    mut rx: mpsc::Receiver<CloseIntent>,
    broker: Arc<dyn Broker>,
    account_id_key: String,
    book: Arc<PositionBook>,
    compound: Arc<CompoundEngine>,
    events: EventSink,
    snapshots: SnapshotWriter,
    collector: Arc<ExitCollector>,
) {
    info!("close worker started");
    while let Some(intent) = rx.recv().await {
        let Some(position) = book.snapshot(&intent.position_id) else {
            continue;
        };
        if position.quantity <= 0.0 {
            continue;
        }

        let quantity = intent.quantity.min(position.quantity).max(0.0);
        if quantity <= 0.0 {
            continue;
        }

        let order = OrderRequest::Equity {
            symbol: intent.symbol.clone(),
            action: match intent.side {
                Side::Long => EquityAction::Sell,
                Side::Short => EquityAction::Buy,
            },
            quantity: quantity.round() as u32,
            price_type: PriceType::Market,
        };

        let mut placed = None;
        for attempt in 0..3u32 {
            match broker.preview_order(&account_id_key, &order).await {
                Ok(preview) => {
                    match broker.place_order(&account_id_key, &order, &preview).await {
                        Ok(ok) => {
                            placed = Some(ok);
                            break;
                        }
                        Err(e) if e.is_transient() => {
                            warn!(id = %intent.position_id, attempt, error = %e, "place failed — retrying");
                        }
                        Err(e) => {
                            error!(id = %intent.position_id, error = %e, "place failed permanently");
                            break;
                        }
                    }
                }
                Err(e) if e.is_transient() => {
                    warn!(id = %intent.position_id, attempt, error = %e, "preview failed — retrying");
                }
                Err(e) => {
                    error!(id = %intent.position_id, error = %e, "preview failed permanently");
                    break;
                }
            }
        }

        let Some(placed) = placed else {
            book.escalate(&intent.position_id);
            events.publish(EngineEvent::PositionEscalated {
                at: Utc::now(),
                position_id: intent.position_id.clone(),
                symbol: intent.symbol.clone(),
                detail: format!("close order failed ({})", intent.reason),
            });
            continue;
        };

        let fill = placed.fill_price.unwrap_or(position.current_price);
        let freed_value = quantity * position.entry_price;
        let pnl = super::math::unrealized_pnl(position.side, position.entry_price, fill, quantity);

        match intent.ladder_rung {
            Some(rung) => {
                if let Some(after) =
                    book.apply_partial(&intent.position_id, quantity, fill, rung)
                {
                    compound.on_position_closed(
                        &intent.symbol,
                        freed_value,
                        position.signal_type,
                        &intent.reason.to_string(),
                        pnl,
                    );
                    events.publish(EngineEvent::PartialClose {
                        at: Utc::now(),
                        position_id: intent.position_id.clone(),
                        symbol: intent.symbol.clone(),
                        closed_quantity: quantity,
                        remaining_quantity: after.quantity,
                        realized_pnl: pnl,
                    });
                }
            }
            None => {
                if book
                    .mark_closed(&intent.position_id, fill, &intent.reason.to_string())
                    .is_some()
                {
                    collector.record_exit(
                        &intent.position_id,
                        &intent.symbol,
                        &intent.reason.to_string(),
                        position.entry_price,
                        fill,
                        pnl,
                        Utc::now(),
                    );
                    compound.on_position_closed(
                        &intent.symbol,
                        freed_value,
                        position.signal_type,
                        &intent.reason.to_string(),
                        pnl,
                    );
                    events.publish(EngineEvent::PositionClosed {
                        at: Utc::now(),
                        position_id: intent.position_id.clone(),
                        symbol: intent.symbol.clone(),
                        signal_type: position.signal_type,
                        exit_reason: intent.reason.to_string(),
                        realized_pnl: pnl,
                    });
                }
            }
        }

        if let Err(e) = snapshots.persist(&book) {
            warn!(error = %e, "snapshot persistence failed after settlement");
        }
    }
    info!("close worker stopped (queue closed)");
}

// =============================================================================
// Tests
// =============================================================================
#[cfg(test)]
mod tests {
    use super::*;
    use crate::broker::SimBroker;
    use crate::exit::registry::{LifecyclePhase, NewPosition, PositionStatus};
    use crate::types::{SignalType, TradeRegime};
    use chrono::TimeZone;

    fn t0() -> chrono::DateTime<Utc> {
        // A normal Tuesday mid-session: 11:00 ET.
        Utc.with_ymd_and_hms(2026, 1, 6, 16, 0, 0).unwrap()
    }

    struct Fixture {
        monitor: Arc<ExitMonitor>,
        book: Arc<PositionBook>,
        rx: mpsc::Receiver<CloseIntent>,
        _dir: tempfile::TempDir,
    }

    fn monitor_fixture() -> Fixture {
        let book = Arc::new(PositionBook::new(30));
        let store = Arc::new(CandleStore::new());
        let orb_book = Arc::new(OrbBook::new());
        let clock = Arc::new(MarketClock::new());
        let (tx, rx) = mpsc::channel(INTENT_QUEUE_DEPTH);
        let dir = tempfile::tempdir().unwrap();
        let snapshots = SnapshotWriter::new(dir.path().join("positions.json"));

        let collector = Arc::new(ExitCollector::new(dir.path().join("exit_records.json")));

        let monitor = Arc::new(ExitMonitor::new(
            book.clone(),
            store,
            orb_book,
            clock,
            ExitConfig::default(),
            2.0,
            tx,
            snapshots,
            collector,
        ));
        Fixture {
            monitor,
            book,
            rx,
            _dir: dir,
        }
    }

    fn register(book: &PositionBook, entry: f64) -> String {
        book.register(NewPosition {
            symbol: "TQQQ".into(),
            side: Side::Long,
            signal_type: SignalType::So,
            regime: TradeRegime::Explosive,
            quantity: 100.0,
            entry_price: entry,
            entry_time: t0(),
            entry_bar_volatility: 0.50,
            entry_spread_pct: 0.0004,
            position_value: 5_000.0,
        })
    }

    fn feed_price(monitor: &ExitMonitor, symbol: &str, price: f64, minute: i64) {
        monitor.store.record_quote(
            symbol,
            t0() + chrono::Duration::minutes(minute),
            price,
            price - 0.01,
            price + 0.01,
            (minute as f64 + 1.0) * 10_000.0,
        );
    }

    /// Anchor the VWAP near `price` with one heavy minute of prints.
    fn anchor_vwap(monitor: &ExitMonitor, symbol: &str, price: f64) {
        monitor
            .store
            .record_quote(symbol, t0(), price, price - 0.01, price + 0.01, 10_000.0);
        monitor.store.record_quote(
            symbol,
            t0() + chrono::Duration::seconds(50),
            price,
            price - 0.01,
            price + 0.01,
            5_000_000.0,
        );
    }

    #[test]
    fn tick_enqueues_hard_stop_close() {
        let mut fx = monitor_fixture();
        let id = register(&fx.book, 50.0);

        // Tape collapses through the 49.25 initial stop.
        feed_price(&fx.monitor, "TQQQ", 49.0, 0);
        fx.monitor.tick(t0() + chrono::Duration::minutes(1));

        let intent = fx.rx.try_recv().expect("close intent expected");
        assert_eq!(intent.position_id, id);
        assert_eq!(intent.reason, ExitReason::HardStop);
        assert!((intent.quantity - 100.0).abs() < 1e-9);
    }

    #[test]
    fn tick_holds_and_updates_peak_on_quiet_tape() {
        let mut fx = monitor_fixture();
        let id = register(&fx.book, 50.0);

        feed_price(&fx.monitor, "TQQQ", 50.3, 0);
        fx.monitor.tick(t0() + chrono::Duration::minutes(1));

        assert!(fx.rx.try_recv().is_err(), "no intent on a quiet tape");
        let p = fx.book.snapshot(&id).unwrap();
        assert!((p.current_price - 50.3).abs() < 1e-9);
        assert!(p.peak_gain_pct > 0.59 && p.peak_gain_pct < 0.61);
    }

    #[test]
    fn stealth_ladder_scenario() {
        // Scenario S4: 100 @ $50, explosive. +3% → rung 1 (50 shares),
        // +7% → rung 2 (25 shares), runner trails with stop ≥ entry.
        let mut fx = monitor_fixture();
        let id = register(&fx.book, 50.0);

        // Heavy volume at entry so the intraday VWAP anchors near $50 and
        // the later pullback does not read as a VWAP reclaim.
        anchor_vwap(&fx.monitor, "TQQQ", 50.0);

        // +3%: first partial intent.
        feed_price(&fx.monitor, "TQQQ", 51.5, 1);
        fx.monitor.tick(t0() + chrono::Duration::minutes(1));
        let intent = fx.rx.try_recv().expect("rung 1 intent");
        assert_eq!(intent.ladder_rung, Some(1));
        assert!((intent.quantity - 50.0).abs() < 1e-9);
        // Settle the partial as the worker would.
        fx.book.apply_partial(&id, 50.0, 51.5, 1).unwrap();

        // +7%: second partial intent (half of the remaining 50).
        feed_price(&fx.monitor, "TQQQ", 53.5, 2);
        fx.monitor.tick(t0() + chrono::Duration::minutes(3));
        let intent = fx.rx.try_recv().expect("rung 2 intent");
        assert_eq!(intent.ladder_rung, Some(2));
        assert!((intent.quantity - 25.0).abs() < 1e-9);
        fx.book.apply_partial(&id, 25.0, 53.5, 2).unwrap();

        // Pullback: runner holds, trailing stop at or above entry, and the
        // stop never regressed.
        feed_price(&fx.monitor, "TQQQ", 52.8, 4);
        fx.monitor.tick(t0() + chrono::Duration::minutes(5));
        assert!(fx.rx.try_recv().is_err(), "runner holds on the pullback");

        let p = fx.book.snapshot(&id).unwrap();
        assert_eq!(p.phase, LifecyclePhase::Partial);
        assert!((p.quantity - 25.0).abs() < 1e-9);
        assert!(
            p.current_stop_loss >= 50.0,
            "runner stop {} must be at or above entry",
            p.current_stop_loss
        );
    }

    #[test]
    fn momentum_flip_helper_is_side_aware() {
        assert!(momentum_flipped(Side::Long, Some(-0.2), 1.0));
        assert!(!momentum_flipped(Side::Long, Some(0.2), 1.0));
        assert!(
            !momentum_flipped(Side::Long, Some(-0.05), 1.0),
            "inside the floor"
        );
        assert!(momentum_flipped(Side::Short, Some(0.2), 1.0));
        assert!(!momentum_flipped(Side::Short, None, 1.0));
    }

    #[tokio::test]
    async fn close_worker_settles_full_close() {
        let book = Arc::new(PositionBook::new(30));
        let id = register(&book, 50.0);
        book.update_price(&id, 51.0, t0());

        let compound = Arc::new(CompoundEngine::new(100_000.0));
        compound.on_position_opened("TQQQ", 5_000.0, SignalType::So);

        let broker: Arc<dyn Broker> = Arc::new(SimBroker::new());
        let (tx, rx) = mpsc::channel(8);
        let dir = tempfile::tempdir().unwrap();
        let snapshots = SnapshotWriter::new(dir.path().join("positions.json"));

        tx.send(CloseIntent {
            position_id: id.clone(),
            symbol: "TQQQ".into(),
            side: Side::Long,
            quantity: 100.0,
            ladder_rung: None,
            reason: ExitReason::EndOfDay,
        })
        .await
        .unwrap();
        drop(tx); // worker exits after draining

        let collector = Arc::new(ExitCollector::new(dir.path().join("exit_records.json")));
        run_close_worker(
            rx,
            broker,
            "SIM-0001".into(),
            book.clone(),
            compound.clone(),
            EventSink::detached(),
            snapshots,
            collector.clone(),
        )
        .await;

        let p = book.snapshot(&id).unwrap();
        assert_eq!(p.status, PositionStatus::Closed);
        assert!(compound.freed_capital() > 0.0, "capital returned to the pool");
        assert_eq!(collector.day_summary().closed_positions, 1);
    }
}
