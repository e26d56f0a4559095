// =============================================================================
// 0DTE manager — eligibility → rank → gate → select → size → execute
// =============================================================================
//
// Subscribes to the same ORB signal stream as the equity executor and runs
// its own pipeline for the index products:
//
//   1. Convex eligibility filter over the batch (with batch percentiles).
//   2. Rank survivors with the shared priority scorer.
//   3. Execution-time hard gate: symbol ∈ {SPY, QQQ, IWM, SPX}, ET clock in
//      [09:35, 10:15], liquidity thresholds, no extreme-volatility flag.
//   4. Fetch today's chain, select the structure (debit vertical by
//      default; a lotto when conviction is very high), enforce the chain
//      age and leg liquidity walls.
//   5. Size under the dedicated options sub-account: 90% deployable, 35%
//      per position, the shared rank-multiplier ladder; quantity from
//      `debit_cost × 100` (or `max_loss × 100` margin for credit).
//   6. Execute (preview → place) and register with the options exit book.
//
// The monitor loop re-marks open structures from fresh chains and drives
// the options exit ladder; exits route through the same broker seam.
// =============================================================================

use std::sync::Arc;

use chrono::{NaiveTime, Utc};
use tokio::sync::watch;
use tracing::{debug, info, warn};

use super::eligibility::{self, ConvexInputs};
use super::exits::{
    evaluate_options_exit, structure_mark, OptionsBook, OptionsContext, OptionsExitAction,
};
use super::selection::{self, SelectReject};
use super::types::{
    OptionContract, OptionKind, OptionsPosition, OptionsStructure,
};
use crate::broker::types::{OptionAction, OptionLeg, OrderRequest, PriceType};
use crate::broker::Broker;
use crate::events::{EngineEvent, EventSink};
use crate::market::candles::CandleStore;
use crate::market::clock::MarketClock;
use crate::market::eastern;
use crate::orb::signals::OrbSignal;
use crate::ranker::{self, SizingInputs};
use crate::types::Side;
use crate::watchlist::Watchlist;

/// The index products the 0DTE engine trades.
const ZERO_DTE_SYMBOLS: &[&str] = &["SPY", "QQQ", "IWM", "SPX"];

/// Entry window (ET).
fn entry_window() -> (NaiveTime, NaiveTime) {
    (
        NaiveTime::from_hms_opt(9, 35, 0).expect("valid time"),
        NaiveTime::from_hms_opt(10, 15, 0).expect("valid time"),
    )
}

/// Eligibility score above which a lotto is taken instead of a vertical.
const LOTTO_CONVICTION: f64 = 0.90;
/// Target delta for the scored leg.
const TARGET_DELTA: f64 = 0.20;
/// Strikes pulled around the money per chain fetch.
const CHAIN_STRIKES: u32 = 20;
/// Options sub-account deployment knobs (shared ladder with equities).
const OPTIONS_CAPITAL_PCT: f64 = 90.0;
const OPTIONS_POSITION_PCT: f64 = 35.0;
const OPTIONS_MAX_CONCURRENT: usize = 4;

/// Day-level flags supplied by the session orchestrator.
#[derive(Debug, Clone, Copy, Default)]
pub struct DayFlags {
    pub is_red_day: bool,
    pub extreme_volatility: bool,
}

/// Why a signal fell out of the options pipeline.
#[derive(Debug, Clone)]
pub enum OptionsSkip {
    NotAnIndexProduct,
    OutsideEntryWindow,
    ExtremeVolatility,
    Ineligible(Vec<&'static str>),
    Selection(SelectReject),
    BudgetExhausted,
    ZeroQuantity,
    BrokerFailed(String),
}

impl std::fmt::Display for OptionsSkip {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::NotAnIndexProduct => write!(f, "not a 0DTE index product"),
            Self::OutsideEntryWindow => write!(f, "outside the 09:35-10:15 ET window"),
            Self::ExtremeVolatility => write!(f, "extreme volatility flag set"),
            Self::Ineligible(r) => write!(f, "convex filter: {r:?}"),
            Self::Selection(r) => write!(f, "selection: {r}"),
            Self::BudgetExhausted => write!(f, "options budget exhausted"),
            Self::ZeroQuantity => write!(f, "allocation too small for one contract"),
            Self::BrokerFailed(e) => write!(f, "broker: {e}"),
        }
    }
}

/// The execution-time hard gate — every trade, no exceptions.
pub fn hard_gate(
    symbol: &str,
    now: chrono::DateTime<Utc>,
    flags: DayFlags,
) -> Result<(), OptionsSkip> {
    if !ZERO_DTE_SYMBOLS.contains(&symbol) {
        return Err(OptionsSkip::NotAnIndexProduct);
    }
    let et = eastern::eastern_time(now);
    let (start, end) = entry_window();
    if et < start || et > end {
        return Err(OptionsSkip::OutsideEntryWindow);
    }
    if flags.extreme_volatility {
        return Err(OptionsSkip::ExtremeVolatility);
    }
    Ok(())
}

/// Contracts affordable for the allocation, per structure economics.
pub fn contracts_for_allocation(structure: &OptionsStructure, allocation: f64) -> u32 {
    let per_contract = match structure {
        OptionsStructure::DebitSpread(s) => s.debit_cost * 100.0,
        OptionsStructure::CreditSpread(s) => s.max_loss * 100.0,
        OptionsStructure::Lotto(c) => c.mid() * 100.0,
    };
    if per_contract <= 0.0 {
        return 0;
    }
    (allocation / per_contract).floor() as u32
}

/// The 0DTE manager.
pub struct ZeroDteManager {
    pub broker: Arc<dyn Broker>,
    pub account_id_key: String,
    pub book: Arc<OptionsBook>,
    pub store: Arc<CandleStore>,
    pub clock: Arc<MarketClock>,
    pub watchlist: Arc<Watchlist>,
    pub events: EventSink,
    /// Dedicated options sub-account value.
    pub account_value: f64,
    /// Capital already deployed today.
    deployed: parking_lot::Mutex<f64>,
}

impl ZeroDteManager {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        broker: Arc<dyn Broker>,
        account_id_key: String,
        book: Arc<OptionsBook>,
        store: Arc<CandleStore>,
        clock: Arc<MarketClock>,
        watchlist: Arc<Watchlist>,
        events: EventSink,
        account_value: f64,
    ) -> Self {
        Self {
            broker,
            account_id_key,
            book,
            store,
            clock,
            watchlist,
            events,
            account_value,
            deployed: parking_lot::Mutex::new(0.0),
        }
    }

    /// Run the full pipeline over a signal batch. Returns per-signal
    /// outcomes for the batched report.
    pub async fn process_signals(
        &self,
        signals: &[OrbSignal],
        flags: DayFlags,
        now: chrono::DateTime<Utc>,
    ) -> Vec<(String, Result<String, OptionsSkip>)> {
        let mut outcomes = Vec::new();

        // Index products only, then the convex filter over the batch.
        let index_signals: Vec<OrbSignal> = signals
            .iter()
            .filter(|s| ZERO_DTE_SYMBOLS.contains(&s.ticker.as_str()))
            .cloned()
            .collect();
        for s in signals {
            if !ZERO_DTE_SYMBOLS.contains(&s.ticker.as_str()) {
                outcomes.push((s.ticker.clone(), Err(OptionsSkip::NotAnIndexProduct)));
            }
        }
        if index_signals.is_empty() {
            return outcomes;
        }

        let percentiles = eligibility::volatility_percentiles(&index_signals);
        let mut eligible = Vec::new();
        for (signal, percentile) in index_signals.into_iter().zip(percentiles) {
            let is_leveraged = self
                .watchlist
                .get(&signal.ticker)
                .map(|w| w.is_leveraged)
                .unwrap_or(false);
            let verdict = eligibility::evaluate(
                &signal,
                ConvexInputs {
                    is_red_day: flags.is_red_day,
                    is_leveraged,
                    volatility_percentile: percentile,
                },
            );
            if verdict.eligible {
                eligible.push(signal);
            } else {
                outcomes.push((
                    signal.ticker.clone(),
                    Err(OptionsSkip::Ineligible(verdict.rejections)),
                ));
            }
        }

        // Rank and size the survivors against the options sub-account.
        let ranked = ranker::allocate(
            ranker::rank(eligible),
            SizingInputs {
                total_account: self.account_value,
                trading_capital_pct: OPTIONS_CAPITAL_PCT,
                max_position_pct: OPTIONS_POSITION_PCT,
                max_concurrent: OPTIONS_MAX_CONCURRENT,
            },
        );

        for entry in ranked {
            let ticker = entry.signal.ticker.clone();
            let outcome = self.execute_one(&entry.signal, entry.capital_allocated, flags, now).await;
            outcomes.push((ticker, outcome));
        }
        outcomes
    }

    /// Gate, select, size, and place one trade.
    async fn execute_one(
        &self,
        signal: &OrbSignal,
        allocation: f64,
        flags: DayFlags,
        now: chrono::DateTime<Utc>,
    ) -> Result<String, OptionsSkip> {
        hard_gate(&signal.ticker, now, flags)?;

        {
            let deployed = self.deployed.lock();
            let budget = self.account_value * OPTIONS_CAPITAL_PCT / 100.0;
            if *deployed + allocation > budget {
                return Err(OptionsSkip::BudgetExhausted);
            }
        }

        // Today's expiry chain.
        let expiry = eastern::eastern_date(now);
        let (calls, puts) = self
            .broker
            .get_option_chain(&signal.ticker, expiry, CHAIN_STRIKES)
            .await
            .map_err(|e| OptionsSkip::BrokerFailed(e.to_string()))?;
        let fetched_at = Utc::now();
        selection::check_chain_age(fetched_at, Utc::now())
            .map_err(OptionsSkip::Selection)?;

        let kind = OptionKind::for_side(signal.side);
        let contracts: &[OptionContract] = match kind {
            OptionKind::Call => &calls,
            OptionKind::Put => &puts,
        };
        let spot = signal.price_at_emit;
        let width = selection::spread_width_for(&signal.ticker, signal.orb.orb_range);

        // High-conviction signals take the single leg; everything else
        // buys the defined-risk vertical.
        let structure = if signal.eligibility_score >= LOTTO_CONVICTION {
            selection::select_lotto(contracts, kind, spot, TARGET_DELTA)
                .map(OptionsStructure::Lotto)
        } else {
            selection::select_debit_spread(contracts, kind, spot, TARGET_DELTA, width)
                .map(OptionsStructure::DebitSpread)
        }
        .map_err(OptionsSkip::Selection)?;

        let quantity = contracts_for_allocation(&structure, allocation);
        if quantity == 0 {
            return Err(OptionsSkip::ZeroQuantity);
        }

        let order = self.entry_order(&structure, quantity);
        let preview = self
            .broker
            .preview_order(&self.account_id_key, &order)
            .await
            .map_err(|e| OptionsSkip::BrokerFailed(e.to_string()))?;
        let placed = self
            .broker
            .place_order(&self.account_id_key, &order, &preview)
            .await
            .map_err(|e| OptionsSkip::BrokerFailed(e.to_string()))?;

        let entry_price = placed.fill_price.unwrap_or_else(|| structure_mark(&structure));
        let entry_spread_pct = match &structure {
            OptionsStructure::DebitSpread(s) => s.long_leg.spread_pct(),
            OptionsStructure::CreditSpread(s) => s.short_leg.spread_pct(),
            OptionsStructure::Lotto(c) => c.spread_pct(),
        };

        let position = OptionsPosition {
            position_id: uuid::Uuid::new_v4().to_string(),
            symbol: signal.ticker.clone(),
            entry_price,
            entry_time: now,
            quantity,
            current_value: entry_price,
            unrealized_pnl: 0.0,
            realized_pnl: 0.0,
            status: super::types::OptionsPositionStatus::Open,
            entry_spread_pct,
            peak_pnl_pct: 0.0,
            first_target_hit: false,
            second_target_hit: false,
            structure,
        };
        let label = position.structure.label().to_string();
        let committed = match &position.structure {
            OptionsStructure::DebitSpread(s) => s.debit_cost * 100.0 * quantity as f64,
            OptionsStructure::CreditSpread(s) => s.max_loss * 100.0 * quantity as f64,
            OptionsStructure::Lotto(c) => c.mid() * 100.0 * quantity as f64,
        };
        *self.deployed.lock() += committed;

        info!(
            symbol = %signal.ticker,
            structure = %label,
            quantity,
            entry = entry_price,
            committed,
            order_id = %placed.order_id,
            "0DTE position opened"
        );
        self.book.register(position);
        Ok(label)
    }

    /// The opening order for a structure.
    fn entry_order(&self, structure: &OptionsStructure, quantity: u32) -> OrderRequest {
        match structure {
            OptionsStructure::DebitSpread(s) => OrderRequest::OptionNetDebit {
                legs: vec![
                    leg(&s.long_leg, OptionAction::BuyOpen, quantity),
                    leg(&s.short_leg, OptionAction::SellOpen, quantity),
                ],
                net_price: s.debit_cost,
            },
            OptionsStructure::CreditSpread(s) => OrderRequest::OptionNetCredit {
                legs: vec![
                    leg(&s.short_leg, OptionAction::SellOpen, quantity),
                    leg(&s.long_leg, OptionAction::BuyOpen, quantity),
                ],
                net_price: s.credit_received,
            },
            OptionsStructure::Lotto(c) => OrderRequest::OptionSingle {
                leg: leg(c, OptionAction::BuyOpen, quantity),
                price_type: PriceType::Limit { limit_price: c.ask },
            },
        }
    }

    /// The closing order for part or all of a structure.
    fn exit_order(&self, p: &OptionsPosition, quantity: u32, mark: f64) -> OrderRequest {
        match &p.structure {
            OptionsStructure::DebitSpread(s) => OrderRequest::OptionNetCredit {
                legs: vec![
                    leg(&s.long_leg, OptionAction::SellClose, quantity),
                    leg(&s.short_leg, OptionAction::BuyClose, quantity),
                ],
                net_price: mark.max(0.01),
            },
            OptionsStructure::CreditSpread(s) => OrderRequest::OptionNetDebit {
                legs: vec![
                    leg(&s.short_leg, OptionAction::BuyClose, quantity),
                    leg(&s.long_leg, OptionAction::SellClose, quantity),
                ],
                net_price: mark.max(0.01),
            },
            OptionsStructure::Lotto(c) => OrderRequest::OptionSingle {
                leg: leg(c, OptionAction::SellClose, quantity),
                price_type: PriceType::Market,
            },
        }
    }

    /// Re-mark one open position from a fresh chain and evaluate its exits.
    /// Marks come from the structure legs matched by strike in the chain.
    async fn monitor_position(&self, position: &OptionsPosition, now: chrono::DateTime<Utc>) {
        let expiry = eastern::eastern_date(now);
        let chain = self
            .broker
            .get_option_chain(&position.symbol, expiry, CHAIN_STRIKES)
            .await;
        let (calls, puts) = match chain {
            Ok(c) => c,
            Err(e) => {
                warn!(symbol = %position.symbol, error = %e, "chain re-mark failed");
                return;
            }
        };

        let remarked = remark_structure(&position.structure, &calls, &puts);
        let mark = structure_mark(&remarked);
        self.book.update_value(&position.position_id, mark);

        let Some(p) = self.book.snapshot(&position.position_id) else {
            return;
        };

        let spread_pct = match &remarked {
            OptionsStructure::DebitSpread(s) => s.long_leg.spread_pct(),
            OptionsStructure::CreditSpread(s) => s.short_leg.spread_pct(),
            OptionsStructure::Lotto(c) => c.spread_pct(),
        };

        // Underlying structure reclaim from the equity tape.
        let underlying_reclaim = self
            .store
            .tape(&p.symbol)
            .map(|tape| {
                let direction = structure_side(&p.structure);
                crate::exit::math::reclaimed_against(direction, tape.last_price, tape.vwap)
            })
            .unwrap_or(false);

        let ctx = OptionsContext {
            current_value: mark,
            spread_pct,
            underlying_reclaim,
            minutes_to_close: (self.clock.next_close(now) - now).num_minutes(),
            now,
        };

        match evaluate_options_exit(&p, &ctx) {
            OptionsExitAction::Hold => {
                debug!(id = %p.position_id, mark, "options position holds");
            }
            OptionsExitAction::PartialClose {
                fraction_of_remaining,
                rung,
                reason,
            } => {
                let close_qty = ((p.quantity as f64) * fraction_of_remaining).floor().max(1.0) as u32;
                let order = self.exit_order(&p, close_qty, mark);
                match self.submit(&order).await {
                    Ok(()) => {
                        if let Some(after) =
                            self.book.apply_partial(&p.position_id, close_qty, mark, rung)
                        {
                            self.events.publish(EngineEvent::PartialClose {
                                at: now,
                                position_id: p.position_id.clone(),
                                symbol: p.symbol.clone(),
                                closed_quantity: close_qty as f64,
                                remaining_quantity: after.quantity as f64,
                                realized_pnl: after.realized_pnl,
                            });
                        }
                    }
                    Err(e) => warn!(id = %p.position_id, error = %e, reason = %reason, "partial close failed"),
                }
            }
            OptionsExitAction::Close { reason } => {
                let order = self.exit_order(&p, p.quantity, mark);
                match self.submit(&order).await {
                    Ok(()) => {
                        if let Some(pnl) =
                            self.book.mark_closed(&p.position_id, mark, &reason.to_string())
                        {
                            self.events.publish(EngineEvent::PositionClosed {
                                at: now,
                                position_id: p.position_id.clone(),
                                symbol: p.symbol.clone(),
                                signal_type: crate::types::SignalType::So,
                                exit_reason: reason.to_string(),
                                realized_pnl: pnl,
                            });
                        }
                    }
                    Err(e) => warn!(id = %p.position_id, error = %e, reason = %reason, "close failed"),
                }
            }
        }
    }

    async fn submit(&self, order: &OrderRequest) -> Result<(), String> {
        let preview = self
            .broker
            .preview_order(&self.account_id_key, order)
            .await
            .map_err(|e| e.to_string())?;
        self.broker
            .place_order(&self.account_id_key, order, &preview)
            .await
            .map_err(|e| e.to_string())?;
        Ok(())
    }

    /// The options monitor loop.
    pub async fn run_monitor(
        self: Arc<Self>,
        interval_secs: u64,
        mut shutdown: watch::Receiver<bool>,
    ) {
        info!(interval_secs, "options exit monitor started");
        let mut ticker =
            tokio::time::interval(std::time::Duration::from_secs(interval_secs.max(5)));
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);

        loop {
            tokio::select! {
                _ = ticker.tick() => {}
                _ = shutdown.changed() => {
                    if *shutdown.borrow() {
                        info!("options exit monitor stopping");
                        return;
                    }
                }
            }

            let now = Utc::now();
            for position in self.book.open_positions() {
                self.monitor_position(&position, now).await;
            }
        }
    }
}

fn leg(contract: &OptionContract, action: OptionAction, quantity: u32) -> OptionLeg {
    OptionLeg {
        symbol: contract.symbol.clone(),
        expiry: contract.expiry,
        strike: contract.strike,
        kind: contract.kind,
        action,
        quantity,
    }
}

/// The directional exposure of a structure (long calls ⇒ long underlying).
fn structure_side(structure: &OptionsStructure) -> Side {
    let kind = match structure {
        OptionsStructure::DebitSpread(s) => s.kind,
        // A credit spread profits when the underlying moves AWAY from the
        // short strike: short calls ⇒ short exposure.
        OptionsStructure::CreditSpread(s) => {
            return match s.kind {
                OptionKind::Call => Side::Short,
                OptionKind::Put => Side::Long,
            }
        }
        OptionsStructure::Lotto(c) => c.kind,
    };
    match kind {
        OptionKind::Call => Side::Long,
        OptionKind::Put => Side::Short,
    }
}

/// Refresh structure legs from a new chain by strike match; keeps the old
/// quotes when a strike has gone missing.
fn remark_structure(
    structure: &OptionsStructure,
    calls: &[OptionContract],
    puts: &[OptionContract],
) -> OptionsStructure {
    let find = |template: &OptionContract| -> OptionContract {
        let pool = match template.kind {
            OptionKind::Call => calls,
            OptionKind::Put => puts,
        };
        pool.iter()
            .find(|c| (c.strike - template.strike).abs() < 1e-9)
            .cloned()
            .unwrap_or_else(|| template.clone())
    };

    match structure {
        OptionsStructure::DebitSpread(s) => {
            let mut fresh = s.clone();
            fresh.long_leg = find(&s.long_leg);
            fresh.short_leg = find(&s.short_leg);
            OptionsStructure::DebitSpread(fresh)
        }
        OptionsStructure::CreditSpread(s) => {
            let mut fresh = s.clone();
            fresh.short_leg = find(&s.short_leg);
            fresh.long_leg = find(&s.long_leg);
            OptionsStructure::CreditSpread(fresh)
        }
        OptionsStructure::Lotto(c) => OptionsStructure::Lotto(find(c)),
    }
}
