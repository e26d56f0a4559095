// =============================================================================
// Execution manager — ranked signals become live positions
// =============================================================================
//
// Signals execute serially in rank order. Each one passes through:
//
//   1. The per-(symbol, signal-type) daily cap — one open position each.
//   2. The compound engine's availability check for its capital type.
//   3. The ADV liquidity clamp on the dollar allocation.
//   4. Share quantity from the live tape, bounded by available cash.
//   5. Preview → place through the broker seam; the fill price becomes the
//      entry and the position registers with the exit engine.
//
// Skips are recorded, not raised; after the pass one batched event reports
// every accepted fill and every rejection with its reason. Demo mode swaps
// the broker implementation and nothing else.
// =============================================================================

use std::sync::Arc;

use chrono::{DateTime, Utc};
use tracing::{info, warn};

use crate::adv::{AdvCache, AdvMode};
use crate::broker::types::{EquityAction, OrderRequest, PriceType};
use crate::broker::Broker;
use crate::compound::CompoundEngine;
use crate::events::{EngineEvent, EventSink, OpenedPosition, RejectedSignal};
use crate::exit::registry::{NewPosition, PositionBook};
use crate::market::candles::CandleStore;
use crate::ranker::RankedSignal;
use crate::types::{Side, TradeRegime};

/// Confidence at which a signal is tagged for the moon profile.
const MOON_CONFIDENCE: f64 = 0.65;

/// Regime tagging at entry: leveraged products ride the explosive profile,
/// high-conviction signals get room to run, the rest trail balanced.
pub fn classify_regime(is_leveraged: bool, confidence: f64) -> TradeRegime {
    if is_leveraged {
        TradeRegime::Explosive
    } else if confidence >= MOON_CONFIDENCE {
        TradeRegime::Moon
    } else {
        TradeRegime::Balanced
    }
}

/// The execution manager.
pub struct ExecutionManager {
    pub broker: Arc<dyn Broker>,
    pub account_id_key: String,
    pub book: Arc<PositionBook>,
    pub compound: Arc<CompoundEngine>,
    pub adv: Arc<AdvCache>,
    pub store: Arc<CandleStore>,
    pub events: EventSink,
}

impl ExecutionManager {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        broker: Arc<dyn Broker>,
        account_id_key: String,
        book: Arc<PositionBook>,
        compound: Arc<CompoundEngine>,
        adv: Arc<AdvCache>,
        store: Arc<CandleStore>,
        events: EventSink,
    ) -> Self {
        Self {
            broker,
            account_id_key,
            book,
            compound,
            adv,
            store,
            events,
        }
    }

    /// Execute a ranked batch serially (rank 1 first) and emit the batched
    /// open report. Returns (opened, rejected) for the caller's records.
    pub async fn execute_ranked(
        &self,
        ranked: Vec<RankedSignal>,
        is_leveraged: impl Fn(&str) -> bool,
        now: DateTime<Utc>,
    ) -> (Vec<OpenedPosition>, Vec<RejectedSignal>) {
        let mut opened = Vec::new();
        let mut rejected = Vec::new();

        for entry in ranked {
            let ticker = entry.signal.ticker.clone();
            let signal_type = entry.signal.signal_type;
            match self
                .execute_one(&entry, is_leveraged(&ticker), now)
                .await
            {
                Ok(position) => opened.push(position),
                Err(reason) => {
                    warn!(symbol = %ticker, %reason, "signal skipped");
                    rejected.push(RejectedSignal {
                        symbol: ticker,
                        signal_type,
                        reason,
                    });
                }
            }
        }

        info!(
            opened = opened.len(),
            rejected = rejected.len(),
            "execution pass complete"
        );
        self.events.publish(EngineEvent::PositionsOpened {
            at: now,
            opened: opened.clone(),
            rejected: rejected.clone(),
        });

        (opened, rejected)
    }

    async fn execute_one(
        &self,
        entry: &RankedSignal,
        is_leveraged: bool,
        now: DateTime<Utc>,
    ) -> Result<OpenedPosition, String> {
        let signal = &entry.signal;

        // One open position per (symbol, signal type) per day.
        if self.book.has_open(&signal.ticker, signal.signal_type) {
            return Err(format!(
                "open {} position already exists",
                signal.signal_type
            ));
        }

        // Capital availability for the signal's type.
        if !self.compound.can_open(entry.capital_allocated, signal.signal_type) {
            return Err(format!(
                "budget exceeded: {:.2} requested",
                entry.capital_allocated
            ));
        }

        // ADV clamp on the dollar size.
        let adv_limit = self.adv.limit(&signal.ticker, AdvMode::Aggressive);
        let allocation = entry.capital_allocated.min(adv_limit);
        if allocation < entry.capital_allocated {
            info!(
                symbol = %signal.ticker,
                requested = entry.capital_allocated,
                clamped = allocation,
                "allocation clamped by ADV limit"
            );
        }

        // Share quantity from the live tape.
        let price = self
            .store
            .last_price(&signal.ticker)
            .unwrap_or(signal.price_at_emit);
        if price <= 0.0 {
            return Err("no usable price".into());
        }
        let quantity = (allocation / price).floor();
        if quantity < 1.0 {
            return Err(format!("allocation {allocation:.2} buys no shares at {price:.2}"));
        }

        let order = OrderRequest::Equity {
            symbol: signal.ticker.clone(),
            action: match signal.side {
                Side::Long => EquityAction::Buy,
                Side::Short => EquityAction::Sell,
            },
            quantity: quantity as u32,
            price_type: PriceType::Market,
        };

        let preview = self
            .broker
            .preview_order(&self.account_id_key, &order)
            .await
            .map_err(|e| format!("preview failed: {e}"))?;
        let placed = self
            .broker
            .place_order(&self.account_id_key, &order, &preview)
            .await
            .map_err(|e| format!("place failed: {e}"))?;

        let entry_price = placed.fill_price.unwrap_or(price);
        let position_value = entry_price * quantity;
        let entry_atr = signal
            .indicators
            .atr_14
            .unwrap_or(entry_price * 0.005);
        let entry_spread_pct = self
            .store
            .tape(&signal.ticker)
            .map(|t| t.spread_pct())
            .unwrap_or(0.0);

        let position_id = self.book.register(NewPosition {
            symbol: signal.ticker.clone(),
            side: signal.side,
            signal_type: signal.signal_type,
            regime: classify_regime(is_leveraged, signal.confidence),
            quantity,
            entry_price,
            entry_time: now,
            entry_bar_volatility: entry_atr,
            entry_spread_pct,
            position_value,
        });

        self.compound
            .on_position_opened(&signal.ticker, position_value, signal.signal_type);

        Ok(OpenedPosition {
            position_id,
            symbol: signal.ticker.clone(),
            side: signal.side,
            signal_type: signal.signal_type,
            quantity,
            entry_price,
            capital_allocated: entry.capital_allocated,
        })
    }
}
