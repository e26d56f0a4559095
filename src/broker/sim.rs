// =============================================================================
// SimBroker — demo-mode broker with synthetic quotes and instant fills
// =============================================================================
//
// Implements the full `Broker` surface against an in-memory account so the
// engine's execution call stack is byte-for-byte the same in demo and live
// modes. Quotes follow a deterministic per-symbol random walk seeded from
// the ticker; orders fill immediately at the quoted price (or the limit).
// =============================================================================

use std::collections::hash_map::DefaultHasher;
use std::collections::HashMap;
use std::hash::{Hash, Hasher};
use std::sync::atomic::{AtomicU64, Ordering};

use async_trait::async_trait;
use chrono::NaiveDate;
use parking_lot::RwLock;
use rand::{Rng, SeedableRng};
use tracing::{debug, info};

use super::client::Broker;
use super::error::BrokerError;
use super::types::{
    AccountInfo, Balance, EquityAction, OrderPreview, OrderRequest, PlacedOrder, PriceType, Quote,
};
use crate::options::types::{OptionContract, OptionKind};

const SIM_ACCOUNT_KEY: &str = "SIM-0001";
/// Starting cash for the demo account.
const STARTING_CASH: f64 = 100_000.0;

#[derive(Debug)]
struct SimState {
    cash: f64,
    quotes: HashMap<String, Quote>,
    /// Deterministic walk state per symbol.
    rng: rand::rngs::StdRng,
}

/// The demo broker.
pub struct SimBroker {
    state: RwLock<SimState>,
    order_seq: AtomicU64,
    preview_seq: AtomicU64,
}

impl Default for SimBroker {
    fn default() -> Self {
        Self::new()
    }
}

impl SimBroker {
    pub fn new() -> Self {
        info!(cash = STARTING_CASH, "SimBroker initialised");
        Self {
            state: RwLock::new(SimState {
                cash: STARTING_CASH,
                quotes: HashMap::new(),
                rng: rand::rngs::StdRng::seed_from_u64(20_260_106),
            }),
            order_seq: AtomicU64::new(1),
            preview_seq: AtomicU64::new(1),
        }
    }

    /// Deterministic base price derived from the ticker, so runs are
    /// reproducible without fixture files.
    fn base_price(symbol: &str) -> f64 {
        let mut hasher = DefaultHasher::new();
        symbol.hash(&mut hasher);
        50.0 + (hasher.finish() % 45_000) as f64 / 100.0
    }

    /// Pin a quote directly (tests and replay harnesses).
    pub fn set_quote(&self, symbol: &str, quote: Quote) {
        self.state.write().quotes.insert(symbol.to_string(), quote);
    }

    fn step_quote(state: &mut SimState, symbol: &str) -> Quote {
        let base = Self::base_price(symbol);
        let entry = state.quotes.entry(symbol.to_string()).or_insert_with(|| Quote {
            last: base,
            bid: base * 0.9995,
            ask: base * 1.0005,
            volume: 0.0,
            open: base,
            high: base,
            low: base,
        });

        // ±0.05% drift per poll keeps the tape alive without being violent.
        let drift: f64 = state.rng.gen_range(-0.0005..0.0005);
        let last = (entry.last * (1.0 + drift)).max(0.01);
        entry.last = last;
        entry.bid = last * 0.9995;
        entry.ask = last * 1.0005;
        entry.volume += state.rng.gen_range(5_000.0..50_000.0);
        entry.high = entry.high.max(last);
        entry.low = entry.low.min(last);
        *entry
    }

    fn fill_price(&self, order: &OrderRequest) -> f64 {
        match order {
            OrderRequest::Equity {
                symbol, price_type, ..
            } => match price_type {
                PriceType::Limit { limit_price } => *limit_price,
                PriceType::Market => {
                    let mut state = self.state.write();
                    Self::step_quote(&mut state, symbol).last
                }
            },
            OrderRequest::OptionSingle { price_type, .. } => match price_type {
                PriceType::Limit { limit_price } => *limit_price,
                PriceType::Market => 0.40,
            },
            OrderRequest::OptionNetDebit { net_price, .. }
            | OrderRequest::OptionNetCredit { net_price, .. } => *net_price,
        }
    }
}

#[async_trait]
impl Broker for SimBroker {
    async fn list_accounts(&self) -> Result<Vec<AccountInfo>, BrokerError> {
        Ok(vec![AccountInfo {
            account_id: "00000001".into(),
            account_id_key: SIM_ACCOUNT_KEY.into(),
            status: "ACTIVE".into(),
            account_type: "INDIVIDUAL".into(),
        }])
    }

    async fn get_balance(&self, _account_id_key: &str) -> Result<Balance, BrokerError> {
        let state = self.state.read();
        Ok(Balance {
            cash_available_for_investment: state.cash,
            account_value: state.cash,
            buying_power: state.cash * 2.0,
        })
    }

    async fn get_quote(&self, symbols: &[String]) -> Result<Vec<(String, Quote)>, BrokerError> {
        let mut state = self.state.write();
        Ok(symbols
            .iter()
            .map(|s| (s.clone(), Self::step_quote(&mut state, s)))
            .collect())
    }

    async fn get_option_chain(
        &self,
        symbol: &str,
        expiry: NaiveDate,
        strikes_around_atm: u32,
    ) -> Result<(Vec<OptionContract>, Vec<OptionContract>), BrokerError> {
        let spot = {
            let mut state = self.state.write();
            Self::step_quote(&mut state, symbol).last
        };
        let increment = crate::watchlist::strike_increment_for(symbol);
        let atm = (spot / increment).round() * increment;

        let mut calls = Vec::new();
        let mut puts = Vec::new();
        let half = strikes_around_atm as i64 / 2;
        for i in -half..=half {
            let strike = atm + i as f64 * increment;
            let moneyness = (spot - strike) / spot;

            // Rough 0DTE shape: ATM delta ~0.5 falling off with distance,
            // premiums decaying away from the money.
            let call_delta = (0.5 + moneyness * 12.0).clamp(0.02, 0.98);
            let call_premium = (spot * 0.004 * (1.0 + moneyness * 18.0)).max(0.05);
            let put_delta = call_delta - 1.0;
            let put_premium = (spot * 0.004 * (1.0 - moneyness * 18.0)).max(0.05);

            calls.push(OptionContract {
                symbol: symbol.to_string(),
                strike,
                expiry,
                kind: OptionKind::Call,
                bid: (call_premium * 0.96).max(0.01),
                ask: call_premium * 1.04,
                last: call_premium,
                volume: 800,
                open_interest: 4000,
                delta: call_delta,
                gamma: 0.08 * (1.0 - moneyness.abs() * 8.0).max(0.1),
                theta: -call_premium * 0.5,
                vega: 0.04,
                iv: 0.22,
            });
            puts.push(OptionContract {
                symbol: symbol.to_string(),
                strike,
                expiry,
                kind: OptionKind::Put,
                bid: (put_premium * 0.96).max(0.01),
                ask: put_premium * 1.04,
                last: put_premium,
                volume: 800,
                open_interest: 4000,
                delta: put_delta,
                gamma: 0.08 * (1.0 - moneyness.abs() * 8.0).max(0.1),
                theta: -put_premium * 0.5,
                vega: 0.04,
                iv: 0.22,
            });
        }

        debug!(symbol, strikes = calls.len(), "synthetic chain generated");
        Ok((calls, puts))
    }

    async fn preview_order(
        &self,
        _account_id_key: &str,
        order: &OrderRequest,
    ) -> Result<OrderPreview, BrokerError> {
        let id = self.preview_seq.fetch_add(1, Ordering::SeqCst);
        debug!(symbol = %order.symbol(), preview_id = id, "sim order previewed");
        Ok(OrderPreview {
            preview_id: format!("SIM-PV-{id}"),
        })
    }

    async fn place_order(
        &self,
        _account_id_key: &str,
        order: &OrderRequest,
        _preview: &OrderPreview,
    ) -> Result<PlacedOrder, BrokerError> {
        let fill = self.fill_price(order);
        let id = self.order_seq.fetch_add(1, Ordering::SeqCst);

        // Cash bookkeeping for equity legs; options margin is out of scope
        // for the simulator.
        if let OrderRequest::Equity {
            action, quantity, ..
        } = order
        {
            let notional = fill * *quantity as f64;
            let mut state = self.state.write();
            match action {
                EquityAction::Buy => state.cash -= notional,
                EquityAction::Sell => state.cash += notional,
            }
        }

        info!(
            symbol = %order.symbol(),
            order_id = id,
            fill_price = fill,
            "sim order filled"
        );
        Ok(PlacedOrder {
            order_id: format!("SIM-{id}"),
            fill_price: Some(fill),
        })
    }

    async fn cancel_order(
        &self,
        _account_id_key: &str,
        order_id: &str,
    ) -> Result<(), BrokerError> {
        debug!(order_id, "sim order cancelled (no-op)");
        Ok(())
    }
}
