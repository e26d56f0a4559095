// =============================================================================
// Broker wire types — the records the core consumes
// =============================================================================

use chrono::NaiveDate;
use serde::{Deserialize, Serialize};

use crate::options::types::OptionKind;

/// Every order the engine places is day-only.
pub const ORDER_TERM: &str = "GOOD_FOR_DAY";

/// One brokerage account from the accounts list.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AccountInfo {
    pub account_id: String,
    /// Opaque key used in every account-scoped endpoint path.
    pub account_id_key: String,
    pub status: String,
    pub account_type: String,
}

/// Balance figures the sizing paths need.
#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize)]
pub struct Balance {
    pub cash_available_for_investment: f64,
    pub account_value: f64,
    pub buying_power: f64,
}

/// A consolidated quote for one symbol.
#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize)]
pub struct Quote {
    pub last: f64,
    pub bid: f64,
    pub ask: f64,
    /// Session-cumulative share volume.
    pub volume: f64,
    pub open: f64,
    pub high: f64,
    pub low: f64,
}

/// Buy/sell for equity legs.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum EquityAction {
    Buy,
    Sell,
}

impl EquityAction {
    pub fn wire(&self) -> &'static str {
        match self {
            Self::Buy => "BUY",
            Self::Sell => "SELL",
        }
    }
}

/// Market or limit pricing for an equity order.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub enum PriceType {
    Market,
    Limit { limit_price: f64 },
}

/// Open/close actions for option legs.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum OptionAction {
    BuyOpen,
    SellOpen,
    BuyClose,
    SellClose,
}

impl OptionAction {
    pub fn wire(&self) -> &'static str {
        match self {
            Self::BuyOpen => "BUY_OPEN",
            Self::SellOpen => "SELL_OPEN",
            Self::BuyClose => "BUY_CLOSE",
            Self::SellClose => "SELL_CLOSE",
        }
    }
}

/// One option leg in an order.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct OptionLeg {
    pub symbol: String,
    pub expiry: NaiveDate,
    pub strike: f64,
    pub kind: OptionKind,
    pub action: OptionAction,
    pub quantity: u32,
}

/// The order structures the engine submits.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub enum OrderRequest {
    /// Single-leg equity order.
    Equity {
        symbol: String,
        action: EquityAction,
        quantity: u32,
        price_type: PriceType,
    },
    /// Single-leg option order (lotto entries and exits).
    OptionSingle { leg: OptionLeg, price_type: PriceType },
    /// Two-leg vertical priced at a net debit.
    OptionNetDebit { legs: Vec<OptionLeg>, net_price: f64 },
    /// Two-leg vertical priced at a net credit.
    OptionNetCredit { legs: Vec<OptionLeg>, net_price: f64 },
}

impl OrderRequest {
    /// Underlying ticker for logging and caps.
    pub fn symbol(&self) -> &str {
        match self {
            Self::Equity { symbol, .. } => symbol,
            Self::OptionSingle { leg, .. } => &leg.symbol,
            Self::OptionNetDebit { legs, .. } | Self::OptionNetCredit { legs, .. } => legs
                .first()
                .map(|l| l.symbol.as_str())
                .unwrap_or(""),
        }
    }

    /// E*TRADE priceType wire value.
    pub fn wire_price_type(&self) -> &'static str {
        match self {
            Self::Equity { price_type, .. } | Self::OptionSingle { price_type, .. } => {
                match price_type {
                    PriceType::Market => "MARKET",
                    PriceType::Limit { .. } => "LIMIT",
                }
            }
            Self::OptionNetDebit { .. } => "NET_DEBIT",
            Self::OptionNetCredit { .. } => "NET_CREDIT",
        }
    }
}

/// Result of order preview.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct OrderPreview {
    pub preview_id: String,
}

/// Result of order placement.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PlacedOrder {
    pub order_id: String,
    /// Fill price when the broker reports one immediately (market orders in
    /// the simulator always do).
    pub fill_price: Option<f64>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn wire_values() {
        assert_eq!(EquityAction::Buy.wire(), "BUY");
        assert_eq!(OptionAction::SellClose.wire(), "SELL_CLOSE");
        assert_eq!(ORDER_TERM, "GOOD_FOR_DAY");
    }

    #[test]
    fn price_type_wire_mapping() {
        let market = OrderRequest::Equity {
            symbol: "SPY".into(),
            action: EquityAction::Buy,
            quantity: 10,
            price_type: PriceType::Market,
        };
        assert_eq!(market.wire_price_type(), "MARKET");

        let debit = OrderRequest::OptionNetDebit {
            legs: Vec::new(),
            net_price: 0.40,
        };
        assert_eq!(debit.wire_price_type(), "NET_DEBIT");
    }

    #[test]
    fn symbol_resolution() {
        let order = OrderRequest::Equity {
            symbol: "TQQQ".into(),
            action: EquityAction::Sell,
            quantity: 5,
            price_type: PriceType::Market,
        };
        assert_eq!(order.symbol(), "TQQQ");
    }
}
