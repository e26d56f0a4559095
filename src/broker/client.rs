// =============================================================================
// Broker adapter — typed operations atop the OAuth session
// =============================================================================
//
// The `Broker` trait is the seam between the engine and the outside world:
// the live implementation signs REST calls through the session manager, the
// demo implementation simulates fills in memory. Everything above this layer
// is identical in both modes.
//
// Responses may arrive as JSON in broker-specific envelopes; parsing stays in
// this file and hands typed records upward.
// =============================================================================

use std::sync::Arc;

use async_trait::async_trait;
use chrono::{Datelike, NaiveDate};
use serde_json::Value;
use tokio::sync::Semaphore;
use tracing::{debug, info, warn};

use super::error::BrokerError;
use super::types::{
    AccountInfo, Balance, OrderPreview, OrderRequest, PlacedOrder, PriceType, Quote, ORDER_TERM,
};
use crate::oauth::OAuthSession;
use crate::options::types::{OptionContract, OptionKind};
use crate::types::Environment;

/// The capability surface the core consumes.
#[async_trait]
pub trait Broker: Send + Sync {
    async fn list_accounts(&self) -> Result<Vec<AccountInfo>, BrokerError>;
    async fn get_balance(&self, account_id_key: &str) -> Result<Balance, BrokerError>;
    async fn get_quote(&self, symbols: &[String]) -> Result<Vec<(String, Quote)>, BrokerError>;
    async fn get_option_chain(
        &self,
        symbol: &str,
        expiry: NaiveDate,
        strikes_around_atm: u32,
    ) -> Result<(Vec<OptionContract>, Vec<OptionContract>), BrokerError>;
    async fn preview_order(
        &self,
        account_id_key: &str,
        order: &OrderRequest,
    ) -> Result<OrderPreview, BrokerError>;
    async fn place_order(
        &self,
        account_id_key: &str,
        order: &OrderRequest,
        preview: &OrderPreview,
    ) -> Result<PlacedOrder, BrokerError>;
    async fn cancel_order(&self, account_id_key: &str, order_id: &str)
        -> Result<(), BrokerError>;
}

/// Fetch quotes for many symbols with a bounded number of in-flight calls.
pub async fn fetch_quotes_bounded(
    broker: &dyn Broker,
    symbols: &[String],
    limit: usize,
) -> Vec<(String, Quote)> {
    let semaphore = Arc::new(Semaphore::new(limit.max(1)));
    let mut out = Vec::new();

    // The quote endpoint accepts batches of up to 25 symbols.
    let futures: Vec<_> = symbols
        .chunks(25)
        .map(|chunk| {
            let semaphore = semaphore.clone();
            let chunk: Vec<String> = chunk.to_vec();
            async move {
                let _permit = semaphore.acquire().await.ok()?;
                match broker.get_quote(&chunk).await {
                    Ok(quotes) => Some(quotes),
                    Err(e) => {
                        warn!(error = %e, "quote batch failed");
                        None
                    }
                }
            }
        })
        .collect();

    for result in futures_util::future::join_all(futures).await.into_iter().flatten() {
        out.extend(result);
    }
    out
}

// =============================================================================
// Live implementation
// =============================================================================

/// The signed-REST broker client.
pub struct EtradeClient {
    session: Arc<OAuthSession>,
    env: Environment,
}

impl EtradeClient {
    pub fn new(session: Arc<OAuthSession>, env: Environment) -> Self {
        Self { session, env }
    }

    fn base(&self) -> &'static str {
        self.session.api_base(self.env)
    }

    async fn get_json(
        &self,
        url: &str,
        query: &[(String, String)],
    ) -> Result<Value, BrokerError> {
        let body = self.session.signed_get(self.env, url, query).await?;
        serde_json::from_str(&body)
            .map_err(|e| BrokerError::Fatal(format!("unparseable broker response: {e}")))
    }

    fn f64_at(value: &Value, path: &[&str]) -> f64 {
        let mut cursor = value;
        for key in path {
            cursor = &cursor[*key];
        }
        cursor
            .as_f64()
            .or_else(|| cursor.as_str().and_then(|s| s.parse().ok()))
            .unwrap_or(0.0)
    }

    fn u64_at(value: &Value, path: &[&str]) -> u64 {
        let mut cursor = value;
        for key in path {
            cursor = &cursor[*key];
        }
        cursor
            .as_u64()
            .or_else(|| cursor.as_str().and_then(|s| s.parse().ok()))
            .unwrap_or(0)
    }

    fn parse_contract(node: &Value, kind: OptionKind, expiry: NaiveDate) -> OptionContract {
        OptionContract {
            symbol: node["symbol"].as_str().unwrap_or_default().to_string(),
            strike: Self::f64_at(node, &["strikePrice"]),
            expiry,
            kind,
            bid: Self::f64_at(node, &["bid"]),
            ask: Self::f64_at(node, &["ask"]),
            last: Self::f64_at(node, &["lastPrice"]),
            volume: Self::u64_at(node, &["volume"]),
            open_interest: Self::u64_at(node, &["openInterest"]),
            delta: Self::f64_at(node, &["OptionGreeks", "delta"]),
            gamma: Self::f64_at(node, &["OptionGreeks", "gamma"]),
            theta: Self::f64_at(node, &["OptionGreeks", "theta"]),
            vega: Self::f64_at(node, &["OptionGreeks", "vega"]),
            iv: Self::f64_at(node, &["OptionGreeks", "iv"]),
        }
    }

    /// Build the JSON order envelope shared by preview and place.
    fn order_payload(order: &OrderRequest, client_order_id: &str) -> Value {
        let instruments: Vec<Value> = match order {
            OrderRequest::Equity {
                symbol,
                action,
                quantity,
                ..
            } => vec![serde_json::json!({
                "Product": { "securityType": "EQ", "symbol": symbol },
                "orderAction": action.wire(),
                "quantityType": "QUANTITY",
                "quantity": quantity,
            })],
            OrderRequest::OptionSingle { leg, .. } => vec![serde_json::json!({
                "Product": {
                    "securityType": "OPTN",
                    "symbol": leg.symbol,
                    "callPut": match leg.kind { OptionKind::Call => "CALL", OptionKind::Put => "PUT" },
                    "expiryYear": leg.expiry.year(),
                    "expiryMonth": leg.expiry.month(),
                    "expiryDay": leg.expiry.day(),
                    "strikePrice": leg.strike,
                },
                "orderAction": leg.action.wire(),
                "orderedQuantity": leg.quantity,
                "quantity": leg.quantity,
            })],
            OrderRequest::OptionNetDebit { legs, .. }
            | OrderRequest::OptionNetCredit { legs, .. } => legs
                .iter()
                .map(|leg| {
                    serde_json::json!({
                        "Product": {
                            "securityType": "OPTN",
                            "symbol": leg.symbol,
                            "callPut": match leg.kind { OptionKind::Call => "CALL", OptionKind::Put => "PUT" },
                            "expiryYear": leg.expiry.year(),
                            "expiryMonth": leg.expiry.month(),
                            "expiryDay": leg.expiry.day(),
                            "strikePrice": leg.strike,
                        },
                        "orderAction": leg.action.wire(),
                        "orderedQuantity": leg.quantity,
                        "quantity": leg.quantity,
                    })
                })
                .collect(),
        };

        let mut detail = serde_json::json!({
            "orderTerm": ORDER_TERM,
            "priceType": order.wire_price_type(),
            "marketSession": "REGULAR",
            "Instrument": instruments,
        });

        match order {
            OrderRequest::Equity {
                price_type: PriceType::Limit { limit_price },
                ..
            }
            | OrderRequest::OptionSingle {
                price_type: PriceType::Limit { limit_price },
                ..
            } => {
                detail["limitPrice"] = serde_json::json!(limit_price);
            }
            OrderRequest::OptionNetDebit { net_price, .. }
            | OrderRequest::OptionNetCredit { net_price, .. } => {
                detail["limitPrice"] = serde_json::json!(net_price);
            }
            _ => {}
        }

        serde_json::json!({
            "orderType": match order {
                OrderRequest::Equity { .. } => "EQ",
                OrderRequest::OptionSingle { .. } => "OPTN",
                _ => "SPREADS",
            },
            "clientOrderId": client_order_id,
            "Order": [detail],
        })
    }
}

#[async_trait]
impl Broker for EtradeClient {
    async fn list_accounts(&self) -> Result<Vec<AccountInfo>, BrokerError> {
        let url = format!("{}/v1/accounts/list", self.base());
        let json = self.get_json(&url, &[]).await?;

        let accounts = json["AccountListResponse"]["Accounts"]["Account"]
            .as_array()
            .cloned()
            .unwrap_or_default();

        let parsed: Vec<AccountInfo> = accounts
            .iter()
            .map(|a| AccountInfo {
                account_id: a["accountId"].as_str().unwrap_or_default().to_string(),
                account_id_key: a["accountIdKey"].as_str().unwrap_or_default().to_string(),
                status: a["accountStatus"].as_str().unwrap_or_default().to_string(),
                account_type: a["accountType"].as_str().unwrap_or_default().to_string(),
            })
            .collect();

        debug!(count = parsed.len(), "accounts listed");
        Ok(parsed)
    }

    async fn get_balance(&self, account_id_key: &str) -> Result<Balance, BrokerError> {
        let url = format!("{}/v1/accounts/{}/balance", self.base(), account_id_key);
        let query = vec![
            ("instType".to_string(), "BROKERAGE".to_string()),
            ("realTimeNAV".to_string(), "true".to_string()),
        ];
        let json = self.get_json(&url, &query).await?;
        let computed = &json["BalanceResponse"]["Computed"];

        Ok(Balance {
            cash_available_for_investment: Self::f64_at(computed, &["cashAvailableForInvestment"]),
            account_value: Self::f64_at(computed, &["RealTimeValues", "totalAccountValue"]),
            buying_power: Self::f64_at(computed, &["marginBuyingPower"]),
        })
    }

    async fn get_quote(&self, symbols: &[String]) -> Result<Vec<(String, Quote)>, BrokerError> {
        if symbols.is_empty() {
            return Ok(Vec::new());
        }
        let url = format!("{}/v1/market/quote/{}", self.base(), symbols.join(","));
        let json = self.get_json(&url, &[]).await?;

        let entries = json["QuoteResponse"]["QuoteData"]
            .as_array()
            .cloned()
            .unwrap_or_default();

        let mut out = Vec::with_capacity(entries.len());
        for entry in &entries {
            let symbol = entry["Product"]["symbol"]
                .as_str()
                .unwrap_or_default()
                .to_string();
            if symbol.is_empty() {
                continue;
            }
            let all = &entry["All"];
            out.push((
                symbol,
                Quote {
                    last: Self::f64_at(all, &["lastTrade"]),
                    bid: Self::f64_at(all, &["bid"]),
                    ask: Self::f64_at(all, &["ask"]),
                    volume: Self::f64_at(all, &["totalVolume"]),
                    open: Self::f64_at(all, &["open"]),
                    high: Self::f64_at(all, &["high"]),
                    low: Self::f64_at(all, &["low"]),
                },
            ));
        }
        Ok(out)
    }

    async fn get_option_chain(
        &self,
        symbol: &str,
        expiry: NaiveDate,
        strikes_around_atm: u32,
    ) -> Result<(Vec<OptionContract>, Vec<OptionContract>), BrokerError> {
        let url = format!("{}/v1/market/optionchains", self.base());
        let query = vec![
            ("symbol".to_string(), symbol.to_string()),
            ("expiryYear".to_string(), expiry.year().to_string()),
            ("expiryMonth".to_string(), expiry.month().to_string()),
            ("expiryDay".to_string(), expiry.day().to_string()),
            ("noOfStrikes".to_string(), strikes_around_atm.to_string()),
            ("includeWeekly".to_string(), "true".to_string()),
            ("optionCategory".to_string(), "ALL".to_string()),
            ("chainType".to_string(), "CALLPUT".to_string()),
        ];
        let json = self.get_json(&url, &query).await?;

        let pairs = json["OptionChainResponse"]["OptionPair"]
            .as_array()
            .cloned()
            .unwrap_or_default();

        let mut calls = Vec::with_capacity(pairs.len());
        let mut puts = Vec::with_capacity(pairs.len());
        for pair in &pairs {
            if !pair["Call"].is_null() {
                calls.push(Self::parse_contract(&pair["Call"], OptionKind::Call, expiry));
            }
            if !pair["Put"].is_null() {
                puts.push(Self::parse_contract(&pair["Put"], OptionKind::Put, expiry));
            }
        }

        debug!(symbol, calls = calls.len(), puts = puts.len(), "option chain fetched");
        Ok((calls, puts))
    }

    async fn preview_order(
        &self,
        account_id_key: &str,
        order: &OrderRequest,
    ) -> Result<OrderPreview, BrokerError> {
        let client_order_id = uuid::Uuid::new_v4().simple().to_string();
        let payload = serde_json::json!({
            "PreviewOrderRequest": Self::order_payload(order, &client_order_id[..20]),
        });

        let url = format!("{}/v1/accounts/{}/orders/preview", self.base(), account_id_key);
        let body = self
            .session
            .signed_post_json(self.env, &url, &payload)
            .await?;
        let json: Value = serde_json::from_str(&body)
            .map_err(|e| BrokerError::Fatal(format!("unparseable preview response: {e}")))?;

        let preview_id = json["PreviewOrderResponse"]["PreviewIds"][0]["previewId"]
            .as_i64()
            .map(|v| v.to_string())
            .or_else(|| {
                json["PreviewOrderResponse"]["PreviewIds"][0]["previewId"]
                    .as_str()
                    .map(String::from)
            })
            .ok_or_else(|| BrokerError::InvalidRequest(format!("no preview id in: {body}")))?;

        Ok(OrderPreview { preview_id })
    }

    async fn place_order(
        &self,
        account_id_key: &str,
        order: &OrderRequest,
        preview: &OrderPreview,
    ) -> Result<PlacedOrder, BrokerError> {
        let client_order_id = uuid::Uuid::new_v4().simple().to_string();
        let mut request = Self::order_payload(order, &client_order_id[..20]);
        request["PreviewIds"] = serde_json::json!([{ "previewId": preview.preview_id }]);
        let payload = serde_json::json!({ "PlaceOrderRequest": request });

        let url = format!("{}/v1/accounts/{}/orders/place", self.base(), account_id_key);
        let body = self
            .session
            .signed_post_json(self.env, &url, &payload)
            .await?;
        let json: Value = serde_json::from_str(&body)
            .map_err(|e| BrokerError::Fatal(format!("unparseable place response: {e}")))?;

        let order_id = json["PlaceOrderResponse"]["OrderIds"][0]["orderId"]
            .as_i64()
            .map(|v| v.to_string())
            .or_else(|| {
                json["PlaceOrderResponse"]["OrderIds"][0]["orderId"]
                    .as_str()
                    .map(String::from)
            })
            .ok_or_else(|| BrokerError::InvalidRequest(format!("no order id in: {body}")))?;

        info!(order_id = %order_id, symbol = %order.symbol(), "order placed");
        Ok(PlacedOrder {
            order_id,
            fill_price: None,
        })
    }

    async fn cancel_order(
        &self,
        account_id_key: &str,
        order_id: &str,
    ) -> Result<(), BrokerError> {
        let url = format!("{}/v1/accounts/{}/orders/cancel", self.base(), account_id_key);
        let payload = serde_json::json!({
            "CancelOrderRequest": { "orderId": order_id }
        });
        self.session
            .signed_put_json(self.env, &url, &payload)
            .await?;
        info!(order_id, "order cancelled");
        Ok(())
    }
}
