// =============================================================================
// Health & status endpoints — Axum 0.7
// =============================================================================
//
// A minimal operational surface: `/healthz` for liveness probes and
// `/api/v1/status` with the session phase, auth state, capital snapshot,
// and open position counts. CORS is permissive; this listener is expected
// to sit behind the operator's firewall.
// =============================================================================

use std::sync::Arc;

use axum::{extract::State, response::IntoResponse, routing::get, Json, Router};
use serde::Serialize;
use tower_http::cors::{Any, CorsLayer};

use crate::compound::CompoundEngine;
use crate::exit::registry::PositionBook;
use crate::market::clock::MarketClock;
use crate::oauth::OAuthSession;
use crate::options::exits::OptionsBook;
use crate::types::{Environment, TradeMode};

/// Shared state behind the status router.
pub struct ApiState {
    pub clock: Arc<MarketClock>,
    pub session: Arc<OAuthSession>,
    pub environment: Environment,
    pub trade_mode: TradeMode,
    pub book: Arc<PositionBook>,
    pub options_book: Arc<OptionsBook>,
    pub compound: Arc<CompoundEngine>,
    pub started_at: std::time::Instant,
}

/// Build the router.
pub fn router(state: Arc<ApiState>) -> Router {
    let cors = CorsLayer::new()
        .allow_origin(Any)
        .allow_methods(Any)
        .allow_headers(Any);

    Router::new()
        .route("/healthz", get(healthz))
        .route("/api/v1/status", get(status))
        .route("/api/v1/positions", get(positions))
        .layer(cors)
        .with_state(state)
}

#[derive(Serialize)]
struct HealthResponse {
    status: &'static str,
    uptime_secs: u64,
    server_time: i64,
}

async fn healthz(State(state): State<Arc<ApiState>>) -> impl IntoResponse {
    Json(HealthResponse {
        status: "ok",
        uptime_secs: state.started_at.elapsed().as_secs(),
        server_time: chrono::Utc::now().timestamp_millis(),
    })
}

async fn status(State(state): State<Arc<ApiState>>) -> impl IntoResponse {
    let now = chrono::Utc::now();
    let oauth = state.session.status(state.environment);
    let snapshot = state.compound.snapshot();

    Json(serde_json::json!({
        "phase": state.clock.phase(now).to_string(),
        "trading_day": state.clock.is_trading_day(crate::market::eastern::eastern_date(now)),
        "next_open": state.clock.next_open(now),
        "next_close": state.clock.next_close(now),
        "environment": state.environment,
        "trade_mode": state.trade_mode,
        "oauth": oauth,
        "capital": snapshot,
        "open_equity_positions": state.book.open_count(),
        "open_options_positions": state.options_book.open_count(),
    }))
}

async fn positions(State(state): State<Arc<ApiState>>) -> impl IntoResponse {
    Json(serde_json::json!({
        "equities": state.book.open_positions(),
        "options": state.options_book.open_positions(),
    }))
}
