// =============================================================================
// REST API Endpoints — Axum 0.7
// =============================================================================
//
// All endpoints live under `/api/v1/`. Health is public; everything else
// requires a valid Bearer token via the `AuthBearer` extractor.
//
// CORS is configured permissively for development; tighten the allowed
// origins in production.
// =============================================================================

use std::sync::Arc;

use axum::{
    extract::{Path, State},
    response::IntoResponse,
    routing::{get, post},
    Json, Router,
};
use serde::Serialize;
use tower_http::cors::{Any, CorsLayer};
use tracing::{info, warn};

use crate::api::auth::AuthBearer;
use crate::app_state::AppState;
use crate::journal::EventSink;
use crate::position::ExitKind;
use crate::types::TradingMode;

/// Build the full REST router with CORS middleware and shared state.
pub fn router(state: Arc<AppState>) -> Router {
    let cors = CorsLayer::new()
        .allow_origin(Any)
        .allow_methods(Any)
        .allow_headers(Any);

    Router::new()
        // ── Public ──────────────────────────────────────────────────
        .route("/api/v1/health", get(health))
        // ── Authenticated ───────────────────────────────────────────
        .route("/api/v1/status", get(status))
        .route("/api/v1/state", get(full_state))
        .route("/api/v1/positions", get(positions))
        .route("/api/v1/trades", get(trades))
        .route("/api/v1/watchlist", get(watchlist))
        .route("/api/v1/control/start", post(control_start))
        .route("/api/v1/control/pause", post(control_pause))
        .route("/api/v1/control/resume", post(control_resume))
        .route("/api/v1/control/kill", post(control_kill))
        .route("/api/v1/control/close/:symbol", post(close_position))
        .route("/api/v1/control/close-all", post(close_all))
        // ── Middleware & State ──────────────────────────────────────
        .layer(cors)
        .with_state(state)
}

// =============================================================================
// Health (public)
// =============================================================================

#[derive(Serialize)]
struct HealthResponse {
    status: &'static str,
    state_version: u64,
    server_time: i64,
}

async fn health(State(state): State<Arc<AppState>>) -> impl IntoResponse {
    Json(HealthResponse {
        status: "ok",
        state_version: state.current_state_version(),
        server_time: chrono::Utc::now().timestamp_millis(),
    })
}

// =============================================================================
// Read endpoints
// =============================================================================

#[derive(Serialize)]
struct StatusResponse {
    trading_mode: String,
    account_mode: String,
    open_positions: usize,
    realized_pnl: f64,
    filled_trade_count: u32,
    uptime_s: u64,
}

async fn status(_auth: AuthBearer, State(state): State<Arc<AppState>>) -> impl IntoResponse {
    let config = state.runtime_config.read();
    Json(StatusResponse {
        trading_mode: config.trading_mode.to_string(),
        account_mode: config.account_mode.to_string(),
        open_positions: state.ledger.open_count(),
        realized_pnl: state.ledger.realized_pnl(),
        filled_trade_count: state.ledger.filled_trade_count(),
        uptime_s: state.start_time.elapsed().as_secs(),
    })
}

async fn full_state(_auth: AuthBearer, State(state): State<Arc<AppState>>) -> impl IntoResponse {
    Json(state.build_snapshot())
}

async fn positions(_auth: AuthBearer, State(state): State<Arc<AppState>>) -> impl IntoResponse {
    let positions: Vec<_> = state
        .ledger
        .open_symbols()
        .into_iter()
        .filter_map(|s| state.ledger.position(&s))
        .map(|p| p.lock().clone())
        .collect();
    Json(positions)
}

async fn trades(_auth: AuthBearer, State(state): State<Arc<AppState>>) -> impl IntoResponse {
    Json(state.journal.recent(100))
}

async fn watchlist(_auth: AuthBearer, State(state): State<Arc<AppState>>) -> impl IntoResponse {
    Json(state.runtime_config.read().watchlist.clone())
}

// =============================================================================
// Control endpoints
// =============================================================================

fn set_mode(state: &AppState, mode: TradingMode) -> Json<serde_json::Value> {
    state.runtime_config.write().trading_mode = mode;
    state.increment_version();
    info!(mode = %mode, "trading mode changed via API");
    Json(serde_json::json!({ "trading_mode": mode.to_string() }))
}

async fn control_start(_auth: AuthBearer, State(state): State<Arc<AppState>>) -> impl IntoResponse {
    set_mode(&state, TradingMode::Live)
}

async fn control_pause(_auth: AuthBearer, State(state): State<Arc<AppState>>) -> impl IntoResponse {
    set_mode(&state, TradingMode::Paused)
}

async fn control_resume(_auth: AuthBearer, State(state): State<Arc<AppState>>) -> impl IntoResponse {
    set_mode(&state, TradingMode::Live)
}

/// Kill switch: entries stop permanently for the session. Open positions
/// continue to be managed to a safe exit.
async fn control_kill(_auth: AuthBearer, State(state): State<Arc<AppState>>) -> impl IntoResponse {
    warn!("kill switch activated via API");
    set_mode(&state, TradingMode::Killed)
}

async fn close_position(
    _auth: AuthBearer,
    State(state): State<Arc<AppState>>,
    Path(symbol): Path<String>,
) -> impl IntoResponse {
    let symbol = symbol.to_uppercase();
    if state.ledger.position(&symbol).is_none() {
        return Json(serde_json::json!({ "closed": false, "error": "no managed position" }));
    }
    state
        .positions
        .force_close(&symbol, ExitKind::Manual, chrono::Utc::now())
        .await;
    state.increment_version();
    Json(serde_json::json!({ "closed": true, "symbol": symbol }))
}

async fn close_all(_auth: AuthBearer, State(state): State<Arc<AppState>>) -> impl IntoResponse {
    let count = state.ledger.open_count();
    state.positions.force_close_all(chrono::Utc::now()).await;
    state.increment_version();
    Json(serde_json::json!({ "closing": count }))
}
