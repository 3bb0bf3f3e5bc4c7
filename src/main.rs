// =============================================================================
// Meridian Gap Engine — Main Entry Point
// =============================================================================
//
// The engine starts in Demo + Paused mode for safety. Users must explicitly
// switch to Live mode via the control API.
// =============================================================================

// ── Module declarations ──────────────────────────────────────────────────────
mod api;
mod app_state;
mod broker;
mod clock;
mod coordinator;
mod decision;
mod indicators;
mod journal;
mod ledger;
mod market_data;
mod position;
mod risk;
mod runtime_config;
mod strategy;
mod types;

use std::sync::Arc;

use tracing::{error, info, warn};
use tracing_subscriber::EnvFilter;

use crate::app_state::AppState;
use crate::broker::{AlpacaClient, Broker, PaperBroker, RateLimiter};
use crate::clock::MarketClock;
use crate::coordinator::Coordinator;
use crate::journal::{EventSink, JsonlJournal};
use crate::market_data::{HttpBarFeed, MarketDataProvider};
use crate::runtime_config::RuntimeConfig;
use crate::types::{AccountMode, TradingMode};

const CONFIG_PATH: &str = "runtime_config.json";
const JOURNAL_PATH: &str = "journal.jsonl";

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // ── 1. Environment & config ──────────────────────────────────────────
    let _ = dotenv::dotenv();

    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();

    info!("╔══════════════════════════════════════════════════════════╗");
    info!("║        Meridian Gap Engine — Starting Up                ║");
    info!("╚══════════════════════════════════════════════════════════╝");

    let mut config = RuntimeConfig::load(CONFIG_PATH).unwrap_or_else(|e| {
        warn!(error = %e, "Failed to load config, using defaults");
        RuntimeConfig::default()
    });

    // SAFETY: Force Demo + Paused on startup.
    config.trading_mode = TradingMode::Paused;
    config.account_mode = AccountMode::Demo;

    // Override watchlist from env if available.
    if let Ok(syms) = std::env::var("MERIDIAN_SYMBOLS") {
        config.watchlist = syms
            .split(',')
            .map(|s| s.trim().to_uppercase())
            .filter(|s| !s.is_empty())
            .collect();
    }
    if config.watchlist.is_empty() {
        config.watchlist = vec![
            "AAPL".into(),
            "TSLA".into(),
            "NVDA".into(),
            "AMD".into(),
            "META".into(),
        ];
    }

    info!(watchlist = ?config.watchlist, "Configured symbols");
    info!(
        trading_mode = %config.trading_mode,
        account_mode = %config.account_mode,
        "Engine starting in SAFE mode (Demo + Paused)"
    );

    let clock = MarketClock::from_config(&config)?;

    // ── 2. Broker & market data ──────────────────────────────────────────
    let api_key = std::env::var("ALPACA_API_KEY").unwrap_or_default();
    let api_secret = std::env::var("ALPACA_API_SECRET").unwrap_or_default();
    let trading_url = std::env::var("ALPACA_TRADING_URL")
        .unwrap_or_else(|_| "https://paper-api.alpaca.markets".into());
    let data_url =
        std::env::var("ALPACA_DATA_URL").unwrap_or_else(|_| "https://data.alpaca.markets".into());

    let limiter = Arc::new(RateLimiter::per_minute(config.broker_rate_limit_per_min));

    let broker: Arc<dyn Broker> = match config.account_mode {
        AccountMode::Demo => Arc::new(PaperBroker::new(100_000.0, 200_000.0)),
        AccountMode::Live => Arc::new(AlpacaClient::new(
            trading_url,
            &api_key,
            &api_secret,
            limiter,
        )),
    };

    let feed = Arc::new(HttpBarFeed::new(data_url, &api_key, &api_secret));
    let market = Arc::new(MarketDataProvider::new(feed));

    // ── 3. Journal & restart tallies ─────────────────────────────────────
    let journal = Arc::new(JsonlJournal::open(JOURNAL_PATH)?);
    let journal_sink: Arc<dyn EventSink> = journal.clone();

    let state = Arc::new(AppState::new(
        config,
        clock.clone(),
        market,
        broker.clone(),
        journal_sink,
    ));

    let now = chrono::Utc::now();
    match journal.replay_today(clock.local_date(now), |ts| clock.local_date(ts)) {
        Ok((pnl, count)) if count > 0 || pnl != 0.0 => {
            state.ledger.seed(pnl, count);
        }
        Ok(_) => {}
        Err(e) => warn!(error = %e, "journal replay failed, starting with fresh tallies"),
    }

    // Broker positions the journal does not know about are left unmanaged.
    match broker.positions().await {
        Ok(positions) => {
            for p in positions {
                warn!(
                    symbol = %p.symbol,
                    qty = p.qty,
                    "existing broker position is not managed by this engine"
                );
            }
        }
        Err(e) => warn!(error = %e, "could not list broker positions at startup"),
    }

    // ── 4. Control API ───────────────────────────────────────────────────
    let api_state = state.clone();
    let bind_addr =
        std::env::var("MERIDIAN_BIND_ADDR").unwrap_or_else(|_| "0.0.0.0:3001".into());

    tokio::spawn(async move {
        let app = api::rest::router(api_state);
        let listener = match tokio::net::TcpListener::bind(&bind_addr).await {
            Ok(l) => l,
            Err(e) => {
                error!(addr = %bind_addr, error = %e, "failed to bind API server");
                return;
            }
        };
        info!(addr = %bind_addr, "API server listening");
        if let Err(e) = axum::serve(listener, app).await {
            error!(error = %e, "API server failed");
        }
    });

    // ── 5. Coordinator ───────────────────────────────────────────────────
    let coordinator = Coordinator::new(state.clone());
    tokio::spawn(coordinator.run());

    info!("All subsystems running. Press Ctrl+C to stop.");

    // ── 6. Graceful shutdown ─────────────────────────────────────────────
    tokio::signal::ctrl_c().await?;
    warn!("Shutdown signal received — stopping gracefully");

    if let Err(e) = state.runtime_config.read().save(CONFIG_PATH) {
        error!(error = %e, "Failed to save runtime config on shutdown");
    }

    info!("Meridian Gap Engine shut down complete.");
    Ok(())
}
