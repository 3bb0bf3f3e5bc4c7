// =============================================================================
// Central Application State — Meridian Gap Engine
// =============================================================================
//
// The single wiring point for the engine. Every service is constructed once
// at startup and injected here; subsystems hold Arc references. AppState
// ties them together and builds the unified snapshot served by the control
// API.
//
// Thread safety:
//   - Atomic counter for lock-free version tracking.
//   - parking_lot::RwLock for mutable shared collections.
//   - The day ledger carries its own mutex; everything else is immutable
//     after construction.
// =============================================================================

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use chrono::Utc;
use parking_lot::RwLock;
use serde::Serialize;

use crate::broker::Broker;
use crate::clock::MarketClock;
use crate::decision::ScanDecision;
use crate::journal::{EventSink, TradeEvent};
use crate::ledger::{DayLedger, LedgerSnapshot};
use crate::market_data::MarketDataProvider;
use crate::position::{ManagedPosition, PositionManager};
use crate::risk::RiskGate;
use crate::runtime_config::RuntimeConfig;

/// Maximum number of recent errors retained.
const MAX_RECENT_ERRORS: usize = 50;
/// Maximum number of recent scan decisions retained.
const MAX_RECENT_DECISIONS: usize = 100;

/// A recorded error event for the dashboard error log.
#[derive(Debug, Clone, Serialize)]
pub struct ErrorRecord {
    pub message: String,
    /// ISO 8601 timestamp.
    pub at: String,
}

/// Central application state shared across all async tasks via
/// `Arc<AppState>`.
pub struct AppState {
    /// Monotonically increasing version counter, bumped on every meaningful
    /// state mutation so dashboard pollers can detect changes.
    pub state_version: AtomicU64,

    pub runtime_config: Arc<RwLock<RuntimeConfig>>,
    pub clock: MarketClock,

    pub market: Arc<MarketDataProvider>,
    pub broker: Arc<dyn Broker>,
    pub ledger: Arc<DayLedger>,
    pub positions: Arc<PositionManager>,
    pub risk_gate: RiskGate,
    pub journal: Arc<dyn EventSink>,

    pub recent_decisions: RwLock<Vec<ScanDecision>>,
    pub recent_errors: RwLock<Vec<ErrorRecord>>,

    /// Engine start, for uptime reporting.
    pub start_time: std::time::Instant,
}

impl AppState {
    pub fn new(
        config: RuntimeConfig,
        clock: MarketClock,
        market: Arc<MarketDataProvider>,
        broker: Arc<dyn Broker>,
        journal: Arc<dyn EventSink>,
    ) -> Self {
        let now = Utc::now();
        let ledger = Arc::new(DayLedger::new(clock.clone(), now));
        let positions = Arc::new(PositionManager::new(
            broker.clone(),
            ledger.clone(),
            journal.clone(),
        ));
        let risk_gate = RiskGate::new(clock.clone());

        Self {
            state_version: AtomicU64::new(1),
            runtime_config: Arc::new(RwLock::new(config)),
            clock,
            market,
            broker,
            ledger,
            positions,
            risk_gate,
            journal,
            recent_decisions: RwLock::new(Vec::new()),
            recent_errors: RwLock::new(Vec::new()),
            start_time: std::time::Instant::now(),
        }
    }

    // ── Version management ──────────────────────────────────────────────

    pub fn increment_version(&self) -> u64 {
        self.state_version.fetch_add(1, Ordering::SeqCst)
    }

    pub fn current_state_version(&self) -> u64 {
        self.state_version.load(Ordering::SeqCst)
    }

    // ── Error log ───────────────────────────────────────────────────────

    /// Record an error message. Oldest entries are evicted beyond the cap.
    pub fn push_error(&self, message: String) {
        let mut errors = self.recent_errors.write();
        errors.push(ErrorRecord {
            message,
            at: Utc::now().to_rfc3339(),
        });
        while errors.len() > MAX_RECENT_ERRORS {
            errors.remove(0);
        }
        self.increment_version();
    }

    // ── Decision audit ──────────────────────────────────────────────────

    pub fn push_decision(&self, decision: ScanDecision) {
        let mut decisions = self.recent_decisions.write();
        decisions.push(decision);
        while decisions.len() > MAX_RECENT_DECISIONS {
            decisions.remove(0);
        }
        self.increment_version();
    }

    // ── Snapshot builder ────────────────────────────────────────────────

    /// The payload behind `GET /api/v1/state`.
    pub fn build_snapshot(&self) -> StateSnapshot {
        let now = Utc::now();
        let config = self.runtime_config.read();

        let positions: Vec<ManagedPosition> = self
            .ledger
            .open_symbols()
            .into_iter()
            .filter_map(|s| self.ledger.position(&s))
            .map(|p| p.lock().clone())
            .collect();

        StateSnapshot {
            state_version: self.current_state_version(),
            server_time: now.timestamp_millis(),
            trading_mode: config.trading_mode.to_string(),
            account_mode: config.account_mode.to_string(),
            watchlist: config.watchlist.clone(),
            ledger: self.ledger.snapshot(&config, now),
            positions,
            recent_trades: self.journal.recent(50),
            recent_decisions: self.recent_decisions.read().clone(),
            recent_errors: self.recent_errors.read().clone(),
            uptime_s: self.start_time.elapsed().as_secs(),
        }
    }
}

/// Full engine state snapshot for the dashboard.
#[derive(Debug, Clone, Serialize)]
pub struct StateSnapshot {
    pub state_version: u64,
    pub server_time: i64,
    pub trading_mode: String,
    pub account_mode: String,
    pub watchlist: Vec<String>,
    pub ledger: LedgerSnapshot,
    pub positions: Vec<ManagedPosition>,
    pub recent_trades: Vec<TradeEvent>,
    pub recent_decisions: Vec<ScanDecision>,
    pub recent_errors: Vec<ErrorRecord>,
    pub uptime_s: u64,
}
