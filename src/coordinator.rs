// =============================================================================
// Coordinator — scanner, monitor, and cutoff scheduling
// =============================================================================
//
// Three timers drive the engine:
//   - the scanner (default 3 s) walks the watchlist during the entry window,
//   - the monitor (default 1 s) steps every open position's state machine,
//   - the cutoff timer fires one force-close sweep at the configured local
//     time, exactly once per trading day.
//
// Symbol-level work runs on a bounded worker pool. A keyed async mutex per
// symbol guarantees at most one in-flight evaluation and one in-flight
// monitor step per symbol; a tick that finds a symbol busy skips it instead
// of queueing behind it. A failure on one symbol never aborts a tick.
// =============================================================================

use std::collections::HashMap;
use std::sync::Arc;

use chrono::{DateTime, NaiveDate, Utc};
use parking_lot::Mutex;
use tokio::sync::Semaphore;
use tokio::task::JoinSet;
use tracing::{debug, error, info, warn};

use crate::app_state::AppState;
use crate::broker::{BracketRequest, Broker, BrokerError, EntryType};
use crate::clock::MarketClock;
use crate::decision::ScanDecision;
use crate::journal::{EventKind, EventSink, TradeEvent};
use crate::market_data::Bar;
use crate::runtime_config::RuntimeConfig;
use crate::strategy::{self, Setup};
use crate::types::{Timeframe, TradingMode};

/// 5-minute history requested per evaluation; enough for MACD(12/26/9) plus
/// the 20-bar divergence window.
const BARS_5M: usize = 80;
/// Daily bars requested: 20 for the volume baseline plus today's partial.
const DAILY_BARS: usize = 21;

// =============================================================================
// Keyed locks — per-symbol mutual exclusion
// =============================================================================

/// A lazily populated map of per-key async mutexes. The symbol key serves as
/// the mutual-exclusion token for evaluation and monitor work.
pub struct KeyedLocks {
    map: Mutex<HashMap<String, Arc<tokio::sync::Mutex<()>>>>,
}

impl KeyedLocks {
    pub fn new() -> Self {
        Self {
            map: Mutex::new(HashMap::new()),
        }
    }

    pub fn for_key(&self, key: &str) -> Arc<tokio::sync::Mutex<()>> {
        self.map
            .lock()
            .entry(key.to_string())
            .or_insert_with(|| Arc::new(tokio::sync::Mutex::new(())))
            .clone()
    }
}

impl Default for KeyedLocks {
    fn default() -> Self {
        Self::new()
    }
}

// =============================================================================
// Coordinator
// =============================================================================

pub struct Coordinator {
    state: Arc<AppState>,
    eval_locks: Arc<KeyedLocks>,
    monitor_locks: Arc<KeyedLocks>,
    workers: Arc<Semaphore>,
    swept_on: Mutex<Option<NaiveDate>>,
}

impl Coordinator {
    pub fn new(state: Arc<AppState>) -> Arc<Self> {
        let pool = state.runtime_config.read().worker_pool_size.max(1);
        Arc::new(Self {
            state,
            eval_locks: Arc::new(KeyedLocks::new()),
            monitor_locks: Arc::new(KeyedLocks::new()),
            workers: Arc::new(Semaphore::new(pool)),
            swept_on: Mutex::new(None),
        })
    }

    /// Run all three timers until the process stops.
    pub async fn run(self: Arc<Self>) {
        let scanner = {
            let this = self.clone();
            tokio::spawn(async move {
                let period = this.state.runtime_config.read().scanner_period_s.max(1);
                let mut ticker = tokio::time::interval(std::time::Duration::from_secs(period));
                loop {
                    ticker.tick().await;
                    this.scanner_tick(Utc::now()).await;
                }
            })
        };

        let monitor = {
            let this = self.clone();
            tokio::spawn(async move {
                let period = this.state.runtime_config.read().monitor_period_s.max(1);
                let mut ticker = tokio::time::interval(std::time::Duration::from_secs(period));
                loop {
                    ticker.tick().await;
                    this.monitor_tick(Utc::now()).await;
                }
            })
        };

        let cutoff = {
            let this = self.clone();
            tokio::spawn(async move {
                let mut ticker = tokio::time::interval(std::time::Duration::from_secs(1));
                loop {
                    ticker.tick().await;
                    this.cutoff_tick(Utc::now()).await;
                }
            })
        };

        info!("coordinator timers running");
        let _ = tokio::join!(scanner, monitor, cutoff);
    }

    // -------------------------------------------------------------------------
    // Scanner
    // -------------------------------------------------------------------------

    /// One scanner pass: evaluate eligible watchlist symbols in parallel,
    /// then admit survivors in descending signal strength.
    pub async fn scanner_tick(&self, now: DateTime<Utc>) {
        self.state.ledger.roll_if_needed(now);

        let cfg = self.state.runtime_config.read().clone();
        if cfg.trading_mode != TradingMode::Live {
            return;
        }
        if !self.state.clock.entry_window_open(now) {
            return;
        }
        if self.state.ledger.circuit_tripped(&cfg) {
            debug!("daily loss circuit tripped, scanner idle");
            return;
        }

        let symbols: Vec<String> = cfg
            .watchlist
            .iter()
            .filter(|s| self.state.ledger.is_eligible(s, &cfg, now))
            .cloned()
            .collect();
        if symbols.is_empty() {
            return;
        }

        // Fan out evaluations on the worker pool, one in flight per symbol.
        let mut join_set = JoinSet::new();
        for symbol in symbols {
            let state = self.state.clone();
            let cfg = cfg.clone();
            let lock = self.eval_locks.for_key(&symbol);
            let workers = self.workers.clone();
            join_set.spawn(async move {
                let Ok(_permit) = workers.acquire().await else {
                    return None;
                };
                let Ok(_guard) = lock.try_lock() else {
                    return None; // evaluation from a prior tick still running
                };
                evaluate_symbol(&state, &symbol, &cfg, now).await
            });
        }

        let mut setups: Vec<Setup> = Vec::new();
        while let Some(joined) = join_set.join_next().await {
            match joined {
                Ok(Some(setup)) => setups.push(setup),
                Ok(None) => {}
                Err(e) => warn!(error = %e, "evaluation task panicked"),
            }
        }
        if setups.is_empty() {
            return;
        }

        // Strongest signals claim the remaining position slots first.
        setups.sort_by(|a, b| b.signal_strength.cmp(&a.signal_strength));
        self.admit_setups(setups, &cfg, now).await;
    }

    /// Risk-gate and submit admitted setups in order.
    pub(crate) async fn admit_setups(
        &self,
        setups: Vec<Setup>,
        cfg: &RuntimeConfig,
        now: DateTime<Utc>,
    ) -> usize {
        let account = match self.state.broker.account().await {
            Ok(a) => a,
            Err(e) => {
                warn!(error = %e, "account fetch failed, skipping admissions this tick");
                return 0;
            }
        };

        let mut admitted = 0;
        for setup in setups {
            match self
                .state
                .risk_gate
                .evaluate(&setup, &self.state.ledger, cfg, &account, now)
            {
                Ok(()) => {
                    if self.submit_entry(&setup, cfg, now).await {
                        admitted += 1;
                    }
                }
                Err(reason) => {
                    debug!(symbol = %setup.symbol, %reason, "setup rejected by risk gate");
                    self.state.push_decision(ScanDecision::reject(
                        &setup.symbol,
                        "RiskGate",
                        reason.to_string(),
                    ));
                }
            }
        }
        admitted
    }

    /// Submit one bracket and register the managed position. The pending
    /// entry lock is written before the submit and released on rejection.
    async fn submit_entry(&self, setup: &Setup, cfg: &RuntimeConfig, now: DateTime<Utc>) -> bool {
        self.state.ledger.lock_entry(&setup.symbol, cfg, now);

        let request = BracketRequest {
            symbol: setup.symbol.clone(),
            side: setup.side.entry_side(),
            qty: setup.size_shares,
            entry: EntryType::Market,
            stop_price: setup.stop_price,
            target_price: setup.target_price,
            client_order_id: Some(uuid::Uuid::new_v4().to_string()),
        };

        match self.state.broker.submit_bracket(request).await {
            Ok(parent_id) => {
                self.state.positions.register(setup, parent_id.clone(), now);
                self.state.journal.record(TradeEvent {
                    ts: now,
                    symbol: setup.symbol.clone(),
                    side: setup.side,
                    size: setup.size_shares,
                    price: setup.entry_price,
                    fees: 0.0,
                    realized_pnl: None,
                    event_kind: EventKind::SetupAdmitted,
                    parent_order_id: Some(parent_id),
                });
                self.state
                    .push_decision(ScanDecision::admit(&setup.symbol, setup.signal_strength));
                info!(
                    symbol = %setup.symbol,
                    side = %setup.side,
                    score = setup.signal_strength,
                    size = setup.size_shares,
                    "bracket submitted"
                );
                true
            }
            Err(e) => {
                // A dead submit leaves nothing in flight: free the symbol now.
                self.state.ledger.release_entry_lock(&setup.symbol);
                match &e {
                    BrokerError::Rejected(_)
                    | BrokerError::InsufficientBuyingPower
                    | BrokerError::MarketClosed
                    | BrokerError::DuplicateClientOrderId => {
                        warn!(symbol = %setup.symbol, error = %e, "entry rejected by broker");
                    }
                    other => {
                        error!(symbol = %setup.symbol, error = %other, "entry submit failed");
                        self.state.push_error(format!(
                            "{}: entry submit failed: {other}",
                            setup.symbol
                        ));
                    }
                }
                self.state.push_decision(ScanDecision::reject(
                    &setup.symbol,
                    "Broker",
                    e.to_string(),
                ));
                false
            }
        }
    }

    // -------------------------------------------------------------------------
    // Monitor
    // -------------------------------------------------------------------------

    /// One monitor pass: step every open position. Steps for distinct
    /// symbols run in parallel; per-symbol steps are serialized.
    pub async fn monitor_tick(&self, now: DateTime<Utc>) {
        let open = self.state.ledger.open_symbols();
        if open.is_empty() {
            return;
        }

        let trail = self.state.runtime_config.read().trail.clone();

        let mut join_set = JoinSet::new();
        for symbol in open {
            let state = self.state.clone();
            let trail = trail.clone();
            let lock = self.monitor_locks.for_key(&symbol);
            let workers = self.workers.clone();
            join_set.spawn(async move {
                let Ok(_permit) = workers.acquire().await else {
                    return;
                };
                let Ok(_guard) = lock.try_lock() else {
                    return; // a prior step for this symbol is still running
                };
                match state.market.last(&symbol).await {
                    Ok(quote) => {
                        state.positions.step(&symbol, quote.last, now, &trail).await;
                    }
                    Err(e) => {
                        debug!(symbol = %symbol, error = %e, "no quote, skipping monitor step");
                    }
                }
            });
        }
        while join_set.join_next().await.is_some() {}
    }

    // -------------------------------------------------------------------------
    // Cutoff
    // -------------------------------------------------------------------------

    /// Fire the force-close sweep once per trading day at the configured
    /// local time. The sweep itself always runs to completion.
    pub async fn cutoff_tick(&self, now: DateTime<Utc>) {
        if !self.state.clock.past_position_close(now) {
            return;
        }
        let today = self.state.clock.local_date(now);
        {
            let mut swept = self.swept_on.lock();
            if *swept == Some(today) {
                return;
            }
            *swept = Some(today);
        }

        info!(date = %today, "position close time reached, sweeping");
        self.state.positions.force_close_all(now).await;
        self.state.increment_version();
    }
}

// =============================================================================
// Symbol evaluation
// =============================================================================

/// Today's session bars: market-local date matches and time is at or past
/// the open.
fn session_bars(bars: &[Bar], clock: &MarketClock, now: DateTime<Utc>) -> Vec<Bar> {
    let today = clock.local_date(now);
    let open = clock.market_open_time();
    bars.iter()
        .filter(|b| clock.local_date(b.ts) == today && clock.local_time(b.ts) >= open)
        .cloned()
        .collect()
}

/// Full per-symbol pipeline: bars, gap, indicators, strategy. Pushes a
/// decision record for every terminal outcome except an admitted setup
/// (admission itself records that).
async fn evaluate_symbol(
    state: &AppState,
    symbol: &str,
    cfg: &RuntimeConfig,
    now: DateTime<Utc>,
) -> Option<Setup> {
    let bars_5m = match state.market.bars(symbol, Timeframe::Min5, BARS_5M).await {
        Ok(b) => b,
        Err(e) => {
            state.push_decision(ScanDecision::skip(symbol, e.to_string()));
            return None;
        }
    };
    let daily = match state.market.bars(symbol, Timeframe::Day, DAILY_BARS).await {
        Ok(b) => b,
        Err(e) => {
            state.push_decision(ScanDecision::skip(symbol, e.to_string()));
            return None;
        }
    };

    // Today's partial daily bar must not feed the gap reference or the
    // volume baseline.
    let today = state.clock.local_date(now);
    let history: &[Bar] = match daily.last() {
        Some(last) if state.clock.local_date(last.ts) == today => &daily[..daily.len() - 1],
        _ => &daily[..],
    };
    let Some(prev_close) = history.last().map(|b| b.close) else {
        state.push_decision(ScanDecision::skip(symbol, "no prior daily close"));
        return None;
    };

    let session = session_bars(&bars_5m, &state.clock, now);
    let Some(today_open) = session.first().map(|b| b.open) else {
        state.push_decision(ScanDecision::skip(symbol, "no session bars yet"));
        return None;
    };

    let Some(gap) = strategy::observe_gap(symbol, prev_close, today_open) else {
        state.push_decision(ScanDecision::skip(symbol, "gap not computable"));
        return None;
    };

    let fraction = state.clock.session_fraction(now);
    let Some(snap) = crate::indicators::snapshot(&bars_5m, &session, history, fraction) else {
        state.push_decision(ScanDecision::skip(symbol, "indicators not ready"));
        return None;
    };

    let quote = match state.market.last(symbol).await {
        Ok(q) => q,
        Err(e) => {
            state.push_decision(ScanDecision::skip(symbol, e.to_string()));
            return None;
        }
    };

    match strategy::evaluate(&gap, &snap, quote.last, &cfg.strategy) {
        Ok(setup) => {
            debug!(
                symbol,
                score = setup.signal_strength,
                side = %setup.side,
                "setup candidate"
            );
            Some(setup)
        }
        Err(reason) => {
            state.push_decision(ScanDecision::reject(symbol, "Strategy", reason.to_string()));
            None
        }
    }
}
