// =============================================================================
// Position Manager — tiered trailing-stop state machine, one per position
// =============================================================================
//
// Life-cycle:
//   AwaitingFill -> OpenInitial -> OpenBreakeven -> OpenTierLocked -> Closing -> Closed
//                        \________________\________________\____________/
//                         any Open_* exits to Closing on a leg fill or
//                         force-close; Closed on terminal confirmation
//
// Per monitor tick the machine:
//   1. polls the protection legs; a filled leg finalizes the exit,
//   2. otherwise updates peak profit, derives the desired dollar lock from
//      the tier ladder, and
//   3. replaces the resting stop when the candidate is strictly better.
//
// The stored stop price is monotone over the position's lifetime:
// non-decreasing for longs, non-increasing for shorts. A candidate that
// would move the stop against the trader is refused and logged, never
// crashed on.
//
// The machine never cancels its own stop: it calls `replace_stop` and the
// adapter chooses atomic replace or cancel-then-resubmit.
// =============================================================================

use std::sync::Arc;

use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use serde::Serialize;
use tracing::{debug, error, info, warn};

use crate::broker::{Broker, BrokerError, OrderStatus};
use crate::journal::{EventKind, EventSink, TradeEvent};
use crate::ledger::DayLedger;
use crate::position::tiers;
use crate::runtime_config::TrailParams;
use crate::strategy::Setup;
use crate::types::Side;

/// Attempts per tick for a transient-failing stop replace.
const REPLACE_ATTEMPTS: u32 = 3;
/// Backoff between replace attempts.
const REPLACE_BACKOFF: std::time::Duration = std::time::Duration::from_millis(50);
/// Price comparisons ignore sub-cent noise.
const PRICE_EPS: f64 = 1e-9;

/// Where a position sits in its life-cycle.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum PositionState {
    AwaitingFill,
    OpenInitial,
    OpenBreakeven,
    OpenTierLocked,
    Closing,
    Closed,
}

impl std::fmt::Display for PositionState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::AwaitingFill => write!(f, "AwaitingFill"),
            Self::OpenInitial => write!(f, "OpenInitial"),
            Self::OpenBreakeven => write!(f, "OpenBreakeven"),
            Self::OpenTierLocked => write!(f, "OpenTierLocked"),
            Self::Closing => write!(f, "Closing"),
            Self::Closed => write!(f, "Closed"),
        }
    }
}

/// How a position left the book.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum ExitKind {
    Stop,
    Target,
    ForceClose,
    Manual,
}

/// Terminal exit details.
#[derive(Debug, Clone, Serialize)]
pub struct ExitRecord {
    pub kind: ExitKind,
    pub price: f64,
    pub realized_pnl: f64,
}

/// One managed position. Private to its monitor worker; shared state flows
/// through the day ledger.
#[derive(Debug, Clone, Serialize)]
pub struct ManagedPosition {
    pub symbol: String,
    pub side: Side,
    pub size_shares: u32,
    pub entry_price: f64,
    pub entry_time: DateTime<Utc>,
    pub parent_order_id: String,
    pub current_stop_price: f64,
    pub current_stop_order_id: Option<String>,
    pub target_order_id: Option<String>,
    pub target_price: f64,
    pub state: PositionState,
    pub locked_profit_dollars: f64,
    pub highest_profit_seen_dollars: f64,
    pub last_stop_replace_time: Option<DateTime<Utc>>,
    pub replace_failures: u32,
    pub close_order_id: Option<String>,
    pub exit: Option<ExitRecord>,
}

impl ManagedPosition {
    fn from_setup(setup: &Setup, parent_order_id: String, now: DateTime<Utc>) -> Self {
        Self {
            symbol: setup.symbol.clone(),
            side: setup.side,
            size_shares: setup.size_shares,
            entry_price: setup.entry_price,
            entry_time: now,
            parent_order_id,
            current_stop_price: setup.stop_price,
            current_stop_order_id: None,
            target_order_id: None,
            target_price: setup.target_price,
            state: PositionState::AwaitingFill,
            locked_profit_dollars: 0.0,
            highest_profit_seen_dollars: 0.0,
            last_stop_replace_time: None,
            replace_failures: 0,
            close_order_id: None,
            exit: None,
        }
    }

    /// Dollar PnL at `last`.
    fn dollar_profit(&self, last: f64) -> f64 {
        self.side.sign() * (last - self.entry_price) * self.size_shares as f64
    }
}

/// Drives every managed position's state machine against the broker.
pub struct PositionManager {
    broker: Arc<dyn Broker>,
    ledger: Arc<DayLedger>,
    journal: Arc<dyn EventSink>,
}

impl PositionManager {
    pub fn new(broker: Arc<dyn Broker>, ledger: Arc<DayLedger>, journal: Arc<dyn EventSink>) -> Self {
        Self {
            broker,
            ledger,
            journal,
        }
    }

    /// Register a freshly submitted bracket as a managed position. Returns
    /// false when the symbol already carries one.
    pub fn register(&self, setup: &Setup, parent_order_id: String, now: DateTime<Utc>) -> bool {
        let pos = ManagedPosition::from_setup(setup, parent_order_id, now);
        let registered = self
            .ledger
            .register_open(&setup.symbol, Arc::new(Mutex::new(pos)));
        if registered {
            info!(
                symbol = %setup.symbol,
                side = %setup.side,
                size = setup.size_shares,
                entry = setup.entry_price,
                stop = setup.stop_price,
                target = setup.target_price,
                "position registered (awaiting fill)"
            );
        }
        registered
    }

    // -------------------------------------------------------------------------
    // Per-tick step
    // -------------------------------------------------------------------------

    /// Run one monitor step for `symbol`. The caller serializes steps per
    /// symbol; steps for distinct symbols may run concurrently.
    pub async fn step(&self, symbol: &str, last: f64, now: DateTime<Utc>, trail: &TrailParams) {
        let Some(pos_arc) = self.ledger.position(symbol) else {
            return;
        };

        // Mark-to-market hint: fills simulated brokers, no-op on live ones.
        self.broker.observe_price(symbol, last);

        let state = pos_arc.lock().state;
        match state {
            PositionState::AwaitingFill => self.step_awaiting_fill(&pos_arc, now).await,
            PositionState::OpenInitial
            | PositionState::OpenBreakeven
            | PositionState::OpenTierLocked => self.step_open(&pos_arc, last, now, trail).await,
            PositionState::Closing => self.step_closing(&pos_arc, now).await,
            PositionState::Closed => {}
        }
    }

    async fn step_awaiting_fill(&self, pos_arc: &Arc<Mutex<ManagedPosition>>, now: DateTime<Utc>) {
        let (symbol, parent_id) = {
            let pos = pos_arc.lock();
            (pos.symbol.clone(), pos.parent_order_id.clone())
        };

        let snap = match self.broker.order_status(&parent_id).await {
            Ok(s) => s,
            Err(e) => {
                warn!(symbol, error = %e, "entry status poll failed, retrying next tick");
                return;
            }
        };

        match snap.status {
            OrderStatus::Filled => {
                let children = self
                    .broker
                    .children_of(&parent_id)
                    .await
                    .unwrap_or_default();

                let (side, size, fill_price) = {
                    let mut pos = pos_arc.lock();
                    if let Some(px) = snap.filled_avg_price {
                        pos.entry_price = px;
                    }
                    pos.entry_time = now;
                    pos.current_stop_order_id = children.stop_leg_id;
                    pos.target_order_id = children.target_leg_id;
                    pos.state = PositionState::OpenInitial;
                    (pos.side, pos.size_shares, pos.entry_price)
                };

                self.ledger.note_fill(&symbol);
                self.journal.record(TradeEvent {
                    ts: now,
                    symbol: symbol.clone(),
                    side,
                    size,
                    price: fill_price,
                    fees: 0.0,
                    realized_pnl: None,
                    event_kind: EventKind::EntryFilled,
                    parent_order_id: Some(parent_id),
                });
                info!(symbol, fill_price, "entry filled, protection legs live");
            }
            OrderStatus::Rejected | OrderStatus::Canceled | OrderStatus::Expired => {
                warn!(symbol, status = ?snap.status, "entry died before filling, discarding");
                pos_arc.lock().state = PositionState::Closed;
                self.ledger.discard(&symbol);
                self.ledger.release_entry_lock(&symbol);
            }
            _ => {} // still working
        }
    }

    async fn step_open(
        &self,
        pos_arc: &Arc<Mutex<ManagedPosition>>,
        last: f64,
        now: DateTime<Utc>,
        trail: &TrailParams,
    ) {
        let (symbol, stop_id, target_id) = {
            let pos = pos_arc.lock();
            (
                pos.symbol.clone(),
                pos.current_stop_order_id.clone(),
                pos.target_order_id.clone(),
            )
        };

        // ── 1. Did the stop leg fill? ────────────────────────────────────
        if let Some(id) = &stop_id {
            if let Ok(snap) = self.broker.order_status(id).await {
                if snap.status == OrderStatus::Filled {
                    let price = snap
                        .filled_avg_price
                        .unwrap_or_else(|| pos_arc.lock().current_stop_price);
                    self.finalize_exit(pos_arc, ExitKind::Stop, price, now);
                    return;
                }
            }
        }

        // ── 2. Did the target leg fill? ──────────────────────────────────
        if let Some(id) = &target_id {
            if let Ok(snap) = self.broker.order_status(id).await {
                if snap.status == OrderStatus::Filled {
                    let price = snap
                        .filled_avg_price
                        .unwrap_or_else(|| pos_arc.lock().target_price);
                    self.finalize_exit(pos_arc, ExitKind::Target, price, now);
                    return;
                }
            }
        }

        // ── 3. Trail logic ───────────────────────────────────────────────
        let (candidate, lock_dollars) = {
            let mut pos = pos_arc.lock();

            let profit = pos.dollar_profit(last);
            if profit > pos.highest_profit_seen_dollars {
                pos.highest_profit_seen_dollars = profit;
            }

            let elapsed_s = (now - pos.entry_time).num_seconds().max(0) as u64;
            let quick = tiers::quick_profit_fired(elapsed_s, profit, trail);
            let Some(mut lock_dollars) =
                tiers::desired_lock(pos.highest_profit_seen_dollars, quick, trail)
            else {
                return; // initial stop stands
            };

            // A position leaves OpenInitial only through OpenBreakeven. A
            // move fast enough to clear the tier floor on its first
            // profitable tick still takes the breakeven stop now; the next
            // tick takes the tier.
            if pos.state == PositionState::OpenInitial && lock_dollars > 0.0 {
                lock_dollars = 0.0;
            }

            if lock_dollars + PRICE_EPS < pos.locked_profit_dollars {
                // The ladder only climbs; a lower lock is an internal bug.
                error!(
                    symbol = %pos.symbol,
                    current = pos.locked_profit_dollars,
                    proposed = lock_dollars,
                    "refusing lock downgrade"
                );
                return;
            }

            let candidate = pos.entry_price
                + pos.side.sign() * lock_dollars / pos.size_shares as f64;

            let better = match pos.side {
                Side::Long => candidate > pos.current_stop_price + PRICE_EPS,
                Side::Short => candidate < pos.current_stop_price - PRICE_EPS,
            };
            if !better {
                return; // monotonicity: never move the stop against the trade
            }

            (candidate, lock_dollars)
        };

        self.replace_stop_protocol(pos_arc, &symbol, candidate, lock_dollars, now)
            .await;
    }

    /// The stop-replace protocol: replace, absorb AlreadyTerminal as a fill
    /// signal, retry transients with backoff, and keep the prior stop on
    /// anything else.
    async fn replace_stop_protocol(
        &self,
        pos_arc: &Arc<Mutex<ManagedPosition>>,
        symbol: &str,
        candidate: f64,
        lock_dollars: f64,
        now: DateTime<Utc>,
    ) {
        let Some(stop_id) = pos_arc.lock().current_stop_order_id.clone() else {
            warn!(symbol, "no stop order id to replace");
            return;
        };

        for attempt in 1..=REPLACE_ATTEMPTS {
            match self.broker.replace_stop(&stop_id, candidate).await {
                Ok(new_id) => {
                    let (side, size) = {
                        let mut pos = pos_arc.lock();
                        pos.current_stop_order_id = Some(new_id.clone());
                        pos.current_stop_price = candidate;
                        pos.last_stop_replace_time = Some(now);
                        if lock_dollars > pos.locked_profit_dollars {
                            pos.locked_profit_dollars = lock_dollars;
                        }
                        // Defined edges only: OpenInitial reaches
                        // OpenBreakeven (step_open caps its lock at $0), and
                        // a positive lock upgrades OpenBreakeven to
                        // OpenTierLocked.
                        pos.state = match pos.state {
                            PositionState::OpenInitial => PositionState::OpenBreakeven,
                            PositionState::OpenBreakeven | PositionState::OpenTierLocked
                                if lock_dollars > 0.0 =>
                            {
                                PositionState::OpenTierLocked
                            }
                            other => other,
                        };
                        (pos.side, pos.size_shares)
                    };

                    self.journal.record(TradeEvent {
                        ts: now,
                        symbol: symbol.to_string(),
                        side,
                        size,
                        price: candidate,
                        fees: 0.0,
                        realized_pnl: None,
                        event_kind: EventKind::StopReplaced,
                        parent_order_id: Some(pos_arc.lock().parent_order_id.clone()),
                    });
                    info!(
                        symbol,
                        new_stop = candidate,
                        locked = lock_dollars,
                        order_id = %new_id,
                        "stop upgraded"
                    );
                    return;
                }
                Err(BrokerError::AlreadyTerminal) => {
                    // The stop filled under us. Do not resubmit; the closing
                    // step confirms the fill and records the exit.
                    info!(symbol, "stop filled during replace, moving to closing");
                    pos_arc.lock().state = PositionState::Closing;
                    return;
                }
                Err(e) if e.is_retryable() => {
                    warn!(symbol, attempt, error = %e, "transient replace failure");
                    if attempt < REPLACE_ATTEMPTS {
                        tokio::time::sleep(REPLACE_BACKOFF * attempt).await;
                    }
                }
                Err(e) => {
                    // Rejected, buying power, anything else: keep the prior
                    // stop, flag for the operator, do not touch stored state.
                    error!(symbol, error = %e, "stop replace refused, keeping prior stop");
                    pos_arc.lock().replace_failures += 1;
                    return;
                }
            }
        }

        // Retry budget spent: the prior stop stays live, next tick retries.
        warn!(symbol, "stop replace deferred after transient failures");
        pos_arc.lock().replace_failures += 1;
    }

    async fn step_closing(&self, pos_arc: &Arc<Mutex<ManagedPosition>>, now: DateTime<Utc>) {
        let (symbol, stop_id, target_id, close_id) = {
            let pos = pos_arc.lock();
            (
                pos.symbol.clone(),
                pos.current_stop_order_id.clone(),
                pos.target_order_id.clone(),
                pos.close_order_id.clone(),
            )
        };

        // The force-close market order ends the position when it fills.
        if let Some(id) = &close_id {
            if let Ok(snap) = self.broker.order_status(id).await {
                if snap.status == OrderStatus::Filled {
                    let price = snap
                        .filled_avg_price
                        .unwrap_or_else(|| pos_arc.lock().entry_price);
                    self.finalize_exit(pos_arc, ExitKind::ForceClose, price, now);
                    return;
                }
            }
            debug!(symbol, "close order still working");
            return;
        }

        // Closing without a close order means a leg filled under us.
        if let Some(id) = &stop_id {
            if let Ok(snap) = self.broker.order_status(id).await {
                if snap.status == OrderStatus::Filled {
                    let price = snap
                        .filled_avg_price
                        .unwrap_or_else(|| pos_arc.lock().current_stop_price);
                    self.finalize_exit(pos_arc, ExitKind::Stop, price, now);
                    return;
                }
            }
        }
        if let Some(id) = &target_id {
            if let Ok(snap) = self.broker.order_status(id).await {
                if snap.status == OrderStatus::Filled {
                    let price = snap
                        .filled_avg_price
                        .unwrap_or_else(|| pos_arc.lock().target_price);
                    self.finalize_exit(pos_arc, ExitKind::Target, price, now);
                }
            }
        }
    }

    // -------------------------------------------------------------------------
    // Force-close
    // -------------------------------------------------------------------------

    /// Flatten one position now: cancel both protection legs (an already
    /// terminal leg is fine), market out, and move to Closing. `Manual`
    /// marks operator-initiated closes; `ForceClose` the cutoff sweep.
    pub async fn force_close(&self, symbol: &str, kind: ExitKind, now: DateTime<Utc>) {
        let Some(pos_arc) = self.ledger.position(symbol) else {
            return;
        };

        let (state, stop_id, target_id, parent_id, side, size) = {
            let pos = pos_arc.lock();
            (
                pos.state,
                pos.current_stop_order_id.clone(),
                pos.target_order_id.clone(),
                pos.parent_order_id.clone(),
                pos.side,
                pos.size_shares,
            )
        };

        match state {
            PositionState::Closed | PositionState::Closing => return,
            PositionState::AwaitingFill => {
                // Nothing is open yet; kill the entry instead of flattening.
                if let Err(e) = self.broker.cancel(&parent_id).await {
                    warn!(symbol, error = %e, "entry cancel failed during force-close");
                }
                pos_arc.lock().state = PositionState::Closed;
                self.ledger.discard(symbol);
                self.ledger.release_entry_lock(symbol);
                return;
            }
            _ => {}
        }

        // 1. Cancel both legs. AlreadyTerminal is success.
        if let Some(id) = &target_id {
            if let Err(e) = self.broker.cancel(id).await {
                warn!(symbol, error = %e, "target cancel failed during force-close");
            }
        }
        if let Some(id) = &stop_id {
            if let Err(e) = self.broker.cancel(id).await {
                warn!(symbol, error = %e, "stop cancel failed during force-close");
            }
        }

        // A leg that filled before the cancel landed already closed the
        // position; a market order on top would open a fresh one.
        if let Some(id) = &stop_id {
            if let Ok(snap) = self.broker.order_status(id).await {
                if snap.status == OrderStatus::Filled {
                    let price = snap
                        .filled_avg_price
                        .unwrap_or_else(|| pos_arc.lock().current_stop_price);
                    self.finalize_exit(&pos_arc, ExitKind::Stop, price, now);
                    return;
                }
            }
        }
        if let Some(id) = &target_id {
            if let Ok(snap) = self.broker.order_status(id).await {
                if snap.status == OrderStatus::Filled {
                    let price = snap
                        .filled_avg_price
                        .unwrap_or_else(|| pos_arc.lock().target_price);
                    self.finalize_exit(&pos_arc, ExitKind::Target, price, now);
                    return;
                }
            }
        }

        // 2. Market out the full size.
        match self.broker.submit_market(symbol, side.exit_side(), size).await {
            Ok(close_id) => {
                let mut pos = pos_arc.lock();
                pos.close_order_id = Some(close_id);
                pos.state = PositionState::Closing;
                info!(symbol, kind = ?kind, "force-close submitted, position closing");
            }
            Err(e) => {
                // Legs are cancelled but the position is still on. Flag loudly;
                // the next sweep or an operator close retries.
                error!(symbol, error = %e, "force-close market order failed, position unprotected");
                pos_arc.lock().replace_failures += 1;
            }
        }
    }

    /// The cutoff sweep: force-close every managed position. Runs to
    /// completion; a failure on one symbol never skips the rest.
    pub async fn force_close_all(&self, now: DateTime<Utc>) {
        let symbols = self.ledger.open_symbols();
        info!(count = symbols.len(), "cutoff sweep starting");
        for symbol in symbols {
            self.force_close(&symbol, ExitKind::ForceClose, now).await;
        }
    }

    // -------------------------------------------------------------------------
    // Exit bookkeeping
    // -------------------------------------------------------------------------

    /// Terminal confirmation: record PnL, arm the cooldown on stop-outs, and
    /// retire the position.
    fn finalize_exit(
        &self,
        pos_arc: &Arc<Mutex<ManagedPosition>>,
        kind: ExitKind,
        exit_price: f64,
        now: DateTime<Utc>,
    ) {
        let (symbol, side, size, pnl, parent_id) = {
            let mut pos = pos_arc.lock();
            if pos.state == PositionState::Closed {
                return;
            }
            let pnl = pos.dollar_profit(exit_price);
            pos.exit = Some(ExitRecord {
                kind,
                price: exit_price,
                realized_pnl: pnl,
            });
            pos.state = PositionState::Closed;
            (
                pos.symbol.clone(),
                pos.side,
                pos.size_shares,
                pnl,
                pos.parent_order_id.clone(),
            )
        };

        // Only a genuine stop-leg fill arms the whipsaw cooldown.
        if kind == ExitKind::Stop {
            self.ledger.record_stop_out(&symbol, now);
        }
        let daily = self.ledger.record_exit(&symbol, pnl);

        self.journal.record(TradeEvent {
            ts: now,
            symbol: symbol.clone(),
            side,
            size,
            price: exit_price,
            fees: 0.0,
            realized_pnl: Some(pnl),
            event_kind: match kind {
                ExitKind::ForceClose => EventKind::ForceClose,
                _ => EventKind::Exit,
            },
            parent_order_id: Some(parent_id),
        });

        info!(
            symbol,
            kind = ?kind,
            exit_price,
            trade_pnl = pnl,
            daily_pnl = daily,
            "position closed"
        );
    }
}

impl std::fmt::Debug for PositionManager {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PositionManager")
            .field("open_positions", &self.ledger.open_count())
            .finish()
    }
}

// =============================================================================
// Tests — scenario simulations against the paper broker
// =============================================================================
#[cfg(test)]
mod tests {
    use super::*;
    use crate::broker::{BracketRequest, EntryType, PaperBroker};
    use crate::clock::MarketClock;
    use crate::journal::MemoryJournal;
    use crate::runtime_config::RuntimeConfig;
    use crate::strategy::SetupKind;
    use chrono::TimeZone;

    struct Rig {
        broker: Arc<PaperBroker>,
        ledger: Arc<DayLedger>,
        journal: Arc<MemoryJournal>,
        manager: PositionManager,
        trail: TrailParams,
        now: DateTime<Utc>,
    }

    impl Rig {
        fn new() -> Self {
            let cfg = RuntimeConfig::default();
            let clock = MarketClock::from_config(&cfg).unwrap();
            // Wednesday 2026-07-01 12:00 New York.
            let now = Utc.with_ymd_and_hms(2026, 7, 1, 16, 0, 0).unwrap();
            let broker = Arc::new(PaperBroker::new(100_000.0, 200_000.0));
            let ledger = Arc::new(DayLedger::new(clock, now));
            let journal = Arc::new(MemoryJournal::new());
            let manager = PositionManager::new(broker.clone(), ledger.clone(), journal.clone());
            Self {
                broker,
                ledger,
                journal,
                manager,
                trail: cfg.trail,
                now,
            }
        }

        /// Submit a bracket, register it, and step once at the entry price
        /// so the fill is observed.
        async fn open(&mut self, setup: &Setup) -> Arc<Mutex<ManagedPosition>> {
            self.broker.observe_price(&setup.symbol, setup.entry_price);
            let parent = self
                .broker
                .submit_bracket(BracketRequest {
                    symbol: setup.symbol.clone(),
                    side: setup.side.entry_side(),
                    qty: setup.size_shares,
                    entry: EntryType::Market,
                    stop_price: setup.stop_price,
                    target_price: setup.target_price,
                    client_order_id: None,
                })
                .await
                .unwrap();
            assert!(self.manager.register(setup, parent, self.now));
            self.tick(&setup.symbol, setup.entry_price).await;
            let pos = self.ledger.position(&setup.symbol).unwrap();
            assert_eq!(pos.lock().state, PositionState::OpenInitial);
            pos
        }

        /// Advance the clock and run one monitor step at `last`.
        async fn tick(&mut self, symbol: &str, last: f64) {
            self.now += chrono::Duration::seconds(1);
            self.manager.step(symbol, last, self.now, &self.trail).await;
        }

        /// A monitor step `delta_s` later.
        async fn tick_at(&mut self, symbol: &str, last: f64, delta_s: i64) {
            self.now += chrono::Duration::seconds(delta_s);
            self.manager.step(symbol, last, self.now, &self.trail).await;
        }
    }

    fn long_setup(symbol: &str, entry: f64, size: u32, stop_distance: f64, target_mult: f64) -> Setup {
        Setup {
            symbol: symbol.to_string(),
            side: Side::Long,
            entry_price: entry,
            stop_price: entry - stop_distance,
            target_price: entry + target_mult * stop_distance,
            size_shares: size,
            risk_dollars: stop_distance * size as f64,
            stop_distance_dollars: stop_distance,
            signal_strength: 8,
            setup_kind: SetupKind::GapContinuationLong,
        }
    }

    // ── S1: clean winner climbing the tier ladder ─────────────────────────

    #[tokio::test]
    async fn s1_tier_ladder_and_stop_exit() {
        let mut rig = Rig::new();
        // AAPL long, 50 shares at 100.00, stop distance 1.50, target 103.75.
        let setup = long_setup("AAPL", 100.0, 50, 1.5, 2.5);
        let pos = rig.open(&setup).await;
        assert!((pos.lock().current_stop_price - 98.5).abs() < 1e-9);

        let mut stop_history = vec![pos.lock().current_stop_price];

        // 101.00: profit $50 -> breakeven.
        rig.tick("AAPL", 101.0).await;
        assert_eq!(pos.lock().state, PositionState::OpenBreakeven);
        assert!((pos.lock().current_stop_price - 100.0).abs() < 1e-9);
        stop_history.push(pos.lock().current_stop_price);

        // 102.00: profit $100, lock $50, stop 100 + 50/50 = 101.00.
        rig.tick("AAPL", 102.0).await;
        assert_eq!(pos.lock().state, PositionState::OpenTierLocked);
        assert!((pos.lock().current_stop_price - 101.0).abs() < 1e-9);
        stop_history.push(pos.lock().current_stop_price);

        // 103.00: profit $150, lock 50*floor(120/50) = $100, stop 102.00.
        rig.tick("AAPL", 103.0).await;
        assert!((pos.lock().current_stop_price - 102.0).abs() < 1e-9);
        assert!((pos.lock().locked_profit_dollars - 100.0).abs() < 1e-9);
        stop_history.push(pos.lock().current_stop_price);

        // 102.80: retrace above the stop, nothing moves, no exit.
        rig.tick("AAPL", 102.8).await;
        assert_eq!(pos.lock().state, PositionState::OpenTierLocked);
        assert!((pos.lock().current_stop_price - 102.0).abs() < 1e-9);
        stop_history.push(pos.lock().current_stop_price);

        // 102.00: stop fires, exit at 102, PnL (102-100)*50 = $100.
        rig.tick("AAPL", 102.0).await;
        let p = pos.lock();
        assert_eq!(p.state, PositionState::Closed);
        let exit = p.exit.as_ref().unwrap();
        assert_eq!(exit.kind, ExitKind::Stop);
        assert!((exit.price - 102.0).abs() < 1e-9);
        assert!((exit.realized_pnl - 100.0).abs() < 1e-9);
        drop(p);

        // P1: the stored stop never moved down.
        assert!(stop_history.windows(2).all(|w| w[1] >= w[0] - 1e-9));

        assert!((rig.ledger.realized_pnl() - 100.0).abs() < 1e-9);
        assert_eq!(rig.ledger.open_count(), 0);
    }

    #[tokio::test]
    async fn single_tick_jump_passes_through_breakeven() {
        let mut rig = Rig::new();
        // AAPL long, 50 shares at 100.00, stop 98.50, target 103.75.
        let setup = long_setup("AAPL", 100.0, 50, 1.5, 2.5);
        let pos = rig.open(&setup).await;
        assert_eq!(pos.lock().state, PositionState::OpenInitial);

        // First monitoring tick gaps straight to 103.00: peak profit $150 is
        // past the $80 tier floor, but the only edge out of OpenInitial is
        // the breakeven one.
        rig.tick("AAPL", 103.0).await;
        {
            let p = pos.lock();
            assert_eq!(p.state, PositionState::OpenBreakeven);
            assert!((p.current_stop_price - 100.0).abs() < 1e-9);
            assert!((p.locked_profit_dollars - 0.0).abs() < 1e-9);
        }

        // The next tick takes the earned tier: lock 50*floor(120/50) = $100,
        // stop 100 + 100/50 = 102.00.
        rig.tick("AAPL", 103.0).await;
        {
            let p = pos.lock();
            assert_eq!(p.state, PositionState::OpenTierLocked);
            assert!((p.current_stop_price - 102.0).abs() < 1e-9);
            assert!((p.locked_profit_dollars - 100.0).abs() < 1e-9);
        }
    }

    // ── S2: quick-profit override ─────────────────────────────────────────

    #[tokio::test]
    async fn s2_quick_profit_breakeven() {
        let mut rig = Rig::new();
        // TSLA long, 40 shares at 250.00.
        let setup = long_setup("TSLA", 250.0, 40, 3.0, 2.5);
        let pos = rig.open(&setup).await;
        assert_eq!(pos.lock().state, PositionState::OpenInitial);

        // t=120s, last 250.55: profit $22 >= $20 inside the 600 s window.
        rig.tick_at("TSLA", 250.55, 119).await;
        let p = pos.lock();
        assert_eq!(p.state, PositionState::OpenBreakeven);
        assert!((p.current_stop_price - 250.0).abs() < 1e-9);
    }

    #[tokio::test]
    async fn quick_profit_expires_with_window() {
        let mut rig = Rig::new();
        let setup = long_setup("TSLA", 250.0, 40, 3.0, 2.5);
        let pos = rig.open(&setup).await;

        // Same $22 profit but 11 minutes in: peak $22 >= $15 still earns the
        // plain breakeven tier, so drive a smaller profit first to pin the
        // distinction: $12 profit, no lock either way.
        rig.tick_at("TSLA", 250.30, 660).await;
        assert_eq!(pos.lock().state, PositionState::OpenInitial);
    }

    // ── P2: no exit from OpenInitial under the threshold ─────────────────

    #[tokio::test]
    async fn p2_stays_initial_below_threshold() {
        let mut rig = Rig::new();
        let setup = long_setup("AAPL", 100.0, 50, 1.5, 2.5);
        let pos = rig.open(&setup).await;

        // Profit peaks at $14.50 (last 100.29), never $15, never quick-fire.
        for last in [100.1, 100.2, 100.29, 100.15, 100.05] {
            rig.tick_at("AAPL", last, 700).await;
            assert_eq!(pos.lock().state, PositionState::OpenInitial);
            assert!((pos.lock().current_stop_price - 98.5).abs() < 1e-9);
        }
    }

    // ── S3: noise-protected loser ─────────────────────────────────────────

    #[tokio::test]
    async fn s3_noise_protected_stop_out() {
        let mut rig = Rig::new();
        // PFE long, 400 shares at 24.65, stop distance 0.30 -> stop 24.35.
        let setup = long_setup("PFE", 24.65, 400, 0.30, 2.5);
        let pos = rig.open(&setup).await;

        // Dip to 24.55: above the stop, no exit, no movement.
        rig.tick("PFE", 24.55).await;
        assert_eq!(pos.lock().state, PositionState::OpenInitial);

        // 24.35: stop fires. PnL = (24.35 - 24.65) * 400 = -$120.
        rig.tick("PFE", 24.35).await;
        let p = pos.lock();
        assert_eq!(p.state, PositionState::Closed);
        let exit = p.exit.as_ref().unwrap();
        assert_eq!(exit.kind, ExitKind::Stop);
        assert!((exit.realized_pnl + 120.0).abs() < 1e-9);
        drop(p);

        // P4 precondition: the stop-out armed the cooldown.
        let cfg = RuntimeConfig::default();
        assert!(!rig.ledger.is_eligible("PFE", &cfg, rig.now));
    }

    // ── Target exit leaves no cooldown ────────────────────────────────────

    #[tokio::test]
    async fn target_exit_skips_cooldown() {
        let mut rig = Rig::new();
        let setup = long_setup("AAPL", 100.0, 50, 1.5, 2.5);
        let pos = rig.open(&setup).await;

        rig.tick("AAPL", 104.0).await;
        let p = pos.lock();
        assert_eq!(p.state, PositionState::Closed);
        let exit = p.exit.as_ref().unwrap();
        assert_eq!(exit.kind, ExitKind::Target);
        assert!((exit.price - 103.75).abs() < 1e-9);
        drop(p);

        let cfg = RuntimeConfig::default();
        assert!(rig.ledger.is_eligible("AAPL", &cfg, rig.now));
    }

    // ── Short side mirror ─────────────────────────────────────────────────

    #[tokio::test]
    async fn short_tier_ladder_descends() {
        let mut rig = Rig::new();
        let setup = Setup {
            symbol: "TSLA".to_string(),
            side: Side::Short,
            entry_price: 250.0,
            stop_price: 253.0,
            target_price: 242.5,
            size_shares: 40,
            risk_dollars: 120.0,
            stop_distance_dollars: 3.0,
            signal_strength: 8,
            setup_kind: SetupKind::GapContinuationShort,
        };
        let pos = rig.open(&setup).await;

        // Down 0.50 = $20 profit after 20 minutes: breakeven tier not yet
        // ($20 >= $15 -> breakeven). Stop descends to entry.
        rig.tick_at("TSLA", 249.5, 1260).await;
        assert_eq!(pos.lock().state, PositionState::OpenBreakeven);
        assert!((pos.lock().current_stop_price - 250.0).abs() < 1e-9);

        // Down 2.50 = $100 profit: lock $50, stop 250 - 50/40 = 248.75.
        rig.tick("TSLA", 247.5).await;
        assert_eq!(pos.lock().state, PositionState::OpenTierLocked);
        assert!((pos.lock().current_stop_price - 248.75).abs() < 1e-9);

        // Rally back through the stop: exit at 248.75, pnl (250-248.75)*40 = $50.
        rig.tick("TSLA", 248.8).await;
        let p = pos.lock();
        assert_eq!(p.state, PositionState::Closed);
        assert!((p.exit.as_ref().unwrap().realized_pnl - 50.0).abs() < 1e-9);
    }

    // ── S4: force-close at cutoff ─────────────────────────────────────────

    #[tokio::test]
    async fn s4_force_close_sweep() {
        let mut rig = Rig::new();
        let aapl = long_setup("AAPL", 100.0, 50, 1.5, 2.5);
        let tsla = long_setup("TSLA", 250.0, 40, 3.0, 2.5);
        let pos_a = rig.open(&aapl).await;
        let pos_t = rig.open(&tsla).await;

        rig.now += chrono::Duration::seconds(1);
        rig.manager.force_close_all(rig.now).await;

        assert_eq!(pos_a.lock().state, PositionState::Closing);
        assert_eq!(pos_t.lock().state, PositionState::Closing);

        // The close orders filled instantly against the current marks; the
        // next monitor tick confirms and records both exits.
        rig.tick("AAPL", 100.0).await;
        rig.tick("TSLA", 250.0).await;

        assert_eq!(pos_a.lock().state, PositionState::Closed);
        assert_eq!(pos_t.lock().state, PositionState::Closed);
        assert_eq!(pos_a.lock().exit.as_ref().unwrap().kind, ExitKind::ForceClose);
        assert_eq!(rig.ledger.open_count(), 0);

        // No cooldown from a force-close.
        let cfg = RuntimeConfig::default();
        assert!(rig.ledger.is_eligible("AAPL", &cfg, rig.now));

        // And no further replaces: a later tick on a closed position is a
        // no-op.
        rig.tick("AAPL", 105.0).await;
        assert_eq!(pos_a.lock().state, PositionState::Closed);
    }

    #[tokio::test]
    async fn force_close_awaiting_fill_cancels_entry() {
        let mut rig = Rig::new();
        let setup = long_setup("AAPL", 100.0, 50, 1.5, 2.5);
        // Submit without a mark so the entry stays pending.
        let parent = rig
            .broker
            .submit_bracket(BracketRequest {
                symbol: "AAPL".to_string(),
                side: Side::Long.entry_side(),
                qty: 50,
                entry: EntryType::Market,
                stop_price: 98.5,
                target_price: 103.75,
                client_order_id: None,
            })
            .await
            .unwrap();
        rig.manager.register(&setup, parent.clone(), rig.now);

        rig.manager
            .force_close("AAPL", ExitKind::ForceClose, rig.now)
            .await;

        assert_eq!(rig.ledger.open_count(), 0);
        let snap = rig.broker.order_status(&parent).await.unwrap();
        assert_eq!(snap.status, OrderStatus::Canceled);
    }

    // ── Stop-replace partial failure handling ─────────────────────────────

    #[tokio::test]
    async fn transient_replace_retries_within_tick() {
        let mut rig = Rig::new();
        let setup = long_setup("AAPL", 100.0, 50, 1.5, 2.5);
        let pos = rig.open(&setup).await;

        rig.broker.inject_replace_fault(BrokerError::Transient("flap".into()));
        rig.broker.inject_replace_fault(BrokerError::Transient("flap".into()));

        rig.tick("AAPL", 101.0).await;
        // Two transient failures then success: the stop still upgraded.
        assert_eq!(pos.lock().state, PositionState::OpenBreakeven);
        assert!((pos.lock().current_stop_price - 100.0).abs() < 1e-9);
    }

    #[tokio::test]
    async fn exhausted_transients_keep_prior_stop_then_recover() {
        let mut rig = Rig::new();
        let setup = long_setup("AAPL", 100.0, 50, 1.5, 2.5);
        let pos = rig.open(&setup).await;

        for _ in 0..3 {
            rig.broker.inject_replace_fault(BrokerError::Transient("down".into()));
        }

        rig.tick("AAPL", 101.0).await;
        // Budget spent: prior stop stands, state unchanged.
        assert_eq!(pos.lock().state, PositionState::OpenInitial);
        assert!((pos.lock().current_stop_price - 98.5).abs() < 1e-9);
        assert_eq!(pos.lock().replace_failures, 1);

        // Next tick succeeds and catches up.
        rig.tick("AAPL", 101.0).await;
        assert_eq!(pos.lock().state, PositionState::OpenBreakeven);
        assert!((pos.lock().current_stop_price - 100.0).abs() < 1e-9);
    }

    #[tokio::test]
    async fn rejected_replace_keeps_stored_price() {
        let mut rig = Rig::new();
        let setup = long_setup("AAPL", 100.0, 50, 1.5, 2.5);
        let pos = rig.open(&setup).await;

        rig.broker.inject_replace_fault(BrokerError::Rejected("nope".into()));

        rig.tick("AAPL", 101.0).await;
        assert_eq!(pos.lock().state, PositionState::OpenInitial);
        assert!((pos.lock().current_stop_price - 98.5).abs() < 1e-9);
        assert_eq!(pos.lock().replace_failures, 1);
    }

    #[tokio::test]
    async fn already_terminal_replace_moves_to_closing() {
        let mut rig = Rig::new();
        let setup = long_setup("AAPL", 100.0, 50, 1.5, 2.5);
        let pos = rig.open(&setup).await;

        // The replace races a stop fill: broker says terminal.
        rig.broker.inject_replace_fault(BrokerError::AlreadyTerminal);
        rig.tick("AAPL", 101.0).await;
        assert_eq!(pos.lock().state, PositionState::Closing);

        // The stop then shows as filled; the closing step records a stop exit.
        rig.broker.observe_price("AAPL", 98.4);
        rig.tick("AAPL", 98.4).await;
        let p = pos.lock();
        assert_eq!(p.state, PositionState::Closed);
        assert_eq!(p.exit.as_ref().unwrap().kind, ExitKind::Stop);
    }

    // ── Journal trail ─────────────────────────────────────────────────────

    #[tokio::test]
    async fn journal_records_lifecycle() {
        let mut rig = Rig::new();
        let setup = long_setup("AAPL", 100.0, 50, 1.5, 2.5);
        rig.open(&setup).await;
        rig.tick("AAPL", 101.0).await; // breakeven replace
        rig.tick("AAPL", 104.0).await; // target exit

        let kinds: Vec<EventKind> = rig.journal.events().iter().map(|e| e.event_kind).collect();
        assert_eq!(
            kinds,
            vec![EventKind::EntryFilled, EventKind::StopReplaced, EventKind::Exit]
        );
        let exit = rig.journal.events().pop().unwrap();
        assert!((exit.realized_pnl.unwrap() - 187.5).abs() < 1e-9);
    }

    // ── P1 randomized: stop monotone under noisy prices ───────────────────

    #[tokio::test]
    async fn p1_randomized_monotonicity() {
        let mut rig = Rig::new();
        let setup = long_setup("AAPL", 100.0, 50, 1.5, 2.5);
        let pos = rig.open(&setup).await;

        // Deterministic pseudo-random walk (LCG), bounded inside the bracket.
        let mut x: u64 = 0x2545F4914F6CDD1D;
        let mut last_stop = pos.lock().current_stop_price;
        for _ in 0..200 {
            x = x.wrapping_mul(6364136223846793005).wrapping_add(1442695040888963407);
            let noise = ((x >> 33) % 200) as f64 / 100.0 - 1.0; // [-1.0, 1.0)
            let price = 101.5 + noise; // stays above any reachable stop
            rig.tick("AAPL", price).await;

            let p = pos.lock();
            if p.state == PositionState::Closed {
                break;
            }
            assert!(
                p.current_stop_price >= last_stop - 1e-9,
                "stop moved down: {} -> {}",
                last_stop,
                p.current_stop_price
            );
            last_stop = p.current_stop_price;
        }
    }
}
