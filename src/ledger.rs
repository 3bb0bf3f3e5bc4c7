// =============================================================================
// Day Ledger — the single shared mutable object of the engine
// =============================================================================
//
// Tracks everything that must be consistent across concurrent admission
// decisions: realized PnL, the filled-trade count, per-symbol stop-out
// times, pending entry locks, and the map of managed positions.
//
// Every method is a single invariant-preserving transition taken under one
// mutex. The mutex is held only for counter reads/updates and map
// membership, never across a broker call. Daily counters reset automatically
// when the market-local date rolls over.
// =============================================================================

use std::collections::HashMap;
use std::sync::Arc;

use chrono::{DateTime, NaiveDate, Utc};
use parking_lot::Mutex;
use tracing::{info, warn};

use crate::clock::MarketClock;
use crate::position::ManagedPosition;
use crate::risk::RejectReason;
use crate::runtime_config::RuntimeConfig;

struct LedgerDay {
    trading_date: NaiveDate,
    realized_pnl: f64,
    filled_trade_count: u32,
    stop_out_times: HashMap<String, DateTime<Utc>>,
    pending_entry_locks: HashMap<String, DateTime<Utc>>, // value = expiry
    open_positions: HashMap<String, Arc<Mutex<ManagedPosition>>>,
}

impl LedgerDay {
    fn fresh(date: NaiveDate) -> Self {
        Self {
            trading_date: date,
            realized_pnl: 0.0,
            filled_trade_count: 0,
            stop_out_times: HashMap::new(),
            pending_entry_locks: HashMap::new(),
            open_positions: HashMap::new(),
        }
    }
}

/// Serialisable summary for the dashboard.
#[derive(Debug, Clone, serde::Serialize)]
pub struct LedgerSnapshot {
    pub trading_date: NaiveDate,
    pub realized_pnl: f64,
    pub filled_trade_count: u32,
    pub open_symbols: Vec<String>,
    pub cooldown_symbols: Vec<String>,
    pub circuit_tripped: bool,
}

/// Thread-safe daily ledger.
pub struct DayLedger {
    clock: MarketClock,
    inner: Mutex<LedgerDay>,
}

impl DayLedger {
    pub fn new(clock: MarketClock, now: DateTime<Utc>) -> Self {
        let date = clock.local_date(now);
        Self {
            clock,
            inner: Mutex::new(LedgerDay::fresh(date)),
        }
    }

    /// Reset daily counters if the market-local date has changed. Open
    /// positions survive a rollover: they still need managing until closed.
    pub fn roll_if_needed(&self, now: DateTime<Utc>) {
        let today = self.clock.local_date(now);
        let mut day = self.inner.lock();
        if day.trading_date == today {
            return;
        }

        info!(
            old_date = %day.trading_date,
            new_date = %today,
            realized_pnl = day.realized_pnl,
            trades = day.filled_trade_count,
            "date rolled, archiving daily ledger"
        );

        let carried = std::mem::take(&mut day.open_positions);
        *day = LedgerDay::fresh(today);
        day.open_positions = carried;
    }

    /// Seed today's tallies from journal replay after a restart.
    pub fn seed(&self, realized_pnl: f64, filled_trade_count: u32) {
        let mut day = self.inner.lock();
        day.realized_pnl = realized_pnl;
        day.filled_trade_count = filled_trade_count;
        info!(realized_pnl, filled_trade_count, "ledger seeded from journal replay");
    }

    // -------------------------------------------------------------------------
    // Admission (risk gate checks 3-7, evaluated in this exact order)
    // -------------------------------------------------------------------------

    /// Counter-based admission checks under one consistent snapshot:
    /// concurrency cap, dynamic trade cap, daily loss breaker, stop-out
    /// cooldown, pending entry lock. First failure wins.
    pub fn try_admit(
        &self,
        symbol: &str,
        cfg: &RuntimeConfig,
        now: DateTime<Utc>,
    ) -> Result<(), RejectReason> {
        let mut day = self.inner.lock();

        if day.open_positions.len() >= cfg.max_concurrent {
            return Err(RejectReason::MaxConcurrent {
                open: day.open_positions.len(),
                max: cfg.max_concurrent,
            });
        }
        if day.open_positions.contains_key(symbol) {
            return Err(RejectReason::AlreadyManaged);
        }

        let cap = if day.realized_pnl <= 0.0 {
            cfg.trade_cap_losing
        } else {
            cfg.trade_cap_winning
        };
        if day.filled_trade_count >= cap {
            return Err(RejectReason::TradeCap {
                count: day.filled_trade_count,
                cap,
            });
        }

        if day.realized_pnl <= -cfg.daily_loss_limit {
            return Err(RejectReason::DailyLossBreaker {
                realized: day.realized_pnl,
                limit: cfg.daily_loss_limit,
            });
        }

        if let Some(stopped_at) = day.stop_out_times.get(symbol) {
            let elapsed = (now - *stopped_at).num_seconds();
            if elapsed <= cfg.stop_out_cooldown_s as i64 {
                return Err(RejectReason::Cooldown {
                    remaining_s: cfg.stop_out_cooldown_s as i64 - elapsed,
                });
            }
        }

        // Pending locks are cleaned lazily on expiry.
        if let Some(expiry) = day.pending_entry_locks.get(symbol).copied() {
            if now < expiry {
                return Err(RejectReason::PendingLock);
            }
            day.pending_entry_locks.remove(symbol);
        }

        Ok(())
    }

    /// Scanner pre-filter: managed, cooling down, or entry-locked symbols
    /// are not worth evaluating this tick.
    pub fn is_eligible(&self, symbol: &str, cfg: &RuntimeConfig, now: DateTime<Utc>) -> bool {
        let mut day = self.inner.lock();

        if day.open_positions.contains_key(symbol) {
            return false;
        }
        if let Some(stopped_at) = day.stop_out_times.get(symbol) {
            if (now - *stopped_at).num_seconds() <= cfg.stop_out_cooldown_s as i64 {
                return false;
            }
        }
        if let Some(expiry) = day.pending_entry_locks.get(symbol).copied() {
            if now < expiry {
                return false;
            }
            day.pending_entry_locks.remove(symbol);
        }
        true
    }

    // -------------------------------------------------------------------------
    // Transitions
    // -------------------------------------------------------------------------

    /// Move a freshly submitted position into the managed map. One managed
    /// position per symbol: a duplicate registration is refused.
    pub fn register_open(&self, symbol: &str, position: Arc<Mutex<ManagedPosition>>) -> bool {
        let mut day = self.inner.lock();
        if day.open_positions.contains_key(symbol) {
            warn!(symbol, "refusing duplicate managed position registration");
            return false;
        }
        day.open_positions.insert(symbol.to_string(), position);
        true
    }

    /// Count an observed entry fill toward the dynamic trade cap.
    pub fn note_fill(&self, symbol: &str) {
        let mut day = self.inner.lock();
        day.filled_trade_count += 1;
        info!(symbol, filled_trade_count = day.filled_trade_count, "entry fill counted");
    }

    /// Remove a position from the managed map and fold its realized PnL into
    /// the day. Returns the updated daily realized PnL.
    pub fn record_exit(&self, symbol: &str, realized_pnl: f64) -> f64 {
        let mut day = self.inner.lock();
        if day.open_positions.remove(symbol).is_none() {
            warn!(symbol, "exit recorded for a symbol that was not managed");
        }
        day.realized_pnl += realized_pnl;
        info!(
            symbol,
            trade_pnl = realized_pnl,
            daily_pnl = day.realized_pnl,
            "exit recorded"
        );
        day.realized_pnl
    }

    /// Drop a position that never filled (entry rejected, cancelled, or
    /// expired). No PnL, no trade count.
    pub fn discard(&self, symbol: &str) {
        let mut day = self.inner.lock();
        if day.open_positions.remove(symbol).is_some() {
            info!(symbol, "unfilled position discarded");
        }
    }

    /// Start the cooldown window after a stop-leg fill.
    pub fn record_stop_out(&self, symbol: &str, now: DateTime<Utc>) {
        let mut day = self.inner.lock();
        day.stop_out_times.insert(symbol.to_string(), now);
        warn!(symbol, "stop-out recorded, cooldown active");
    }

    /// Arm the short-TTL dedup lock at entry submit time.
    pub fn lock_entry(&self, symbol: &str, cfg: &RuntimeConfig, now: DateTime<Utc>) {
        let expiry = now + chrono::Duration::seconds(cfg.pending_entry_lock_s as i64);
        self.inner
            .lock()
            .pending_entry_locks
            .insert(symbol.to_string(), expiry);
    }

    /// Drop the dedup lock early (submit rejected, nothing in flight).
    pub fn release_entry_lock(&self, symbol: &str) {
        self.inner.lock().pending_entry_locks.remove(symbol);
    }

    // -------------------------------------------------------------------------
    // Queries
    // -------------------------------------------------------------------------

    pub fn position(&self, symbol: &str) -> Option<Arc<Mutex<ManagedPosition>>> {
        self.inner.lock().open_positions.get(symbol).cloned()
    }

    pub fn open_symbols(&self) -> Vec<String> {
        self.inner.lock().open_positions.keys().cloned().collect()
    }

    pub fn open_count(&self) -> usize {
        self.inner.lock().open_positions.len()
    }

    pub fn realized_pnl(&self) -> f64 {
        self.inner.lock().realized_pnl
    }

    pub fn filled_trade_count(&self) -> u32 {
        self.inner.lock().filled_trade_count
    }

    /// True once the daily loss circuit has tripped. Entries stop; open
    /// positions continue to be managed.
    pub fn circuit_tripped(&self, cfg: &RuntimeConfig) -> bool {
        self.inner.lock().realized_pnl <= -cfg.daily_loss_limit
    }

    pub fn snapshot(&self, cfg: &RuntimeConfig, now: DateTime<Utc>) -> LedgerSnapshot {
        let day = self.inner.lock();
        let cooldown_symbols = day
            .stop_out_times
            .iter()
            .filter(|(_, t)| (now - **t).num_seconds() <= cfg.stop_out_cooldown_s as i64)
            .map(|(s, _)| s.clone())
            .collect();
        LedgerSnapshot {
            trading_date: day.trading_date,
            realized_pnl: day.realized_pnl,
            filled_trade_count: day.filled_trade_count,
            open_symbols: day.open_positions.keys().cloned().collect(),
            cooldown_symbols,
            circuit_tripped: day.realized_pnl <= -cfg.daily_loss_limit,
        }
    }
}

impl std::fmt::Debug for DayLedger {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let day = self.inner.lock();
        f.debug_struct("DayLedger")
            .field("trading_date", &day.trading_date)
            .field("realized_pnl", &day.realized_pnl)
            .field("filled_trade_count", &day.filled_trade_count)
            .field("open_positions", &day.open_positions.len())
            .finish()
    }
}

// =============================================================================
// Tests
// =============================================================================
#[cfg(test)]
mod tests {
    use super::*;
    use crate::position::tests::managed_long;
    use chrono::TimeZone;

    fn ledger_at(now: DateTime<Utc>) -> (DayLedger, RuntimeConfig) {
        let cfg = RuntimeConfig::default();
        let clock = MarketClock::from_config(&cfg).unwrap();
        (DayLedger::new(clock, now), cfg)
    }

    /// Wednesday 2026-07-01, New York afternoon (UTC-4).
    fn noon() -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2026, 7, 1, 16, 0, 0).unwrap()
    }

    #[test]
    fn admit_clean_symbol() {
        let (ledger, cfg) = ledger_at(noon());
        assert!(ledger.try_admit("AAPL", &cfg, noon()).is_ok());
    }

    #[test]
    fn concurrency_cap_enforced() {
        let (ledger, cfg) = ledger_at(noon());
        for sym in ["A", "B", "C", "D", "E"] {
            assert!(ledger.register_open(sym, managed_long(sym, 100.0, 10)));
        }
        assert!(matches!(
            ledger.try_admit("F", &cfg, noon()),
            Err(RejectReason::MaxConcurrent { open: 5, max: 5 })
        ));
    }

    #[test]
    fn duplicate_symbol_refused() {
        let (ledger, cfg) = ledger_at(noon());
        assert!(ledger.register_open("AAPL", managed_long("AAPL", 100.0, 10)));
        assert!(!ledger.register_open("AAPL", managed_long("AAPL", 100.0, 10)));
        assert!(matches!(
            ledger.try_admit("AAPL", &cfg, noon()),
            Err(RejectReason::AlreadyManaged)
        ));
    }

    #[test]
    fn dynamic_trade_cap() {
        let (ledger, cfg) = ledger_at(noon());

        for _ in 0..10 {
            ledger.note_fill("X");
        }
        // Flat PnL: cap is 10, the 11th entry is refused.
        assert!(matches!(
            ledger.try_admit("AAPL", &cfg, noon()),
            Err(RejectReason::TradeCap { count: 10, cap: 10 })
        ));

        // A losing day keeps the cap at 10.
        ledger.record_exit("X", -50.0);
        assert!(matches!(
            ledger.try_admit("AAPL", &cfg, noon()),
            Err(RejectReason::TradeCap { cap: 10, .. })
        ));

        // A winner lifts realized PnL above zero; cap becomes 20.
        ledger.record_exit("Y", 55.0);
        assert!(ledger.try_admit("AAPL", &cfg, noon()).is_ok());
    }

    #[test]
    fn daily_loss_breaker() {
        let (ledger, cfg) = ledger_at(noon());
        ledger.record_exit("X", -600.0);
        assert!(ledger.circuit_tripped(&cfg));
        assert!(matches!(
            ledger.try_admit("AAPL", &cfg, noon()),
            Err(RejectReason::DailyLossBreaker { .. })
        ));
    }

    #[test]
    fn cooldown_boundary_is_strict() {
        let (ledger, cfg) = ledger_at(noon());
        let stop_out = noon();
        ledger.record_stop_out("NET", stop_out);

        // 4 minutes later: rejected.
        let at_4m = stop_out + chrono::Duration::seconds(240);
        assert!(matches!(
            ledger.try_admit("NET", &cfg, at_4m),
            Err(RejectReason::Cooldown { .. })
        ));

        // Exactly 20 minutes: still rejected (strictly greater required).
        let at_20m = stop_out + chrono::Duration::seconds(1200);
        assert!(matches!(
            ledger.try_admit("NET", &cfg, at_20m),
            Err(RejectReason::Cooldown { .. })
        ));

        // One second past the window: admitted.
        let past = stop_out + chrono::Duration::seconds(1201);
        assert!(ledger.try_admit("NET", &cfg, past).is_ok());
    }

    #[test]
    fn pending_lock_expires_lazily() {
        let (ledger, cfg) = ledger_at(noon());
        ledger.lock_entry("AAPL", &cfg, noon());

        assert!(matches!(
            ledger.try_admit("AAPL", &cfg, noon() + chrono::Duration::seconds(10)),
            Err(RejectReason::PendingLock)
        ));

        // Past expiry the lock is dropped and admission proceeds.
        let later = noon() + chrono::Duration::seconds(301);
        assert!(ledger.try_admit("AAPL", &cfg, later).is_ok());
    }

    #[test]
    fn release_entry_lock_frees_symbol() {
        let (ledger, cfg) = ledger_at(noon());
        ledger.lock_entry("AAPL", &cfg, noon());
        ledger.release_entry_lock("AAPL");
        assert!(ledger.try_admit("AAPL", &cfg, noon()).is_ok());
    }

    #[test]
    fn rollover_resets_counters_keeps_positions() {
        let (ledger, cfg) = ledger_at(noon());
        ledger.note_fill("A");
        ledger.record_exit("A", -100.0);
        ledger.record_stop_out("NET", noon());
        assert!(ledger.register_open("AAPL", managed_long("AAPL", 100.0, 10)));

        // Next market-local day.
        let tomorrow = noon() + chrono::Duration::days(1);
        ledger.roll_if_needed(tomorrow);

        assert_eq!(ledger.filled_trade_count(), 0);
        assert!((ledger.realized_pnl() - 0.0).abs() < f64::EPSILON);
        assert!(ledger.try_admit("NET", &cfg, tomorrow).is_ok(), "cooldown cleared by rollover");
        assert_eq!(ledger.open_count(), 1, "open positions survive the rollover");
    }

    #[test]
    fn seed_restores_tallies() {
        let (ledger, cfg) = ledger_at(noon());
        ledger.seed(-250.0, 7);
        assert!((ledger.realized_pnl() + 250.0).abs() < f64::EPSILON);
        assert_eq!(ledger.filled_trade_count(), 7);
        assert!(!ledger.circuit_tripped(&cfg));
    }
}
