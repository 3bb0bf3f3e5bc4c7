// =============================================================================
// Risk Gate — ordered pre-trade checks, first failure wins
// =============================================================================
//
// Check order is part of the contract:
//   1. Entry window open (open + post-open delay, before the entry cutoff)
//   2. Force-close cutoff not reached
//   3. Open managed positions below the concurrency cap
//   4. Filled trade count below the dynamic cap (10 losing / 20 winning)
//   5. Daily realized loss above the circuit-breaker limit
//   6. Symbol not in stop-out cooldown
//   7. No pending entry lock for the symbol
//   8. Notional within the per-symbol cap and buying power
//
// Checks 3-7 are taken by the day ledger under one mutex so concurrent
// admissions observe a consistent snapshot.
// =============================================================================

use chrono::{DateTime, Utc};
use serde::Serialize;
use tracing::debug;

use crate::broker::AccountSnapshot;
use crate::clock::MarketClock;
use crate::ledger::DayLedger;
use crate::runtime_config::RuntimeConfig;
use crate::strategy::Setup;

/// Why a candidate setup was refused. Closed set; the scanner records the
/// reason in the decision audit trail.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub enum RejectReason {
    OutsideEntryWindow,
    CutoffActive,
    MaxConcurrent { open: usize, max: usize },
    AlreadyManaged,
    TradeCap { count: u32, cap: u32 },
    DailyLossBreaker { realized: f64, limit: f64 },
    Cooldown { remaining_s: i64 },
    PendingLock,
    NotionalCap { notional: f64, cap: f64 },
    InsufficientBuyingPower { notional: f64, buying_power: f64 },
}

impl std::fmt::Display for RejectReason {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::OutsideEntryWindow => write!(f, "outside entry window"),
            Self::CutoffActive => write!(f, "force-close cutoff active"),
            Self::MaxConcurrent { open, max } => {
                write!(f, "concurrent positions at cap ({open}/{max})")
            }
            Self::AlreadyManaged => write!(f, "symbol already has a managed position"),
            Self::TradeCap { count, cap } => write!(f, "daily trade cap reached ({count}/{cap})"),
            Self::DailyLossBreaker { realized, limit } => {
                write!(f, "daily loss breaker tripped ({realized:.2} vs -{limit:.2})")
            }
            Self::Cooldown { remaining_s } => {
                write!(f, "stop-out cooldown active ({remaining_s}s remaining)")
            }
            Self::PendingLock => write!(f, "pending entry lock"),
            Self::NotionalCap { notional, cap } => {
                write!(f, "notional {notional:.2} exceeds per-symbol cap {cap:.2}")
            }
            Self::InsufficientBuyingPower { notional, buying_power } => {
                write!(f, "notional {notional:.2} exceeds buying power {buying_power:.2}")
            }
        }
    }
}

/// Stateless gate over the clock, the ledger, and an account snapshot.
pub struct RiskGate {
    clock: MarketClock,
}

impl RiskGate {
    pub fn new(clock: MarketClock) -> Self {
        Self { clock }
    }

    /// Run all checks against a candidate setup. `Ok(())` admits the trade.
    pub fn evaluate(
        &self,
        setup: &Setup,
        ledger: &DayLedger,
        cfg: &RuntimeConfig,
        account: &AccountSnapshot,
        now: DateTime<Utc>,
    ) -> Result<(), RejectReason> {
        // 1. Entry window
        if !self.clock.entry_window_open(now) {
            return Err(RejectReason::OutsideEntryWindow);
        }

        // 2. Cutoff
        if self.clock.past_position_close(now) {
            return Err(RejectReason::CutoffActive);
        }

        // 3-7. Counter checks under the ledger mutex.
        ledger.try_admit(&setup.symbol, cfg, now)?;

        // 8. Notional caps.
        let notional = setup.entry_price * setup.size_shares as f64;
        if notional > cfg.strategy.per_symbol_notional_cap {
            return Err(RejectReason::NotionalCap {
                notional,
                cap: cfg.strategy.per_symbol_notional_cap,
            });
        }
        if notional > account.buying_power {
            return Err(RejectReason::InsufficientBuyingPower {
                notional,
                buying_power: account.buying_power,
            });
        }

        debug!(symbol = %setup.symbol, notional, "risk gate passed");
        Ok(())
    }
}
