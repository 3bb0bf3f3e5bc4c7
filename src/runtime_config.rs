// =============================================================================
// Runtime Configuration — Hot-reloadable engine settings with atomic save
// =============================================================================
//
// Central configuration hub for the Meridian engine. Every tunable parameter
// lives here so that the engine can be reconfigured at runtime without a
// restart.
//
// Persistence uses an atomic tmp + rename pattern to prevent corruption on
// crash. All fields carry `#[serde(default)]` so that adding new fields
// never breaks loading an older config file.
// =============================================================================

use std::path::Path;

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use tracing::info;

use crate::types::{AccountMode, TradingMode};

// =============================================================================
// Default-value helpers (required by serde `default = "..."` attribute)
// =============================================================================

fn default_watchlist() -> Vec<String> {
    vec![
        "AAPL".to_string(),
        "TSLA".to_string(),
        "NVDA".to_string(),
        "AMD".to_string(),
        "META".to_string(),
    ]
}

fn default_market_timezone() -> String {
    "America/New_York".to_string()
}

fn default_market_open_local() -> String {
    "09:30".to_string()
}

fn default_trading_cutoff_local() -> String {
    "14:00".to_string()
}

fn default_position_close_local() -> String {
    "13:50".to_string()
}

fn default_post_open_delay_s() -> u64 {
    1800
}

fn default_min_gap_pct() -> f64 {
    0.75
}

fn default_max_gap_pct() -> f64 {
    20.0
}

fn default_min_volume_ratio() -> f64 {
    1.5
}

fn default_atr_stop_mult() -> f64 {
    1.5
}

fn default_min_stop_dollars() -> f64 {
    0.30
}

fn default_min_stop_pct() -> f64 {
    1.2
}

fn default_target_mult() -> f64 {
    2.5
}

fn default_breakeven_threshold() -> f64 {
    15.0
}

fn default_quick_profit_threshold() -> f64 {
    20.0
}

fn default_quick_profit_window_s() -> u64 {
    600
}

fn default_tier_increment() -> f64 {
    50.0
}

fn default_tier_buffer() -> f64 {
    30.0
}

fn default_stop_out_cooldown_s() -> u64 {
    1200
}

fn default_pending_entry_lock_s() -> u64 {
    300
}

fn default_max_concurrent() -> usize {
    5
}

fn default_trade_cap_losing() -> u32 {
    10
}

fn default_trade_cap_winning() -> u32 {
    20
}

fn default_risk_per_trade() -> f64 {
    100.0
}

fn default_daily_loss_limit() -> f64 {
    600.0
}

fn default_per_symbol_notional_cap() -> f64 {
    25_000.0
}

fn default_scanner_period_s() -> u64 {
    3
}

fn default_monitor_period_s() -> u64 {
    1
}

fn default_broker_rate_limit_per_min() -> u32 {
    200
}

fn default_worker_pool_size() -> usize {
    8
}

// =============================================================================
// StrategyParams
// =============================================================================

/// Tunable parameters for the gap-continuation strategy (gap band, signal
/// floors, stop/target geometry, sizing).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StrategyParams {
    /// Minimum absolute gap (open vs prior close) as a percentage.
    #[serde(default = "default_min_gap_pct")]
    pub min_gap_pct: f64,

    /// Maximum absolute gap as a percentage. Gaps beyond this are exhaustion
    /// moves, not continuations.
    #[serde(default = "default_max_gap_pct")]
    pub max_gap_pct: f64,

    /// Mandatory minimum cumulative volume ratio vs the 20-day pace.
    #[serde(default = "default_min_volume_ratio")]
    pub min_volume_ratio: f64,

    /// ATR multiplier for the stop distance.
    #[serde(default = "default_atr_stop_mult")]
    pub atr_stop_mult: f64,

    /// Absolute floor on the stop distance in dollars.
    #[serde(default = "default_min_stop_dollars")]
    pub min_stop_dollars: f64,

    /// Percentage-of-entry floor on the stop distance.
    #[serde(default = "default_min_stop_pct")]
    pub min_stop_pct: f64,

    /// Target distance as a multiple of the stop distance.
    #[serde(default = "default_target_mult")]
    pub target_mult: f64,

    /// Dollar risk allocated to each trade; sizes are floor(risk / stop).
    #[serde(default = "default_risk_per_trade")]
    pub risk_per_trade: f64,

    /// Maximum notional per symbol in dollars.
    #[serde(default = "default_per_symbol_notional_cap")]
    pub per_symbol_notional_cap: f64,
}

impl Default for StrategyParams {
    fn default() -> Self {
        Self {
            min_gap_pct: default_min_gap_pct(),
            max_gap_pct: default_max_gap_pct(),
            min_volume_ratio: default_min_volume_ratio(),
            atr_stop_mult: default_atr_stop_mult(),
            min_stop_dollars: default_min_stop_dollars(),
            min_stop_pct: default_min_stop_pct(),
            target_mult: default_target_mult(),
            risk_per_trade: default_risk_per_trade(),
            per_symbol_notional_cap: default_per_symbol_notional_cap(),
        }
    }
}

// =============================================================================
// TrailParams
// =============================================================================

/// Tunable parameters for the tiered trailing-stop state machine. All tier
/// constants flow from here; no code path computes a lock from anything else.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TrailParams {
    /// Peak profit in dollars at which the stop moves to breakeven.
    #[serde(default = "default_breakeven_threshold")]
    pub breakeven_threshold: f64,

    /// Profit in dollars that triggers the quick-profit breakeven override.
    #[serde(default = "default_quick_profit_threshold")]
    pub quick_profit_threshold: f64,

    /// Seconds after entry during which the quick-profit override applies.
    #[serde(default = "default_quick_profit_window_s")]
    pub quick_profit_window_s: u64,

    /// Dollar step between successive locked tiers.
    #[serde(default = "default_tier_increment")]
    pub tier_increment: f64,

    /// Dollar buffer preserved above the locked amount before the next tier
    /// engages.
    #[serde(default = "default_tier_buffer")]
    pub tier_buffer: f64,
}

impl Default for TrailParams {
    fn default() -> Self {
        Self {
            breakeven_threshold: default_breakeven_threshold(),
            quick_profit_threshold: default_quick_profit_threshold(),
            quick_profit_window_s: default_quick_profit_window_s(),
            tier_increment: default_tier_increment(),
            tier_buffer: default_tier_buffer(),
        }
    }
}

// =============================================================================
// RuntimeConfig
// =============================================================================

/// Top-level runtime configuration for the Meridian engine.
///
/// Every field has a serde default so that older JSON files missing new
/// fields will still deserialise correctly.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RuntimeConfig {
    // --- Operational modes ---------------------------------------------------

    /// Current trading mode: Live, Paused, or Killed.
    #[serde(default)]
    pub trading_mode: TradingMode,

    /// Whether running against real funds or the paper simulator.
    #[serde(default)]
    pub account_mode: AccountMode,

    // --- Universe ------------------------------------------------------------

    /// Symbols the scanner walks every cycle.
    #[serde(default = "default_watchlist")]
    pub watchlist: Vec<String>,

    // --- Session clock -------------------------------------------------------

    /// IANA timezone all time-of-day gates are evaluated in.
    #[serde(default = "default_market_timezone")]
    pub market_timezone: String,

    /// Regular session open, local market time, "HH:MM".
    #[serde(default = "default_market_open_local")]
    pub market_open_local: String,

    /// Last local time at which new entries are admitted, "HH:MM".
    #[serde(default = "default_trading_cutoff_local")]
    pub trading_cutoff_local: String,

    /// Local time of the unconditional force-close sweep, "HH:MM".
    #[serde(default = "default_position_close_local")]
    pub position_close_local: String,

    /// Seconds after the open before the scanner starts admitting entries.
    #[serde(default = "default_post_open_delay_s")]
    pub post_open_delay_s: u64,

    // --- Risk limits ---------------------------------------------------------

    /// Maximum number of concurrently managed positions.
    #[serde(default = "default_max_concurrent")]
    pub max_concurrent: usize,

    /// Daily trade cap while realized PnL is flat or negative.
    #[serde(default = "default_trade_cap_losing")]
    pub trade_cap_losing: u32,

    /// Daily trade cap once realized PnL is positive.
    #[serde(default = "default_trade_cap_winning")]
    pub trade_cap_winning: u32,

    /// Daily loss circuit breaker in dollars (positive number).
    #[serde(default = "default_daily_loss_limit")]
    pub daily_loss_limit: f64,

    /// Cooldown after a stop-out before the same symbol is eligible again.
    #[serde(default = "default_stop_out_cooldown_s")]
    pub stop_out_cooldown_s: u64,

    /// Dedup window after an entry submit during which the symbol is locked.
    #[serde(default = "default_pending_entry_lock_s")]
    pub pending_entry_lock_s: u64,

    // --- Cadences & plumbing -------------------------------------------------

    /// Scanner cycle period in seconds.
    #[serde(default = "default_scanner_period_s")]
    pub scanner_period_s: u64,

    /// Position monitor cycle period in seconds.
    #[serde(default = "default_monitor_period_s")]
    pub monitor_period_s: u64,

    /// Global broker request budget per minute.
    #[serde(default = "default_broker_rate_limit_per_min")]
    pub broker_rate_limit_per_min: u32,

    /// Bound on concurrent symbol evaluations / monitor steps.
    #[serde(default = "default_worker_pool_size")]
    pub worker_pool_size: usize,

    // --- Strategy & trail parameters -----------------------------------------

    #[serde(default)]
    pub strategy: StrategyParams,

    #[serde(default)]
    pub trail: TrailParams,
}

impl Default for RuntimeConfig {
    fn default() -> Self {
        Self {
            trading_mode: TradingMode::Paused,
            account_mode: AccountMode::Demo,
            watchlist: default_watchlist(),
            market_timezone: default_market_timezone(),
            market_open_local: default_market_open_local(),
            trading_cutoff_local: default_trading_cutoff_local(),
            position_close_local: default_position_close_local(),
            post_open_delay_s: default_post_open_delay_s(),
            max_concurrent: default_max_concurrent(),
            trade_cap_losing: default_trade_cap_losing(),
            trade_cap_winning: default_trade_cap_winning(),
            daily_loss_limit: default_daily_loss_limit(),
            stop_out_cooldown_s: default_stop_out_cooldown_s(),
            pending_entry_lock_s: default_pending_entry_lock_s(),
            scanner_period_s: default_scanner_period_s(),
            monitor_period_s: default_monitor_period_s(),
            broker_rate_limit_per_min: default_broker_rate_limit_per_min(),
            worker_pool_size: default_worker_pool_size(),
            strategy: StrategyParams::default(),
            trail: TrailParams::default(),
        }
    }
}

impl RuntimeConfig {
    /// Load configuration from a JSON file at `path`.
    ///
    /// If the file does not exist, returns an error so the caller can fall
    /// back to defaults with a warning.
    pub fn load(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();

        let content = std::fs::read_to_string(path)
            .with_context(|| format!("failed to read runtime config from {}", path.display()))?;

        let config: Self = serde_json::from_str(&content)
            .with_context(|| format!("failed to parse runtime config from {}", path.display()))?;

        info!(
            path = %path.display(),
            watchlist = ?config.watchlist,
            trading_mode = %config.trading_mode,
            "runtime config loaded"
        );

        Ok(config)
    }

    /// Persist the current configuration to `path` using an atomic write
    /// (write to `.tmp`, then rename).
    pub fn save(&self, path: impl AsRef<Path>) -> Result<()> {
        let path = path.as_ref();

        let content = serde_json::to_string_pretty(self)
            .context("failed to serialise runtime config to JSON")?;

        let tmp_path = path.with_extension("json.tmp");

        std::fs::write(&tmp_path, &content)
            .with_context(|| format!("failed to write tmp config to {}", tmp_path.display()))?;

        std::fs::rename(&tmp_path, path)
            .with_context(|| format!("failed to rename tmp config to {}", path.display()))?;

        info!(path = %path.display(), "runtime config saved (atomic)");
        Ok(())
    }
}
