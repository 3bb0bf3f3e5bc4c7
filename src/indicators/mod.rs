// =============================================================================
// Technical Indicators Module
// =============================================================================
//
// Pure, side-effect-free implementations of the indicators used by the
// strategy evaluator. Every public function returns `Option`/`Vec` so callers
// are forced to handle insufficient-data and numerical-edge-case scenarios.

pub mod atr;
pub mod ema;
pub mod levels;
pub mod macd;
pub mod rsi;
pub mod vwap;

use serde::{Deserialize, Serialize};

use crate::market_data::Bar;
pub use macd::Divergence;

/// Look-back for RSI and ATR.
const WILDER_PERIOD: usize = 14;
/// MACD periods.
const MACD_FAST: usize = 12;
const MACD_SLOW: usize = 26;
const MACD_SIGNAL: usize = 9;
/// Window scanned for divergences and rolling support/resistance.
const LEVEL_WINDOW: usize = 20;
/// Daily bars averaged for the volume pace baseline.
const VOLUME_WINDOW: usize = 20;

/// One symbol's full indicator read at a moment in time. Derived on demand,
/// never persisted.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct IndicatorSnapshot {
    pub rsi14: f64,
    pub atr14: f64,
    pub macd_line: f64,
    pub macd_signal: f64,
    pub macd_hist: f64,
    pub macd_divergence: Divergence,
    pub macd_bullish_cross: bool,
    pub macd_bearish_cross: bool,
    pub vwap: f64,
    pub support20: f64,
    pub resistance20: f64,
    pub avg_volume20: f64,
    pub cumulative_volume_ratio: f64,
}

/// Assemble the full snapshot for one symbol.
///
/// * `bars_5m` — recent 5-minute bars, ascending, spanning enough history for
///   the slow indicators (54+ bars).
/// * `session_bars` — today's session bars only (VWAP, session volume).
/// * `daily_bars` — recent daily bars for the volume pace baseline.
/// * `session_fraction` — fraction of the regular session elapsed, in (0, 1].
///
/// Returns `None` when any component cannot be computed; the scanner skips
/// the symbol for this tick rather than trading on a partial read.
pub fn snapshot(
    bars_5m: &[Bar],
    session_bars: &[Bar],
    daily_bars: &[Bar],
    session_fraction: f64,
) -> Option<IndicatorSnapshot> {
    let closes: Vec<f64> = bars_5m.iter().map(|b| b.close).collect();

    let rsi14 = rsi::latest_rsi(&closes, WILDER_PERIOD)?;
    let atr14 = atr::calculate_atr(bars_5m, WILDER_PERIOD)?;

    let macd = macd::calculate_macd(&closes, MACD_FAST, MACD_SLOW, MACD_SIGNAL)?;
    let macd_divergence = macd::detect_divergence(bars_5m, &macd, LEVEL_WINDOW);

    let vwap = vwap::session_vwap(session_bars)?;
    let support20 = levels::support(bars_5m, LEVEL_WINDOW)?;
    let resistance20 = levels::resistance(bars_5m, LEVEL_WINDOW)?;
    let avg_volume20 = levels::average_daily_volume(daily_bars, VOLUME_WINDOW)?;
    let cumulative_volume_ratio = levels::cumulative_volume_ratio(
        levels::session_volume(session_bars),
        avg_volume20,
        session_fraction,
    )?;

    Some(IndicatorSnapshot {
        rsi14,
        atr14,
        macd_line: macd.latest_line()?,
        macd_signal: macd.latest_signal()?,
        macd_hist: macd.latest_hist()?,
        macd_divergence,
        macd_bullish_cross: macd.bullish_crossover(),
        macd_bearish_cross: macd.bearish_crossover(),
        vwap,
        support20,
        resistance20,
        avg_volume20,
        cumulative_volume_ratio,
    })
}
