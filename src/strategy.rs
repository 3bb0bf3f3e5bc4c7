// =============================================================================
// Strategy Evaluator — gap-continuation setups with a weighted signal score
// =============================================================================
//
// Pipeline per symbol:
//   1. Gap gate: |gap| must sit inside the configured band.
//   2. Additive signal score (gap, pullback, MACD, RSI, volume pace).
//      RSI outside its band and thin volume reject outright; everything else
//      just contributes points.
//   3. Accept at score >= 6.
//   4. Stop construction: max(ATR component, dollar/percent floor).
//   5. Target at a fixed multiple of the stop distance.
//   6. Sizing: floor(risk / stop distance), clamped to the notional cap.
//
// Shorts are the mirror image: gap down, rally into VWAP/resistance, bearish
// MACD, RSI thresholds inverted.
// =============================================================================

use serde::Serialize;

use crate::indicators::{Divergence, IndicatorSnapshot};
use crate::runtime_config::StrategyParams;
use crate::types::Side;

/// Accept threshold for the additive score.
const ACCEPT_SCORE: i32 = 6;
/// Points per component.
const GAP_POINTS: i32 = 2;
const PULLBACK_POINTS: i32 = 2;
const MACD_POINTS: i32 = 3;
const RSI_STRONG_POINTS: i32 = 2;
const RSI_WEAK_POINTS: i32 = 1;
const VOLUME_POINTS: i32 = 1;
/// Pullback proximity bands.
const VWAP_PROXIMITY_PCT: f64 = 1.5;
const LEVEL_PROXIMITY_PCT: f64 = 2.0;
/// RSI bands. Longs want a pullback (low RSI); shorts the mirror.
const RSI_LONG_STRONG: f64 = 35.0;
const RSI_LONG_WEAK: f64 = 50.0;

/// Direction of today's opening gap.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum GapDirection {
    Up,
    Down,
}

/// One symbol's opening gap, computed once per day.
#[derive(Debug, Clone, Serialize)]
pub struct GapObservation {
    pub symbol: String,
    pub prev_close: f64,
    pub today_open: f64,
    pub gap_pct: f64,
    pub direction: GapDirection,
}

/// Compute the opening gap. `None` when either price is non-positive.
pub fn observe_gap(symbol: &str, prev_close: f64, today_open: f64) -> Option<GapObservation> {
    if prev_close <= 0.0 || today_open <= 0.0 {
        return None;
    }
    let gap_pct = (today_open - prev_close) / prev_close * 100.0;
    if !gap_pct.is_finite() {
        return None;
    }
    Some(GapObservation {
        symbol: symbol.to_string(),
        prev_close,
        today_open,
        gap_pct,
        direction: if gap_pct >= 0.0 {
            GapDirection::Up
        } else {
            GapDirection::Down
        },
    })
}

/// What kind of setup the evaluator produced.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum SetupKind {
    GapContinuationLong,
    GapContinuationShort,
}

/// A fully constructed trade candidate, ready for the risk gate.
#[derive(Debug, Clone, Serialize)]
pub struct Setup {
    pub symbol: String,
    pub side: Side,
    pub entry_price: f64,
    pub stop_price: f64,
    pub target_price: f64,
    pub size_shares: u32,
    pub risk_dollars: f64,
    pub stop_distance_dollars: f64,
    pub signal_strength: i32,
    pub setup_kind: SetupKind,
}

/// Why the evaluator produced no setup.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub enum EvalReject {
    GapOutOfBand { gap_pct: f64 },
    VolumeTooThin { ratio: f64 },
    RsiUnfavorable { rsi: f64 },
    ScoreBelowThreshold { score: i32 },
    SizeTooSmall,
}

impl std::fmt::Display for EvalReject {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::GapOutOfBand { gap_pct } => write!(f, "gap {gap_pct:.2}% outside band"),
            Self::VolumeTooThin { ratio } => write!(f, "volume ratio {ratio:.2} below minimum"),
            Self::RsiUnfavorable { rsi } => write!(f, "RSI {rsi:.1} outside entry band"),
            Self::ScoreBelowThreshold { score } => write!(f, "score {score} below threshold"),
            Self::SizeTooSmall => write!(f, "risk budget sizes below one share"),
        }
    }
}

/// Evaluate one symbol. `last` is the current trade price used as the entry
/// reference.
pub fn evaluate(
    gap: &GapObservation,
    snap: &IndicatorSnapshot,
    last: f64,
    params: &StrategyParams,
) -> Result<Setup, EvalReject> {
    // ── 1. Gap gate ──────────────────────────────────────────────────────
    let abs_gap = gap.gap_pct.abs();
    if abs_gap < params.min_gap_pct || abs_gap > params.max_gap_pct {
        return Err(EvalReject::GapOutOfBand { gap_pct: gap.gap_pct });
    }

    let side = match gap.direction {
        GapDirection::Up => Side::Long,
        GapDirection::Down => Side::Short,
    };

    // ── 2. Mandatory volume pace ─────────────────────────────────────────
    if snap.cumulative_volume_ratio < params.min_volume_ratio {
        return Err(EvalReject::VolumeTooThin {
            ratio: snap.cumulative_volume_ratio,
        });
    }

    // ── 3. Score ─────────────────────────────────────────────────────────
    let mut score = GAP_POINTS + VOLUME_POINTS;

    if pullback_confirmed(side, last, snap) {
        score += PULLBACK_POINTS;
    }

    let macd_confirms = match side {
        Side::Long => snap.macd_bullish_cross || snap.macd_divergence == Divergence::Bullish,
        Side::Short => snap.macd_bearish_cross || snap.macd_divergence == Divergence::Bearish,
    };
    if macd_confirms {
        score += MACD_POINTS;
    }

    score += rsi_points(side, snap.rsi14)?;

    if score < ACCEPT_SCORE {
        return Err(EvalReject::ScoreBelowThreshold { score });
    }

    // ── 4. Stop construction ─────────────────────────────────────────────
    let atr_component = params.atr_stop_mult * snap.atr14;
    let min_component = params
        .min_stop_dollars
        .max(params.min_stop_pct / 100.0 * last);
    let stop_distance = atr_component.max(min_component);

    let (stop_price, target_price) = match side {
        Side::Long => (
            last - stop_distance,
            last + params.target_mult * stop_distance,
        ),
        Side::Short => (
            last + stop_distance,
            last - params.target_mult * stop_distance,
        ),
    };

    // ── 5. Sizing ────────────────────────────────────────────────────────
    let raw_size = (params.risk_per_trade / stop_distance).floor();
    let cap_size = (params.per_symbol_notional_cap / last).floor();
    let size = raw_size.min(cap_size);
    if size < 1.0 {
        return Err(EvalReject::SizeTooSmall);
    }
    let size_shares = size as u32;

    Ok(Setup {
        symbol: gap.symbol.clone(),
        side,
        entry_price: last,
        stop_price,
        target_price,
        size_shares,
        risk_dollars: stop_distance * size,
        stop_distance_dollars: stop_distance,
        signal_strength: score,
        setup_kind: match side {
            Side::Long => SetupKind::GapContinuationLong,
            Side::Short => SetupKind::GapContinuationShort,
        },
    })
}

/// Price has pulled back to VWAP or to the rolling level that favours the
/// trade: support for longs, resistance for shorts.
fn pullback_confirmed(side: Side, last: f64, snap: &IndicatorSnapshot) -> bool {
    let near = |price: f64, level: f64, band_pct: f64| {
        level > 0.0 && ((price - level).abs() / level * 100.0) <= band_pct
    };

    let near_vwap = near(last, snap.vwap, VWAP_PROXIMITY_PCT);
    match side {
        Side::Long => near_vwap || near(last, snap.support20, LEVEL_PROXIMITY_PCT),
        Side::Short => near_vwap || near(last, snap.resistance20, LEVEL_PROXIMITY_PCT),
    }
}

/// RSI contribution; outside the band the setup is rejected outright.
fn rsi_points(side: Side, rsi: f64) -> Result<i32, EvalReject> {
    let points = match side {
        Side::Long => {
            if rsi < RSI_LONG_STRONG {
                RSI_STRONG_POINTS
            } else if rsi < RSI_LONG_WEAK {
                RSI_WEAK_POINTS
            } else {
                return Err(EvalReject::RsiUnfavorable { rsi });
            }
        }
        Side::Short => {
            // Mirrored thresholds: 65/50.
            if rsi > 100.0 - RSI_LONG_STRONG {
                RSI_STRONG_POINTS
            } else if rsi > RSI_LONG_WEAK {
                RSI_WEAK_POINTS
            } else {
                return Err(EvalReject::RsiUnfavorable { rsi });
            }
        }
    };
    Ok(points)
}

// =============================================================================
// Tests
// =============================================================================
#[cfg(test)]
pub mod tests {
    use super::*;

    /// Minimal admitted setup for risk-gate and coordinator tests.
    pub fn setup_long(symbol: &str, entry: f64, size: u32) -> Setup {
        Setup {
            symbol: symbol.to_string(),
            side: Side::Long,
            entry_price: entry,
            stop_price: entry - 1.5,
            target_price: entry + 3.75,
            size_shares: size,
            risk_dollars: 1.5 * size as f64,
            stop_distance_dollars: 1.5,
            signal_strength: 8,
            setup_kind: SetupKind::GapContinuationLong,
        }
    }

    fn snapshot() -> IndicatorSnapshot {
        IndicatorSnapshot {
            rsi14: 42.0,
            atr14: 1.0,
            macd_line: 0.2,
            macd_signal: 0.1,
            macd_hist: 0.1,
            macd_divergence: Divergence::None,
            macd_bullish_cross: true,
            macd_bearish_cross: false,
            vwap: 100.0,
            support20: 98.0,
            resistance20: 104.0,
            avg_volume20: 1_000_000.0,
            cumulative_volume_ratio: 2.0,
        }
    }

    fn gap_up(symbol: &str) -> GapObservation {
        observe_gap(symbol, 98.0, 100.0).unwrap()
    }

    fn params() -> StrategyParams {
        StrategyParams::default()
    }

    #[test]
    fn observe_gap_math() {
        let gap = observe_gap("AAPL", 100.0, 102.0).unwrap();
        assert!((gap.gap_pct - 2.0).abs() < 1e-10);
        assert_eq!(gap.direction, GapDirection::Up);

        let gap = observe_gap("AAPL", 100.0, 97.0).unwrap();
        assert!((gap.gap_pct + 3.0).abs() < 1e-10);
        assert_eq!(gap.direction, GapDirection::Down);

        assert!(observe_gap("AAPL", 0.0, 100.0).is_none());
    }

    #[test]
    fn accepted_long_setup() {
        // Gap +2, volume +1, pullback to VWAP +2, MACD cross +3, RSI 42 +1
        // => score 9.
        let setup = evaluate(&gap_up("AAPL"), &snapshot(), 100.0, &params()).unwrap();
        assert_eq!(setup.side, Side::Long);
        assert_eq!(setup.signal_strength, 9);
        assert_eq!(setup.setup_kind, SetupKind::GapContinuationLong);
    }

    #[test]
    fn gap_band_gate() {
        let tiny = observe_gap("AAPL", 100.0, 100.5).unwrap(); // +0.5%
        assert!(matches!(
            evaluate(&tiny, &snapshot(), 100.5, &params()),
            Err(EvalReject::GapOutOfBand { .. })
        ));

        let huge = observe_gap("AAPL", 100.0, 125.0).unwrap(); // +25%
        assert!(matches!(
            evaluate(&huge, &snapshot(), 125.0, &params()),
            Err(EvalReject::GapOutOfBand { .. })
        ));
    }

    #[test]
    fn volume_is_mandatory() {
        let mut snap = snapshot();
        snap.cumulative_volume_ratio = 1.49;
        assert!(matches!(
            evaluate(&gap_up("AAPL"), &snap, 100.0, &params()),
            Err(EvalReject::VolumeTooThin { .. })
        ));
    }

    #[test]
    fn rsi_band_rejects_neutral() {
        let mut snap = snapshot();
        snap.rsi14 = 55.0;
        assert!(matches!(
            evaluate(&gap_up("AAPL"), &snap, 100.0, &params()),
            Err(EvalReject::RsiUnfavorable { .. })
        ));
    }

    #[test]
    fn rsi_strong_vs_weak_points() {
        // RSI 30 gives +2, pushing an otherwise borderline setup over.
        let mut snap = snapshot();
        snap.macd_bullish_cross = false; // drop the +3
        snap.rsi14 = 30.0;
        // Gap 2 + vol 1 + pullback 2 + rsi 2 = 7 => accepted.
        let setup = evaluate(&gap_up("AAPL"), &snap, 100.0, &params()).unwrap();
        assert_eq!(setup.signal_strength, 7);

        // RSI 42 gives only +1: score 6, still accepted at the threshold.
        snap.rsi14 = 42.0;
        let setup = evaluate(&gap_up("AAPL"), &snap, 100.0, &params()).unwrap();
        assert_eq!(setup.signal_strength, 6);
    }

    #[test]
    fn score_below_threshold_rejected() {
        let mut snap = snapshot();
        snap.macd_bullish_cross = false;
        snap.rsi14 = 42.0;
        // Price far from VWAP and support: no pullback points.
        // Gap 2 + vol 1 + rsi 1 = 4 < 6.
        let result = evaluate(&gap_up("AAPL"), &snap, 110.0, &params());
        assert!(matches!(result, Err(EvalReject::ScoreBelowThreshold { score: 4 })));
    }

    #[test]
    fn divergence_substitutes_for_crossover() {
        let mut snap = snapshot();
        snap.macd_bullish_cross = false;
        snap.macd_divergence = Divergence::Bullish;
        let setup = evaluate(&gap_up("AAPL"), &snap, 100.0, &params()).unwrap();
        assert_eq!(setup.signal_strength, 9);
    }

    #[test]
    fn stop_uses_atr_when_dominant() {
        // ATR 1.0 at entry 100: atr component 1.5 > max(0.30, 1.20) = 1.20.
        let setup = evaluate(&gap_up("AAPL"), &snapshot(), 100.0, &params()).unwrap();
        assert!((setup.stop_distance_dollars - 1.5).abs() < 1e-10);
        assert!((setup.stop_price - 98.5).abs() < 1e-10);
        assert!((setup.target_price - 103.75).abs() < 1e-10);
        // size = floor(100 / 1.5) = 66
        assert_eq!(setup.size_shares, 66);
    }

    #[test]
    fn stop_floor_dominates_low_atr() {
        // PFE-style numbers: entry 24.65, ATR 0.04.
        // atr component 0.06; floor = max(0.30, 0.012 * 24.65 = 0.2958) = 0.30.
        let mut snap = snapshot();
        snap.atr14 = 0.04;
        snap.vwap = 24.65;
        snap.support20 = 24.40;
        snap.resistance20 = 25.20;
        let gap = observe_gap("PFE", 24.30, 24.60).unwrap();
        let setup = evaluate(&gap, &snap, 24.65, &params()).unwrap();
        assert!((setup.stop_distance_dollars - 0.30).abs() < 1e-10);
        assert!((setup.stop_price - 24.35).abs() < 1e-10);
        // size = floor(100 / 0.30) = 333
        assert_eq!(setup.size_shares, 333);
    }

    #[test]
    fn short_mirror() {
        let mut snap = snapshot();
        snap.rsi14 = 68.0;
        snap.macd_bullish_cross = false;
        snap.macd_bearish_cross = true;
        snap.vwap = 100.0;
        let gap = observe_gap("TSLA", 103.0, 100.0).unwrap(); // gap down ~2.9%
        let setup = evaluate(&gap, &snap, 100.0, &params()).unwrap();
        assert_eq!(setup.side, Side::Short);
        assert_eq!(setup.setup_kind, SetupKind::GapContinuationShort);
        assert!(setup.stop_price > setup.entry_price);
        assert!(setup.target_price < setup.entry_price);
    }

    #[test]
    fn short_rsi_band_inverted() {
        let mut snap = snapshot();
        snap.macd_bearish_cross = true;
        snap.rsi14 = 45.0; // below 50: no short entry
        let gap = observe_gap("TSLA", 103.0, 100.0).unwrap();
        assert!(matches!(
            evaluate(&gap, &snap, 100.0, &params()),
            Err(EvalReject::RsiUnfavorable { .. })
        ));
    }

    #[test]
    fn notional_cap_clamps_size() {
        let mut p = params();
        p.per_symbol_notional_cap = 1_000.0;
        let setup = evaluate(&gap_up("AAPL"), &snapshot(), 100.0, &p).unwrap();
        // floor(1000 / 100) = 10 shares, despite risk budget allowing 66.
        assert_eq!(setup.size_shares, 10);
    }

    #[test]
    fn sub_share_sizing_rejected() {
        let mut p = params();
        p.risk_per_trade = 1.0; // floor(1.0 / 1.5) = 0
        assert!(matches!(
            evaluate(&gap_up("AAPL"), &snapshot(), 100.0, &p),
            Err(EvalReject::SizeTooSmall)
        ));
    }
}
