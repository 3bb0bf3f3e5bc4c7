// =============================================================================
// Session VWAP — volume-weighted average price since the session open
// =============================================================================
//
//   VWAP = Σ(typical_price × volume) / Σ(volume)
//   typical_price = (high + low + close) / 3
//
// The caller is responsible for passing only bars belonging to the current
// session; the function itself is session-agnostic.
// =============================================================================

use crate::market_data::Bar;

/// Compute the cumulative VWAP over `session_bars`.
///
/// Returns `None` on an empty slice, zero total volume, or a non-finite
/// result.
pub fn session_vwap(session_bars: &[Bar]) -> Option<f64> {
    if session_bars.is_empty() {
        return None;
    }

    let mut pv_sum = 0.0;
    let mut vol_sum = 0.0;
    for bar in session_bars {
        let typical = (bar.high + bar.low + bar.close) / 3.0;
        pv_sum += typical * bar.volume;
        vol_sum += bar.volume;
    }

    if vol_sum <= 0.0 {
        return None;
    }

    let vwap = pv_sum / vol_sum;
    if vwap.is_finite() {
        Some(vwap)
    } else {
        None
    }
}

// =============================================================================
// Unit Tests
// =============================================================================
#[cfg(test)]
mod tests {
    use super::*;
    use crate::market_data::tests::bar_ohlcv;

    #[test]
    fn vwap_empty() {
        assert!(session_vwap(&[]).is_none());
    }

    #[test]
    fn vwap_zero_volume() {
        let bars = vec![bar_ohlcv(100.0, 101.0, 99.0, 100.0, 0.0)];
        assert!(session_vwap(&bars).is_none());
    }

    #[test]
    fn vwap_single_bar_is_typical_price() {
        let bars = vec![bar_ohlcv(100.0, 102.0, 98.0, 100.0, 500.0)];
        let vwap = session_vwap(&bars).unwrap();
        assert!((vwap - 100.0).abs() < 1e-10);
    }

    #[test]
    fn vwap_weights_by_volume() {
        // Heavy volume at 100, light volume at 110: VWAP sits near 100.
        let bars = vec![
            bar_ohlcv(100.0, 100.0, 100.0, 100.0, 900.0),
            bar_ohlcv(110.0, 110.0, 110.0, 110.0, 100.0),
        ];
        let vwap = session_vwap(&bars).unwrap();
        assert!((vwap - 101.0).abs() < 1e-10, "got {vwap}");
    }
}
