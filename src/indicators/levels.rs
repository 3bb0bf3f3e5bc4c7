// =============================================================================
// Rolling levels — support / resistance and session volume pace
// =============================================================================

use crate::market_data::Bar;

/// Lowest low over the last `window` bars.
pub fn support(bars: &[Bar], window: usize) -> Option<f64> {
    if window == 0 || bars.len() < window {
        return None;
    }
    bars[bars.len() - window..]
        .iter()
        .map(|b| b.low)
        .fold(None, |acc, v| match acc {
            Some(m) if m <= v => Some(m),
            _ if v.is_finite() => Some(v),
            acc => acc,
        })
}

/// Highest high over the last `window` bars.
pub fn resistance(bars: &[Bar], window: usize) -> Option<f64> {
    if window == 0 || bars.len() < window {
        return None;
    }
    bars[bars.len() - window..]
        .iter()
        .map(|b| b.high)
        .fold(None, |acc, v| match acc {
            Some(m) if m >= v => Some(m),
            _ if v.is_finite() => Some(v),
            acc => acc,
        })
}

/// Mean full-session volume over the most recent `window` daily bars.
pub fn average_daily_volume(daily_bars: &[Bar], window: usize) -> Option<f64> {
    if window == 0 || daily_bars.len() < window {
        return None;
    }
    let sum: f64 = daily_bars[daily_bars.len() - window..]
        .iter()
        .map(|b| b.volume)
        .sum();
    let avg = sum / window as f64;
    if avg.is_finite() && avg > 0.0 {
        Some(avg)
    } else {
        None
    }
}

/// Cumulative volume ratio: today's session volume so far against the
/// average daily volume scaled by the fraction of the session elapsed.
///
/// A ratio of 1.0 means the symbol is trading exactly at its 20-day pace; a
/// ratio of 2.0 means twice the usual participation at this point of the day.
pub fn cumulative_volume_ratio(
    session_volume: f64,
    average_daily_volume: f64,
    session_fraction: f64,
) -> Option<f64> {
    if average_daily_volume <= 0.0 || session_fraction <= 0.0 {
        return None;
    }
    let expected = average_daily_volume * session_fraction.min(1.0);
    let ratio = session_volume / expected;
    if ratio.is_finite() {
        Some(ratio)
    } else {
        None
    }
}

/// Total volume across the given session bars.
pub fn session_volume(session_bars: &[Bar]) -> f64 {
    session_bars.iter().map(|b| b.volume).sum()
}

// =============================================================================
// Unit Tests
// =============================================================================
#[cfg(test)]
mod tests {
    use super::*;
    use crate::market_data::tests::{bar_ohlc, bar_ohlcv};

    #[test]
    fn support_resistance_window() {
        let bars: Vec<Bar> = (0..30)
            .map(|i| {
                let base = 100.0 + i as f64;
                bar_ohlc(base, base + 2.0, base - 2.0, base)
            })
            .collect();
        // Last 20 bars: bases 110..=129.
        assert!((support(&bars, 20).unwrap() - 108.0).abs() < 1e-10);
        assert!((resistance(&bars, 20).unwrap() - 131.0).abs() < 1e-10);
    }

    #[test]
    fn support_requires_full_window() {
        let bars = vec![bar_ohlc(100.0, 101.0, 99.0, 100.0); 10];
        assert!(support(&bars, 20).is_none());
        assert!(resistance(&bars, 20).is_none());
    }

    #[test]
    fn average_daily_volume_window() {
        let daily: Vec<Bar> = (0..25)
            .map(|i| bar_ohlcv(100.0, 101.0, 99.0, 100.0, 1000.0 + i as f64 * 10.0))
            .collect();
        let avg = average_daily_volume(&daily, 20).unwrap();
        // Last 20 volumes: 1050..=1240, mean 1145.
        assert!((avg - 1145.0).abs() < 1e-10);
    }

    #[test]
    fn volume_ratio_at_pace() {
        // Half the session elapsed, half the average volume traded.
        let r = cumulative_volume_ratio(500_000.0, 1_000_000.0, 0.5).unwrap();
        assert!((r - 1.0).abs() < 1e-10);
    }

    #[test]
    fn volume_ratio_hot_open() {
        // 30 minutes into a 390-minute session, already 20% of a day's volume.
        let r = cumulative_volume_ratio(200_000.0, 1_000_000.0, 30.0 / 390.0).unwrap();
        assert!(r > 2.0);
    }

    #[test]
    fn volume_ratio_guards() {
        assert!(cumulative_volume_ratio(1.0, 0.0, 0.5).is_none());
        assert!(cumulative_volume_ratio(1.0, 100.0, 0.0).is_none());
    }

    #[test]
    fn session_volume_sums() {
        let bars = vec![
            bar_ohlcv(1.0, 1.0, 1.0, 1.0, 10.0),
            bar_ohlcv(1.0, 1.0, 1.0, 1.0, 20.0),
        ];
        assert!((session_volume(&bars) - 30.0).abs() < 1e-10);
    }
}
