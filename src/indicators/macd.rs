// =============================================================================
// MACD (12/26/9) with regular divergence detection
// =============================================================================
//
// MACD line = EMA(fast) - EMA(slow); signal = EMA(signal_period) of the MACD
// line; histogram = line - signal.
//
// Regular divergence over a recent window: price makes a new extreme that the
// histogram fails to confirm. The window is split in half; a bullish
// divergence means the later half printed a lower price low with a higher
// histogram low, bearish is the mirror on highs.
// =============================================================================

use serde::{Deserialize, Serialize};

use crate::indicators::ema::calculate_ema;
use crate::market_data::Bar;

/// Divergence verdict over the scanned window.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum Divergence {
    None,
    Bullish,
    Bearish,
}

impl std::fmt::Display for Divergence {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::None => write!(f, "none"),
            Self::Bullish => write!(f, "bullish"),
            Self::Bearish => write!(f, "bearish"),
        }
    }
}

/// MACD series aligned to the input closes.
///
/// `first_index` is the close index of the first element of `line` /
/// `signal` / `hist`; all three vectors share that alignment.
#[derive(Debug, Clone)]
pub struct MacdSeries {
    pub first_index: usize,
    pub line: Vec<f64>,
    pub signal: Vec<f64>,
    pub hist: Vec<f64>,
}

impl MacdSeries {
    pub fn latest_line(&self) -> Option<f64> {
        self.line.last().copied()
    }

    pub fn latest_signal(&self) -> Option<f64> {
        self.signal.last().copied()
    }

    pub fn latest_hist(&self) -> Option<f64> {
        self.hist.last().copied()
    }

    /// True when the line crossed above the signal on the most recent bar.
    pub fn bullish_crossover(&self) -> bool {
        match self.hist.as_slice() {
            [.., prev, last] => *prev <= 0.0 && *last > 0.0,
            _ => false,
        }
    }

    /// True when the line crossed below the signal on the most recent bar.
    pub fn bearish_crossover(&self) -> bool {
        match self.hist.as_slice() {
            [.., prev, last] => *prev >= 0.0 && *last < 0.0,
            _ => false,
        }
    }
}

/// Compute the MACD series for `closes`.
///
/// Returns `None` until `slow + signal_period - 1` closes exist. The
/// histogram starts at close index `slow + signal_period - 2`.
pub fn calculate_macd(
    closes: &[f64],
    fast: usize,
    slow: usize,
    signal_period: usize,
) -> Option<MacdSeries> {
    if fast == 0 || slow <= fast || signal_period == 0 {
        return None;
    }
    if closes.len() < slow + signal_period - 1 {
        return None;
    }

    let ema_fast = calculate_ema(closes, fast); // starts at index fast - 1
    let ema_slow = calculate_ema(closes, slow); // starts at index slow - 1

    // MACD line from index slow - 1.
    let offset = slow - fast;
    let line_full: Vec<f64> = ema_slow
        .iter()
        .enumerate()
        .map(|(i, s)| ema_fast[i + offset] - s)
        .collect();

    let signal = calculate_ema(&line_full, signal_period);
    if signal.is_empty() {
        return None;
    }

    // Align line/hist to where the signal becomes defined.
    let skip = line_full.len() - signal.len();
    let line: Vec<f64> = line_full[skip..].to_vec();
    let hist: Vec<f64> = line.iter().zip(signal.iter()).map(|(l, s)| l - s).collect();

    Some(MacdSeries {
        first_index: slow - 1 + skip,
        line,
        signal,
        hist,
    })
}

/// Scan the last `window` bars for a regular divergence between price and
/// the MACD histogram.
///
/// `bars` and `macd` must come from the same close series. Returns
/// `Divergence::None` when the window does not fit in the available
/// histogram, or when neither pattern is present.
pub fn detect_divergence(bars: &[Bar], macd: &MacdSeries, window: usize) -> Divergence {
    if window < 4 || macd.hist.len() < window || bars.len() < window {
        return Divergence::None;
    }

    let bars_win = &bars[bars.len() - window..];
    let hist_win = &macd.hist[macd.hist.len() - window..];
    let half = window / 2;

    let min_f64 = |xs: &mut dyn Iterator<Item = f64>| xs.fold(f64::INFINITY, f64::min);
    let max_f64 = |xs: &mut dyn Iterator<Item = f64>| xs.fold(f64::NEG_INFINITY, f64::max);

    let early_low = min_f64(&mut bars_win[..half].iter().map(|b| b.low));
    let late_low = min_f64(&mut bars_win[half..].iter().map(|b| b.low));
    let early_hist_low = min_f64(&mut hist_win[..half].iter().copied());
    let late_hist_low = min_f64(&mut hist_win[half..].iter().copied());

    if late_low < early_low && late_hist_low > early_hist_low {
        return Divergence::Bullish;
    }

    let early_high = max_f64(&mut bars_win[..half].iter().map(|b| b.high));
    let late_high = max_f64(&mut bars_win[half..].iter().map(|b| b.high));
    let early_hist_high = max_f64(&mut hist_win[..half].iter().copied());
    let late_hist_high = max_f64(&mut hist_win[half..].iter().copied());

    if late_high > early_high && late_hist_high < early_hist_high {
        return Divergence::Bearish;
    }

    Divergence::None
}
