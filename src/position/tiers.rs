// =============================================================================
// Profit tiers — the dollar-lock ladder behind the trailing stop
// =============================================================================
//
// All constants flow from `TrailParams`; no other code path computes a lock.
//
// Tier function over peak profit p (defaults shown):
//   p < $15          -> no lock (initial stop stands)
//   $15 <= p < $80   -> lock $0 (breakeven)
//   p >= $80         -> lock $50 * floor((p - $30) / $50)
//
// The $80 boundary is buffer + increment: the first tier engages once a
// full increment clears above the preserved buffer.
//
// Quick-profit override: within the opening window after entry, a profit at
// or above the threshold forces at least the breakeven lock regardless of
// where the peak sits.
// =============================================================================

use crate::runtime_config::TrailParams;

/// Desired dollar lock for a position whose peak profit is `peak_profit`.
///
/// `None` means the initial stop stands. `Some(0.0)` is the breakeven lock;
/// positive values are tiered locks.
pub fn desired_lock(peak_profit: f64, quick_profit_fired: bool, trail: &TrailParams) -> Option<f64> {
    let tier_floor = trail.tier_buffer + trail.tier_increment;

    let base = if peak_profit >= tier_floor && trail.tier_increment > 0.0 {
        let steps = ((peak_profit - trail.tier_buffer) / trail.tier_increment).floor();
        Some(trail.tier_increment * steps)
    } else if peak_profit >= trail.breakeven_threshold {
        Some(0.0)
    } else {
        None
    };

    if quick_profit_fired {
        Some(base.unwrap_or(0.0).max(0.0))
    } else {
        base
    }
}

/// Whether the quick-profit override is live for this tick.
pub fn quick_profit_fired(elapsed_s: u64, dollar_profit: f64, trail: &TrailParams) -> bool {
    elapsed_s <= trail.quick_profit_window_s && dollar_profit >= trail.quick_profit_threshold
}

// =============================================================================
// Tests
// =============================================================================
#[cfg(test)]
mod tests {
    use super::*;

    fn trail() -> TrailParams {
        TrailParams::default()
    }

    #[test]
    fn below_breakeven_threshold_no_lock() {
        assert_eq!(desired_lock(0.0, false, &trail()), None);
        assert_eq!(desired_lock(14.99, false, &trail()), None);
    }

    #[test]
    fn breakeven_band() {
        assert_eq!(desired_lock(15.0, false, &trail()), Some(0.0));
        assert_eq!(desired_lock(79.99, false, &trail()), Some(0.0));
    }

    #[test]
    fn tier_ladder() {
        // p = 80: floor(50/50) = 1 -> $50.
        assert_eq!(desired_lock(80.0, false, &trail()), Some(50.0));
        // p = 100: floor(70/50) = 1 -> $50.
        assert_eq!(desired_lock(100.0, false, &trail()), Some(50.0));
        // p = 129.99: floor(99.99/50) = 1 -> $50.
        assert_eq!(desired_lock(129.99, false, &trail()), Some(50.0));
        // p = 130: floor(100/50) = 2 -> $100.
        assert_eq!(desired_lock(130.0, false, &trail()), Some(100.0));
        // p = 150: floor(120/50) = 2 -> $100.
        assert_eq!(desired_lock(150.0, false, &trail()), Some(100.0));
        // p = 230: floor(200/50) = 4 -> $200.
        assert_eq!(desired_lock(230.0, false, &trail()), Some(200.0));
    }

    #[test]
    fn tier_formula_property() {
        // lock == increment * floor((p - buffer) / increment) for any p at or
        // above the first tier.
        let t = trail();
        let mut p: f64 = 80.0;
        while p < 1000.0 {
            let expected = 50.0 * ((p - 30.0) / 50.0).floor();
            assert_eq!(desired_lock(p, false, &t), Some(expected), "p = {p}");
            p += 7.3;
        }
    }

    #[test]
    fn lock_preserves_buffer() {
        // The locked amount always trails the peak by at least the buffer.
        let t = trail();
        let mut p: f64 = 80.0;
        while p < 2000.0 {
            let lock = desired_lock(p, false, &t).unwrap();
            assert!(p - lock >= t.tier_buffer - 1e-9, "p = {p}, lock = {lock}");
            p += 11.7;
        }
    }

    #[test]
    fn quick_profit_forces_breakeven() {
        // Peak below the breakeven threshold, but the override is live.
        assert_eq!(desired_lock(10.0, true, &trail()), Some(0.0));
        // Override never lowers an earned tier.
        assert_eq!(desired_lock(130.0, true, &trail()), Some(100.0));
    }

    #[test]
    fn quick_profit_window() {
        let t = trail();
        assert!(quick_profit_fired(0, 22.0, &t));
        assert!(quick_profit_fired(600, 20.0, &t));
        assert!(!quick_profit_fired(601, 22.0, &t));
        assert!(!quick_profit_fired(120, 19.99, &t));
    }
}
