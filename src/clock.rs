// =============================================================================
// Market Clock — time-of-day gates in the configured market timezone
// =============================================================================
//
// Every gate (entry window, entry cutoff, force-close) is evaluated in
// market-local time; everything the engine persists stays UTC. The clock is
// built once from the runtime config and handed to the risk gate and the
// coordinator.
// =============================================================================

use anyhow::{bail, Context, Result};
use chrono::{DateTime, Datelike, NaiveTime, Utc, Weekday};
use chrono_tz::Tz;

use crate::runtime_config::RuntimeConfig;

/// Length of the regular U.S. equity session in minutes (09:30 to 16:00).
const REGULAR_SESSION_MIN: i64 = 390;

/// Resolved session clock. All `NaiveTime` fields are market-local.
#[derive(Debug, Clone)]
pub struct MarketClock {
    tz: Tz,
    market_open: NaiveTime,
    entry_cutoff: NaiveTime,
    position_close: NaiveTime,
    post_open_delay: chrono::Duration,
}

/// Parse an "HH:MM" config string into a `NaiveTime`.
fn parse_hhmm(s: &str) -> Result<NaiveTime> {
    NaiveTime::parse_from_str(s, "%H:%M")
        .with_context(|| format!("invalid HH:MM time string: {s:?}"))
}

impl MarketClock {
    /// Build a clock from the runtime config. Fails on a bad timezone or a
    /// malformed time string; a broken clock is a fatal config error.
    pub fn from_config(config: &RuntimeConfig) -> Result<Self> {
        let tz: Tz = config
            .market_timezone
            .parse()
            .map_err(|e| anyhow::anyhow!("invalid market timezone {:?}: {e}", config.market_timezone))?;

        let market_open = parse_hhmm(&config.market_open_local)?;
        let entry_cutoff = parse_hhmm(&config.trading_cutoff_local)?;
        let position_close = parse_hhmm(&config.position_close_local)?;

        if position_close > entry_cutoff {
            bail!(
                "position_close_local {} must not be after trading_cutoff_local {}",
                config.position_close_local,
                config.trading_cutoff_local
            );
        }

        Ok(Self {
            tz,
            market_open,
            entry_cutoff,
            position_close,
            post_open_delay: chrono::Duration::seconds(config.post_open_delay_s as i64),
        })
    }

    /// Current market-local time.
    pub fn local_time(&self, now: DateTime<Utc>) -> NaiveTime {
        now.with_timezone(&self.tz).time()
    }

    /// Current market-local calendar date.
    pub fn local_date(&self, now: DateTime<Utc>) -> chrono::NaiveDate {
        now.with_timezone(&self.tz).date_naive()
    }

    /// Weekends never trade. Exchange holidays are left to the broker, which
    /// answers `MarketClosed` on submits.
    pub fn is_trading_day(&self, now: DateTime<Utc>) -> bool {
        let wd = now.with_timezone(&self.tz).weekday();
        wd != Weekday::Sat && wd != Weekday::Sun
    }

    /// True while new entries may be admitted: a trading day, at or after
    /// open + post-open delay, strictly before the entry cutoff.
    pub fn entry_window_open(&self, now: DateTime<Utc>) -> bool {
        if !self.is_trading_day(now) {
            return false;
        }
        let t = self.local_time(now);
        let earliest = self.market_open + self.post_open_delay;
        t >= earliest && t < self.entry_cutoff
    }

    /// True once the force-close time has been reached today.
    pub fn past_position_close(&self, now: DateTime<Utc>) -> bool {
        self.is_trading_day(now) && self.local_time(now) >= self.position_close
    }

    /// Local session open time.
    pub fn market_open_time(&self) -> NaiveTime {
        self.market_open
    }

    /// Fraction of the regular session elapsed, in [0, 1]. Zero before the
    /// open.
    pub fn session_fraction(&self, now: DateTime<Utc>) -> f64 {
        let t = self.local_time(now);
        if t <= self.market_open {
            return 0.0;
        }
        let elapsed = (t - self.market_open).num_seconds() as f64;
        (elapsed / (REGULAR_SESSION_MIN as f64 * 60.0)).min(1.0)
    }
}
