// =============================================================================
// Market Data Provider — TTL-cached bars and quotes over a pluggable feed
// =============================================================================
//
// The provider sits between the engine and the raw REST feed:
//   - memoizes bar series per (symbol, timeframe) with a TTL equal to the
//     bar length, and quotes with a 2-second TTL;
//   - retries transient fetch failures with exponential backoff up to a
//     small bounded budget, then surfaces `DataError::Unavailable`;
//   - validates that returned bars are strictly ascending and gap-free
//     within a session. A missing minute fails the request; no bar is ever
//     fabricated.
// =============================================================================

use std::collections::HashMap;
use std::sync::Arc;
use std::time::{Duration, Instant};

use async_trait::async_trait;
use parking_lot::RwLock;
use tracing::{debug, warn};

use crate::market_data::{Bar, DataError, Quote};
use crate::types::Timeframe;

/// Raw fetch interface. The HTTP implementation talks to the brokerage data
/// API; tests plug in scripted feeds.
#[async_trait]
pub trait BarFeed: Send + Sync {
    async fn fetch_bars(
        &self,
        symbol: &str,
        timeframe: Timeframe,
        limit: usize,
    ) -> Result<Vec<Bar>, DataError>;

    async fn fetch_last(&self, symbol: &str) -> Result<Quote, DataError>;
}

/// Quote cache TTL.
const QUOTE_TTL: Duration = Duration::from_secs(2);
/// Fetch attempts before giving up on a symbol for this tick.
const FETCH_ATTEMPTS: u32 = 3;
/// Base delay for exponential backoff between attempts.
const BACKOFF_BASE: Duration = Duration::from_millis(200);
/// Intraday timestamp deltas at or above this many minutes are treated as a
/// session break rather than a missing bar.
const SESSION_BREAK_MIN: i64 = 120;

struct CachedBars {
    bars: Vec<Bar>,
    fetched_at: Instant,
}

struct CachedQuote {
    quote: Quote,
    fetched_at: Instant,
}

/// TTL-cached market data service.
pub struct MarketDataProvider {
    feed: Arc<dyn BarFeed>,
    bar_cache: RwLock<HashMap<(String, Timeframe), CachedBars>>,
    quote_cache: RwLock<HashMap<String, CachedQuote>>,
}

impl MarketDataProvider {
    pub fn new(feed: Arc<dyn BarFeed>) -> Self {
        Self {
            feed,
            bar_cache: RwLock::new(HashMap::new()),
            quote_cache: RwLock::new(HashMap::new()),
        }
    }

    /// The last `n` bars for `(symbol, timeframe)`, strictly ascending.
    ///
    /// Served from cache while the cache entry is younger than the bar
    /// length and holds at least `n` bars.
    pub async fn bars(
        &self,
        symbol: &str,
        timeframe: Timeframe,
        n: usize,
    ) -> Result<Vec<Bar>, DataError> {
        let key = (symbol.to_string(), timeframe);

        {
            let cache = self.bar_cache.read();
            if let Some(entry) = cache.get(&key) {
                if entry.fetched_at.elapsed() < timeframe.cache_ttl() && entry.bars.len() >= n {
                    let start = entry.bars.len() - n;
                    return Ok(entry.bars[start..].to_vec());
                }
            }
        }

        let bars = self
            .fetch_with_retry(|| self.feed.fetch_bars(symbol, timeframe, n))
            .await?;

        validate_series(&bars, timeframe)?;

        if bars.len() < n {
            return Err(DataError::Unavailable(format!(
                "{symbol} {timeframe}: {} bars available, {n} requested",
                bars.len()
            )));
        }

        debug!(symbol, timeframe = %timeframe, count = bars.len(), "bar series refreshed");

        let result = bars[bars.len() - n..].to_vec();
        self.bar_cache.write().insert(
            key,
            CachedBars {
                bars,
                fetched_at: Instant::now(),
            },
        );
        Ok(result)
    }

    /// Cached last-trade quote, TTL 2 s.
    pub async fn last(&self, symbol: &str) -> Result<Quote, DataError> {
        {
            let cache = self.quote_cache.read();
            if let Some(entry) = cache.get(symbol) {
                if entry.fetched_at.elapsed() < QUOTE_TTL {
                    return Ok(entry.quote.clone());
                }
            }
        }

        let quote = self
            .fetch_with_retry(|| self.feed.fetch_last(symbol))
            .await?;

        self.quote_cache.write().insert(
            symbol.to_string(),
            CachedQuote {
                quote: quote.clone(),
                fetched_at: Instant::now(),
            },
        );
        Ok(quote)
    }

    async fn fetch_with_retry<T, F, Fut>(&self, mut op: F) -> Result<T, DataError>
    where
        F: FnMut() -> Fut,
        Fut: std::future::Future<Output = Result<T, DataError>>,
    {
        let mut last_err = None;
        for attempt in 0..FETCH_ATTEMPTS {
            match op().await {
                Ok(v) => return Ok(v),
                Err(e) => {
                    warn!(attempt, error = %e, "market data fetch failed");
                    last_err = Some(e);
                    if attempt + 1 < FETCH_ATTEMPTS {
                        tokio::time::sleep(BACKOFF_BASE * 2u32.pow(attempt)).await;
                    }
                }
            }
        }
        Err(DataError::Unavailable(
            last_err
                .map(|e| e.to_string())
                .unwrap_or_else(|| "fetch failed".to_string()),
        ))
    }
}

/// Reject unordered or gappy series instead of handing them downstream.
fn validate_series(bars: &[Bar], timeframe: Timeframe) -> Result<(), DataError> {
    let step = timeframe.bar_duration();
    let session_break = chrono::Duration::minutes(SESSION_BREAK_MIN);

    for pair in bars.windows(2) {
        let delta = pair[1].ts - pair[0].ts;

        if delta <= chrono::Duration::zero() {
            return Err(DataError::Malformed(format!(
                "timestamps not strictly ascending at {}",
                pair[1].ts
            )));
        }

        // Daily bars skip weekends; only intraday frames get the exact-step
        // check, and a session break is not a gap.
        if timeframe != Timeframe::Day && delta != step && delta < session_break {
            return Err(DataError::Malformed(format!(
                "missing {timeframe} bar between {} and {}",
                pair[0].ts, pair[1].ts
            )));
        }
    }

    Ok(())
}
