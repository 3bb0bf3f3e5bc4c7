// =============================================================================
// Market Data Module
// =============================================================================

pub mod http_feed;
pub mod provider;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use thiserror::Error;

pub use http_feed::HttpBarFeed;
pub use provider::{BarFeed, MarketDataProvider};

/// A single OHLCV bar. Immutable once observed.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Bar {
    pub ts: DateTime<Utc>,
    pub open: f64,
    pub high: f64,
    pub low: f64,
    pub close: f64,
    pub volume: f64,
}

/// Last-trade quote for a symbol.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Quote {
    pub symbol: String,
    pub last: f64,
    pub ts: DateTime<Utc>,
}

/// Market data failures surfaced to callers. The scanner treats every
/// variant the same way: skip the symbol this tick.
#[derive(Debug, Clone, Error)]
pub enum DataError {
    #[error("data unavailable: {0}")]
    Unavailable(String),
    #[error("bar series malformed: {0}")]
    Malformed(String),
}
