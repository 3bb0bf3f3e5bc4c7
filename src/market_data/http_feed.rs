// =============================================================================
// HTTP Bar Feed — brokerage market data REST API
// =============================================================================
//
// Fetches OHLCV bars and latest trades from the brokerage data host. Key and
// secret ride as headers on every request; nothing is signed. Errors are
// folded into `DataError` here — the provider layer decides about retries.
// =============================================================================

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use reqwest::header::{HeaderMap, HeaderValue};
use serde::Deserialize;
use tracing::debug;

use crate::market_data::{Bar, BarFeed, DataError, Quote};
use crate::types::Timeframe;

/// Per-request deadline.
const REQUEST_TIMEOUT: std::time::Duration = std::time::Duration::from_secs(10);

/// Market data client for the brokerage data API.
#[derive(Clone)]
pub struct HttpBarFeed {
    base_url: String,
    client: reqwest::Client,
}

#[derive(Debug, Deserialize)]
struct WireBar {
    #[serde(rename = "t")]
    ts: DateTime<Utc>,
    #[serde(rename = "o")]
    open: f64,
    #[serde(rename = "h")]
    high: f64,
    #[serde(rename = "l")]
    low: f64,
    #[serde(rename = "c")]
    close: f64,
    #[serde(rename = "v")]
    volume: f64,
}

#[derive(Debug, Deserialize)]
struct BarsResponse {
    #[serde(default)]
    bars: Vec<WireBar>,
}

#[derive(Debug, Deserialize)]
struct WireTrade {
    #[serde(rename = "t")]
    ts: DateTime<Utc>,
    #[serde(rename = "p")]
    price: f64,
}

#[derive(Debug, Deserialize)]
struct LatestTradeResponse {
    trade: WireTrade,
}

impl HttpBarFeed {
    /// Create a new feed client.
    ///
    /// # Arguments
    /// * `base_url` — data API host, e.g. `https://data.alpaca.markets`.
    /// * `api_key` / `secret` — sent as headers on every request.
    pub fn new(base_url: impl Into<String>, api_key: &str, secret: &str) -> Self {
        let mut default_headers = HeaderMap::new();
        if let Ok(val) = HeaderValue::from_str(api_key) {
            default_headers.insert("APCA-API-KEY-ID", val);
        }
        if let Ok(val) = HeaderValue::from_str(secret) {
            default_headers.insert("APCA-API-SECRET-KEY", val);
        }

        let client = reqwest::Client::builder()
            .default_headers(default_headers)
            .timeout(REQUEST_TIMEOUT)
            .build()
            .expect("failed to build reqwest client");

        Self {
            base_url: base_url.into(),
            client,
        }
    }

    async fn get_json<T: serde::de::DeserializeOwned>(&self, url: &str) -> Result<T, DataError> {
        let resp = self
            .client
            .get(url)
            .send()
            .await
            .map_err(|e| DataError::Unavailable(format!("request failed: {e}")))?;

        let status = resp.status();
        if !status.is_success() {
            let body = resp.text().await.unwrap_or_default();
            return Err(DataError::Unavailable(format!(
                "data API returned {status}: {body}"
            )));
        }

        resp.json::<T>()
            .await
            .map_err(|e| DataError::Malformed(format!("bad response body: {e}")))
    }
}

#[async_trait]
impl BarFeed for HttpBarFeed {
    async fn fetch_bars(
        &self,
        symbol: &str,
        timeframe: Timeframe,
        limit: usize,
    ) -> Result<Vec<Bar>, DataError> {
        let url = format!(
            "{}/v2/stocks/{}/bars?timeframe={}&limit={}&adjustment=raw",
            self.base_url,
            symbol,
            timeframe.api_name(),
            limit
        );

        let resp: BarsResponse = self.get_json(&url).await?;

        let bars: Vec<Bar> = resp
            .bars
            .into_iter()
            .map(|w| Bar {
                ts: w.ts,
                open: w.open,
                high: w.high,
                low: w.low,
                close: w.close,
                volume: w.volume,
            })
            .collect();

        debug!(symbol, timeframe = %timeframe, count = bars.len(), "bars fetched");
        Ok(bars)
    }

    async fn fetch_last(&self, symbol: &str) -> Result<Quote, DataError> {
        let url = format!("{}/v2/stocks/{}/trades/latest", self.base_url, symbol);

        let resp: LatestTradeResponse = self.get_json(&url).await?;

        Ok(Quote {
            symbol: symbol.to_string(),
            last: resp.trade.price,
            ts: resp.trade.ts,
        })
    }
}

impl std::fmt::Debug for HttpBarFeed {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("HttpBarFeed")
            .field("base_url", &self.base_url)
            .finish()
    }
}
