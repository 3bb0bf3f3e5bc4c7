// =============================================================================
// Alpaca REST Adapter — normalized brokerage calls over the trading API
// =============================================================================
//
// SECURITY: the secret key is never logged or serialized. Key and secret
// ride as headers on every request; nothing is signed. Every call takes a
// token from the global rate limiter before hitting the wire and runs under
// a 10-second deadline. Transient failures are retried with backoff inside
// the adapter up to a small bounded budget.
// =============================================================================

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use reqwest::header::{HeaderMap, HeaderValue};
use serde_json::json;
use tracing::{debug, instrument, warn};

use crate::broker::error::BrokerError;
use crate::broker::rate_limit::RateLimiter;
use crate::broker::types::{
    AccountSnapshot, BracketChildren, BracketRequest, BrokerPosition, CancelOutcome, EntryType,
    OrderSnapshot, OrderStatus, TrailSpec, TrailingStopRequest,
};
use crate::broker::Broker;
use crate::types::OrderSide;

/// Per-call deadline.
const REQUEST_TIMEOUT: Duration = Duration::from_secs(10);
/// Attempts for retryable failures before surfacing the error.
const RETRY_ATTEMPTS: u32 = 3;
/// Base backoff between transient retries.
const RETRY_BACKOFF: Duration = Duration::from_millis(250);

/// REST client for the Alpaca trading API.
#[derive(Clone)]
pub struct AlpacaClient {
    base_url: String,
    client: reqwest::Client,
    limiter: Arc<RateLimiter>,
}

impl AlpacaClient {
    // -------------------------------------------------------------------------
    // Construction
    // -------------------------------------------------------------------------

    /// Create a new `AlpacaClient`.
    ///
    /// # Arguments
    /// * `base_url` — trading host, e.g. `https://paper-api.alpaca.markets`.
    /// * `api_key` / `secret` — credentials sent as headers on every request.
    /// * `limiter` — shared token bucket; one per process.
    pub fn new(
        base_url: impl Into<String>,
        api_key: &str,
        secret: &str,
        limiter: Arc<RateLimiter>,
    ) -> Self {
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
            limiter,
        }
    }

    // -------------------------------------------------------------------------
    // Request plumbing
    // -------------------------------------------------------------------------

    /// Send a request with rate limiting and bounded retry on retryable
    /// failures. `build` constructs a fresh request for each attempt.
    async fn send<F>(&self, build: F) -> Result<(reqwest::StatusCode, serde_json::Value), BrokerError>
    where
        F: Fn(&reqwest::Client) -> reqwest::RequestBuilder,
    {
        let mut last_err = BrokerError::Transient("no attempt made".into());

        for attempt in 0..RETRY_ATTEMPTS {
            self.limiter.acquire().await;

            let result = build(&self.client).send().await;

            let resp = match result {
                Ok(r) => r,
                Err(e) => {
                    last_err = BrokerError::Transient(format!("request failed: {e}"));
                    warn!(attempt, error = %last_err, "broker call failed, retrying");
                    tokio::time::sleep(RETRY_BACKOFF * 2u32.pow(attempt)).await;
                    continue;
                }
            };

            let status = resp.status();

            if status.as_u16() == 429 {
                let retry_after = resp
                    .headers()
                    .get("Retry-After")
                    .and_then(|v| v.to_str().ok())
                    .and_then(|s| s.parse::<u64>().ok())
                    .map(Duration::from_secs)
                    .unwrap_or(RETRY_BACKOFF * 2u32.pow(attempt + 2));
                last_err = BrokerError::RateLimited { retry_after };
                warn!(attempt, wait_ms = retry_after.as_millis() as u64, "broker rate limited");
                tokio::time::sleep(retry_after).await;
                continue;
            }

            if status.is_server_error() {
                last_err = BrokerError::Transient(format!("server error {status}"));
                tokio::time::sleep(RETRY_BACKOFF * 2u32.pow(attempt)).await;
                continue;
            }

            // 204 No Content (successful cancel) has no body.
            let body = if status.as_u16() == 204 {
                serde_json::Value::Null
            } else {
                resp.json().await.unwrap_or(serde_json::Value::Null)
            };

            return Ok((status, body));
        }

        Err(last_err)
    }

    /// Fold a non-success HTTP response into the error taxonomy.
    fn map_error(status: reqwest::StatusCode, body: &serde_json::Value) -> BrokerError {
        let message = body
            .get("message")
            .and_then(|m| m.as_str())
            .unwrap_or("")
            .to_lowercase();

        if message.contains("buying power") || message.contains("insufficient") {
            return BrokerError::InsufficientBuyingPower;
        }
        if message.contains("market is closed") || message.contains("market closed") {
            return BrokerError::MarketClosed;
        }
        if message.contains("duplicate") && message.contains("client_order_id") {
            return BrokerError::DuplicateClientOrderId;
        }
        if message.contains("asset") && message.contains("not found") {
            return BrokerError::UnknownSymbol(message);
        }
        // Cancel/replace against a done order.
        if message.contains("not cancelable")
            || message.contains("unable to replace")
            || message.contains("already") && message.contains("filled")
        {
            return BrokerError::AlreadyTerminal;
        }

        BrokerError::Rejected(format!("{status}: {message}"))
    }

    /// Parse a JSON value that may be either a string or a number into `f64`.
    /// The trading API encodes most numerics as strings.
    fn parse_str_f64(val: &serde_json::Value) -> Option<f64> {
        if let Some(s) = val.as_str() {
            s.parse::<f64>().ok()
        } else {
            val.as_f64()
        }
    }

    fn parse_order_snapshot(body: &serde_json::Value) -> Result<OrderSnapshot, BrokerError> {
        let id = body
            .get("id")
            .and_then(|v| v.as_str())
            .ok_or_else(|| BrokerError::Transient("order response missing id".into()))?
            .to_string();

        let symbol = body
            .get("symbol")
            .and_then(|v| v.as_str())
            .unwrap_or_default()
            .to_string();

        let status = body
            .get("status")
            .and_then(|v| v.as_str())
            .map(Self::parse_status)
            .unwrap_or(OrderStatus::Accepted);

        let filled_qty = body
            .get("filled_qty")
            .and_then(Self::parse_str_f64)
            .unwrap_or(0.0) as u32;

        let filled_avg_price = body.get("filled_avg_price").and_then(Self::parse_str_f64);

        Ok(OrderSnapshot {
            id,
            symbol,
            status,
            filled_qty,
            filled_avg_price,
        })
    }

    fn parse_status(s: &str) -> OrderStatus {
        match s {
            "new" | "accepted" | "accepted_for_bidding" | "pending_cancel" | "pending_replace" => {
                OrderStatus::Accepted
            }
            "pending_new" => OrderStatus::PendingNew,
            "partially_filled" => OrderStatus::PartiallyFilled,
            "filled" => OrderStatus::Filled,
            "canceled" | "done_for_day" | "stopped" => OrderStatus::Canceled,
            "replaced" => OrderStatus::Replaced,
            "rejected" => OrderStatus::Rejected,
            "expired" => OrderStatus::Expired,
            other => {
                warn!(status = other, "unrecognized order status, treating as accepted");
                OrderStatus::Accepted
            }
        }
    }
}

#[async_trait]
impl Broker for AlpacaClient {
    #[instrument(skip(self, req), fields(symbol = %req.symbol), name = "alpaca::submit_bracket")]
    async fn submit_bracket(&self, req: BracketRequest) -> Result<String, BrokerError> {
        let mut body = json!({
            "symbol": req.symbol,
            "qty": req.qty.to_string(),
            "side": req.side.to_string(),
            "time_in_force": "day",
            "order_class": "bracket",
            "stop_loss": { "stop_price": format!("{:.2}", req.stop_price) },
            "take_profit": { "limit_price": format!("{:.2}", req.target_price) },
        });
        match req.entry {
            EntryType::Market => {
                body["type"] = json!("market");
            }
            EntryType::Limit(px) => {
                body["type"] = json!("limit");
                body["limit_price"] = json!(format!("{px:.2}"));
            }
        }
        if let Some(coid) = &req.client_order_id {
            body["client_order_id"] = json!(coid);
        }

        let url = format!("{}/v2/orders", self.base_url);
        let (status, resp) = self.send(|c| c.post(&url).json(&body)).await?;

        if !status.is_success() {
            return Err(Self::map_error(status, &resp));
        }

        let parent = Self::parse_order_snapshot(&resp)?;
        debug!(symbol = %req.symbol, parent_id = %parent.id, "bracket submitted");
        Ok(parent.id)
    }

    #[instrument(skip(self, req), fields(symbol = %req.symbol), name = "alpaca::submit_trailing_stop")]
    async fn submit_trailing_stop(&self, req: TrailingStopRequest) -> Result<String, BrokerError> {
        let mut body = json!({
            "symbol": req.symbol,
            "qty": req.qty.to_string(),
            "side": req.exit_side.to_string(),
            "type": "trailing_stop",
            "time_in_force": "gtc",
        });
        match req.trail {
            TrailSpec::Percent(p) => body["trail_percent"] = json!(format!("{p:.2}")),
            TrailSpec::Absolute(d) => body["trail_price"] = json!(format!("{d:.2}")),
        }

        let url = format!("{}/v2/orders", self.base_url);
        let (status, resp) = self.send(|c| c.post(&url).json(&body)).await?;

        if !status.is_success() {
            return Err(Self::map_error(status, &resp));
        }

        Ok(Self::parse_order_snapshot(&resp)?.id)
    }

    #[instrument(skip(self), name = "alpaca::submit_market")]
    async fn submit_market(
        &self,
        symbol: &str,
        side: OrderSide,
        qty: u32,
    ) -> Result<String, BrokerError> {
        let body = json!({
            "symbol": symbol,
            "qty": qty.to_string(),
            "side": side.to_string(),
            "type": "market",
            "time_in_force": "day",
        });

        let url = format!("{}/v2/orders", self.base_url);
        let (status, resp) = self.send(|c| c.post(&url).json(&body)).await?;

        if !status.is_success() {
            return Err(Self::map_error(status, &resp));
        }

        Ok(Self::parse_order_snapshot(&resp)?.id)
    }

    #[instrument(skip(self), name = "alpaca::cancel")]
    async fn cancel(&self, order_id: &str) -> Result<CancelOutcome, BrokerError> {
        let url = format!("{}/v2/orders/{order_id}", self.base_url);
        let (status, resp) = self.send(|c| c.delete(&url)).await?;

        if status.is_success() {
            debug!(order_id, "order cancelled");
            return Ok(CancelOutcome::Cancelled);
        }

        match Self::map_error(status, &resp) {
            BrokerError::AlreadyTerminal => Ok(CancelOutcome::AlreadyTerminal),
            // 422 on cancel means the order is done; treat as terminal.
            BrokerError::Rejected(_) if status.as_u16() == 422 => Ok(CancelOutcome::AlreadyTerminal),
            other => Err(other),
        }
    }

    #[instrument(skip(self), name = "alpaca::replace_stop")]
    async fn replace_stop(&self, order_id: &str, new_stop: f64) -> Result<String, BrokerError> {
        let body = json!({ "stop_price": format!("{new_stop:.2}") });
        let url = format!("{}/v2/orders/{order_id}", self.base_url);
        let (status, resp) = self.send(|c| c.patch(&url).json(&body)).await?;

        if !status.is_success() {
            return Err(Self::map_error(status, &resp));
        }

        let replacement = Self::parse_order_snapshot(&resp)?;
        debug!(old = order_id, new = %replacement.id, new_stop, "stop replaced");
        Ok(replacement.id)
    }

    #[instrument(skip(self), name = "alpaca::children_of")]
    async fn children_of(&self, parent_id: &str) -> Result<BracketChildren, BrokerError> {
        let url = format!("{}/v2/orders/{parent_id}?nested=true", self.base_url);
        let (status, resp) = self.send(|c| c.get(&url)).await?;

        if !status.is_success() {
            return Err(Self::map_error(status, &resp));
        }

        let mut children = BracketChildren::default();
        if let Some(legs) = resp.get("legs").and_then(|v| v.as_array()) {
            for leg in legs {
                let id = leg.get("id").and_then(|v| v.as_str()).map(str::to_string);
                match leg.get("type").and_then(|v| v.as_str()) {
                    Some("stop") | Some("stop_limit") => children.stop_leg_id = id,
                    Some("limit") => children.target_leg_id = id,
                    _ => {}
                }
            }
        }
        Ok(children)
    }

    #[instrument(skip(self), name = "alpaca::order_status")]
    async fn order_status(&self, order_id: &str) -> Result<OrderSnapshot, BrokerError> {
        let url = format!("{}/v2/orders/{order_id}", self.base_url);
        let (status, resp) = self.send(|c| c.get(&url)).await?;

        if !status.is_success() {
            return Err(Self::map_error(status, &resp));
        }

        Self::parse_order_snapshot(&resp)
    }

    #[instrument(skip(self), name = "alpaca::positions")]
    async fn positions(&self) -> Result<Vec<BrokerPosition>, BrokerError> {
        let url = format!("{}/v2/positions", self.base_url);
        let (status, resp) = self.send(|c| c.get(&url)).await?;

        if !status.is_success() {
            return Err(Self::map_error(status, &resp));
        }

        let mut positions = Vec::new();
        if let Some(arr) = resp.as_array() {
            for p in arr {
                let symbol = p.get("symbol").and_then(|v| v.as_str()).unwrap_or_default();
                let qty = p
                    .get("qty")
                    .and_then(Self::parse_str_f64)
                    .unwrap_or(0.0) as i64;
                let avg_entry_price = p
                    .get("avg_entry_price")
                    .and_then(Self::parse_str_f64)
                    .unwrap_or(0.0);
                positions.push(BrokerPosition {
                    symbol: symbol.to_string(),
                    qty,
                    avg_entry_price,
                });
            }
        }
        Ok(positions)
    }

    #[instrument(skip(self), name = "alpaca::account")]
    async fn account(&self) -> Result<AccountSnapshot, BrokerError> {
        let url = format!("{}/v2/account", self.base_url);
        let (status, resp) = self.send(|c| c.get(&url)).await?;

        if !status.is_success() {
            return Err(Self::map_error(status, &resp));
        }

        Ok(AccountSnapshot {
            equity: resp.get("equity").and_then(Self::parse_str_f64).unwrap_or(0.0),
            buying_power: resp
                .get("buying_power")
                .and_then(Self::parse_str_f64)
                .unwrap_or(0.0),
            cash: resp.get("cash").and_then(Self::parse_str_f64).unwrap_or(0.0),
        })
    }
}

impl std::fmt::Debug for AlpacaClient {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("AlpacaClient")
            .field("base_url", &self.base_url)
            .field("credentials", &"<redacted>")
            .finish()
    }
}
