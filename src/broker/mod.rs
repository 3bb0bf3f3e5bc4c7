// =============================================================================
// Broker Adapter Module
// =============================================================================
//
// `Broker` is the engine-facing facade: typed requests in, normalized
// results or `BrokerError` out. Two implementations ship: the live REST
// adapter (`AlpacaClient`) and the in-memory paper simulator (`PaperBroker`)
// used by Demo mode and the simulation tests.

pub mod alpaca;
pub mod error;
pub mod paper;
pub mod rate_limit;
pub mod types;

use async_trait::async_trait;

pub use alpaca::AlpacaClient;
pub use error::BrokerError;
pub use paper::PaperBroker;
pub use rate_limit::RateLimiter;
pub use types::{
    AccountSnapshot, BracketChildren, BracketRequest, BrokerPosition, CancelOutcome, EntryType,
    OrderSnapshot, OrderStatus, TrailSpec, TrailingStopRequest,
};

use crate::types::OrderSide;

/// Typed, normalized brokerage facade.
///
/// Every method may block on network I/O, respects the global rate limit,
/// and runs under a per-call deadline inside the adapter.
#[async_trait]
pub trait Broker: Send + Sync {
    /// Submit an entry with attached stop and target legs. Returns the
    /// parent order id.
    async fn submit_bracket(&self, req: BracketRequest) -> Result<String, BrokerError>;

    /// Submit a broker-native trailing stop (GTC).
    async fn submit_trailing_stop(&self, req: TrailingStopRequest) -> Result<String, BrokerError>;

    /// Submit a plain market order.
    async fn submit_market(
        &self,
        symbol: &str,
        side: OrderSide,
        qty: u32,
    ) -> Result<String, BrokerError>;

    /// Cancel an order. Idempotent: cancelling an already-terminal order
    /// returns `CancelOutcome::AlreadyTerminal`, not an error.
    async fn cancel(&self, order_id: &str) -> Result<CancelOutcome, BrokerError>;

    /// Move a stop order to `new_stop`. Atomic replace where the venue
    /// supports it, cancel-then-resubmit with rollback where it does not.
    /// Returns the id of the live stop order after the call.
    async fn replace_stop(&self, order_id: &str, new_stop: f64) -> Result<String, BrokerError>;

    /// The child legs of a bracket parent. Legs appear once the entry fills.
    async fn children_of(&self, parent_id: &str) -> Result<BracketChildren, BrokerError>;

    /// Point-in-time status of a single order.
    async fn order_status(&self, order_id: &str) -> Result<OrderSnapshot, BrokerError>;

    /// All open positions at the broker, including ones this engine does not
    /// manage.
    async fn positions(&self) -> Result<Vec<BrokerPosition>, BrokerError>;

    /// Account equity and buying power.
    async fn account(&self) -> Result<AccountSnapshot, BrokerError>;

    /// Price hint for simulated brokers. Live adapters ignore it; the paper
    /// broker uses it to trigger pending fills.
    fn observe_price(&self, _symbol: &str, _last: f64) {}
}
