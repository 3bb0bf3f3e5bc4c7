// =============================================================================
// Broker wire types — requests and snapshots shared by all adapters
// =============================================================================

use serde::{Deserialize, Serialize};

use crate::types::OrderSide;

/// How the entry leg of a bracket is priced.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub enum EntryType {
    Market,
    Limit(f64),
}

/// A bracket submit: entry plus attached stop and target legs.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BracketRequest {
    pub symbol: String,
    pub side: OrderSide,
    pub qty: u32,
    pub entry: EntryType,
    pub stop_price: f64,
    pub target_price: f64,
    /// Client-assigned id for dedup on the broker side.
    pub client_order_id: Option<String>,
}

/// Trail distance for a broker-native trailing stop.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub enum TrailSpec {
    Percent(f64),
    Absolute(f64),
}

/// A broker-native trailing stop submit (GTC).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TrailingStopRequest {
    pub symbol: String,
    pub exit_side: OrderSide,
    pub qty: u32,
    pub trail: TrailSpec,
}

/// Outcome of an idempotent cancel.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CancelOutcome {
    Cancelled,
    AlreadyTerminal,
}

/// Child legs of a bracket parent. Both are `None` until the entry fills.
#[derive(Debug, Clone, Default)]
pub struct BracketChildren {
    pub stop_leg_id: Option<String>,
    pub target_leg_id: Option<String>,
}

/// Normalized order state.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum OrderStatus {
    PendingNew,
    Accepted,
    PartiallyFilled,
    Filled,
    Canceled,
    Replaced,
    Rejected,
    Expired,
}

impl OrderStatus {
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            Self::Filled | Self::Canceled | Self::Replaced | Self::Rejected | Self::Expired
        )
    }
}

/// Point-in-time view of a single order.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct OrderSnapshot {
    pub id: String,
    pub symbol: String,
    pub status: OrderStatus,
    pub filled_qty: u32,
    pub filled_avg_price: Option<f64>,
}

/// A position as the broker reports it. `qty` is signed: positive long,
/// negative short.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BrokerPosition {
    pub symbol: String,
    pub qty: i64,
    pub avg_entry_price: f64,
}

/// Account state used by the risk gate's notional checks.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AccountSnapshot {
    pub equity: f64,
    pub buying_power: f64,
    pub cash: f64,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn terminal_statuses() {
        assert!(OrderStatus::Filled.is_terminal());
        assert!(OrderStatus::Canceled.is_terminal());
        assert!(OrderStatus::Replaced.is_terminal());
        assert!(!OrderStatus::Accepted.is_terminal());
        assert!(!OrderStatus::PartiallyFilled.is_terminal());
    }

    #[test]
    fn status_wire_names() {
        let s: OrderStatus = serde_json::from_str("\"partially_filled\"").unwrap();
        assert_eq!(s, OrderStatus::PartiallyFilled);
        assert_eq!(serde_json::to_string(&OrderStatus::PendingNew).unwrap(), "\"pending_new\"");
    }
}
