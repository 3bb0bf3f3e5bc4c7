// =============================================================================
// Position Module
// =============================================================================

pub mod manager;
pub mod tiers;

pub use manager::{ExitKind, ExitRecord, ManagedPosition, PositionManager, PositionState};

// =============================================================================
// Shared test helpers
// =============================================================================
#[cfg(test)]
pub mod tests {
    use super::*;
    use chrono::Utc;
    use parking_lot::Mutex;
    use std::sync::Arc;

    use crate::types::Side;

    /// A minimal open long position for ledger tests.
    pub fn managed_long(symbol: &str, entry: f64, size: u32) -> Arc<Mutex<ManagedPosition>> {
        Arc::new(Mutex::new(ManagedPosition {
            symbol: symbol.to_string(),
            side: Side::Long,
            size_shares: size,
            entry_price: entry,
            entry_time: Utc::now(),
            parent_order_id: "parent".to_string(),
            current_stop_price: entry - 1.5,
            current_stop_order_id: None,
            target_order_id: None,
            target_price: entry + 3.75,
            state: PositionState::OpenInitial,
            locked_profit_dollars: 0.0,
            highest_profit_seen_dollars: 0.0,
            last_stop_replace_time: None,
            replace_failures: 0,
            close_order_id: None,
            exit: None,
        }))
    }
}
