// =============================================================================
// Broker error taxonomy — normalized failures surfaced to callers
// =============================================================================
//
// Every adapter folds its wire-level failures into this closed set so that
// the risk gate, position manager, and coordinator can branch on kind, never
// on message text.
// =============================================================================

use std::time::Duration;

use thiserror::Error;

#[derive(Debug, Clone, Error)]
pub enum BrokerError {
    #[error("insufficient buying power")]
    InsufficientBuyingPower,

    #[error("market is closed")]
    MarketClosed,

    #[error("unknown symbol: {0}")]
    UnknownSymbol(String),

    #[error("duplicate client order id")]
    DuplicateClientOrderId,

    #[error("rate limited, retry after {retry_after:?}")]
    RateLimited { retry_after: Duration },

    #[error("transient broker failure: {0}")]
    Transient(String),

    #[error("order rejected: {0}")]
    Rejected(String),

    /// The order reached a terminal state before the call took effect.
    /// For cancels and stop replaces this is semantically success.
    #[error("order already terminal")]
    AlreadyTerminal,
}

impl BrokerError {
    /// Whether the adapter may retry the call as-is.
    pub fn is_retryable(&self) -> bool {
        matches!(self, Self::Transient(_) | Self::RateLimited { .. })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn retryable_kinds() {
        assert!(BrokerError::Transient("socket".into()).is_retryable());
        assert!(BrokerError::RateLimited { retry_after: Duration::from_secs(1) }.is_retryable());
        assert!(!BrokerError::Rejected("no".into()).is_retryable());
        assert!(!BrokerError::AlreadyTerminal.is_retryable());
    }
}
