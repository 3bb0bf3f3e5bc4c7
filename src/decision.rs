// =============================================================================
// Scan Decision — auditable record of every trade/no-trade decision
// =============================================================================
//
// Every scanner pass over a symbol ends in exactly one of these. The ring of
// recent decisions feeds the dashboard so a no-trade day can be explained
// after the fact.
// =============================================================================

use serde::Serialize;

/// Verdict of one scanner pass over one symbol.
#[derive(Debug, Clone, Serialize)]
pub struct ScanDecision {
    /// Unique identifier (UUID v4).
    pub id: String,
    pub symbol: String,
    /// "ADMIT", "REJECT", or "SKIP".
    pub verdict: String,
    /// Pipeline stage that produced the verdict ("DataQuality", "Strategy",
    /// "RiskGate", "Broker").
    pub stage: String,
    /// Human-readable detail.
    pub reason: Option<String>,
    /// Signal score when the evaluator got that far.
    pub signal_strength: Option<i32>,
    /// ISO 8601 timestamp.
    pub created_at: String,
}

impl ScanDecision {
    pub fn admit(symbol: impl Into<String>, signal_strength: i32) -> Self {
        Self {
            id: uuid::Uuid::new_v4().to_string(),
            symbol: symbol.into(),
            verdict: "ADMIT".to_string(),
            stage: "RiskGate".to_string(),
            reason: None,
            signal_strength: Some(signal_strength),
            created_at: chrono::Utc::now().to_rfc3339(),
        }
    }

    pub fn reject(
        symbol: impl Into<String>,
        stage: impl Into<String>,
        reason: impl Into<String>,
    ) -> Self {
        Self {
            id: uuid::Uuid::new_v4().to_string(),
            symbol: symbol.into(),
            verdict: "REJECT".to_string(),
            stage: stage.into(),
            reason: Some(reason.into()),
            signal_strength: None,
            created_at: chrono::Utc::now().to_rfc3339(),
        }
    }

    pub fn skip(symbol: impl Into<String>, reason: impl Into<String>) -> Self {
        Self {
            id: uuid::Uuid::new_v4().to_string(),
            symbol: symbol.into(),
            verdict: "SKIP".to_string(),
            stage: "DataQuality".to_string(),
            reason: Some(reason.into()),
            signal_strength: None,
            created_at: chrono::Utc::now().to_rfc3339(),
        }
    }
}
