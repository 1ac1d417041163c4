// =============================================================================
// Error taxonomy for the RiskGuard daemon
// =============================================================================
//
// Every failure the daemon can observe is a tagged variant of `RiskError`.
// Adapter errors (Mapping / Units / SignConvention / Quantity / Price) cause
// the offending event to be dropped with an audit row; Config errors abort
// startup; the remaining variants carry the retry policies described on the
// component that raises them.
// =============================================================================

use thiserror::Error;

#[derive(Debug, Error)]
pub enum RiskError {
    /// A required field was missing or had the wrong shape in a raw broker
    /// payload. The event never reaches the rules.
    #[error("mapping error: {0}")]
    Mapping(String),

    /// Tick economics could not be resolved for a symbol. Also surfaces
    /// config/tick-table gaps.
    #[error("units error: no tick economics for '{symbol}' (known roots: {known})")]
    Units { symbol: String, known: String },

    /// Realized or unrealized P&L arrived with a sign that contradicts the
    /// directional price movement. Indicates an upstream bug.
    #[error("sign convention error: {0}")]
    SignConvention(String),

    /// A position or order quantity was zero or negative.
    #[error("quantity error: {0}")]
    Quantity(String),

    /// A price did not align to the instrument's tick size.
    #[error("price error: {0}")]
    Price(String),

    /// The configuration tree is invalid. Raised only at startup; the daemon
    /// refuses to run.
    #[error("config error: {0}")]
    Config(String),

    /// A broker-directed enforcement command failed.
    #[error("enforcement error: {0}")]
    Enforcement(String),

    /// A single rule failed during evaluation. The engine logs it and
    /// continues with the remaining rules.
    #[error("rule '{rule_id}' evaluation error: {message}")]
    RuleEvaluation { rule_id: String, message: String },

    /// The state store rejected a write or read.
    #[error("persistence error: {0}")]
    Persistence(String),
}

impl RiskError {
    pub fn mapping(msg: impl Into<String>) -> Self {
        Self::Mapping(msg.into())
    }

    pub fn quantity(msg: impl Into<String>) -> Self {
        Self::Quantity(msg.into())
    }

    pub fn price(msg: impl Into<String>) -> Self {
        Self::Price(msg.into())
    }

    pub fn sign(msg: impl Into<String>) -> Self {
        Self::SignConvention(msg.into())
    }

    pub fn config(msg: impl Into<String>) -> Self {
        Self::Config(msg.into())
    }

    /// The audit `rule_id` under which adapter-stage failures are recorded.
    pub fn is_ingest(&self) -> bool {
        matches!(
            self,
            Self::Mapping(_)
                | Self::Units { .. }
                | Self::SignConvention(_)
                | Self::Quantity(_)
                | Self::Price(_)
        )
    }
}

impl From<rusqlite::Error> for RiskError {
    fn from(e: rusqlite::Error) -> Self {
        Self::Persistence(e.to_string())
    }
}

// =============================================================================
// Tests
// =============================================================================
#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn units_error_lists_known_roots() {
        let e = RiskError::Units {
            symbol: "XYZ".into(),
            known: "ES, MNQ, NQ".into(),
        };
        let msg = e.to_string();
        assert!(msg.contains("XYZ"));
        assert!(msg.contains("MNQ"));
    }

    #[test]
    fn ingest_classification() {
        assert!(RiskError::mapping("missing contractId").is_ingest());
        assert!(RiskError::price("off tick").is_ingest());
        assert!(!RiskError::config("bad key").is_ingest());
        assert!(!RiskError::Persistence("locked".into()).is_ingest());
    }
}
