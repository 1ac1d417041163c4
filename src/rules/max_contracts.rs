// =============================================================================
// Contract-count rules: account-wide cap and per-instrument caps
// =============================================================================

use serde_json::json;

use crate::config::{InstrumentLimitMode, MaxContractsCfg, MaxContractsPerInstrumentCfg, RuleAction};
use crate::domain::{EventType, RiskEvent};
use crate::errors::RiskError;
use crate::rules::{ActionRequest, EngineView, RiskRule, Severity, Violation};

/// Total contracts across all open positions may not exceed the
/// account-wide limit. Breach closes the offending (most recently touched)
/// position.
pub struct MaxContracts {
    cfg: MaxContractsCfg,
}

impl MaxContracts {
    pub fn new(cfg: MaxContractsCfg) -> Self {
        Self { cfg }
    }
}

impl RiskRule for MaxContracts {
    fn id(&self) -> &'static str {
        "max_contracts"
    }

    fn evaluate(
        &mut self,
        event: &RiskEvent,
        view: &EngineView<'_>,
    ) -> Result<Option<Violation>, RiskError> {
        if !matches!(event.event_type, EventType::PositionOpened | EventType::PositionUpdated) {
            return Ok(None);
        }
        let Some(position) = &event.position else {
            return Ok(None);
        };

        let total: i64 = view.positions().iter().map(|p| p.quantity).sum();
        if total <= self.cfg.limit {
            return Ok(None);
        }

        let action = if self.cfg.action == RuleAction::Alert {
            ActionRequest::Alert
        } else {
            ActionRequest::ClosePosition { contract_id: position.contract_id.clone() }
        };

        Ok(Some(Violation {
            rule_id: self.id(),
            severity: if self.cfg.action == RuleAction::Alert {
                Severity::Warning
            } else {
                Severity::Critical
            },
            message: format!(
                "account holds {total} contracts, limit is {} (offending: {})",
                self.cfg.limit, position.contract_id
            ),
            action,
            payload: json!({ "total": total, "limit": self.cfg.limit }),
        }))
    }
}

/// Per-symbol contract caps. A symbol without a configured limit is
/// unrestricted. `reduce_to_limit` mode records the excess being trimmed.
pub struct MaxContractsPerInstrument {
    cfg: MaxContractsPerInstrumentCfg,
}

impl MaxContractsPerInstrument {
    pub fn new(cfg: MaxContractsPerInstrumentCfg) -> Self {
        Self { cfg }
    }
}

impl RiskRule for MaxContractsPerInstrument {
    fn id(&self) -> &'static str {
        "max_contracts_per_instrument"
    }

    fn evaluate(
        &mut self,
        event: &RiskEvent,
        _view: &EngineView<'_>,
    ) -> Result<Option<Violation>, RiskError> {
        if !matches!(event.event_type, EventType::PositionOpened | EventType::PositionUpdated) {
            return Ok(None);
        }
        let Some(position) = &event.position else {
            return Ok(None);
        };
        let Some(&limit) = self.cfg.limits.get(&position.symbol_root) else {
            return Ok(None);
        };
        if position.quantity <= limit {
            return Ok(None);
        }

        let excess = position.quantity - limit;
        let action = if self.cfg.action == RuleAction::Alert {
            ActionRequest::Alert
        } else {
            match self.cfg.mode {
                InstrumentLimitMode::ReduceToLimit => ActionRequest::ReduceToLimit {
                    contract_id: position.contract_id.clone(),
                    excess,
                },
                InstrumentLimitMode::Close => {
                    ActionRequest::ClosePosition { contract_id: position.contract_id.clone() }
                }
            }
        };

        Ok(Some(Violation {
            rule_id: self.id(),
            severity: if self.cfg.action == RuleAction::Alert {
                Severity::Warning
            } else {
                Severity::Critical
            },
            message: format!(
                "{} holds {} contracts, limit is {limit}",
                position.symbol_root, position.quantity
            ),
            action,
            payload: json!({
                "symbol": position.symbol_root,
                "quantity": position.quantity,
                "limit": limit,
                "excess": excess,
            }),
        }))
    }
}

// =============================================================================
// Tests
// =============================================================================
#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::Side;
    use crate::rules::testutil::{position, ViewFixture};
    use rust_decimal_macros::dec;

    fn opened(position: crate::domain::Position) -> RiskEvent {
        RiskEvent::new(EventType::PositionOpened, "ACC-1").with_position(position)
    }

    #[test]
    fn under_the_account_limit_passes() {
        let mut fixture = ViewFixture::new(Default::default());
        fixture.config.rules.max_contracts =
            MaxContractsCfg { enabled: true, limit: 5, action: RuleAction::ClosePosition };
        let pos = position("CON.F.US.MNQ.Z25", "MNQ", Side::Long, 3, dec!(21000.00));
        fixture.positions.push(pos.clone());

        let mut rule = MaxContracts::new(fixture.config.rules.max_contracts.clone());
        let verdict = rule.evaluate(&opened(pos), &fixture.view()).unwrap();
        assert!(verdict.is_none());
    }

    #[test]
    fn breach_closes_the_offending_position() {
        let mut fixture = ViewFixture::new(Default::default());
        fixture.config.rules.max_contracts =
            MaxContractsCfg { enabled: true, limit: 5, action: RuleAction::ClosePosition };
        fixture.positions.push(position("CON.F.US.ES.Z25", "ES", Side::Long, 4, dec!(6000.00)));
        let pos = position("CON.F.US.MNQ.Z25", "MNQ", Side::Long, 3, dec!(21000.00));
        fixture.positions.push(pos.clone());

        let mut rule = MaxContracts::new(fixture.config.rules.max_contracts.clone());
        let violation = rule.evaluate(&opened(pos), &fixture.view()).unwrap().unwrap();
        assert_eq!(violation.severity, Severity::Critical);
        assert_eq!(
            violation.action,
            ActionRequest::ClosePosition { contract_id: "CON.F.US.MNQ.Z25".into() }
        );
        assert_eq!(violation.payload["total"], 7);
    }

    #[test]
    fn alert_action_downgrades_to_warning() {
        let mut fixture = ViewFixture::new(Default::default());
        fixture.config.rules.max_contracts =
            MaxContractsCfg { enabled: true, limit: 1, action: RuleAction::Alert };
        let pos = position("CON.F.US.MNQ.Z25", "MNQ", Side::Long, 3, dec!(21000.00));
        fixture.positions.push(pos.clone());

        let mut rule = MaxContracts::new(fixture.config.rules.max_contracts.clone());
        let violation = rule.evaluate(&opened(pos), &fixture.view()).unwrap().unwrap();
        assert_eq!(violation.severity, Severity::Warning);
        assert_eq!(violation.action, ActionRequest::Alert);
    }

    #[test]
    fn ignores_non_position_events() {
        let fixture = ViewFixture::new(Default::default());
        let mut rule = MaxContracts::new(MaxContractsCfg {
            enabled: true,
            limit: 0,
            action: RuleAction::ClosePosition,
        });
        let event = RiskEvent::new(EventType::OrderFilled, "ACC-1");
        assert!(rule.evaluate(&event, &fixture.view()).unwrap().is_none());
    }

    #[test]
    fn per_instrument_limit_reduces_to_limit() {
        let mut cfg = MaxContractsPerInstrumentCfg {
            enabled: true,
            limits: Default::default(),
            mode: InstrumentLimitMode::ReduceToLimit,
            action: RuleAction::ClosePosition,
        };
        cfg.limits.insert("MNQ".into(), 2);

        let fixture = ViewFixture::new(Default::default());
        let pos = position("CON.F.US.MNQ.Z25", "MNQ", Side::Long, 5, dec!(21000.00));
        let mut rule = MaxContractsPerInstrument::new(cfg);
        let violation = rule.evaluate(&opened(pos), &fixture.view()).unwrap().unwrap();
        assert_eq!(
            violation.action,
            ActionRequest::ReduceToLimit { contract_id: "CON.F.US.MNQ.Z25".into(), excess: 3 }
        );
    }

    #[test]
    fn per_instrument_unconfigured_symbol_is_unrestricted() {
        let cfg = MaxContractsPerInstrumentCfg {
            enabled: true,
            limits: Default::default(),
            mode: InstrumentLimitMode::Close,
            action: RuleAction::ClosePosition,
        };
        let fixture = ViewFixture::new(Default::default());
        let pos = position("CON.F.US.MNQ.Z25", "MNQ", Side::Long, 50, dec!(21000.00));
        let mut rule = MaxContractsPerInstrument::new(cfg);
        assert!(rule.evaluate(&opened(pos), &fixture.view()).unwrap().is_none());
    }
}
