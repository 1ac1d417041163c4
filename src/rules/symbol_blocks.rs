// =============================================================================
// Symbol blocklist rule
// =============================================================================

use serde_json::json;

use crate::config::{RuleAction, SymbolBlocksCfg};
use crate::domain::{EventType, RiskEvent};
use crate::errors::RiskError;
use crate::rules::{ActionRequest, EngineView, RiskRule, Severity, Violation};

/// Positions and orders in blocked symbols are closed / cancelled.
/// Matching is case-insensitive on the symbol root; `*` blocks everything.
pub struct SymbolBlocks {
    blocked: Vec<String>,
    wildcard: bool,
    action: RuleAction,
}

impl SymbolBlocks {
    pub fn new(cfg: SymbolBlocksCfg) -> Self {
        let blocked: Vec<String> = cfg.blocked.iter().map(|s| s.to_uppercase()).collect();
        let wildcard = blocked.iter().any(|s| s == "*");
        Self { blocked, wildcard, action: cfg.action }
    }

    fn is_blocked(&self, symbol_root: &str) -> bool {
        self.wildcard || self.blocked.iter().any(|b| b == &symbol_root.to_uppercase())
    }

    fn severity(&self) -> Severity {
        if self.action == RuleAction::Alert {
            Severity::Warning
        } else {
            Severity::Critical
        }
    }
}

impl RiskRule for SymbolBlocks {
    fn id(&self) -> &'static str {
        "symbol_blocks"
    }

    fn evaluate(
        &mut self,
        event: &RiskEvent,
        view: &EngineView<'_>,
    ) -> Result<Option<Violation>, RiskError> {
        match event.event_type {
            EventType::PositionOpened | EventType::PositionUpdated => {
                let Some(position) = &event.position else {
                    return Ok(None);
                };
                if !self.is_blocked(&position.symbol_root) {
                    return Ok(None);
                }
                let action = if self.action == RuleAction::Alert {
                    ActionRequest::Alert
                } else {
                    ActionRequest::ClosePosition { contract_id: position.contract_id.clone() }
                };
                Ok(Some(Violation {
                    rule_id: self.id(),
                    severity: self.severity(),
                    message: format!("position in blocked symbol {}", position.symbol_root),
                    action,
                    payload: json!({
                        "symbol": position.symbol_root,
                        "contract_id": position.contract_id,
                    }),
                }))
            }
            EventType::OrderPlaced => {
                let Some(order) = &event.order else {
                    return Ok(None);
                };
                // Orders carry the contract id; resolve its root through the
                // open-position book first, falling back to a raw-prefix strip.
                let root = view
                    .positions()
                    .iter()
                    .find(|p| p.contract_id == order.contract_id)
                    .map(|p| p.symbol_root.clone())
                    .unwrap_or_else(|| root_of_contract(&order.contract_id));
                if !self.is_blocked(&root) {
                    return Ok(None);
                }
                let action = if self.action == RuleAction::Alert {
                    ActionRequest::Alert
                } else {
                    ActionRequest::CancelOrder { order_id: order.order_id.clone() }
                };
                Ok(Some(Violation {
                    rule_id: self.id(),
                    severity: self.severity(),
                    message: format!("order {} in blocked symbol {root}", order.order_id),
                    action,
                    payload: json!({ "symbol": root, "order_id": order.order_id }),
                }))
            }
            _ => Ok(None),
        }
    }
}

/// Root extraction for contracts without an open position (no alias table:
/// the blocklist is matched on the raw root too).
fn root_of_contract(contract_id: &str) -> String {
    let rest = contract_id
        .strip_prefix("CON.F.US.")
        .or_else(|| contract_id.strip_prefix("F.US."))
        .unwrap_or(contract_id);
    rest.split('.').next().unwrap_or(rest).to_uppercase()
}
