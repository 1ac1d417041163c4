// =============================================================================
// Trade management rule: move stops to breakeven, then trail
// =============================================================================
//
// Works only on positions that already have an observed stop order; creating
// protection is the grace rule's domain. Emits at most one stop modification
// per evaluation and remembers the last price it asked for, so a stream of
// quote updates does not spam the broker with identical modifies.
// =============================================================================

use std::collections::HashMap;

use rust_decimal::Decimal;
use serde_json::json;

use crate::config::{RuleAction, TradeManagementCfg};
use crate::domain::{EventType, Position, RiskEvent, Side};
use crate::errors::RiskError;
use crate::rules::{ActionRequest, EngineView, RiskRule, Severity, StopOrderUpdate, Violation};

pub struct TradeManagement {
    cfg: TradeManagementCfg,
    /// Last stop price requested per contract.
    requested: HashMap<String, Decimal>,
}

impl TradeManagement {
    pub fn new(cfg: TradeManagementCfg) -> Self {
        Self { cfg, requested: HashMap::new() }
    }

    /// The stop price this position should have at `mark`, if an adjustment
    /// is warranted.
    fn desired_stop(
        &self,
        position: &Position,
        mark: Decimal,
        tick_size: Decimal,
        current_stop: Decimal,
    ) -> Option<Decimal> {
        let sign = position.side.sign();
        let profit_ticks = (mark - position.entry_price) / tick_size * sign;

        if profit_ticks < Decimal::from(self.cfg.breakeven_trigger_ticks) {
            return None;
        }

        // Past the breakeven trigger: at least entry.
        let mut desired = position.entry_price;

        if self.cfg.enable_trailing {
            let trail_distance = Decimal::from(self.cfg.trail_ticks) * tick_size;
            let trailed = match position.side {
                Side::Long => mark - trail_distance,
                Side::Short => mark + trail_distance,
            };
            // Take the more protective of breakeven and the trail.
            desired = match position.side {
                Side::Long => desired.max(trailed),
                Side::Short => desired.min(trailed),
            };
        }

        // Only ever tighten the stop.
        let improves = match position.side {
            Side::Long => desired > current_stop,
            Side::Short => desired < current_stop,
        };
        improves.then_some(desired)
    }
}

impl RiskRule for TradeManagement {
    fn id(&self) -> &'static str {
        "trade_management"
    }

    fn evaluate(
        &mut self,
        event: &RiskEvent,
        view: &EngineView<'_>,
    ) -> Result<Option<Violation>, RiskError> {
        match event.event_type {
            EventType::PositionUpdated | EventType::UnrealizedPnlUpdate => {}
            EventType::PositionClosed => {
                if let Some(position) = &event.position {
                    self.requested.remove(&position.contract_id);
                }
                return Ok(None);
            }
            _ => return Ok(None),
        }

        for position in view.positions() {
            let Some(mark) = view.market_price(&position.symbol_root) else {
                continue;
            };
            let Some(stop_order) = view.stop_order_for(&position.contract_id) else {
                continue;
            };
            let Some(current_stop) = stop_order.stop_price else {
                continue;
            };
            let ticks = view.tick_economics(&position.symbol_root)?;

            let Some(desired) =
                self.desired_stop(position, mark, ticks.tick_size, current_stop)
            else {
                continue;
            };
            if self.requested.get(&position.contract_id) == Some(&desired) {
                continue;
            }
            self.requested.insert(position.contract_id.clone(), desired);

            let at_breakeven = desired == position.entry_price;
            let action = if self.cfg.action == RuleAction::Alert {
                ActionRequest::Alert
            } else {
                ActionRequest::ModifyOrder {
                    order_id: stop_order.order_id.clone(),
                    updates: StopOrderUpdate { stop_price: desired },
                }
            };

            return Ok(Some(Violation {
                rule_id: self.id(),
                severity: Severity::Warning,
                message: format!(
                    "moving stop for {} to {desired} ({})",
                    position.symbol_root,
                    if at_breakeven { "breakeven" } else { "trailing" },
                ),
                action,
                payload: json!({
                    "contract_id": position.contract_id,
                    "order_id": stop_order.order_id,
                    "from": current_stop.to_string(),
                    "to": desired.to_string(),
                    "mark": mark.to_string(),
                }),
            }));
        }
        Ok(None)
    }
}
