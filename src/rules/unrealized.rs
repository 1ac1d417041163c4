// =============================================================================
// Unrealized P&L rules: composite-aware loss limit and profit taking
// =============================================================================
//
// The unrealized loss rule can tighten its own threshold as realized losses
// consume the daily budget: with composite enforcement on, the effective
// bound is `max(configured_unrealized_limit, realized_limit - realized_pnl)`
// (both negative; max picks the tighter one). An open loss can then never
// close into a realized loss that breaches the daily realized limit.
// =============================================================================

use serde_json::json;
use tracing::debug;

use crate::config::{DailyUnrealizedLossCfg, MaxUnrealizedProfitCfg, RuleAction};
use crate::domain::{EventType, Money, Position, RiskEvent};
use crate::errors::RiskError;
use crate::rules::{ActionRequest, EngineView, RiskRule, Severity, Violation};

/// Close the deepest losing position when total unrealized P&L
/// breaches the (possibly composite-tightened) limit.
pub struct DailyUnrealizedLoss {
    cfg: DailyUnrealizedLossCfg,
    /// Resolved from `composite_enforcement.realized_rule_ref` at engine
    /// construction: the daily realized loss rule's configured limit.
    realized_limit: Money,
}

impl DailyUnrealizedLoss {
    pub fn new(cfg: DailyUnrealizedLossCfg, realized_limit: Money) -> Self {
        Self { cfg, realized_limit }
    }

    /// The threshold in force for this evaluation, and whether composite
    /// enforcement tightened it.
    fn effective_threshold(&self, realized_so_far: Money) -> (Money, bool) {
        let configured = self.cfg.limit;
        let composite = &self.cfg.composite_enforcement;
        if !(composite.enabled && composite.respect_realized_limit) {
            return (configured, false);
        }
        // Remaining realized-loss budget; negative Money, shrinking toward
        // zero as losses accumulate.
        let budget = self.realized_limit - realized_so_far;
        let effective = configured.max(budget);
        (effective, effective != configured)
    }
}

impl RiskRule for DailyUnrealizedLoss {
    fn id(&self) -> &'static str {
        "daily_unrealized_loss"
    }

    fn evaluate(
        &mut self,
        event: &RiskEvent,
        view: &EngineView<'_>,
    ) -> Result<Option<Violation>, RiskError> {
        if !matches!(
            event.event_type,
            EventType::UnrealizedPnlUpdate
                | EventType::PositionOpened
                | EventType::PositionUpdated
        ) {
            return Ok(None);
        }

        let total = view.total_unrealized();
        let (effective, tightened) = self.effective_threshold(view.realized_pnl());
        if tightened {
            debug!(
                configured = %self.cfg.limit,
                effective = %effective,
                realized = %view.realized_pnl(),
                "composite enforcement tightened unrealized loss limit"
            );
        }
        if total > effective {
            return Ok(None);
        }

        // Close the deepest losing position.
        let worst: Option<&Position> = view
            .positions()
            .iter()
            .filter(|p| p.unrealized_pnl.is_some())
            .min_by_key(|p| p.unrealized_pnl);
        let Some(worst) = worst else {
            return Ok(None);
        };

        let action = if self.cfg.action == RuleAction::Alert {
            ActionRequest::Alert
        } else {
            ActionRequest::ClosePosition { contract_id: worst.contract_id.clone() }
        };

        Ok(Some(Violation {
            rule_id: self.id(),
            severity: if self.cfg.action == RuleAction::Alert {
                Severity::Warning
            } else {
                Severity::Critical
            },
            message: format!(
                "total unrealized P&L {total} breached limit {effective} \
                 (configured {})",
                self.cfg.limit
            ),
            action,
            payload: json!({
                "total_unrealized": total.amount().to_string(),
                "configured_limit": self.cfg.limit.amount().to_string(),
                "effective_limit": effective.amount().to_string(),
                "composite_tightened": tightened,
            }),
        }))
    }
}

/// Take profit: close any position whose unrealized P&L has reached
/// the per-position target.
pub struct MaxUnrealizedProfit {
    cfg: MaxUnrealizedProfitCfg,
}

impl MaxUnrealizedProfit {
    pub fn new(cfg: MaxUnrealizedProfitCfg) -> Self {
        Self { cfg }
    }
}

impl RiskRule for MaxUnrealizedProfit {
    fn id(&self) -> &'static str {
        "max_unrealized_profit"
    }

    fn evaluate(
        &mut self,
        event: &RiskEvent,
        view: &EngineView<'_>,
    ) -> Result<Option<Violation>, RiskError> {
        if event.event_type != EventType::UnrealizedPnlUpdate {
            return Ok(None);
        }

        let winner = view.positions().iter().find(|p| {
            p.unrealized_pnl.map(|u| u >= self.cfg.target).unwrap_or(false)
        });
        let Some(winner) = winner else {
            return Ok(None);
        };
        let Some(unrealized) = winner.unrealized_pnl else {
            return Ok(None);
        };

        let action = if self.cfg.action == RuleAction::Alert {
            ActionRequest::Alert
        } else {
            ActionRequest::ClosePosition { contract_id: winner.contract_id.clone() }
        };

        Ok(Some(Violation {
            rule_id: self.id(),
            severity: if self.cfg.action == RuleAction::Alert {
                Severity::Warning
            } else {
                Severity::Critical
            },
            message: format!(
                "{} unrealized P&L {unrealized} reached profit target {}",
                winner.symbol_root, self.cfg.target
            ),
            action,
            payload: json!({
                "contract_id": winner.contract_id,
                "unrealized": unrealized.amount().to_string(),
                "target": self.cfg.target.amount().to_string(),
            }),
        }))
    }
}
