// =============================================================================
// Overtrading rules: entry-fill frequency tiers and cooldown after a loss
// =============================================================================

use std::collections::{HashMap, VecDeque};

use chrono::{DateTime, Duration, Utc};
use serde_json::json;

use crate::config::{CooldownAfterLossCfg, RuleAction, TradeFrequencyCfg};
use crate::domain::{EventType, OrderSide, RiskEvent, Side};
use crate::errors::RiskError;
use crate::rules::{ActionRequest, EngineView, LockoutRequest, RiskRule, Severity, Violation};

/// Fallback cooldown seconds per frequency tier when `lockout_durations`
/// does not configure one.
const DEFAULT_MINUTE_COOLDOWN: u64 = 60;
const DEFAULT_HOUR_COOLDOWN: u64 = 300;
const DEFAULT_SESSION_COOLDOWN: u64 = 900;

/// Too many entry fills per minute / hour / session flattens the
/// account and starts a tiered cooldown.
pub struct TradeFrequency {
    cfg: TradeFrequencyCfg,
    durations: HashMap<String, u64>,
    /// Entry-fill timestamps within the last hour.
    fills: VecDeque<DateTime<Utc>>,
    /// Entry fills since the last daily reset.
    session_count: u32,
}

impl TradeFrequency {
    pub fn new(cfg: TradeFrequencyCfg, durations: HashMap<String, u64>) -> Self {
        Self { cfg, durations, fills: VecDeque::new(), session_count: 0 }
    }

    fn count_within(&self, now: DateTime<Utc>, seconds: i64) -> u32 {
        let cutoff = now - Duration::seconds(seconds);
        self.fills.iter().filter(|t| **t > cutoff).count() as u32
    }

    fn cooldown_for(&self, tier: &str, fallback: u64) -> u64 {
        self.durations.get(&format!("trade_frequency_{tier}")).copied().unwrap_or(fallback)
    }

    fn breach(&self, tier: &str, count: u32, limit: u32, cooldown: u64) -> Violation {
        let message =
            format!("{count} entry fills breached the per-{tier} limit of {limit}");
        let action = if self.cfg.action == RuleAction::Alert {
            ActionRequest::Alert
        } else {
            ActionRequest::FlattenAndLockout(LockoutRequest::Cooldown {
                reason: message.clone(),
                duration_seconds: cooldown,
            })
        };
        Violation {
            rule_id: "trade_frequency",
            severity: if self.cfg.action == RuleAction::Alert {
                Severity::Warning
            } else {
                Severity::Critical
            },
            message,
            action,
            payload: json!({
                "tier": tier,
                "count": count,
                "limit": limit,
                "cooldown_seconds": cooldown,
            }),
        }
    }
}

impl RiskRule for TradeFrequency {
    fn id(&self) -> &'static str {
        "trade_frequency"
    }

    fn evaluate(
        &mut self,
        event: &RiskEvent,
        view: &EngineView<'_>,
    ) -> Result<Option<Violation>, RiskError> {
        match event.event_type {
            EventType::DailyReset => {
                self.fills.clear();
                self.session_count = 0;
                return Ok(None);
            }
            EventType::OrderFilled => {}
            _ => return Ok(None),
        }

        // Count entries only: a fill that opens a new position or extends an
        // existing one in the same direction. Exits don't pace the trader.
        if let Some(order) = &event.order {
            let existing =
                view.positions().iter().find(|p| p.contract_id == order.contract_id);
            let is_entry = match existing {
                None => true,
                Some(pos) => matches!(
                    (order.side, pos.side),
                    (OrderSide::Buy, Side::Long) | (OrderSide::Sell, Side::Short)
                ),
            };
            if !is_entry {
                return Ok(None);
            }
        }

        let now = event.timestamp;
        self.fills.push_back(now);
        let hour_cutoff = now - Duration::seconds(3600);
        while matches!(self.fills.front(), Some(t) if *t <= hour_cutoff) {
            self.fills.pop_front();
        }
        self.session_count += 1;

        if self.cfg.per_minute > 0 {
            let count = self.count_within(now, 60);
            if count > self.cfg.per_minute {
                let cooldown = self.cooldown_for("minute", DEFAULT_MINUTE_COOLDOWN);
                return Ok(Some(self.breach("minute", count, self.cfg.per_minute, cooldown)));
            }
        }
        if self.cfg.per_hour > 0 {
            let count = self.count_within(now, 3600);
            if count > self.cfg.per_hour {
                let cooldown = self.cooldown_for("hour", DEFAULT_HOUR_COOLDOWN);
                return Ok(Some(self.breach("hour", count, self.cfg.per_hour, cooldown)));
            }
        }
        if self.cfg.per_session > 0 && self.session_count > self.cfg.per_session {
            let cooldown = self.cooldown_for("session", DEFAULT_SESSION_COOLDOWN);
            return Ok(Some(self.breach(
                "session",
                self.session_count,
                self.cfg.per_session,
                cooldown,
            )));
        }
        Ok(None)
    }
}

/// A single losing trade at or beyond a tier threshold earns a
/// cooldown; the deepest matching tier wins.
pub struct CooldownAfterLoss {
    cfg: CooldownAfterLossCfg,
}

impl CooldownAfterLoss {
    pub fn new(cfg: CooldownAfterLossCfg) -> Self {
        Self { cfg }
    }
}

impl RiskRule for CooldownAfterLoss {
    fn id(&self) -> &'static str {
        "cooldown_after_loss"
    }

    fn evaluate(
        &mut self,
        event: &RiskEvent,
        _view: &EngineView<'_>,
    ) -> Result<Option<Violation>, RiskError> {
        if event.event_type != EventType::PositionClosed {
            return Ok(None);
        }
        let Some(pnl) = event.realized_pnl else {
            return Ok(None);
        };
        if !pnl.is_loss() {
            return Ok(None);
        }

        // Deepest tier whose threshold the loss reaches.
        let tier = self
            .cfg
            .tiers
            .iter()
            .filter(|t| pnl <= t.loss_at_least)
            .min_by_key(|t| t.loss_at_least);
        let Some(tier) = tier else {
            return Ok(None);
        };

        let message = format!(
            "single-trade loss {pnl} reached tier {} -> {}s cooldown",
            tier.loss_at_least, tier.cooldown_seconds
        );
        let action = if self.cfg.action == RuleAction::Alert {
            ActionRequest::Alert
        } else {
            ActionRequest::Lockout(LockoutRequest::Cooldown {
                reason: message.clone(),
                duration_seconds: tier.cooldown_seconds,
            })
        };

        Ok(Some(Violation {
            rule_id: self.id(),
            severity: if self.cfg.action == RuleAction::Alert {
                Severity::Warning
            } else {
                Severity::Critical
            },
            message,
            action,
            payload: json!({
                "trade_pnl": pnl.amount().to_string(),
                "tier_loss": tier.loss_at_least.amount().to_string(),
                "cooldown_seconds": tier.cooldown_seconds,
            }),
        }))
    }
}
