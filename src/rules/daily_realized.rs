// =============================================================================
// Daily realized P&L rules: loss limit and profit target
// =============================================================================
//
// Both evaluate on POSITION_CLOSED against the daily ledger (which already
// includes the closing trade) and both end the trading day the same way:
// flatten everything and hard-lock until the next daily reset.
// =============================================================================

use serde_json::json;

use crate::config::{DailyRealizedLossCfg, DailyRealizedProfitCfg, RuleAction};
use crate::domain::{EventType, RiskEvent};
use crate::errors::RiskError;
use crate::reset::TradingCalendar;
use crate::rules::{ActionRequest, EngineView, LockoutRequest, RiskRule, Severity, Violation};

/// Flatten and hard-lock when the day's realized P&L reaches the
/// configured (negative) limit.
pub struct DailyRealizedLoss {
    cfg: DailyRealizedLossCfg,
    calendar: TradingCalendar,
}

impl DailyRealizedLoss {
    pub fn new(cfg: DailyRealizedLossCfg, calendar: TradingCalendar) -> Self {
        Self { cfg, calendar }
    }
}

impl RiskRule for DailyRealizedLoss {
    fn id(&self) -> &'static str {
        "daily_realized_loss"
    }

    fn evaluate(
        &mut self,
        event: &RiskEvent,
        view: &EngineView<'_>,
    ) -> Result<Option<Violation>, RiskError> {
        if event.event_type != EventType::PositionClosed {
            return Ok(None);
        }

        let daily = view.realized_pnl();
        if daily > self.cfg.limit {
            return Ok(None);
        }

        let message = format!("daily realized P&L {daily} breached loss limit {}", self.cfg.limit);
        let action = if self.cfg.action == RuleAction::Alert {
            ActionRequest::Alert
        } else {
            ActionRequest::FlattenAndLockout(LockoutRequest::Hard {
                reason: message.clone(),
                until: Some(self.calendar.next_fire(view.now)),
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
                "daily_pnl": daily.amount().to_string(),
                "limit": self.cfg.limit.amount().to_string(),
            }),
        }))
    }
}

/// Flatten and hard-lock once the day's realized profit target is
/// reached; the day is done either way.
pub struct DailyRealizedProfit {
    cfg: DailyRealizedProfitCfg,
    calendar: TradingCalendar,
}

impl DailyRealizedProfit {
    pub fn new(cfg: DailyRealizedProfitCfg, calendar: TradingCalendar) -> Self {
        Self { cfg, calendar }
    }
}

impl RiskRule for DailyRealizedProfit {
    fn id(&self) -> &'static str {
        "daily_realized_profit"
    }

    fn evaluate(
        &mut self,
        event: &RiskEvent,
        view: &EngineView<'_>,
    ) -> Result<Option<Violation>, RiskError> {
        if event.event_type != EventType::PositionClosed {
            return Ok(None);
        }

        let daily = view.realized_pnl();
        if daily < self.cfg.target {
            return Ok(None);
        }

        let message =
            format!("daily realized P&L {daily} reached profit target {}", self.cfg.target);
        let action = if self.cfg.action == RuleAction::Alert {
            ActionRequest::Alert
        } else {
            ActionRequest::FlattenAndLockout(LockoutRequest::Hard {
                reason: message.clone(),
                until: Some(self.calendar.next_fire(view.now)),
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
                "daily_pnl": daily.amount().to_string(),
                "target": self.cfg.target.amount().to_string(),
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
    use crate::config::DailyResetCfg;
    use crate::domain::Money;
    use crate::rules::testutil::ViewFixture;
    use rust_decimal_macros::dec;

    fn calendar() -> TradingCalendar {
        TradingCalendar::new(&DailyResetCfg::default()).unwrap()
    }

    fn closed(pnl: Money) -> RiskEvent {
        RiskEvent::new(EventType::PositionClosed, "ACC-1").with_realized_pnl(pnl)
    }

    #[test]
    fn loss_within_limit_passes() {
        let mut fixture = ViewFixture::new(Default::default());
        fixture.realized = Money::new(dec!(-400));
        let cfg = DailyRealizedLossCfg {
            enabled: true,
            limit: Money::new(dec!(-900)),
            action: RuleAction::FlattenAndLockout,
        };
        let mut rule = DailyRealizedLoss::new(cfg, calendar());
        let verdict =
            rule.evaluate(&closed(Money::new(dec!(-100))), &fixture.view()).unwrap();
        assert!(verdict.is_none());
    }

    #[test]
    fn loss_at_limit_flattens_and_hard_locks_until_reset() {
        let mut fixture = ViewFixture::new(Default::default());
        fixture.realized = Money::new(dec!(-900));
        let cfg = DailyRealizedLossCfg {
            enabled: true,
            limit: Money::new(dec!(-900)),
            action: RuleAction::FlattenAndLockout,
        };
        let mut rule = DailyRealizedLoss::new(cfg, calendar());
        let violation =
            rule.evaluate(&closed(Money::new(dec!(-300))), &fixture.view()).unwrap().unwrap();

        assert_eq!(violation.severity, Severity::Critical);
        match &violation.action {
            ActionRequest::FlattenAndLockout(LockoutRequest::Hard { until, .. }) => {
                // The unlock time is the next daily reset, in the future.
                assert!(until.unwrap() > fixture.view().now);
            }
            other => panic!("expected FlattenAndLockout(Hard), got {other:?}"),
        }
        assert_eq!(violation.payload["daily_pnl"], "-900");
    }

    #[test]
    fn only_position_closed_triggers() {
        let mut fixture = ViewFixture::new(Default::default());
        fixture.realized = Money::new(dec!(-5000));
        let cfg = DailyRealizedLossCfg {
            enabled: true,
            limit: Money::new(dec!(-900)),
            action: RuleAction::FlattenAndLockout,
        };
        let mut rule = DailyRealizedLoss::new(cfg, calendar());
        let quote_event = RiskEvent::new(EventType::QuoteUpdate, "ACC-1");
        assert!(rule.evaluate(&quote_event, &fixture.view()).unwrap().is_none());
    }

    #[test]
    fn profit_target_reached_ends_the_day() {
        let mut fixture = ViewFixture::new(Default::default());
        fixture.realized = Money::new(dec!(1500));
        let cfg = DailyRealizedProfitCfg {
            enabled: true,
            target: Money::new(dec!(1500)),
            action: RuleAction::FlattenAndLockout,
        };
        let mut rule = DailyRealizedProfit::new(cfg, calendar());
        let violation =
            rule.evaluate(&closed(Money::new(dec!(200))), &fixture.view()).unwrap().unwrap();
        assert!(matches!(
            violation.action,
            ActionRequest::FlattenAndLockout(LockoutRequest::Hard { .. })
        ));
    }

    #[test]
    fn profit_below_target_passes() {
        let mut fixture = ViewFixture::new(Default::default());
        fixture.realized = Money::new(dec!(1499.99));
        let cfg = DailyRealizedProfitCfg {
            enabled: true,
            target: Money::new(dec!(1500)),
            action: RuleAction::FlattenAndLockout,
        };
        let mut rule = DailyRealizedProfit::new(cfg, calendar());
        assert!(rule.evaluate(&closed(Money::new(dec!(10))), &fixture.view()).unwrap().is_none());
    }
}
