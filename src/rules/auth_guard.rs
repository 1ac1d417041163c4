// =============================================================================
// Auth loss guard: lock the account while broker authorization is gone
// =============================================================================
//
// AUTH_FAILED and SDK_DISCONNECTED set a condition-held hard lockout (no
// unlock time). Only this rule releases it, on SDK_CONNECTED with trading
// permission restored. AUTH_FAILED and SDK_CONNECTED bypass the engine's
// PRE-CHECK so auth monitoring and the release path keep operating while the
// account is locked; SDK_DISCONNECTED does not, and is gated like any other
// event.
// =============================================================================

use serde_json::json;

use crate::config::AuthLossGuardCfg;
use crate::domain::{EventType, RiskEvent};
use crate::errors::RiskError;
use crate::rules::{ActionRequest, EngineView, LockoutRequest, RiskRule, Severity, Violation};

pub struct AuthLossGuard {
    cfg: AuthLossGuardCfg,
    /// Whether this rule currently holds a lockout.
    holding: bool,
}

impl AuthLossGuard {
    pub fn new(cfg: AuthLossGuardCfg) -> Self {
        Self { cfg, holding: false }
    }

    fn can_trade(event: &RiskEvent) -> Option<bool> {
        event.raw_data.get("canTrade").and_then(serde_json::Value::as_bool)
    }
}

impl RiskRule for AuthLossGuard {
    fn id(&self) -> &'static str {
        "auth_loss_guard"
    }

    fn evaluate(
        &mut self,
        event: &RiskEvent,
        _view: &EngineView<'_>,
    ) -> Result<Option<Violation>, RiskError> {
        match event.event_type {
            EventType::AuthFailed | EventType::SdkDisconnected => {
                // AUTH_FAILED may carry an explicit canTrade; absence means
                // the authorization is gone.
                if Self::can_trade(event) == Some(true) {
                    return Ok(None);
                }
                if self.holding {
                    return Ok(None);
                }
                self.holding = self.cfg.action != crate::config::RuleAction::Alert;

                let reason = event
                    .raw_data
                    .get("reason")
                    .and_then(serde_json::Value::as_str)
                    .unwrap_or("broker authorization lost")
                    .to_string();
                let message = format!("{}: trading blocked until reconnect", reason);

                let downgraded = self.cfg.action == crate::config::RuleAction::Alert;
                let action = if downgraded {
                    ActionRequest::Alert
                } else {
                    ActionRequest::Lockout(LockoutRequest::Hard { reason: message.clone(), until: None })
                };
                Ok(Some(Violation {
                    rule_id: self.id(),
                    severity: if downgraded { Severity::Warning } else { Severity::Critical },
                    message,
                    action,
                    payload: json!({
                        "event": event.event_type.to_string(),
                        "reason": reason,
                    }),
                }))
            }
            EventType::SdkConnected => {
                if !self.holding {
                    return Ok(None);
                }
                // Reconnected without trading permission stays locked.
                if Self::can_trade(event) == Some(false) {
                    return Ok(None);
                }
                self.holding = false;

                Ok(Some(Violation {
                    rule_id: self.id(),
                    severity: Severity::Warning,
                    message: "broker authorization restored; releasing lockout".to_string(),
                    action: ActionRequest::ReleaseLockout {
                        source_rule_id: self.id().to_string(),
                    },
                    payload: json!({ "event": event.event_type.to_string() }),
                }))
            }
            _ => Ok(None),
        }
    }
}

// =============================================================================
// Tests
// =============================================================================
#[cfg(test)]
mod tests {
    use super::*;
    use crate::rules::testutil::ViewFixture;
    use serde_json::json;

    fn guard() -> AuthLossGuard {
        AuthLossGuard::new(AuthLossGuardCfg {
            enabled: true,
            action: crate::config::RuleAction::FlattenAndLockout,
        })
    }

    #[test]
    fn auth_failure_sets_condition_held_hard_lockout() {
        let fixture = ViewFixture::new(Default::default());
        let mut rule = guard();
        let event = RiskEvent::new(EventType::AuthFailed, "ACC-1")
            .with_raw(json!({"canTrade": false, "reason": "token expired"}));

        let violation = rule.evaluate(&event, &fixture.view()).unwrap().unwrap();
        assert_eq!(violation.severity, Severity::Critical);
        match violation.action {
            ActionRequest::Lockout(LockoutRequest::Hard { until, .. }) => {
                assert_eq!(until, None)
            }
            other => panic!("expected hard lockout, got {other:?}"),
        }
    }

    #[test]
    fn disconnect_locks_and_reconnect_releases() {
        let fixture = ViewFixture::new(Default::default());
        let mut rule = guard();

        let down = RiskEvent::new(EventType::SdkDisconnected, "ACC-1");
        assert!(rule.evaluate(&down, &fixture.view()).unwrap().is_some());

        // Duplicate disconnects do not re-lock.
        assert!(rule.evaluate(&down, &fixture.view()).unwrap().is_none());

        let up = RiskEvent::new(EventType::SdkConnected, "ACC-1")
            .with_raw(json!({"canTrade": true}));
        let release = rule.evaluate(&up, &fixture.view()).unwrap().unwrap();
        assert_eq!(
            release.action,
            ActionRequest::ReleaseLockout { source_rule_id: "auth_loss_guard".into() }
        );
    }

    #[test]
    fn reconnect_without_permission_stays_locked() {
        let fixture = ViewFixture::new(Default::default());
        let mut rule = guard();
        let down = RiskEvent::new(EventType::SdkDisconnected, "ACC-1");
        rule.evaluate(&down, &fixture.view()).unwrap();

        let up_no_trade = RiskEvent::new(EventType::SdkConnected, "ACC-1")
            .with_raw(json!({"canTrade": false}));
        assert!(rule.evaluate(&up_no_trade, &fixture.view()).unwrap().is_none());
    }

    #[test]
    fn reconnect_without_prior_lock_is_silent() {
        let fixture = ViewFixture::new(Default::default());
        let mut rule = guard();
        let up = RiskEvent::new(EventType::SdkConnected, "ACC-1");
        assert!(rule.evaluate(&up, &fixture.view()).unwrap().is_none());
    }
}
