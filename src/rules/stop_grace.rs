// =============================================================================
// No-stop-loss grace rule: every open position must be protected within G
// seconds
// =============================================================================
//
// Per-contract state machine:
//   NO_POSITION -> OPEN_NO_STOP -> OPEN_STOP_PRESENT -> (closed) -> NO_POSITION
//
// POSITION_OPENED starts a grace timer; a stop-type ORDER_PLACED for the same
// contract cancels it; expiry while still unprotected emits the violation via
// the engine's direct-violation path. State is in-memory only — after a
// restart the grace window restarts from the re-observed POSITION_OPENED.
// =============================================================================

use std::collections::HashMap;
use std::sync::Arc;

use parking_lot::Mutex;
use serde_json::json;
use tokio::sync::mpsc;
use tracing::{debug, warn};

use crate::config::{NoStopLossGraceCfg, RuleAction};
use crate::domain::{EventType, RiskEvent};
use crate::engine::EngineMsg;
use crate::errors::RiskError;
use crate::rules::{ActionRequest, EngineView, RiskRule, Severity, Violation};
use crate::timers::TimerManager;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum GraceState {
    OpenNoStop,
    OpenStopPresent,
}

fn grace_timer_name(contract_id: &str) -> String {
    format!("grace:{contract_id}")
}

pub struct NoStopLossGrace {
    cfg: NoStopLossGraceCfg,
    timers: Arc<TimerManager>,
    engine_tx: mpsc::UnboundedSender<EngineMsg>,
    /// Shared with grace-timer callbacks, which must observe transitions
    /// that happened after they were armed.
    states: Arc<Mutex<HashMap<String, GraceState>>>,
}

impl NoStopLossGrace {
    pub fn new(
        cfg: NoStopLossGraceCfg,
        timers: Arc<TimerManager>,
        engine_tx: mpsc::UnboundedSender<EngineMsg>,
    ) -> Self {
        Self { cfg, timers, engine_tx, states: Arc::new(Mutex::new(HashMap::new())) }
    }

    fn arm_grace_timer(&self, account_id: &str, contract_id: &str) {
        let states = self.states.clone();
        let engine_tx = self.engine_tx.clone();
        let account = account_id.to_string();
        let contract = contract_id.to_string();
        let grace_seconds = self.cfg.grace_seconds;
        let downgraded = self.cfg.action == RuleAction::Alert;

        self.timers.start(grace_timer_name(contract_id), grace_seconds, move || {
            // Still unprotected at expiry?
            let unprotected =
                states.lock().get(&contract) == Some(&GraceState::OpenNoStop);
            if !unprotected {
                return;
            }
            let message = format!(
                "position {contract} still has no stop order after {grace_seconds}s grace"
            );
            let violation = Violation {
                rule_id: "no_stop_loss_grace",
                severity: if downgraded { Severity::Warning } else { Severity::Critical },
                message,
                action: if downgraded {
                    ActionRequest::Alert
                } else {
                    ActionRequest::ClosePosition { contract_id: contract.clone() }
                },
                payload: json!({
                    "contract_id": contract,
                    "grace_seconds": grace_seconds,
                }),
            };
            if engine_tx
                .send(EngineMsg::DirectViolation { account_id: account.clone(), violation })
                .is_err()
            {
                warn!(contract = %contract, "engine queue closed; grace violation dropped");
            }
        });
    }
}

impl RiskRule for NoStopLossGrace {
    fn id(&self) -> &'static str {
        "no_stop_loss_grace"
    }

    fn evaluate(
        &mut self,
        event: &RiskEvent,
        view: &EngineView<'_>,
    ) -> Result<Option<Violation>, RiskError> {
        match event.event_type {
            EventType::PositionOpened => {
                let Some(position) = &event.position else {
                    return Ok(None);
                };
                let contract = &position.contract_id;
                if view.stop_order_for(contract).is_some() {
                    self.states.lock().insert(contract.clone(), GraceState::OpenStopPresent);
                    return Ok(None);
                }
                self.states.lock().insert(contract.clone(), GraceState::OpenNoStop);
                self.arm_grace_timer(&event.account_id, contract);
                debug!(contract = %contract, grace = self.cfg.grace_seconds, "grace timer armed");
            }
            EventType::OrderPlaced => {
                let Some(order) = &event.order else {
                    return Ok(None);
                };
                if !order.order_type.is_stop() {
                    return Ok(None);
                }
                let mut states = self.states.lock();
                if states.get(&order.contract_id) == Some(&GraceState::OpenNoStop) {
                    states.insert(order.contract_id.clone(), GraceState::OpenStopPresent);
                    drop(states);
                    self.timers.cancel(&grace_timer_name(&order.contract_id));
                    debug!(contract = %order.contract_id, "stop observed; grace timer cancelled");
                }
            }
            EventType::PositionClosed => {
                let Some(position) = &event.position else {
                    return Ok(None);
                };
                self.states.lock().remove(&position.contract_id);
                self.timers.cancel(&grace_timer_name(&position.contract_id));
            }
            _ => {}
        }
        Ok(None)
    }
}

// =============================================================================
// Tests
// =============================================================================
#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::{Order, OrderSide, OrderType, Side};
    use crate::rules::testutil::{position, ViewFixture};
    use rust_decimal_macros::dec;
    use std::time::Duration;
    use tokio::time::Instant;

    const CONTRACT: &str = "CON.F.US.MNQ.Z25";

    fn setup() -> (
        NoStopLossGrace,
        Arc<TimerManager>,
        mpsc::UnboundedReceiver<EngineMsg>,
        ViewFixture,
    ) {
        let timers = Arc::new(TimerManager::new());
        let (tx, rx) = mpsc::unbounded_channel();
        let cfg = NoStopLossGraceCfg {
            enabled: true,
            grace_seconds: 30,
            action: RuleAction::ClosePosition,
        };
        let rule = NoStopLossGrace::new(cfg, timers.clone(), tx);
        (rule, timers, rx, ViewFixture::new(Default::default()))
    }

    fn opened() -> RiskEvent {
        RiskEvent::new(EventType::PositionOpened, "ACC-1")
            .with_position(position(CONTRACT, "MNQ", Side::Long, 1, dec!(21000.00)))
    }

    fn stop_placed() -> RiskEvent {
        RiskEvent::new(EventType::OrderPlaced, "ACC-1").with_order(Order {
            order_id: "9001".into(),
            contract_id: CONTRACT.into(),
            order_type: OrderType::Stop,
            side: OrderSide::Sell,
            size: 1,
            stop_price: Some(dec!(20950.00)),
            limit_price: None,
            status: 1,
        })
    }

    #[test]
    fn grace_expiry_without_stop_emits_violation() {
        let (mut rule, timers, mut rx, fixture) = setup();
        rule.evaluate(&opened(), &fixture.view()).unwrap();
        assert!(timers.has(&grace_timer_name(CONTRACT)));

        timers.run_due(Instant::now() + Duration::from_secs(31));

        let msg = rx.try_recv().expect("grace violation expected");
        match msg {
            EngineMsg::DirectViolation { account_id, violation } => {
                assert_eq!(account_id, "ACC-1");
                assert_eq!(violation.rule_id, "no_stop_loss_grace");
                assert_eq!(
                    violation.action,
                    ActionRequest::ClosePosition { contract_id: CONTRACT.into() }
                );
            }
            other => panic!("unexpected message {other:?}"),
        }
    }

    #[test]
    fn stop_order_within_grace_cancels_the_timer() {
        let (mut rule, timers, mut rx, fixture) = setup();
        rule.evaluate(&opened(), &fixture.view()).unwrap();
        rule.evaluate(&stop_placed(), &fixture.view()).unwrap();
        assert!(!timers.has(&grace_timer_name(CONTRACT)));

        timers.run_due(Instant::now() + Duration::from_secs(60));
        assert!(rx.try_recv().is_err());
    }

    #[test]
    fn stop_already_observed_at_open_skips_the_timer() {
        let (mut rule, timers, _rx, mut fixture) = setup();
        fixture.stop_orders.insert(
            CONTRACT.to_string(),
            Order {
                order_id: "9001".into(),
                contract_id: CONTRACT.into(),
                order_type: OrderType::TrailingStop,
                side: OrderSide::Sell,
                size: 1,
                stop_price: Some(dec!(20950.00)),
                limit_price: None,
                status: 1,
            },
        );
        rule.evaluate(&opened(), &fixture.view()).unwrap();
        assert!(!timers.has(&grace_timer_name(CONTRACT)));
    }

    #[test]
    fn position_close_cancels_pending_grace() {
        let (mut rule, timers, mut rx, fixture) = setup();
        rule.evaluate(&opened(), &fixture.view()).unwrap();

        let closed = RiskEvent::new(EventType::PositionClosed, "ACC-1")
            .with_position(position(CONTRACT, "MNQ", Side::Long, 1, dec!(21000.00)));
        rule.evaluate(&closed, &fixture.view()).unwrap();
        assert!(!timers.has(&grace_timer_name(CONTRACT)));

        timers.run_due(Instant::now() + Duration::from_secs(60));
        assert!(rx.try_recv().is_err());
    }

    #[test]
    fn non_stop_order_does_not_cancel_grace() {
        let (mut rule, timers, _rx, fixture) = setup();
        rule.evaluate(&opened(), &fixture.view()).unwrap();

        let limit_order = RiskEvent::new(EventType::OrderPlaced, "ACC-1").with_order(Order {
            order_id: "9002".into(),
            contract_id: CONTRACT.into(),
            order_type: OrderType::Limit,
            side: OrderSide::Sell,
            size: 1,
            stop_price: None,
            limit_price: Some(dec!(21100.00)),
            status: 1,
        });
        rule.evaluate(&limit_order, &fixture.view()).unwrap();
        assert!(timers.has(&grace_timer_name(CONTRACT)));
    }
}
