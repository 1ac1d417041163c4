// =============================================================================
// Risk Engine — PRE-CHECK gate, sequential rule evaluation, enforcement
// dispatch
// =============================================================================
//
// One event at a time, in arrival order: realized P&L is committed first
// (ledger writes are accepted even while locked out), then the PRE-CHECK
// gate short-circuits rule evaluation for locked accounts, then the enabled
// rules run in their fixed order against an immutable snapshot, and finally
// collected violations dispatch to the enforcement executor in rule order.
//
// A failing rule is logged and audited but never aborts the remaining rules.
// DAILY_RESET, SDK_CONNECTED, and AUTH_FAILED bypass PRE-CHECK so the reset
// and auth-monitoring paths keep operating while the account is locked.
// =============================================================================

use std::sync::Arc;

use chrono::Utc;
use tokio::sync::mpsc;
use tracing::{debug, error, info};

use crate::app_state::MarketBooks;
use crate::config::RiskConfig;
use crate::domain::{EventType, RiskEvent};
use crate::enforcement::EnforcementExecutor;
use crate::errors::RiskError;
use crate::lockout::LockoutManager;
use crate::persistence::Store;
use crate::pnl::PnlTracker;
use crate::rules::{EngineView, RiskRule, Violation};
use crate::ticks::TickRegistry;

/// Event kinds that evaluate even while the account is locked out.
const PRE_CHECK_BYPASS: &[EventType] =
    &[EventType::DailyReset, EventType::SdkConnected, EventType::AuthFailed];

/// Input to the engine task: canonical events from the router (and the reset
/// scheduler), plus violations emitted directly by timer-driven rule paths.
#[derive(Debug)]
pub enum EngineMsg {
    Event(RiskEvent),
    DirectViolation { account_id: String, violation: Violation },
    /// Sent by the composition root once the router has drained; the engine
    /// stops after everything queued ahead of it.
    Shutdown,
}

pub struct RiskEngine {
    config: Arc<RiskConfig>,
    registry: Arc<TickRegistry>,
    books: Arc<MarketBooks>,
    store: Arc<Store>,
    pnl: Arc<PnlTracker>,
    lockouts: Arc<LockoutManager>,
    executor: Arc<EnforcementExecutor>,
    rules: Vec<Box<dyn RiskRule>>,
}

impl RiskEngine {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        config: Arc<RiskConfig>,
        registry: Arc<TickRegistry>,
        books: Arc<MarketBooks>,
        store: Arc<Store>,
        pnl: Arc<PnlTracker>,
        lockouts: Arc<LockoutManager>,
        executor: Arc<EnforcementExecutor>,
        rules: Vec<Box<dyn RiskRule>>,
    ) -> Self {
        Self { config, registry, books, store, pnl, lockouts, executor, rules }
    }

    /// Engine processor loop: runs until the channel closes, draining any
    /// queued messages first (shutdown semantics).
    pub async fn run(mut self, mut rx: mpsc::UnboundedReceiver<EngineMsg>) {
        info!("event loop running");
        while let Some(msg) = rx.recv().await {
            if matches!(msg, EngineMsg::Shutdown) {
                break;
            }
            self.process(msg).await;
        }
        info!("engine processor stopping");
    }

    /// Process one message. Public so tests can drive the engine
    /// synchronously.
    pub async fn process(&mut self, msg: EngineMsg) {
        match msg {
            EngineMsg::Shutdown => {}
            EngineMsg::Event(event) => self.process_event(event).await,
            EngineMsg::DirectViolation { account_id, violation } => {
                // Timer-driven violations honor the same gate as evaluations.
                if self.lockouts.is_locked(&account_id) {
                    info!(
                        account = %account_id,
                        rule = %violation.rule_id,
                        "direct violation suppressed by active lockout"
                    );
                    return;
                }
                self.executor.apply(&account_id, &violation).await;
            }
        }
    }

    async fn process_event(&mut self, event: RiskEvent) {
        let account_id = event.account_id.clone();
        debug!(
            account = %account_id,
            event = %event.event_type,
            "event received"
        );

        // Realized P&L is committed before anything can suppress it: the
        // ledger accepts writes regardless of lockout state.
        if event.event_type == EventType::PositionClosed {
            if let Some(pnl) = event.realized_pnl {
                if let Err(e) = self.pnl.add_trade_pnl(&account_id, pnl) {
                    self.enter_degraded(&account_id, &e).await;
                }
            }
        }

        // PRE-CHECK: no rule evaluates while a lockout is in force.
        if !PRE_CHECK_BYPASS.contains(&event.event_type)
            && self.lockouts.is_locked(&account_id)
        {
            if let Some(lockout) = self.lockouts.info(&account_id) {
                info!(
                    account = %account_id,
                    event = %event.event_type,
                    kind = %lockout.kind,
                    reason = %lockout.reason,
                    remaining_seconds = lockout.remaining_seconds(Utc::now()),
                    "ALL rules blocked by active lockout"
                );
            }
            return;
        }

        // Immutable snapshot for this evaluation round.
        let positions = self.books.positions_snapshot();
        let stop_orders = self.books.stop_orders_snapshot();
        let marks = self.books.marks_snapshot();
        let realized = self.pnl.get_daily_pnl(&account_id);
        let view = EngineView::new(
            &self.config,
            Utc::now(),
            &self.registry,
            &positions,
            &stop_orders,
            &marks,
            realized,
        );

        let mut violations: Vec<Violation> = Vec::new();
        for rule in &mut self.rules {
            match rule.evaluate(&event, &view) {
                Ok(Some(violation)) => {
                    debug!(rule = rule.id(), "rule evaluated: violation");
                    violations.push(violation);
                }
                Ok(None) => {
                    debug!(rule = rule.id(), "rule evaluated: pass");
                }
                Err(e) => {
                    // One rule's failure never silences the others.
                    error!(rule = rule.id(), error = %e, "rule evaluation failed");
                    let _ = self.store.insert_violation(
                        &account_id,
                        rule.id(),
                        "error",
                        &e.to_string(),
                        "evaluation aborted for this rule",
                        "{}",
                    );
                }
            }
        }

        for violation in &violations {
            self.executor.apply(&account_id, violation).await;
        }
    }

    /// DEGRADED mode: the state store is unavailable, so trading is rejected
    /// by synthesizing a hard lockout.
    async fn enter_degraded(&self, account_id: &str, error: &RiskError) {
        error!(
            account = %account_id,
            error = %error,
            "state store unavailable; entering DEGRADED mode"
        );
        self.lockouts.set_hard(account_id, "state store unavailable", None, "persistence");
    }
}
