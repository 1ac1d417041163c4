// =============================================================================
// Enforcement Executor — applies violations to the broker and the lockout
// manager
// =============================================================================
//
// Every operation is idempotent by intent: re-closing a flat position is an
// ack, re-setting a live lockout of the same kind refreshes nothing. Each
// violation writes its audit row before the broker is touched and updates
// `action_taken` after the ack (or error). Flattens retry up to 3 times with
// 1-second backoff; cancels and modifies retry once.
//
// When a violation demands close-and-lockout, the close goes first. The
// lockout is still set when the broker reports "already flat", but NOT when
// the close fails terminally — a trader must never be locked out on top of
// positions the system could not flatten. That path surfaces as an
// ENFORCEMENT_FAILED audit row and a critical log line.
// =============================================================================

use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use tracing::{error, info, warn};
use uuid::Uuid;

use crate::broker::{BrokerAck, BrokerError, BrokerPort};
use crate::lockout::LockoutManager;
use crate::persistence::Store;
use crate::rules::{ActionRequest, LockoutRequest, Violation};

/// Attempts for flatten-class commands (close one / close all).
const FLATTEN_ATTEMPTS: usize = 3;
/// Attempts for cancel / modify commands.
const ORDER_ATTEMPTS: usize = 2;
/// Backoff between attempts.
const RETRY_BACKOFF: Duration = Duration::from_secs(1);

pub struct EnforcementExecutor {
    broker: Arc<dyn BrokerPort>,
    store: Arc<Store>,
    lockouts: Arc<LockoutManager>,
}

impl EnforcementExecutor {
    pub fn new(
        broker: Arc<dyn BrokerPort>,
        store: Arc<Store>,
        lockouts: Arc<LockoutManager>,
    ) -> Self {
        Self { broker, store, lockouts }
    }

    /// Apply one violation. Never returns an error: every outcome (including
    /// broker failure) is absorbed into the audit row and logs.
    pub async fn apply(&self, account_id: &str, violation: &Violation) {
        // Correlates the CRITICAL log line with the audit row it produced.
        let enforcement_id = Uuid::new_v4();
        error!(
            account = %account_id,
            rule = %violation.rule_id,
            severity = %violation.severity.as_str(),
            message = %violation.message,
            enforcement_id = %enforcement_id,
            "VIOLATION enforcement triggered"
        );

        let audit_id = self.write_audit(account_id, violation, "pending", enforcement_id);

        let outcome = match &violation.action {
            ActionRequest::Alert => "alert only".to_string(),

            ActionRequest::ClosePosition { contract_id } => {
                self.close_position(contract_id).await
            }

            ActionRequest::ReduceToLimit { contract_id, excess } => {
                // The port only supports full closes; closing the offending
                // position is the available reduction.
                let outcome = self.close_position(contract_id).await;
                format!("reduce_to_limit (excess {excess}): {outcome}")
            }

            ActionRequest::CloseAllPositions => self.close_all(account_id).await,

            ActionRequest::CancelOrder { order_id } => {
                let broker = self.broker.clone();
                let id = order_id.clone();
                let result = retry(ORDER_ATTEMPTS, move || {
                    let broker = broker.clone();
                    let id = id.clone();
                    async move { broker.cancel_order(&id).await }
                })
                .await;
                describe("cancel_order", result)
            }

            ActionRequest::ModifyOrder { order_id, updates } => {
                let broker = self.broker.clone();
                let id = order_id.clone();
                let updates = updates.clone();
                let result = retry(ORDER_ATTEMPTS, move || {
                    let broker = broker.clone();
                    let id = id.clone();
                    let updates = updates.clone();
                    async move { broker.modify_order(&id, &updates).await }
                })
                .await;
                describe("modify_order", result)
            }

            ActionRequest::Lockout(request) => {
                self.set_lockout(account_id, violation.rule_id, request);
                format!("lockout set ({})", kind_of(request))
            }

            ActionRequest::FlattenAndLockout(request) => {
                let flatten = self.close_all_raw(account_id).await;
                match flatten {
                    Ok(ack) => {
                        // "Already flat" still earns the lockout.
                        self.set_lockout(account_id, violation.rule_id, request);
                        format!(
                            "close_all_positions: {ack:?}; lockout set ({})",
                            kind_of(request)
                        )
                    }
                    Err(e) => {
                        error!(
                            account = %account_id,
                            rule = %violation.rule_id,
                            error = %e,
                            enforcement_id = %enforcement_id,
                            "ENFORCEMENT_FAILED: flatten failed terminally; lockout NOT set"
                        );
                        self.write_audit_failure(account_id, violation, &e, enforcement_id);
                        format!("ENFORCEMENT_FAILED: close_all_positions: {e}")
                    }
                }
            }

            ActionRequest::ReleaseLockout { source_rule_id } => {
                self.lockouts.clear_source(account_id, source_rule_id);
                format!("lockout released (source {source_rule_id})")
            }
        };

        info!(
            account = %account_id,
            rule = %violation.rule_id,
            outcome = %outcome,
            "enforcement applied"
        );
        if let Some(id) = audit_id {
            if let Err(e) = self.store.update_violation_action(id, &outcome) {
                warn!(error = %e, "audit row update failed");
            }
        }
    }

    // -------------------------------------------------------------------------
    // Broker operations
    // -------------------------------------------------------------------------

    async fn close_position(&self, contract_id: &str) -> String {
        let broker = self.broker.clone();
        let id = contract_id.to_string();
        let result = retry(FLATTEN_ATTEMPTS, move || {
            let broker = broker.clone();
            let id = id.clone();
            async move { broker.close_position(&id).await }
        })
        .await;
        describe("close_position", result)
    }

    async fn close_all(&self, account_id: &str) -> String {
        describe("close_all_positions", self.close_all_raw(account_id).await)
    }

    async fn close_all_raw(&self, account_id: &str) -> Result<BrokerAck, BrokerError> {
        let broker = self.broker.clone();
        let account = account_id.to_string();
        retry(FLATTEN_ATTEMPTS, move || {
            let broker = broker.clone();
            let account = account.clone();
            async move { broker.close_all_positions(&account).await }
        })
        .await
    }

    fn set_lockout(&self, account_id: &str, rule_id: &str, request: &LockoutRequest) {
        match request {
            LockoutRequest::Hard { reason, until } => {
                self.lockouts.set_hard(account_id, reason, *until, rule_id);
            }
            LockoutRequest::Cooldown { reason, duration_seconds } => {
                self.lockouts.set_cooldown(account_id, reason, *duration_seconds, rule_id);
            }
        }
    }

    // -------------------------------------------------------------------------
    // Audit
    // -------------------------------------------------------------------------

    fn write_audit(
        &self,
        account_id: &str,
        violation: &Violation,
        action_taken: &str,
        enforcement_id: Uuid,
    ) -> Option<i64> {
        let payload = tagged_payload(violation, enforcement_id);
        match self.store.insert_violation(
            account_id,
            violation.rule_id,
            violation.severity.as_str(),
            &violation.message,
            action_taken,
            &payload,
        ) {
            Ok(id) => Some(id),
            Err(e) => {
                warn!(error = %e, rule = %violation.rule_id, "audit row insert failed");
                None
            }
        }
    }

    fn write_audit_failure(
        &self,
        account_id: &str,
        violation: &Violation,
        error: &BrokerError,
        enforcement_id: Uuid,
    ) {
        let _ = self.store.insert_violation(
            account_id,
            violation.rule_id,
            "critical",
            &format!("ENFORCEMENT_FAILED: {error}"),
            "flatten failed; lockout suppressed",
            &tagged_payload(violation, enforcement_id),
        );
    }
}

// ---------------------------------------------------------------------------
// Retry plumbing
// ---------------------------------------------------------------------------

async fn retry<Fut>(
    attempts: usize,
    mut op: impl FnMut() -> Fut,
) -> Result<BrokerAck, BrokerError>
where
    Fut: Future<Output = Result<BrokerAck, BrokerError>>,
{
    let mut last = BrokerError::new("no attempts made");
    for attempt in 1..=attempts {
        match op().await {
            Ok(ack) => return Ok(ack),
            Err(e) => {
                warn!(attempt, error = %e, "broker command failed");
                last = e;
                if attempt < attempts {
                    tokio::time::sleep(RETRY_BACKOFF).await;
                }
            }
        }
    }
    Err(last)
}

fn describe(op: &str, result: Result<BrokerAck, BrokerError>) -> String {
    match result {
        Ok(BrokerAck::Done) => format!("{op}: ok"),
        Ok(BrokerAck::AlreadyFlat) => format!("{op}: already flat"),
        Err(e) => format!("{op}: failed ({e})"),
    }
}

fn kind_of(request: &LockoutRequest) -> &'static str {
    match request {
        LockoutRequest::Hard { .. } => "hard",
        LockoutRequest::Cooldown { .. } => "cooldown",
    }
}

/// The violation payload with the enforcement correlation id merged in.
fn tagged_payload(violation: &Violation, enforcement_id: Uuid) -> String {
    let mut payload = violation.payload.clone();
    if let Some(map) = payload.as_object_mut() {
        map.insert(
            "enforcement_id".to_string(),
            serde_json::Value::String(enforcement_id.to_string()),
        );
    }
    payload.to_string()
}
