// =============================================================================
// Lockout Manager — hard and cooldown trading lockouts
// =============================================================================
//
// Per-account states: CLEAR, HARD_LOCKED, COOLDOWN. Hard and cooldown
// lockouts may coexist; `info` returns the hard one. Every transition is
// persisted; on startup active rows are rehydrated, expired cooldowns are
// dropped, and live cooldowns re-arm their clear timer from the stored
// unlock time.
//
// Re-setting an existing lockout of the same kind refreshes neither the
// start time nor the unlock time. If the store rejects a write the lockout
// is still held in memory — losing durability must never unlock a trader.
// =============================================================================

use std::collections::HashMap;
use std::sync::Arc;

use chrono::{DateTime, Duration, Utc};
use parking_lot::RwLock;
use tracing::{error, info, warn};

use crate::domain::{Lockout, LockoutKind};
use crate::persistence::Store;
use crate::timers::TimerManager;

/// Rules whose lockouts are released by the daily reset regardless of their
/// unlock time.
const DAILY_RULES: &[&str] =
    &["daily_realized_loss", "daily_realized_profit", "session_block_outside"];

fn cooldown_timer_name(account_id: &str) -> String {
    format!("lockout:{account_id}")
}

pub struct LockoutManager {
    store: Arc<Store>,
    timers: Arc<TimerManager>,
    /// Active lockouts per account; at most one per kind.
    active: RwLock<HashMap<String, Vec<Lockout>>>,
}

impl LockoutManager {
    pub fn new(store: Arc<Store>, timers: Arc<TimerManager>) -> Self {
        Self { store, timers, active: RwLock::new(HashMap::new()) }
    }

    // -------------------------------------------------------------------------
    // Setting lockouts
    // -------------------------------------------------------------------------

    /// Set a hard lockout. `until = None` is permanent-until-condition: only
    /// the setting rule clears it (via `clear_source`).
    pub fn set_hard(
        &self,
        account_id: &str,
        reason: &str,
        until: Option<DateTime<Utc>>,
        source_rule_id: &str,
    ) {
        if self.kind_active(account_id, LockoutKind::Hard) {
            info!(account = %account_id, "hard lockout already active; not refreshed");
            return;
        }

        let lockout = Lockout {
            account_id: account_id.to_string(),
            reason: reason.to_string(),
            kind: LockoutKind::Hard,
            source_rule_id: source_rule_id.to_string(),
            set_at: Utc::now(),
            unlock_at: until,
        };
        self.persist(&lockout);
        self.remember(lockout.clone());

        warn!(
            account = %account_id,
            rule = %source_rule_id,
            reason = %reason,
            until = ?until,
            "HARD lockout set"
        );
    }

    /// Set a cooldown lockout of `duration_seconds` and arm its clear timer.
    pub fn set_cooldown(
        self: &Arc<Self>,
        account_id: &str,
        reason: &str,
        duration_seconds: u64,
        source_rule_id: &str,
    ) {
        if self.kind_active(account_id, LockoutKind::Cooldown) {
            info!(account = %account_id, "cooldown already active; not refreshed");
            return;
        }

        let now = Utc::now();
        let lockout = Lockout {
            account_id: account_id.to_string(),
            reason: reason.to_string(),
            kind: LockoutKind::Cooldown,
            source_rule_id: source_rule_id.to_string(),
            set_at: now,
            unlock_at: Some(now + Duration::seconds(duration_seconds as i64)),
        };
        self.persist(&lockout);
        self.remember(lockout);
        self.arm_cooldown_timer(account_id, duration_seconds);

        warn!(
            account = %account_id,
            rule = %source_rule_id,
            reason = %reason,
            duration_seconds,
            "COOLDOWN lockout set"
        );
    }

    fn arm_cooldown_timer(self: &Arc<Self>, account_id: &str, duration_seconds: u64) {
        let manager = self.clone();
        let account = account_id.to_string();
        self.timers.start(cooldown_timer_name(account_id), duration_seconds, move || {
            info!(account = %account, "cooldown expired");
            manager.clear_kind(&account, LockoutKind::Cooldown);
        });
    }

    // -------------------------------------------------------------------------
    // Clearing
    // -------------------------------------------------------------------------

    /// Remove every active lockout for the account.
    pub fn clear(&self, account_id: &str) {
        self.timers.cancel(&cooldown_timer_name(account_id));
        self.active.write().remove(account_id);
        if let Err(e) = self.store.clear_lockouts(account_id) {
            error!(account = %account_id, error = %e, "lockout clear not persisted");
        }
        info!(account = %account_id, "lockouts cleared");
    }

    /// Remove only lockouts of one kind (cooldown expiry must not release a
    /// coexisting hard lockout).
    pub fn clear_kind(&self, account_id: &str, kind: LockoutKind) {
        {
            let mut map = self.active.write();
            if let Some(lockouts) = map.get_mut(account_id) {
                lockouts.retain(|l| l.kind != kind);
                if lockouts.is_empty() {
                    map.remove(account_id);
                }
            }
        }
        if let Err(e) = self.store.clear_lockout_kind(account_id, kind) {
            error!(account = %account_id, error = %e, "lockout clear not persisted");
        }
        if kind == LockoutKind::Cooldown {
            self.timers.cancel(&cooldown_timer_name(account_id));
        }
    }

    /// Clear a condition-held lockout set by `source_rule_id` (e.g. the auth
    /// guard on reconnect). Other rules' lockouts are untouched.
    pub fn clear_source(&self, account_id: &str, source_rule_id: &str) {
        let held: Vec<Lockout> = self.lockouts_for(account_id);
        for lockout in held {
            if lockout.source_rule_id == source_rule_id {
                self.clear_kind(account_id, lockout.kind);
                info!(
                    account = %account_id,
                    rule = %source_rule_id,
                    "condition-held lockout released"
                );
            }
        }
    }

    /// Daily-reset sweep: release lockouts whose unlock time has passed and
    /// lockouts set by daily rules.
    pub fn clear_expired_and_daily(&self, account_id: &str, now: DateTime<Utc>) {
        let held = self.lockouts_for(account_id);
        for lockout in held {
            let expired = matches!(lockout.unlock_at, Some(t) if t <= now);
            let daily = DAILY_RULES.contains(&lockout.source_rule_id.as_str());
            if expired || daily {
                info!(
                    account = %account_id,
                    rule = %lockout.source_rule_id,
                    expired,
                    daily,
                    "lockout released by daily reset"
                );
                self.clear_kind(account_id, lockout.kind);
            }
        }
    }

    // -------------------------------------------------------------------------
    // Queries
    // -------------------------------------------------------------------------

    pub fn is_locked(&self, account_id: &str) -> bool {
        self.active.read().get(account_id).map(|l| !l.is_empty()).unwrap_or(false)
    }

    /// The governing lockout: hard takes precedence over cooldown.
    pub fn info(&self, account_id: &str) -> Option<Lockout> {
        let map = self.active.read();
        let lockouts = map.get(account_id)?;
        lockouts
            .iter()
            .find(|l| l.kind == LockoutKind::Hard)
            .or_else(|| lockouts.iter().find(|l| l.kind == LockoutKind::Cooldown))
            .cloned()
    }

    fn lockouts_for(&self, account_id: &str) -> Vec<Lockout> {
        self.active.read().get(account_id).cloned().unwrap_or_default()
    }

    fn kind_active(&self, account_id: &str, kind: LockoutKind) -> bool {
        self.active
            .read()
            .get(account_id)
            .map(|l| l.iter().any(|x| x.kind == kind))
            .unwrap_or(false)
    }

    // -------------------------------------------------------------------------
    // Startup rehydration
    // -------------------------------------------------------------------------

    /// Reload active lockouts from the store: expired cooldowns are dropped,
    /// live ones re-arm their timers, hard lockouts are held as stored.
    pub fn rehydrate(self: &Arc<Self>) {
        let rows = match self.store.active_lockouts() {
            Ok(rows) => rows,
            Err(e) => {
                error!(error = %e, "lockout rehydration failed");
                return;
            }
        };

        let now = Utc::now();
        for lockout in rows {
            match lockout.kind {
                LockoutKind::Cooldown => {
                    let remaining = lockout.remaining_seconds(now);
                    if remaining == 0 {
                        info!(account = %lockout.account_id, "stored cooldown already expired");
                        // Deactivate only the cooldown row; a coexisting hard
                        // row must stay durable.
                        if let Err(e) = self
                            .store
                            .clear_lockout_kind(&lockout.account_id, LockoutKind::Cooldown)
                        {
                            error!(error = %e, "expired cooldown cleanup failed");
                        }
                        continue;
                    }
                    self.arm_cooldown_timer(&lockout.account_id, remaining);
                    info!(
                        account = %lockout.account_id,
                        remaining,
                        "cooldown rehydrated and re-armed"
                    );
                    self.remember(lockout);
                }
                LockoutKind::Hard => {
                    info!(
                        account = %lockout.account_id,
                        rule = %lockout.source_rule_id,
                        "hard lockout rehydrated"
                    );
                    self.remember(lockout);
                }
            }
        }
    }

    // -------------------------------------------------------------------------
    // Internals
    // -------------------------------------------------------------------------

    fn remember(&self, lockout: Lockout) {
        let mut map = self.active.write();
        let entry = map.entry(lockout.account_id.clone()).or_default();
        entry.retain(|l| l.kind != lockout.kind);
        entry.push(lockout);
    }

    fn persist(&self, lockout: &Lockout) {
        if let Err(e) = self.store.insert_lockout(lockout) {
            // Keep the in-memory lockout: losing durability must fail toward
            // "locked", never toward "tradeable".
            error!(
                account = %lockout.account_id,
                error = %e,
                "lockout not persisted; holding in memory"
            );
        }
    }
}

impl std::fmt::Debug for LockoutManager {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("LockoutManager")
            .field("locked_accounts", &self.active.read().len())
            .finish()
    }
}

// =============================================================================
// Tests
// =============================================================================
#[cfg(test)]
mod tests {
    use super::*;

    fn manager() -> (Arc<LockoutManager>, Arc<Store>, Arc<TimerManager>) {
        let store = Arc::new(Store::open_in_memory().unwrap());
        let timers = Arc::new(TimerManager::new());
        let manager = Arc::new(LockoutManager::new(store.clone(), timers.clone()));
        (manager, store, timers)
    }

    #[test]
    fn hard_lockout_locks_and_clears() {
        let (m, _, _) = manager();
        assert!(!m.is_locked("ACC-1"));

        m.set_hard("ACC-1", "daily loss limit", None, "daily_realized_loss");
        assert!(m.is_locked("ACC-1"));
        let info = m.info("ACC-1").unwrap();
        assert_eq!(info.kind, LockoutKind::Hard);
        assert_eq!(info.unlock_at, None);

        m.clear("ACC-1");
        assert!(!m.is_locked("ACC-1"));
        assert_eq!(m.info("ACC-1"), None);
    }

    #[test]
    fn cooldown_registers_timer_and_expiry_clears() {
        let (m, _, timers) = manager();
        m.set_cooldown("ACC-1", "rapid losses", 60, "cooldown_after_loss");
        assert!(m.is_locked("ACC-1"));
        assert!(timers.has("lockout:ACC-1"));
        assert!(m.info("ACC-1").unwrap().remaining_seconds(Utc::now()) <= 60);

        // Drive the timer to its deadline.
        timers.run_due(tokio::time::Instant::now() + std::time::Duration::from_secs(61));
        assert!(!m.is_locked("ACC-1"));
    }

    #[test]
    fn resetting_same_kind_does_not_refresh() {
        let (m, _, _) = manager();
        m.set_cooldown("ACC-1", "first", 60, "cooldown_after_loss");
        let first = m.info("ACC-1").unwrap();

        m.set_cooldown("ACC-1", "second", 600, "cooldown_after_loss");
        let still = m.info("ACC-1").unwrap();
        assert_eq!(still.reason, first.reason);
        assert_eq!(still.unlock_at, first.unlock_at);
    }

    #[test]
    fn hard_takes_precedence_over_cooldown() {
        let (m, _, _) = manager();
        m.set_cooldown("ACC-1", "cooldown", 60, "trade_frequency");
        m.set_hard("ACC-1", "hard", None, "auth_loss_guard");

        let info = m.info("ACC-1").unwrap();
        assert_eq!(info.kind, LockoutKind::Hard);

        // Cooldown expiry must not release the hard lockout.
        m.clear_kind("ACC-1", LockoutKind::Cooldown);
        assert!(m.is_locked("ACC-1"));
        assert_eq!(m.info("ACC-1").unwrap().kind, LockoutKind::Hard);
    }

    #[test]
    fn clear_source_releases_only_owned_lockout() {
        let (m, _, _) = manager();
        m.set_hard("ACC-1", "auth lost", None, "auth_loss_guard");
        m.clear_source("ACC-1", "daily_realized_loss");
        assert!(m.is_locked("ACC-1"));

        m.clear_source("ACC-1", "auth_loss_guard");
        assert!(!m.is_locked("ACC-1"));
    }

    #[test]
    fn daily_reset_releases_daily_and_expired_lockouts() {
        let (m, _, _) = manager();
        m.set_hard("ACC-1", "loss limit until reset", None, "daily_realized_loss");
        assert!(m.is_locked("ACC-1"));
        m.clear_expired_and_daily("ACC-1", Utc::now());
        assert!(!m.is_locked("ACC-1"));

        // An auth-guard lockout is neither daily nor expired.
        m.set_hard("ACC-1", "auth lost", None, "auth_loss_guard");
        m.clear_expired_and_daily("ACC-1", Utc::now());
        assert!(m.is_locked("ACC-1"));
    }

    #[test]
    fn rehydration_restores_hard_and_live_cooldown() {
        let store = Arc::new(Store::open_in_memory().unwrap());
        let timers = Arc::new(TimerManager::new());

        {
            let m = Arc::new(LockoutManager::new(store.clone(), timers.clone()));
            m.set_hard("ACC-1", "loss limit", None, "daily_realized_loss");
            m.set_cooldown("ACC-2", "rapid losses", 600, "cooldown_after_loss");
        }

        // Fresh manager over the same store, as after a restart.
        let timers2 = Arc::new(TimerManager::new());
        let m2 = Arc::new(LockoutManager::new(store, timers2.clone()));
        assert!(!m2.is_locked("ACC-1"));
        m2.rehydrate();

        assert!(m2.is_locked("ACC-1"));
        assert_eq!(m2.info("ACC-1").unwrap().kind, LockoutKind::Hard);
        assert!(m2.is_locked("ACC-2"));
        assert!(timers2.has("lockout:ACC-2"));
    }

    #[test]
    fn rehydration_drops_expired_cooldowns() {
        let store = Arc::new(Store::open_in_memory().unwrap());
        let expired = Lockout {
            account_id: "ACC-1".into(),
            reason: "old cooldown".into(),
            kind: LockoutKind::Cooldown,
            source_rule_id: "cooldown_after_loss".into(),
            set_at: Utc::now() - Duration::hours(2),
            unlock_at: Some(Utc::now() - Duration::hours(1)),
        };
        store.insert_lockout(&expired).unwrap();

        let timers = Arc::new(TimerManager::new());
        let m = Arc::new(LockoutManager::new(store.clone(), timers));
        m.rehydrate();

        assert!(!m.is_locked("ACC-1"));
        assert!(store.active_lockouts().unwrap().is_empty());
    }

    #[test]
    fn rehydration_keeps_hard_row_active_when_dropping_expired_cooldown() {
        // The hard lockout was set before the cooldown, so the expired
        // cooldown's cleanup runs after the hard row was already restored.
        let store = Arc::new(Store::open_in_memory().unwrap());
        let hard = Lockout {
            account_id: "ACC-1".into(),
            reason: "auth lost".into(),
            kind: LockoutKind::Hard,
            source_rule_id: "auth_loss_guard".into(),
            set_at: Utc::now() - Duration::hours(3),
            unlock_at: None,
        };
        let expired_cooldown = Lockout {
            reason: "old cooldown".into(),
            kind: LockoutKind::Cooldown,
            source_rule_id: "cooldown_after_loss".into(),
            set_at: Utc::now() - Duration::hours(2),
            unlock_at: Some(Utc::now() - Duration::hours(1)),
            ..hard.clone()
        };
        store.insert_lockout(&hard).unwrap();
        store.insert_lockout(&expired_cooldown).unwrap();

        let timers = Arc::new(TimerManager::new());
        let m = Arc::new(LockoutManager::new(store.clone(), timers));
        m.rehydrate();

        // In memory: hard-locked, cooldown gone.
        assert!(m.is_locked("ACC-1"));
        assert_eq!(m.info("ACC-1").unwrap().kind, LockoutKind::Hard);

        // Durably: the hard row must still be active so a crash right now
        // cannot lose it across the next restart.
        let active = store.active_lockouts().unwrap();
        assert_eq!(active.len(), 1);
        assert_eq!(active[0].kind, LockoutKind::Hard);

        let timers2 = Arc::new(TimerManager::new());
        let m2 = Arc::new(LockoutManager::new(store, timers2));
        m2.rehydrate();
        assert!(m2.is_locked("ACC-1"));
    }

    #[test]
    fn lockout_survives_roundtrip_exactly() {
        let (m, store, _) = manager();
        m.set_hard(
            "ACC-1",
            "session closed",
            Some("2025-11-04T14:30:00Z".parse().unwrap()),
            "session_block_outside",
        );
        let stored = store.active_lockouts().unwrap();
        let held = m.info("ACC-1").unwrap();
        assert_eq!(stored[0], held);
    }
}
