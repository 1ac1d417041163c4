// =============================================================================
// Persistence Store — durable SQLite state behind the P&L and lockout managers
// =============================================================================
//
// Three tables: pnl_daily, lockouts, violations. WAL journal mode, one short
// exclusive transaction per mutation. Money travels as canonical decimal
// strings, never as binary float. All access goes through PnlTracker,
// LockoutManager, and the enforcement audit path; nothing else touches the
// connection.
// =============================================================================

use std::path::Path;

use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use rusqlite::{params, Connection, OptionalExtension};
use tracing::info;

use crate::domain::{Lockout, LockoutKind, Money};
use crate::errors::RiskError;

/// One realized-P&L ledger row.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PnlRow {
    pub account_id: String,
    pub trading_day: String,
    pub cumulative_pnl: Money,
    pub trade_count: i64,
}

/// One append-only violation audit row.
#[derive(Debug, Clone)]
pub struct ViolationAudit {
    pub id: i64,
    pub timestamp: DateTime<Utc>,
    pub account_id: String,
    pub rule_id: String,
    pub severity: String,
    pub message: String,
    pub action_taken: String,
    pub payload_json: String,
}

/// Durable store. Cheap to clone handles are not needed — the store is held
/// in `Arc` and the connection serialized behind a mutex.
pub struct Store {
    conn: Mutex<Connection>,
}

impl Store {
    /// Open (or create) the database at `path` and bootstrap the schema.
    pub fn open(path: impl AsRef<Path>) -> Result<Self, RiskError> {
        let path = path.as_ref();
        let conn = Connection::open(path)
            .map_err(|e| RiskError::Persistence(format!("open {}: {e}", path.display())))?;
        let store = Self::bootstrap(conn)?;
        info!(path = %path.display(), "state store opened");
        Ok(store)
    }

    /// In-memory store for tests.
    pub fn open_in_memory() -> Result<Self, RiskError> {
        let conn = Connection::open_in_memory()
            .map_err(|e| RiskError::Persistence(format!("open in-memory: {e}")))?;
        Self::bootstrap(conn)
    }

    fn bootstrap(conn: Connection) -> Result<Self, RiskError> {
        conn.pragma_update(None, "journal_mode", "WAL").ok();
        conn.pragma_update(None, "synchronous", "NORMAL").ok();

        conn.execute(
            "CREATE TABLE IF NOT EXISTS pnl_daily (
                account_id     TEXT NOT NULL,
                trading_day    TEXT NOT NULL,
                cumulative_pnl TEXT NOT NULL,
                trade_count    INTEGER NOT NULL,
                updated_at     TEXT NOT NULL,
                PRIMARY KEY (account_id, trading_day)
            )",
            [],
        )?;

        conn.execute(
            "CREATE TABLE IF NOT EXISTS lockouts (
                account_id  TEXT NOT NULL,
                reason      TEXT NOT NULL,
                kind        TEXT NOT NULL,
                source_rule TEXT NOT NULL,
                set_at      TEXT NOT NULL,
                unlock_at   TEXT,
                active      INTEGER NOT NULL,
                PRIMARY KEY (account_id, set_at)
            )",
            [],
        )?;
        // One active lockout per (account, kind); hard and cooldown may
        // coexist, with hard taking precedence at read time.
        conn.execute(
            "CREATE UNIQUE INDEX IF NOT EXISTS idx_lockouts_active
             ON lockouts(account_id, kind) WHERE active = 1",
            [],
        )?;

        conn.execute(
            "CREATE TABLE IF NOT EXISTS violations (
                id           INTEGER PRIMARY KEY AUTOINCREMENT,
                timestamp    TEXT NOT NULL,
                account_id   TEXT NOT NULL,
                rule_id      TEXT NOT NULL,
                severity     TEXT NOT NULL,
                message      TEXT NOT NULL,
                action_taken TEXT NOT NULL,
                payload_json TEXT NOT NULL
            )",
            [],
        )?;
        conn.execute(
            "CREATE INDEX IF NOT EXISTS idx_violations_account_ts
             ON violations(account_id, timestamp DESC)",
            [],
        )?;

        Ok(Self { conn: Mutex::new(conn) })
    }

    // -------------------------------------------------------------------------
    // pnl_daily
    // -------------------------------------------------------------------------

    /// Upsert the ledger row for `(account, trading_day)`.
    pub fn upsert_pnl(&self, row: &PnlRow) -> Result<(), RiskError> {
        let conn = self.conn.lock();
        conn.execute(
            "INSERT INTO pnl_daily (account_id, trading_day, cumulative_pnl, trade_count, updated_at)
             VALUES (?1, ?2, ?3, ?4, ?5)
             ON CONFLICT(account_id, trading_day)
             DO UPDATE SET cumulative_pnl = ?3, trade_count = ?4, updated_at = ?5",
            params![
                row.account_id,
                row.trading_day,
                row.cumulative_pnl.amount().to_string(),
                row.trade_count,
                Utc::now().to_rfc3339(),
            ],
        )?;
        Ok(())
    }

    /// Load the ledger row for `(account, trading_day)`, if any.
    pub fn load_pnl(&self, account_id: &str, trading_day: &str) -> Result<Option<PnlRow>, RiskError> {
        let conn = self.conn.lock();
        let row = conn
            .query_row(
                "SELECT cumulative_pnl, trade_count FROM pnl_daily
                 WHERE account_id = ?1 AND trading_day = ?2",
                params![account_id, trading_day],
                |r| {
                    let pnl: String = r.get(0)?;
                    let count: i64 = r.get(1)?;
                    Ok((pnl, count))
                },
            )
            .optional()?;

        match row {
            None => Ok(None),
            Some((pnl, trade_count)) => Ok(Some(PnlRow {
                account_id: account_id.to_string(),
                trading_day: trading_day.to_string(),
                cumulative_pnl: Money::parse(&pnl)?,
                trade_count,
            })),
        }
    }

    /// Accounts that have any ledger row. Used by the reset scheduler.
    pub fn known_accounts(&self) -> Result<Vec<String>, RiskError> {
        let conn = self.conn.lock();
        let mut stmt = conn.prepare("SELECT DISTINCT account_id FROM pnl_daily")?;
        let accounts = stmt
            .query_map([], |r| r.get::<_, String>(0))?
            .collect::<Result<Vec<_>, _>>()?;
        Ok(accounts)
    }

    // -------------------------------------------------------------------------
    // lockouts
    // -------------------------------------------------------------------------

    /// Persist a new active lockout row. Any previously active row of the
    /// same kind is deactivated in the same transaction.
    pub fn insert_lockout(&self, lockout: &Lockout) -> Result<(), RiskError> {
        let mut conn = self.conn.lock();
        let tx = conn.transaction()?;
        tx.execute(
            "UPDATE lockouts SET active = 0 WHERE account_id = ?1 AND kind = ?2 AND active = 1",
            params![lockout.account_id, lockout.kind.as_str()],
        )?;
        tx.execute(
            "INSERT INTO lockouts (account_id, reason, kind, source_rule, set_at, unlock_at, active)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, 1)",
            params![
                lockout.account_id,
                lockout.reason,
                lockout.kind.as_str(),
                lockout.source_rule_id,
                lockout.set_at.to_rfc3339(),
                lockout.unlock_at.map(|t| t.to_rfc3339()),
            ],
        )?;
        tx.commit()?;
        Ok(())
    }

    /// Deactivate all active lockouts for an account.
    pub fn clear_lockouts(&self, account_id: &str) -> Result<(), RiskError> {
        let conn = self.conn.lock();
        conn.execute(
            "UPDATE lockouts SET active = 0 WHERE account_id = ?1 AND active = 1",
            params![account_id],
        )?;
        Ok(())
    }

    /// Deactivate active lockouts of one kind only.
    pub fn clear_lockout_kind(&self, account_id: &str, kind: LockoutKind) -> Result<(), RiskError> {
        let conn = self.conn.lock();
        conn.execute(
            "UPDATE lockouts SET active = 0
             WHERE account_id = ?1 AND kind = ?2 AND active = 1",
            params![account_id, kind.as_str()],
        )?;
        Ok(())
    }

    /// All active lockouts across accounts, for startup rehydration.
    pub fn active_lockouts(&self) -> Result<Vec<Lockout>, RiskError> {
        let conn = self.conn.lock();
        let mut stmt = conn.prepare(
            "SELECT account_id, reason, kind, source_rule, set_at, unlock_at
             FROM lockouts WHERE active = 1 ORDER BY set_at",
        )?;
        let rows = stmt.query_map([], |r| {
            Ok((
                r.get::<_, String>(0)?,
                r.get::<_, String>(1)?,
                r.get::<_, String>(2)?,
                r.get::<_, String>(3)?,
                r.get::<_, String>(4)?,
                r.get::<_, Option<String>>(5)?,
            ))
        })?;

        let mut lockouts = Vec::new();
        for row in rows {
            let (account_id, reason, kind, source_rule, set_at, unlock_at) = row?;
            lockouts.push(Lockout {
                account_id,
                reason,
                kind: LockoutKind::parse(&kind)?,
                source_rule_id: source_rule,
                set_at: parse_rfc3339(&set_at)?,
                unlock_at: unlock_at.as_deref().map(parse_rfc3339).transpose()?,
            });
        }
        Ok(lockouts)
    }

    // -------------------------------------------------------------------------
    // violations
    // -------------------------------------------------------------------------

    /// Append an audit row, returning its id so `action_taken` can be updated
    /// after the broker ack.
    pub fn insert_violation(
        &self,
        account_id: &str,
        rule_id: &str,
        severity: &str,
        message: &str,
        action_taken: &str,
        payload_json: &str,
    ) -> Result<i64, RiskError> {
        let conn = self.conn.lock();
        conn.execute(
            "INSERT INTO violations
                 (timestamp, account_id, rule_id, severity, message, action_taken, payload_json)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7)",
            params![
                Utc::now().to_rfc3339(),
                account_id,
                rule_id,
                severity,
                message,
                action_taken,
                payload_json,
            ],
        )?;
        Ok(conn.last_insert_rowid())
    }

    /// Record the outcome of an enforcement action on an existing audit row.
    pub fn update_violation_action(&self, id: i64, action_taken: &str) -> Result<(), RiskError> {
        let conn = self.conn.lock();
        conn.execute(
            "UPDATE violations SET action_taken = ?2 WHERE id = ?1",
            params![id, action_taken],
        )?;
        Ok(())
    }

    /// Most recent `limit` audit rows, newest first.
    pub fn recent_violations(&self, limit: usize) -> Result<Vec<ViolationAudit>, RiskError> {
        let conn = self.conn.lock();
        let mut stmt = conn.prepare(
            "SELECT id, timestamp, account_id, rule_id, severity, message, action_taken, payload_json
             FROM violations ORDER BY id DESC LIMIT ?1",
        )?;
        let rows = stmt.query_map(params![limit as i64], |r| {
            Ok((
                r.get::<_, i64>(0)?,
                r.get::<_, String>(1)?,
                r.get::<_, String>(2)?,
                r.get::<_, String>(3)?,
                r.get::<_, String>(4)?,
                r.get::<_, String>(5)?,
                r.get::<_, String>(6)?,
                r.get::<_, String>(7)?,
            ))
        })?;

        let mut audits = Vec::new();
        for row in rows {
            let (id, timestamp, account_id, rule_id, severity, message, action_taken, payload_json) =
                row?;
            audits.push(ViolationAudit {
                id,
                timestamp: parse_rfc3339(&timestamp)?,
                account_id,
                rule_id,
                severity,
                message,
                action_taken,
                payload_json,
            });
        }
        Ok(audits)
    }
}

fn parse_rfc3339(s: &str) -> Result<DateTime<Utc>, RiskError> {
    DateTime::parse_from_rfc3339(s)
        .map(|dt| dt.with_timezone(&Utc))
        .map_err(|e| RiskError::Persistence(format!("bad timestamp '{s}': {e}")))
}

// =============================================================================
// Tests
// =============================================================================
#[cfg(test)]
mod tests {
    use super::*;
    use rust_decimal_macros::dec;

    #[test]
    fn pnl_upsert_and_load() {
        let store = Store::open_in_memory().unwrap();
        let row = PnlRow {
            account_id: "ACC-1".into(),
            trading_day: "2025-11-03".into(),
            cumulative_pnl: Money::new(dec!(-156.50)),
            trade_count: 4,
        };
        store.upsert_pnl(&row).unwrap();
        assert_eq!(store.load_pnl("ACC-1", "2025-11-03").unwrap().unwrap(), row);

        // Update in place.
        let row2 = PnlRow { cumulative_pnl: Money::new(dec!(-200.00)), trade_count: 5, ..row };
        store.upsert_pnl(&row2).unwrap();
        assert_eq!(store.load_pnl("ACC-1", "2025-11-03").unwrap().unwrap(), row2);
        assert_eq!(store.load_pnl("ACC-1", "2025-11-04").unwrap(), None);
    }

    #[test]
    fn pnl_money_is_exact_through_the_store() {
        let store = Store::open_in_memory().unwrap();
        let row = PnlRow {
            account_id: "ACC-1".into(),
            trading_day: "2025-11-03".into(),
            cumulative_pnl: Money::new(dec!(0.1)) + Money::new(dec!(0.2)),
            trade_count: 1,
        };
        store.upsert_pnl(&row).unwrap();
        let loaded = store.load_pnl("ACC-1", "2025-11-03").unwrap().unwrap();
        assert_eq!(loaded.cumulative_pnl, Money::new(dec!(0.3)));
    }

    #[test]
    fn lockout_roundtrip_preserves_unlock_time() {
        let store = Store::open_in_memory().unwrap();
        let lockout = Lockout {
            account_id: "ACC-1".into(),
            reason: "daily realized loss limit".into(),
            kind: LockoutKind::Hard,
            source_rule_id: "daily_realized_loss".into(),
            set_at: "2025-11-03T20:15:00Z".parse().unwrap(),
            unlock_at: Some("2025-11-03T23:00:00Z".parse().unwrap()),
        };
        store.insert_lockout(&lockout).unwrap();
        let active = store.active_lockouts().unwrap();
        assert_eq!(active, vec![lockout]);
    }

    #[test]
    fn lockout_condition_cleared_roundtrips_null_unlock() {
        let store = Store::open_in_memory().unwrap();
        let lockout = Lockout {
            account_id: "ACC-1".into(),
            reason: "auth lost".into(),
            kind: LockoutKind::Hard,
            source_rule_id: "auth_loss_guard".into(),
            set_at: "2025-11-03T20:15:00Z".parse().unwrap(),
            unlock_at: None,
        };
        store.insert_lockout(&lockout).unwrap();
        assert_eq!(store.active_lockouts().unwrap()[0].unlock_at, None);
    }

    #[test]
    fn new_lockout_of_same_kind_replaces_active_row() {
        let store = Store::open_in_memory().unwrap();
        let first = Lockout {
            account_id: "ACC-1".into(),
            reason: "first".into(),
            kind: LockoutKind::Cooldown,
            source_rule_id: "cooldown_after_loss".into(),
            set_at: "2025-11-03T20:15:00Z".parse().unwrap(),
            unlock_at: Some("2025-11-03T20:20:00Z".parse().unwrap()),
        };
        let second =
            Lockout { reason: "second".into(), set_at: "2025-11-03T20:16:00Z".parse().unwrap(), ..first.clone() };
        store.insert_lockout(&first).unwrap();
        store.insert_lockout(&second).unwrap();
        let active = store.active_lockouts().unwrap();
        assert_eq!(active.len(), 1);
        assert_eq!(active[0].reason, "second");
    }

    #[test]
    fn hard_and_cooldown_can_both_be_active() {
        let store = Store::open_in_memory().unwrap();
        let hard = Lockout {
            account_id: "ACC-1".into(),
            reason: "hard".into(),
            kind: LockoutKind::Hard,
            source_rule_id: "daily_realized_loss".into(),
            set_at: "2025-11-03T20:15:00Z".parse().unwrap(),
            unlock_at: None,
        };
        let cooldown = Lockout {
            reason: "cooldown".into(),
            kind: LockoutKind::Cooldown,
            set_at: "2025-11-03T20:16:00Z".parse().unwrap(),
            unlock_at: Some("2025-11-03T20:26:00Z".parse().unwrap()),
            ..hard.clone()
        };
        store.insert_lockout(&hard).unwrap();
        store.insert_lockout(&cooldown).unwrap();
        assert_eq!(store.active_lockouts().unwrap().len(), 2);

        store.clear_lockouts("ACC-1").unwrap();
        assert!(store.active_lockouts().unwrap().is_empty());
    }

    #[test]
    fn violations_append_and_update() {
        let store = Store::open_in_memory().unwrap();
        let id = store
            .insert_violation("ACC-1", "daily_realized_loss", "critical", "limit breached", "pending", "{}")
            .unwrap();
        store.update_violation_action(id, "flatten_all: ok").unwrap();

        let rows = store.recent_violations(10).unwrap();
        assert_eq!(rows.len(), 1);
        assert_eq!(rows[0].rule_id, "daily_realized_loss");
        assert_eq!(rows[0].action_taken, "flatten_all: ok");
    }

    #[test]
    fn recent_violations_newest_first() {
        let store = Store::open_in_memory().unwrap();
        for i in 0..5 {
            store
                .insert_violation("ACC-1", "ingest", "warning", &format!("bad event {i}"), "dropped", "{}")
                .unwrap();
        }
        let rows = store.recent_violations(3).unwrap();
        assert_eq!(rows.len(), 3);
        assert!(rows[0].message.contains("bad event 4"));
    }

    #[test]
    fn known_accounts_lists_distinct() {
        let store = Store::open_in_memory().unwrap();
        for (acc, day) in [("A", "2025-11-03"), ("A", "2025-11-04"), ("B", "2025-11-03")] {
            store
                .upsert_pnl(&PnlRow {
                    account_id: acc.into(),
                    trading_day: day.into(),
                    cumulative_pnl: Money::ZERO,
                    trade_count: 0,
                })
                .unwrap();
        }
        let mut accounts = store.known_accounts().unwrap();
        accounts.sort();
        assert_eq!(accounts, vec!["A", "B"]);
    }
}
