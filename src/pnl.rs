// =============================================================================
// P&L Tracker — per-account realized P&L for the current trading day
// =============================================================================
//
// Every mutation is flushed to the store before the call returns, so a crash
// between two events can never lose a realized trade. Rows are keyed
// `(account_id, trading_day)`; the archive requirement of the daily reset
// falls out of the key change. Writes are accepted regardless of lockout
// state — the ledger may exceed a configured limit; only rule evaluation is
// suppressed elsewhere.
// =============================================================================

use std::collections::HashMap;
use std::sync::Arc;

use chrono::Utc;
use parking_lot::RwLock;
use tracing::{debug, error, info, warn};

use crate::domain::Money;
use crate::errors::RiskError;
use crate::persistence::{PnlRow, Store};
use crate::reset::TradingCalendar;

pub struct PnlTracker {
    store: Arc<Store>,
    calendar: TradingCalendar,
    /// Current-day row per account. The store remains authoritative; this is
    /// the read path for rules.
    ledger: RwLock<HashMap<String, PnlRow>>,
}

impl PnlTracker {
    pub fn new(store: Arc<Store>, calendar: TradingCalendar) -> Self {
        Self { store, calendar, ledger: RwLock::new(HashMap::new()) }
    }

    // -------------------------------------------------------------------------
    // Mutations
    // -------------------------------------------------------------------------

    /// Add one trade's realized P&L and return the new daily cumulative.
    ///
    /// The updated row is persisted before returning; a store failure (after
    /// one retry) surfaces as a PersistenceError so the engine can enter
    /// DEGRADED mode.
    pub fn add_trade_pnl(&self, account_id: &str, pnl: Money) -> Result<Money, RiskError> {
        let mut row = self.current_row(account_id);
        row.cumulative_pnl += pnl;
        row.trade_count += 1;

        self.persist_with_retry(&row)?;

        let cumulative = row.cumulative_pnl;
        self.ledger.write().insert(account_id.to_string(), row);

        debug!(
            account = %account_id,
            trade_pnl = %pnl,
            daily_pnl = %cumulative,
            "trade pnl recorded"
        );
        Ok(cumulative)
    }

    /// Archive the current day's row and begin a new one. Called only by the
    /// reset scheduler.
    pub fn reset_daily_pnl(&self, account_id: &str) -> Result<(), RiskError> {
        let previous = self.current_row(account_id);
        let fresh = PnlRow {
            account_id: account_id.to_string(),
            trading_day: self.calendar.trading_day(Utc::now()),
            cumulative_pnl: Money::ZERO,
            trade_count: 0,
        };
        self.persist_with_retry(&fresh)?;
        self.ledger.write().insert(account_id.to_string(), fresh);

        info!(
            account = %account_id,
            archived_day = %previous.trading_day,
            archived_pnl = %previous.cumulative_pnl,
            "daily pnl reset"
        );
        Ok(())
    }

    // -------------------------------------------------------------------------
    // Reads
    // -------------------------------------------------------------------------

    /// Cumulative realized P&L for the current trading day, creating the row
    /// lazily (and loading any persisted row for the day on first access).
    pub fn get_daily_pnl(&self, account_id: &str) -> Money {
        self.current_row(account_id).cumulative_pnl
    }

    /// Trades recorded so far in the current trading day.
    pub fn daily_trade_count(&self, account_id: &str) -> i64 {
        self.current_row(account_id).trade_count
    }

    /// Accounts known to the tracker (in-memory and persisted).
    pub fn accounts(&self) -> Vec<String> {
        let mut accounts: Vec<String> = self.ledger.read().keys().cloned().collect();
        match self.store.known_accounts() {
            Ok(stored) => {
                for account in stored {
                    if !accounts.contains(&account) {
                        accounts.push(account);
                    }
                }
            }
            Err(e) => warn!(error = %e, "could not list accounts from store"),
        }
        accounts.sort();
        accounts
    }

    // -------------------------------------------------------------------------
    // Internals
    // -------------------------------------------------------------------------

    /// The row for the current trading day, rolling the in-memory row when
    /// the day key has advanced and recovering a persisted row on first
    /// access after a restart.
    fn current_row(&self, account_id: &str) -> PnlRow {
        let today = self.calendar.trading_day(Utc::now());

        if let Some(row) = self.ledger.read().get(account_id) {
            if row.trading_day == today {
                return row.clone();
            }
        }

        // Miss or stale day: prefer the persisted row for today (restart
        // recovery), otherwise start at zero.
        let row = match self.store.load_pnl(account_id, &today) {
            Ok(Some(row)) => row,
            Ok(None) => PnlRow {
                account_id: account_id.to_string(),
                trading_day: today,
                cumulative_pnl: Money::ZERO,
                trade_count: 0,
            },
            Err(e) => {
                error!(account = %account_id, error = %e, "pnl row load failed; using zero");
                PnlRow {
                    account_id: account_id.to_string(),
                    trading_day: today,
                    cumulative_pnl: Money::ZERO,
                    trade_count: 0,
                }
            }
        };
        self.ledger.write().insert(account_id.to_string(), row.clone());
        row
    }

    fn persist_with_retry(&self, row: &PnlRow) -> Result<(), RiskError> {
        if let Err(first) = self.store.upsert_pnl(row) {
            warn!(account = %row.account_id, error = %first, "pnl flush failed; retrying once");
            self.store.upsert_pnl(row).map_err(|second| {
                error!(account = %row.account_id, error = %second, "pnl flush failed twice");
                second
            })?;
        }
        Ok(())
    }
}
