// =============================================================================
// Central Application State — RiskGuard daemon
// =============================================================================
//
// Ties the subsystems together and owns the market books the router writes
// and the engine reads. All mutable shared collections sit behind
// `parking_lot::RwLock`; subsystem engines manage their own interior
// mutability and are shared via `Arc`.
// =============================================================================

use std::collections::HashMap;
use std::sync::Arc;

use parking_lot::RwLock;
use rust_decimal::Decimal;

use crate::config::RiskConfig;
use crate::domain::{Money, Order, Position};
use crate::lockout::LockoutManager;
use crate::persistence::Store;
use crate::pnl::PnlTracker;
use crate::ticks::TickRegistry;
use crate::timers::TimerManager;

// =============================================================================
// Market books
// =============================================================================

/// Live view of the account as observed from the broker feed. Single writer
/// (the event router); the engine snapshots on every event.
#[derive(Default)]
pub struct MarketBooks {
    /// Open positions by contract id.
    pub positions: RwLock<HashMap<String, Position>>,
    /// Observed open stop orders by contract id.
    pub stop_orders: RwLock<HashMap<String, Order>>,
    /// Latest mark price by symbol root.
    pub marks: RwLock<HashMap<String, Decimal>>,
}

impl MarketBooks {
    pub fn new() -> Self {
        Self::default()
    }

    /// Snapshot of all open positions.
    pub fn positions_snapshot(&self) -> Vec<Position> {
        self.positions.read().values().cloned().collect()
    }

    /// Snapshot of observed stop orders.
    pub fn stop_orders_snapshot(&self) -> HashMap<String, Order> {
        self.stop_orders.read().clone()
    }

    /// Snapshot of the mark cache.
    pub fn marks_snapshot(&self) -> HashMap<String, Decimal> {
        self.marks.read().clone()
    }

    /// Total unrealized P&L across positions with a known mark.
    pub fn total_unrealized(&self) -> Money {
        self.positions.read().values().filter_map(|p| p.unrealized_pnl).sum()
    }
}

// =============================================================================
// AppState
// =============================================================================

/// Shared across all async tasks via `Arc<AppState>`.
pub struct AppState {
    /// Immutable configuration snapshot loaded at startup.
    pub config: Arc<RiskConfig>,
    /// The single account this daemon guards.
    pub account_id: String,

    pub registry: Arc<TickRegistry>,
    pub books: Arc<MarketBooks>,

    pub store: Arc<Store>,
    pub pnl: Arc<PnlTracker>,
    pub lockouts: Arc<LockoutManager>,
    pub timers: Arc<TimerManager>,

    /// Instant the daemon started, for uptime in status lines.
    pub start_time: std::time::Instant,
}

impl AppState {
    pub fn new(
        config: Arc<RiskConfig>,
        account_id: String,
        registry: Arc<TickRegistry>,
        store: Arc<Store>,
        pnl: Arc<PnlTracker>,
        lockouts: Arc<LockoutManager>,
        timers: Arc<TimerManager>,
    ) -> Self {
        Self {
            config,
            account_id,
            registry,
            books: Arc::new(MarketBooks::new()),
            store,
            pnl,
            lockouts,
            timers,
            start_time: std::time::Instant::now(),
        }
    }
}

impl std::fmt::Debug for AppState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("AppState")
            .field("account_id", &self.account_id)
            .field("open_positions", &self.books.positions.read().len())
            .field("uptime_secs", &self.start_time.elapsed().as_secs())
            .finish()
    }
}

// =============================================================================
// Tests
// =============================================================================
#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::Side;
    use chrono::Utc;
    use rust_decimal_macros::dec;

    fn pos(contract: &str, unrealized: Option<Money>) -> Position {
        Position {
            contract_id: contract.into(),
            symbol_root: "MNQ".into(),
            side: Side::Long,
            quantity: 1,
            entry_price: dec!(21000.00),
            unrealized_pnl: unrealized,
            created_at: Utc::now(),
        }
    }

    #[test]
    fn total_unrealized_skips_unmarked_positions() {
        let books = MarketBooks::new();
        books.positions.write().insert("A".into(), pos("A", Some(Money::new(dec!(40)))));
        books.positions.write().insert("B".into(), pos("B", None));
        books.positions.write().insert("C".into(), pos("C", Some(Money::new(dec!(-15.50)))));
        assert_eq!(books.total_unrealized(), Money::new(dec!(24.50)));
    }

    #[test]
    fn snapshots_are_detached_copies() {
        let books = MarketBooks::new();
        books.positions.write().insert("A".into(), pos("A", None));
        let snapshot = books.positions_snapshot();
        books.positions.write().clear();
        assert_eq!(snapshot.len(), 1);
    }
}
