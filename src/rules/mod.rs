// =============================================================================
// Rule Library — 13 risk rules over four enforcement categories
// =============================================================================
//
// Each rule is an evaluator over `(RiskEvent, EngineView)`: no I/O, no access
// to the broker or the store. A rule returns `None` or one `Violation`
// describing the action the enforcement executor should take. Rules may keep
// internal counters and state machines, but shared state (realized P&L,
// lockouts, positions, marks) is read only through the engine-provided view.
// =============================================================================

pub mod auth_guard;
pub mod daily_realized;
pub mod frequency;
pub mod max_contracts;
pub mod session;
pub mod stop_grace;
pub mod symbol_blocks;
pub mod trade_management;
pub mod unrealized;

use std::collections::HashMap;
use std::sync::Arc;

use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use tokio::sync::mpsc;
use tracing::info;

use crate::config::RiskConfig;
use crate::domain::{Money, Order, Position, RiskEvent, TickEconomics};
use crate::engine::EngineMsg;
use crate::errors::RiskError;
use crate::reset::TradingCalendar;
use crate::ticks::TickRegistry;
use crate::timers::TimerManager;

// ---------------------------------------------------------------------------
// Violations
// ---------------------------------------------------------------------------

/// Audit severity of a violation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Severity {
    Warning,
    Error,
    Critical,
}

impl Severity {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Warning => "warning",
            Self::Error => "error",
            Self::Critical => "critical",
        }
    }
}

/// Stop-order price updates applied by trade management.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StopOrderUpdate {
    pub stop_price: Decimal,
}

/// A lockout demanded by a violation.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum LockoutRequest {
    Hard { reason: String, until: Option<DateTime<Utc>> },
    Cooldown { reason: String, duration_seconds: u64 },
}

/// What the enforcement executor should do about a violation.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum ActionRequest {
    /// Log-only.
    Alert,
    ClosePosition { contract_id: String },
    /// Shrink an oversized position back to its per-instrument limit. The
    /// outbound port only supports full closes, so this closes the offending
    /// position and records the intent.
    ReduceToLimit { contract_id: String, excess: i64 },
    CloseAllPositions,
    CancelOrder { order_id: String },
    ModifyOrder { order_id: String, updates: StopOrderUpdate },
    Lockout(LockoutRequest),
    FlattenAndLockout(LockoutRequest),
    /// Release a condition-held lockout owned by `source_rule_id` (auth
    /// guard on reconnect). Only the owning rule may emit this.
    ReleaseLockout { source_rule_id: String },
}

/// One rule's verdict on one event.
#[derive(Debug, Clone, Serialize)]
pub struct Violation {
    pub rule_id: &'static str,
    pub severity: Severity,
    pub message: String,
    pub action: ActionRequest,
    /// Rule-specific context carried onto the audit row (e.g. configured vs
    /// effective thresholds for composite enforcement).
    pub payload: serde_json::Value,
}

// ---------------------------------------------------------------------------
// Engine view
// ---------------------------------------------------------------------------

/// Immutable read-only snapshot handed to every rule. Built by the engine
/// per event; rules never reach shared state any other way.
pub struct EngineView<'a> {
    pub config: &'a RiskConfig,
    pub now: DateTime<Utc>,
    registry: &'a TickRegistry,
    positions: &'a [Position],
    stop_orders: &'a HashMap<String, Order>,
    marks: &'a HashMap<String, Decimal>,
    realized_pnl: Money,
}

impl<'a> EngineView<'a> {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        config: &'a RiskConfig,
        now: DateTime<Utc>,
        registry: &'a TickRegistry,
        positions: &'a [Position],
        stop_orders: &'a HashMap<String, Order>,
        marks: &'a HashMap<String, Decimal>,
        realized_pnl: Money,
    ) -> Self {
        Self { config, now, registry, positions, stop_orders, marks, realized_pnl }
    }

    /// Open positions on the account.
    pub fn positions(&self) -> &[Position] {
        self.positions
    }

    /// Cumulative realized P&L for the current trading day (includes the
    /// trade carried by the event under evaluation).
    pub fn realized_pnl(&self) -> Money {
        self.realized_pnl
    }

    /// Total unrealized P&L across positions with a known mark.
    pub fn total_unrealized(&self) -> Money {
        self.positions.iter().filter_map(|p| p.unrealized_pnl).sum()
    }

    /// Latest mark price for a symbol root.
    pub fn market_price(&self, symbol_root: &str) -> Option<Decimal> {
        self.marks.get(symbol_root).copied()
    }

    /// The observed open stop order protecting a contract, if any.
    pub fn stop_order_for(&self, contract_id: &str) -> Option<&Order> {
        self.stop_orders.get(contract_id)
    }

    pub fn tick_economics(&self, symbol_root: &str) -> Result<TickEconomics, RiskError> {
        self.registry.get(symbol_root)
    }
}

// ---------------------------------------------------------------------------
// Rule trait & registry
// ---------------------------------------------------------------------------

/// One evaluator per rule. `&mut self` is for rule-internal counters and
/// state machines only; shared state goes through the view.
pub trait RiskRule: Send + Sync {
    fn id(&self) -> &'static str;

    fn evaluate(
        &mut self,
        event: &RiskEvent,
        view: &EngineView<'_>,
    ) -> Result<Option<Violation>, RiskError>;
}

/// Construction-time dependencies for rules that schedule timers or compute
/// reset-relative unlock times.
pub struct RuleDeps {
    pub timers: Arc<TimerManager>,
    pub engine_tx: mpsc::UnboundedSender<EngineMsg>,
    pub calendar: TradingCalendar,
}

/// Build the enabled rules in their fixed, deterministic evaluation order.
pub fn build_rules(
    config: &RiskConfig,
    deps: &RuleDeps,
) -> Result<Vec<Box<dyn RiskRule>>, RiskError> {
    let mut rules: Vec<Box<dyn RiskRule>> = Vec::new();
    let r = &config.rules;

    if r.max_contracts.enabled {
        rules.push(Box::new(max_contracts::MaxContracts::new(r.max_contracts.clone())));
    }
    if r.max_contracts_per_instrument.enabled {
        rules.push(Box::new(max_contracts::MaxContractsPerInstrument::new(
            r.max_contracts_per_instrument.clone(),
        )));
    }
    if r.daily_realized_loss.enabled {
        rules.push(Box::new(daily_realized::DailyRealizedLoss::new(
            r.daily_realized_loss.clone(),
            deps.calendar,
        )));
    }
    if r.daily_unrealized_loss.enabled {
        rules.push(Box::new(unrealized::DailyUnrealizedLoss::new(
            r.daily_unrealized_loss.clone(),
            config.rules.daily_realized_loss.limit,
        )));
    }
    if r.max_unrealized_profit.enabled {
        rules.push(Box::new(unrealized::MaxUnrealizedProfit::new(
            r.max_unrealized_profit.clone(),
        )));
    }
    if r.trade_frequency.enabled {
        rules.push(Box::new(frequency::TradeFrequency::new(
            r.trade_frequency.clone(),
            config.lockout_durations.clone(),
        )));
    }
    if r.cooldown_after_loss.enabled {
        rules.push(Box::new(frequency::CooldownAfterLoss::new(r.cooldown_after_loss.clone())));
    }
    if r.no_stop_loss_grace.enabled {
        rules.push(Box::new(stop_grace::NoStopLossGrace::new(
            r.no_stop_loss_grace.clone(),
            deps.timers.clone(),
            deps.engine_tx.clone(),
        )));
    }
    if r.session_block_outside.enabled {
        rules.push(Box::new(session::SessionBlockOutside::new(
            r.session_block_outside.clone(),
            config.session_hours.clone(),
        )?));
    }
    if r.auth_loss_guard.enabled {
        rules.push(Box::new(auth_guard::AuthLossGuard::new(r.auth_loss_guard.clone())));
    }
    if r.symbol_blocks.enabled {
        rules.push(Box::new(symbol_blocks::SymbolBlocks::new(r.symbol_blocks.clone())));
    }
    if r.trade_management.enabled {
        rules.push(Box::new(trade_management::TradeManagement::new(r.trade_management.clone())));
    }
    if r.daily_realized_profit.enabled {
        rules.push(Box::new(daily_realized::DailyRealizedProfit::new(
            r.daily_realized_profit.clone(),
            deps.calendar,
        )));
    }

    let ids: Vec<&str> = rules.iter().map(|r| r.id()).collect();
    info!(count = rules.len(), rules = ?ids, "rules initialized");
    Ok(rules)
}

// ---------------------------------------------------------------------------
// Test helpers shared by rule tests
// ---------------------------------------------------------------------------
