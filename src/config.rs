// =============================================================================
// Configuration — immutable snapshot loaded once at startup
// =============================================================================
//
// The whole tree is `deny_unknown_fields`: a typo'd or unrecognized key is a
// ConfigError, not a silently ignored setting. Cross-field validation runs in
// `validate()` before the daemon wires anything; a config that fails
// validation never runs.
// =============================================================================

use std::collections::HashMap;
use std::path::Path;

use chrono::{NaiveTime, Weekday};
use chrono_tz::Tz;
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use tracing::info;

use crate::domain::{Money, TickEconomics};
use crate::errors::RiskError;

// ---------------------------------------------------------------------------
// Actions
// ---------------------------------------------------------------------------

/// Enforcement action a rule block may be configured with. Each rule's
/// evaluator honors `alert` as a downgrade; otherwise it emits the action
/// its contract prescribes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RuleAction {
    Alert,
    ClosePosition,
    CloseAllPositions,
    CancelOrder,
    ModifyOrder,
    FlattenAndLockout,
}

impl Default for RuleAction {
    fn default() -> Self {
        Self::Alert
    }
}

// ---------------------------------------------------------------------------
// Per-rule blocks
// ---------------------------------------------------------------------------

fn default_enabled() -> bool {
    false
}

fn default_grace_seconds() -> u64 {
    30
}

/// Account-wide max contracts.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct MaxContractsCfg {
    #[serde(default = "default_enabled")]
    pub enabled: bool,
    #[serde(default)]
    pub limit: i64,
    #[serde(default)]
    pub action: RuleAction,
}

impl Default for MaxContractsCfg {
    fn default() -> Self {
        Self { enabled: false, limit: 0, action: RuleAction::Alert }
    }
}

/// How the per-instrument cap shrinks an oversized position.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum InstrumentLimitMode {
    ReduceToLimit,
    Close,
}

impl Default for InstrumentLimitMode {
    fn default() -> Self {
        Self::Close
    }
}

/// Per-instrument max contracts.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct MaxContractsPerInstrumentCfg {
    #[serde(default = "default_enabled")]
    pub enabled: bool,
    /// Symbol root -> contract limit.
    #[serde(default)]
    pub limits: HashMap<String, i64>,
    #[serde(default)]
    pub mode: InstrumentLimitMode,
    #[serde(default)]
    pub action: RuleAction,
}

/// Daily realized loss limit (negative Money).
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct DailyRealizedLossCfg {
    #[serde(default = "default_enabled")]
    pub enabled: bool,
    #[serde(default)]
    pub limit: Money,
    #[serde(default)]
    pub action: RuleAction,
}

/// Composite linkage: the unrealized loss rule may tighten its threshold to
/// the remaining realized-loss budget.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct CompositeEnforcementCfg {
    #[serde(default = "default_enabled")]
    pub enabled: bool,
    #[serde(default)]
    pub respect_realized_limit: bool,
    /// Must reference the daily realized loss rule.
    #[serde(default)]
    pub realized_rule_ref: String,
}

/// Total unrealized loss limit (negative Money), composite-aware.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct DailyUnrealizedLossCfg {
    #[serde(default = "default_enabled")]
    pub enabled: bool,
    #[serde(default)]
    pub limit: Money,
    #[serde(default)]
    pub action: RuleAction,
    #[serde(default)]
    pub composite_enforcement: CompositeEnforcementCfg,
}

/// Per-position unrealized profit target (positive Money).
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct MaxUnrealizedProfitCfg {
    #[serde(default = "default_enabled")]
    pub enabled: bool,
    #[serde(default)]
    pub target: Money,
    #[serde(default)]
    pub action: RuleAction,
}

/// Entry-fill frequency limits per tier. A tier with limit 0 is
/// unbounded.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct TradeFrequencyCfg {
    #[serde(default = "default_enabled")]
    pub enabled: bool,
    #[serde(default)]
    pub per_minute: u32,
    #[serde(default)]
    pub per_hour: u32,
    #[serde(default)]
    pub per_session: u32,
    #[serde(default)]
    pub action: RuleAction,
}

/// One tier of the loss-cooldown ladder: a single-trade loss at or beyond
/// `loss_at_least` earns `cooldown_seconds`.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct LossTier {
    pub loss_at_least: Money,
    pub cooldown_seconds: u64,
}

/// Cooldown after a single-trade loss, tiered by loss size.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct CooldownAfterLossCfg {
    #[serde(default = "default_enabled")]
    pub enabled: bool,
    /// Tiers ordered from smallest loss to largest; the deepest matching
    /// tier wins.
    #[serde(default)]
    pub tiers: Vec<LossTier>,
    #[serde(default)]
    pub action: RuleAction,
}

/// No-stop-loss grace window.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct NoStopLossGraceCfg {
    #[serde(default = "default_enabled")]
    pub enabled: bool,
    #[serde(default = "default_grace_seconds")]
    pub grace_seconds: u64,
    #[serde(default)]
    pub action: RuleAction,
}

impl Default for NoStopLossGraceCfg {
    fn default() -> Self {
        Self { enabled: false, grace_seconds: default_grace_seconds(), action: RuleAction::Alert }
    }
}

/// Block trading outside the configured session window.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct SessionBlockCfg {
    #[serde(default = "default_enabled")]
    pub enabled: bool,
    #[serde(default)]
    pub action: RuleAction,
}

/// Lock out when broker authorization is lost.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct AuthLossGuardCfg {
    #[serde(default = "default_enabled")]
    pub enabled: bool,
    #[serde(default)]
    pub action: RuleAction,
}

/// Symbol blocklist. Entries are case-insensitive roots; `*` blocks
/// everything.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct SymbolBlocksCfg {
    #[serde(default = "default_enabled")]
    pub enabled: bool,
    #[serde(default)]
    pub blocked: Vec<String>,
    #[serde(default)]
    pub action: RuleAction,
}

/// Trade management: move stops to breakeven, then trail.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct TradeManagementCfg {
    #[serde(default = "default_enabled")]
    pub enabled: bool,
    /// Ticks of profit before the stop moves to entry.
    #[serde(default)]
    pub breakeven_trigger_ticks: i64,
    /// Distance in ticks the stop trails behind the mark once past breakeven.
    #[serde(default)]
    pub trail_ticks: i64,
    #[serde(default)]
    pub enable_trailing: bool,
    #[serde(default)]
    pub action: RuleAction,
}

/// Daily realized profit target (positive Money).
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct DailyRealizedProfitCfg {
    #[serde(default = "default_enabled")]
    pub enabled: bool,
    #[serde(default)]
    pub target: Money,
    #[serde(default)]
    pub action: RuleAction,
}

/// All 13 rule blocks. A missing block deserializes to its disabled default.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct RulesConfig {
    #[serde(default)]
    pub max_contracts: MaxContractsCfg,
    #[serde(default)]
    pub max_contracts_per_instrument: MaxContractsPerInstrumentCfg,
    #[serde(default)]
    pub daily_realized_loss: DailyRealizedLossCfg,
    #[serde(default)]
    pub daily_unrealized_loss: DailyUnrealizedLossCfg,
    #[serde(default)]
    pub max_unrealized_profit: MaxUnrealizedProfitCfg,
    #[serde(default)]
    pub trade_frequency: TradeFrequencyCfg,
    #[serde(default)]
    pub cooldown_after_loss: CooldownAfterLossCfg,
    #[serde(default)]
    pub no_stop_loss_grace: NoStopLossGraceCfg,
    #[serde(default)]
    pub session_block_outside: SessionBlockCfg,
    #[serde(default)]
    pub auth_loss_guard: AuthLossGuardCfg,
    #[serde(default)]
    pub symbol_blocks: SymbolBlocksCfg,
    #[serde(default)]
    pub trade_management: TradeManagementCfg,
    #[serde(default)]
    pub daily_realized_profit: DailyRealizedProfitCfg,
}

// ---------------------------------------------------------------------------
// Daily reset / session hours
// ---------------------------------------------------------------------------

fn default_reset_time() -> String {
    "17:00".to_string()
}

fn default_timezone() -> Tz {
    chrono_tz::America::Chicago
}

/// Wall-clock moment of the daily reset, in its own timezone.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct DailyResetCfg {
    #[serde(default = "default_reset_time")]
    pub time: String,
    #[serde(default = "default_timezone")]
    pub timezone: Tz,
}

impl Default for DailyResetCfg {
    fn default() -> Self {
        Self { time: default_reset_time(), timezone: default_timezone() }
    }
}

impl DailyResetCfg {
    pub fn reset_time(&self) -> Result<NaiveTime, RiskError> {
        parse_hhmm(&self.time).map_err(|e| RiskError::config(format!("daily_reset.time: {e}")))
    }
}

fn default_session_start() -> String {
    "08:30".to_string()
}

fn default_session_end() -> String {
    "15:00".to_string()
}

fn default_allowed_days() -> Vec<String> {
    ["Mon", "Tue", "Wed", "Thu", "Fri"].iter().map(|d| d.to_string()).collect()
}

/// Trading session window used by the session gate.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct SessionHoursCfg {
    #[serde(default = "default_session_start")]
    pub start: String,
    #[serde(default = "default_session_end")]
    pub end: String,
    #[serde(default = "default_timezone")]
    pub timezone: Tz,
    #[serde(default = "default_allowed_days")]
    pub allowed_days: Vec<String>,
}

impl Default for SessionHoursCfg {
    fn default() -> Self {
        Self {
            start: default_session_start(),
            end: default_session_end(),
            timezone: default_timezone(),
            allowed_days: default_allowed_days(),
        }
    }
}

impl SessionHoursCfg {
    pub fn start_time(&self) -> Result<NaiveTime, RiskError> {
        parse_hhmm(&self.start).map_err(|e| RiskError::config(format!("session_hours.start: {e}")))
    }

    pub fn end_time(&self) -> Result<NaiveTime, RiskError> {
        parse_hhmm(&self.end).map_err(|e| RiskError::config(format!("session_hours.end: {e}")))
    }

    pub fn weekdays(&self) -> Result<Vec<Weekday>, RiskError> {
        self.allowed_days.iter().map(|d| parse_weekday(d)).collect()
    }
}

// ---------------------------------------------------------------------------
// Tick table
// ---------------------------------------------------------------------------

/// One tick-table entry as configured. Converted to `TickEconomics` after
/// validation.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct TickValueSpec {
    pub size: Decimal,
    pub value: Decimal,
}

// ---------------------------------------------------------------------------
// Top level
// ---------------------------------------------------------------------------

/// The immutable configuration tree. Loaded once; never mutated afterwards.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct RiskConfig {
    #[serde(default)]
    pub rules: RulesConfig,
    #[serde(default)]
    pub daily_reset: DailyResetCfg,
    #[serde(default)]
    pub session_hours: SessionHoursCfg,
    /// Per-rule cooldown seconds, keyed by rule id (tiered rules append a
    /// tier suffix, e.g. `trade_frequency_minute`).
    #[serde(default)]
    pub lockout_durations: HashMap<String, u64>,
    /// Symbol root -> tick size / tick value.
    #[serde(default)]
    pub tick_values: HashMap<String, TickValueSpec>,
}

impl RiskConfig {
    /// Load and validate a configuration file. Unknown keys anywhere in the
    /// tree fail loud via serde's `deny_unknown_fields`.
    pub fn load(path: impl AsRef<Path>) -> Result<Self, RiskError> {
        let path = path.as_ref();
        let content = std::fs::read_to_string(path)
            .map_err(|e| RiskError::config(format!("failed to read {}: {e}", path.display())))?;
        let config: Self = serde_json::from_str(&content)
            .map_err(|e| RiskError::config(format!("failed to parse {}: {e}", path.display())))?;
        config.validate()?;

        info!(
            path = %path.display(),
            symbols = config.tick_values.len(),
            "config loaded"
        );
        Ok(config)
    }

    /// Cross-field validation. Called by `load`; tests call it directly.
    pub fn validate(&self) -> Result<(), RiskError> {
        for (root, spec) in &self.tick_values {
            if spec.size <= Decimal::ZERO {
                return Err(RiskError::config(format!(
                    "tick_values.{root}.size must be positive, got {}",
                    spec.size
                )));
            }
            if spec.value <= Decimal::ZERO {
                return Err(RiskError::config(format!(
                    "tick_values.{root}.value must be positive, got {}",
                    spec.value
                )));
            }
        }

        self.daily_reset.reset_time()?;
        self.session_hours.start_time()?;
        self.session_hours.end_time()?;
        self.session_hours.weekdays()?;

        let realized = &self.rules.daily_realized_loss;
        if realized.enabled && !realized.limit.is_loss() {
            return Err(RiskError::config(format!(
                "rules.daily_realized_loss.limit must be negative, got {}",
                realized.limit
            )));
        }

        let unrealized = &self.rules.daily_unrealized_loss;
        if unrealized.enabled && !unrealized.limit.is_loss() {
            return Err(RiskError::config(format!(
                "rules.daily_unrealized_loss.limit must be negative, got {}",
                unrealized.limit
            )));
        }

        let composite = &unrealized.composite_enforcement;
        if composite.enabled && composite.realized_rule_ref != "daily_realized_loss" {
            return Err(RiskError::config(format!(
                "composite_enforcement.realized_rule_ref must be 'daily_realized_loss', got '{}'",
                composite.realized_rule_ref
            )));
        }

        // An unrealized limit looser (more negative) than the realized limit
        // lets an open loss close into a realized breach. Refuse unless
        // composite enforcement tightens the bound dynamically.
        if realized.enabled && unrealized.enabled && !composite.enabled {
            if unrealized.limit < realized.limit {
                return Err(RiskError::config(format!(
                    "rules.daily_unrealized_loss.limit {} is looser than \
                     rules.daily_realized_loss.limit {}; enable composite_enforcement \
                     or tighten the unrealized limit",
                    unrealized.limit, realized.limit
                )));
            }
        }

        let profit = &self.rules.daily_realized_profit;
        if profit.enabled && !profit.target.is_profit() {
            return Err(RiskError::config(format!(
                "rules.daily_realized_profit.target must be positive, got {}",
                profit.target
            )));
        }

        if self.rules.no_stop_loss_grace.enabled && self.rules.no_stop_loss_grace.grace_seconds == 0
        {
            return Err(RiskError::config(
                "rules.no_stop_loss_grace.grace_seconds must be at least 1".to_string(),
            ));
        }

        for tier in &self.rules.cooldown_after_loss.tiers {
            if !tier.loss_at_least.is_loss() {
                return Err(RiskError::config(format!(
                    "rules.cooldown_after_loss tier loss_at_least must be negative, got {}",
                    tier.loss_at_least
                )));
            }
        }

        Ok(())
    }

    /// The validated tick table in domain form, for the registry.
    pub fn tick_table(&self) -> HashMap<String, TickEconomics> {
        self.tick_values
            .iter()
            .map(|(root, spec)| {
                (
                    root.to_uppercase(),
                    TickEconomics { tick_size: spec.size, tick_value: Money::new(spec.value) },
                )
            })
            .collect()
    }

    /// Cooldown duration for a rule id (with optional tier suffix), if
    /// configured.
    pub fn lockout_duration(&self, key: &str) -> Option<u64> {
        self.lockout_durations.get(key).copied()
    }
}

// ---------------------------------------------------------------------------
// Parsing helpers
// ---------------------------------------------------------------------------

fn parse_hhmm(s: &str) -> Result<NaiveTime, String> {
    NaiveTime::parse_from_str(s, "%H:%M").map_err(|e| format!("'{s}' is not HH:MM ({e})"))
}

fn parse_weekday(s: &str) -> Result<Weekday, RiskError> {
    match s {
        "Mon" => Ok(Weekday::Mon),
        "Tue" => Ok(Weekday::Tue),
        "Wed" => Ok(Weekday::Wed),
        "Thu" => Ok(Weekday::Thu),
        "Fri" => Ok(Weekday::Fri),
        "Sat" => Ok(Weekday::Sat),
        "Sun" => Ok(Weekday::Sun),
        other => Err(RiskError::config(format!(
            "session_hours.allowed_days: unknown day '{other}' (expected Mon..Sun)"
        ))),
    }
}
