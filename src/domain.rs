// =============================================================================
// Canonical domain model — typed, validated values shared across the daemon
// =============================================================================
//
// Everything a rule may read passes through these types. Raw broker payloads
// are converted exactly once (adapter.rs); from then on money is exact
// decimal, sides are enums, and prices are tick-checked. No accessor here
// substitutes a default for a missing field.
// =============================================================================

use chrono::{DateTime, Utc};
use rust_decimal::prelude::Signed;
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};

use crate::errors::RiskError;

// ---------------------------------------------------------------------------
// Money
// ---------------------------------------------------------------------------

/// Signed amount in the account currency. Exact decimal — never binary float.
/// Positive = profit, negative = loss.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Default, Serialize, Deserialize,
)]
#[serde(transparent)]
pub struct Money(pub Decimal);

impl Money {
    pub const ZERO: Money = Money(Decimal::ZERO);

    pub fn new(amount: Decimal) -> Self {
        Self(amount)
    }

    /// Parse from the canonical decimal-string form used in the store.
    pub fn parse(s: &str) -> Result<Self, RiskError> {
        s.parse::<Decimal>()
            .map(Money)
            .map_err(|e| RiskError::mapping(format!("unparseable money '{s}': {e}")))
    }

    pub fn amount(&self) -> Decimal {
        self.0
    }

    pub fn is_profit(&self) -> bool {
        self.0 > Decimal::ZERO
    }

    pub fn is_loss(&self) -> bool {
        self.0 < Decimal::ZERO
    }

    pub fn abs(&self) -> Money {
        Money(self.0.abs())
    }

    /// Sign as a decimal: +1, 0, or -1.
    pub fn signum(&self) -> Decimal {
        self.0.signum()
    }
}

impl std::ops::Add for Money {
    type Output = Money;
    fn add(self, rhs: Money) -> Money {
        Money(self.0 + rhs.0)
    }
}

impl std::ops::AddAssign for Money {
    fn add_assign(&mut self, rhs: Money) {
        self.0 += rhs.0;
    }
}

impl std::ops::Sub for Money {
    type Output = Money;
    fn sub(self, rhs: Money) -> Money {
        Money(self.0 - rhs.0)
    }
}

impl std::ops::Neg for Money {
    type Output = Money;
    fn neg(self) -> Money {
        Money(-self.0)
    }
}

impl std::iter::Sum for Money {
    fn sum<I: Iterator<Item = Money>>(iter: I) -> Money {
        Money(iter.map(|m| m.0).sum())
    }
}

impl std::fmt::Display for Money {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        if self.0 < Decimal::ZERO {
            write!(f, "-${}", self.0.abs())
        } else {
            write!(f, "${}", self.0)
        }
    }
}

// ---------------------------------------------------------------------------
// Side
// ---------------------------------------------------------------------------

/// Direction of an open position. Derived from broker position `type`:
/// 1 = LONG, 2 = SHORT. Any other value fails loud (0 = FLAT never reaches
/// the domain — flat positions are closures, not positions).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum Side {
    Long,
    Short,
}

impl Side {
    pub fn from_broker_type(t: i64) -> Result<Self, RiskError> {
        match t {
            1 => Ok(Self::Long),
            2 => Ok(Self::Short),
            other => Err(RiskError::mapping(format!(
                "position type {other} is not a side (expected 1=LONG or 2=SHORT)"
            ))),
        }
    }

    /// Directional sign: +1 for long, -1 for short.
    pub fn sign(&self) -> Decimal {
        match self {
            Self::Long => Decimal::ONE,
            Self::Short => -Decimal::ONE,
        }
    }
}

impl std::fmt::Display for Side {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Long => write!(f, "LONG"),
            Self::Short => write!(f, "SHORT"),
        }
    }
}

/// Direction of an order as the broker reports it: 0 = BUY, 1 = SELL.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum OrderSide {
    Buy,
    Sell,
}

impl OrderSide {
    pub fn from_broker_side(s: i64) -> Result<Self, RiskError> {
        match s {
            0 => Ok(Self::Buy),
            1 => Ok(Self::Sell),
            other => Err(RiskError::mapping(format!(
                "order side {other} is not BUY(0) or SELL(1)"
            ))),
        }
    }
}

impl std::fmt::Display for OrderSide {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Buy => write!(f, "BUY"),
            Self::Sell => write!(f, "SELL"),
        }
    }
}

// ---------------------------------------------------------------------------
// Orders
// ---------------------------------------------------------------------------

/// Broker order type. The documented integers are 1-5; anything else passes
/// through as `Other` and is never treated as a stop order.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum OrderType {
    Market,
    Limit,
    StopLimit,
    Stop,
    TrailingStop,
    Other(i64),
}

impl OrderType {
    pub fn from_broker_type(t: i64) -> Self {
        match t {
            1 => Self::Market,
            2 => Self::Limit,
            3 => Self::StopLimit,
            4 => Self::Stop,
            5 => Self::TrailingStop,
            other => Self::Other(other),
        }
    }

    /// Whether this order protects a position (stop-loss detection).
    pub fn is_stop(&self) -> bool {
        matches!(self, Self::StopLimit | Self::Stop | Self::TrailingStop)
    }
}

impl std::fmt::Display for OrderType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Market => write!(f, "MARKET"),
            Self::Limit => write!(f, "LIMIT"),
            Self::StopLimit => write!(f, "STOP_LIMIT"),
            Self::Stop => write!(f, "STOP"),
            Self::TrailingStop => write!(f, "TRAILING_STOP"),
            Self::Other(n) => write!(f, "OTHER({n})"),
        }
    }
}

/// An order as observed on the account. The daemon watches orders (for
/// stop-loss detection and trade management) but does not own their
/// lifecycle.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Order {
    pub order_id: String,
    /// Broker contract id, preserved verbatim.
    pub contract_id: String,
    pub order_type: OrderType,
    pub side: OrderSide,
    pub size: i64,
    pub stop_price: Option<Decimal>,
    pub limit_price: Option<Decimal>,
    /// Raw broker status integer, passed through untouched.
    pub status: i64,
}

// ---------------------------------------------------------------------------
// Tick economics
// ---------------------------------------------------------------------------

/// Minimum price increment and its currency value for one contract.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct TickEconomics {
    pub tick_size: Decimal,
    pub tick_value: Money,
}

// ---------------------------------------------------------------------------
// Position
// ---------------------------------------------------------------------------

/// Canonical open position. Created on POSITION_OPENED, mutated only by
/// POSITION_UPDATED, destroyed on POSITION_CLOSED.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Position {
    /// Broker contract id, preserved verbatim (e.g. `CON.F.US.MNQ.Z25`).
    pub contract_id: String,
    /// Normalized symbol root after prefix/suffix stripping and aliasing.
    pub symbol_root: String,
    pub side: Side,
    /// Strictly positive; direction lives in `side`.
    pub quantity: i64,
    /// Tick-aligned entry price.
    pub entry_price: Decimal,
    /// Present once a mark price has been observed for the contract.
    pub unrealized_pnl: Option<Money>,
    pub created_at: DateTime<Utc>,
}

impl Position {
    /// Unrealized P&L implied by `mark`:
    /// `ticks(mark - entry) x tick_value x quantity x sign(side)`.
    pub fn unrealized_at(&self, mark: Decimal, ticks: &TickEconomics) -> Money {
        let tick_move = (mark - self.entry_price) / ticks.tick_size;
        let qty = Decimal::from(self.quantity);
        Money(tick_move * ticks.tick_value.amount() * qty * self.side.sign())
    }
}

// ---------------------------------------------------------------------------
// Quotes
// ---------------------------------------------------------------------------

/// A market quote for one contract.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Quote {
    pub symbol: String,
    pub bid: Decimal,
    pub ask: Decimal,
    pub last_price: Decimal,
    pub timestamp: DateTime<Utc>,
}

impl Quote {
    /// Reference price for mark-to-market. Futures quotes frequently carry
    /// `last_price = 0`; fall back to the bid/ask midpoint.
    pub fn reference_price(&self) -> Option<Decimal> {
        if self.last_price > Decimal::ZERO {
            return Some(self.last_price);
        }
        if self.bid > Decimal::ZERO && self.ask > Decimal::ZERO {
            return Some((self.bid + self.ask) / Decimal::TWO);
        }
        None
    }
}

// ---------------------------------------------------------------------------
// Lockouts
// ---------------------------------------------------------------------------

/// Kind of trading lockout.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum LockoutKind {
    /// Blocks all rule evaluation until an absolute unlock time, or until the
    /// setting rule clears it (`unlock_at = None`).
    Hard,
    /// Duration-based lockout cleared by a timer.
    Cooldown,
}

impl LockoutKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Hard => "HARD",
            Self::Cooldown => "COOLDOWN",
        }
    }

    pub fn parse(s: &str) -> Result<Self, RiskError> {
        match s {
            "HARD" => Ok(Self::Hard),
            "COOLDOWN" => Ok(Self::Cooldown),
            other => Err(RiskError::mapping(format!("unknown lockout kind '{other}'"))),
        }
    }
}

impl std::fmt::Display for LockoutKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// An active trading lockout. Durable: hard lockouts persist across restart,
/// cooldown lockouts persist and re-arm their clear timer on rehydration.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Lockout {
    pub account_id: String,
    pub reason: String,
    pub kind: LockoutKind,
    pub source_rule_id: String,
    pub set_at: DateTime<Utc>,
    /// `None` means permanent-until-condition (only the setting rule clears
    /// it).
    pub unlock_at: Option<DateTime<Utc>>,
}

impl Lockout {
    /// Seconds until the lockout unlocks, or 0 when already unlockable /
    /// condition-cleared.
    pub fn remaining_seconds(&self, now: DateTime<Utc>) -> u64 {
        match self.unlock_at {
            Some(unlock) if unlock > now => (unlock - now).num_seconds().max(0) as u64,
            _ => 0,
        }
    }
}

// ---------------------------------------------------------------------------
// RiskEvent
// ---------------------------------------------------------------------------

/// Kind of canonical event flowing into the risk engine.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum EventType {
    OrderFilled,
    OrderPlaced,
    OrderCancelled,
    PositionOpened,
    PositionUpdated,
    PositionClosed,
    QuoteUpdate,
    UnrealizedPnlUpdate,
    AuthFailed,
    SdkDisconnected,
    SdkConnected,
    DailyReset,
}

impl std::fmt::Display for EventType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        // Upper-snake broker-style names, shared by logs and audit rows.
        let name = match self {
            Self::OrderFilled => "ORDER_FILLED",
            Self::OrderPlaced => "ORDER_PLACED",
            Self::OrderCancelled => "ORDER_CANCELLED",
            Self::PositionOpened => "POSITION_OPENED",
            Self::PositionUpdated => "POSITION_UPDATED",
            Self::PositionClosed => "POSITION_CLOSED",
            Self::QuoteUpdate => "QUOTE_UPDATE",
            Self::UnrealizedPnlUpdate => "UNREALIZED_PNL_UPDATE",
            Self::AuthFailed => "AUTH_FAILED",
            Self::SdkDisconnected => "SDK_DISCONNECTED",
            Self::SdkConnected => "SDK_CONNECTED",
            Self::DailyReset => "DAILY_RESET",
        };
        write!(f, "{name}")
    }
}

/// The only value passed to rules. Typed fields are canonical; `raw_data`
/// exists for rule-level fields not yet modeled and may never shadow a typed
/// field.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RiskEvent {
    pub event_type: EventType,
    pub account_id: String,
    pub timestamp: DateTime<Utc>,
    pub position: Option<Position>,
    pub order: Option<Order>,
    pub quote: Option<Quote>,
    /// Realized P&L, present only on POSITION_CLOSED.
    pub realized_pnl: Option<Money>,
    pub raw_data: serde_json::Value,
}

/// Raw keys that would shadow a typed `RiskEvent` field. Stripped at
/// construction so rules cannot read a stale copy.
const SHADOWED_RAW_KEYS: &[&str] = &[
    "event_type",
    "account_id",
    "timestamp",
    "position",
    "order",
    "quote",
    "realized_pnl",
];

impl RiskEvent {
    pub fn new(event_type: EventType, account_id: impl Into<String>) -> Self {
        Self {
            event_type,
            account_id: account_id.into(),
            timestamp: Utc::now(),
            position: None,
            order: None,
            quote: None,
            realized_pnl: None,
            raw_data: serde_json::Value::Null,
        }
    }

    pub fn with_position(mut self, position: Position) -> Self {
        self.position = Some(position);
        self
    }

    pub fn with_order(mut self, order: Order) -> Self {
        self.order = Some(order);
        self
    }

    pub fn with_quote(mut self, quote: Quote) -> Self {
        self.quote = Some(quote);
        self
    }

    pub fn with_realized_pnl(mut self, pnl: Money) -> Self {
        self.realized_pnl = Some(pnl);
        self
    }

    /// Attach the raw broker payload, stripping any keys that exist as typed
    /// fields.
    pub fn with_raw(mut self, mut raw: serde_json::Value) -> Self {
        if let Some(map) = raw.as_object_mut() {
            for key in SHADOWED_RAW_KEYS {
                map.remove(*key);
            }
        }
        self.raw_data = raw;
        self
    }
}
