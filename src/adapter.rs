// =============================================================================
// SDK Adapter — raw broker payloads to canonical domain values
// =============================================================================
//
// The only path from a broker JSON payload to any value a rule may read.
// Required fields are extracted fail-loud (a missing field is a MappingError,
// never a default), symbols must resolve through the tick registry, prices
// must align to the tick grid, and P&L signs must agree with directional
// price movement. Validation failures are raised as typed `RiskError`s; the
// event router turns them into `ingest` audit rows and drops the event.
// =============================================================================

use std::sync::Arc;

use chrono::{DateTime, Utc};
use rust_decimal::prelude::Signed;
use rust_decimal::Decimal;
use serde_json::Value;

use crate::domain::{Money, Order, OrderSide, OrderType, Position, Quote, Side};
use crate::errors::RiskError;
use crate::ticks::TickRegistry;

/// Contract-id prefixes the broker uses, longest first so `CON.F.US.` wins
/// over `F.US.`.
const CONTRACT_PREFIXES: &[&str] = &["CON.F.US.", "F.US."];

/// Stateless converter from raw payloads to canonical values.
#[derive(Clone)]
pub struct SdkAdapter {
    registry: Arc<TickRegistry>,
}

impl SdkAdapter {
    pub fn new(registry: Arc<TickRegistry>) -> Self {
        Self { registry }
    }

    pub fn registry(&self) -> &TickRegistry {
        &self.registry
    }

    // -------------------------------------------------------------------------
    // Symbol normalization
    // -------------------------------------------------------------------------

    /// Normalize a contract id or feed symbol to its symbol root.
    ///
    /// `CON.F.US.ENQ.Z25` -> strip prefix -> `ENQ.Z25` -> strip expiry ->
    /// `ENQ` -> alias -> `NQ`. The result must be present in the tick
    /// registry; anything else is a hard error.
    pub fn normalize_symbol(&self, raw: &str) -> Result<String, RiskError> {
        let trimmed = raw.trim();
        if trimmed.is_empty() {
            return Err(RiskError::mapping("empty symbol"));
        }

        let mut rest = trimmed;
        for prefix in CONTRACT_PREFIXES {
            if let Some(stripped) = rest.strip_prefix(prefix) {
                rest = stripped;
                break;
            }
        }

        // Anything after the first dot is the expiry (e.g. `.Z25`).
        let root = rest.split('.').next().unwrap_or("").to_uppercase();
        if root.is_empty() {
            return Err(RiskError::mapping(format!("symbol '{raw}' has no root")));
        }

        let resolved = self.registry.resolve_alias(&root).to_string();
        if !self.registry.contains(&resolved) {
            return Err(RiskError::Units {
                symbol: resolved,
                known: self.registry.known_roots().join(", "),
            });
        }
        Ok(resolved)
    }

    // -------------------------------------------------------------------------
    // Position normalization
    // -------------------------------------------------------------------------

    /// Build a canonical `Position` from a raw broker position payload,
    /// computing unrealized P&L when a mark price is known.
    pub fn normalize_position(
        &self,
        raw: &Value,
        mark_price: Option<Decimal>,
    ) -> Result<Position, RiskError> {
        let contract_id = str_field(raw, "contractId")?;
        let entry_price = decimal_field(raw, "averagePrice")?;
        let size = i64_field(raw, "size")?;
        let side = Side::from_broker_type(i64_field(raw, "type")?)?;

        if size <= 0 {
            return Err(RiskError::quantity(format!(
                "position size must be strictly positive, got {size} for {contract_id}"
            )));
        }

        let symbol_root = self.normalize_symbol(&contract_id)?;
        let ticks = self.registry.get(&symbol_root)?;

        if entry_price % ticks.tick_size != Decimal::ZERO {
            return Err(RiskError::price(format!(
                "entry price {entry_price} for {symbol_root} is not a multiple of tick size {}",
                ticks.tick_size
            )));
        }

        let created_at = raw
            .get("creationTimestamp")
            .and_then(Value::as_str)
            .and_then(|s| DateTime::parse_from_rfc3339(s).ok())
            .map(|dt| dt.with_timezone(&Utc))
            .unwrap_or_else(Utc::now);

        let mut position = Position {
            contract_id,
            symbol_root,
            side,
            quantity: size,
            entry_price,
            unrealized_pnl: None,
            created_at,
        };
        if let Some(mark) = mark_price {
            position.unrealized_pnl = Some(position.unrealized_at(mark, &ticks));
        }
        Ok(position)
    }

    /// Extract the realized P&L from a POSITION_CLOSED payload and verify the
    /// sign convention against the exit price when one is known:
    /// `sign(pnl) == sign(exit - entry) x sign(side)`.
    pub fn realized_pnl_on_close(
        &self,
        raw: &Value,
        entry_price: Decimal,
        side: Side,
        exit_price: Option<Decimal>,
    ) -> Result<Money, RiskError> {
        let pnl = Money::new(decimal_field(raw, "profitAndLoss")?);

        if let Some(exit) = exit_price {
            let expected = (exit - entry_price).signum() * side.sign();
            if pnl.signum() != Decimal::ZERO
                && expected != Decimal::ZERO
                && pnl.signum() != expected
            {
                return Err(RiskError::sign(format!(
                    "realized pnl {pnl} contradicts {side} move {entry_price} -> {exit}"
                )));
            }
        }
        Ok(pnl)
    }

    // -------------------------------------------------------------------------
    // Order normalization
    // -------------------------------------------------------------------------

    /// Build a canonical `Order` from a raw broker order payload.
    pub fn normalize_order(&self, raw: &Value) -> Result<Order, RiskError> {
        let order_id = id_field(raw, "id")?;
        let contract_id = str_field(raw, "contractId")?;
        let order_type = OrderType::from_broker_type(i64_field(raw, "type")?);
        let side = OrderSide::from_broker_side(i64_field(raw, "side")?)?;
        let size = i64_field(raw, "size")?;

        if size <= 0 {
            return Err(RiskError::quantity(format!(
                "order size must be strictly positive, got {size} for order {order_id}"
            )));
        }

        Ok(Order {
            order_id,
            contract_id,
            order_type,
            side,
            size,
            stop_price: opt_decimal_field(raw, "stopPrice")?,
            limit_price: opt_decimal_field(raw, "limitPrice")?,
            status: raw.get("status").and_then(Value::as_i64).unwrap_or(0),
        })
    }

    // -------------------------------------------------------------------------
    // Quote normalization
    // -------------------------------------------------------------------------

    /// Build a canonical `Quote`. The symbol is kept as delivered (with its
    /// `F.US.` prefix); root resolution happens when the mark cache is
    /// consulted.
    pub fn normalize_quote(&self, raw: &Value) -> Result<Quote, RiskError> {
        let symbol = str_field(raw, "symbol")?;
        // The root must be resolvable even though the quote keeps the full
        // feed symbol, so unknown instruments fail here and not mid-rule.
        self.normalize_symbol(&symbol)?;

        let timestamp = raw
            .get("timestamp")
            .and_then(Value::as_str)
            .and_then(|s| DateTime::parse_from_rfc3339(s).ok())
            .map(|dt| dt.with_timezone(&Utc))
            .unwrap_or_else(Utc::now);

        Ok(Quote {
            symbol,
            bid: decimal_field(raw, "bid")?,
            ask: decimal_field(raw, "ask")?,
            last_price: decimal_field(raw, "last_price")?,
            timestamp,
        })
    }
}

// ---------------------------------------------------------------------------
// Field extraction — fail-loud, no defaults
// ---------------------------------------------------------------------------

fn str_field(raw: &Value, key: &str) -> Result<String, RiskError> {
    raw.get(key)
        .and_then(Value::as_str)
        .map(str::to_string)
        .filter(|s| !s.is_empty())
        .ok_or_else(|| RiskError::mapping(format!("missing or empty field '{key}'")))
}

/// Ids may arrive as strings or integers depending on the payload kind.
fn id_field(raw: &Value, key: &str) -> Result<String, RiskError> {
    match raw.get(key) {
        Some(Value::String(s)) if !s.is_empty() => Ok(s.clone()),
        Some(Value::Number(n)) => Ok(n.to_string()),
        _ => Err(RiskError::mapping(format!("missing or empty field '{key}'"))),
    }
}

fn i64_field(raw: &Value, key: &str) -> Result<i64, RiskError> {
    raw.get(key)
        .and_then(Value::as_i64)
        .ok_or_else(|| RiskError::mapping(format!("missing or non-integer field '{key}'")))
}

fn decimal_field(raw: &Value, key: &str) -> Result<Decimal, RiskError> {
    let value = raw
        .get(key)
        .ok_or_else(|| RiskError::mapping(format!("missing field '{key}'")))?;
    decimal_from_value(value)
        .ok_or_else(|| RiskError::mapping(format!("field '{key}' is not a decimal: {value}")))
}

fn opt_decimal_field(raw: &Value, key: &str) -> Result<Option<Decimal>, RiskError> {
    match raw.get(key) {
        None | Some(Value::Null) => Ok(None),
        Some(value) => decimal_from_value(value)
            .map(Some)
            .ok_or_else(|| RiskError::mapping(format!("field '{key}' is not a decimal: {value}"))),
    }
}

fn decimal_from_value(value: &Value) -> Option<Decimal> {
    match value {
        Value::Number(n) => {
            if let Some(i) = n.as_i64() {
                Some(Decimal::from(i))
            } else {
                n.as_f64().and_then(|f| Decimal::try_from(f).ok())
            }
        }
        Value::String(s) => s.parse().ok(),
        _ => None,
    }
}
