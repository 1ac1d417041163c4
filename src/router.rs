// =============================================================================
// Event Router — bridges the raw SDK feed to the risk engine
// =============================================================================
//
// For each raw payload: deduplicate (the broker emits 2-3 copies of fill and
// position events), normalize through the adapter, keep the market books
// current, and publish a canonical RiskEvent to the engine. Adapter failures
// become `ingest` audit rows and the event is dropped — corrupted data never
// reaches a rule.
//
// Quotes are special: they update the per-root mark cache and each tracked
// position's unrealized P&L, and only when the account total moves by at
// least $10 since the last emit does the router synthesize an
// UNREALIZED_PNL_UPDATE (throttling rule re-evaluation). When several quotes
// for one symbol are queued, only the newest is processed.
// =============================================================================

use std::collections::hash_map::DefaultHasher;
use std::collections::HashMap;
use std::hash::{Hash, Hasher};
use std::sync::Arc;
use std::time::{Duration, Instant};

use rust_decimal::Decimal;
use rust_decimal_macros::dec;
use serde_json::Value;
use tokio::sync::mpsc;
use tracing::{debug, info, warn};

use crate::adapter::SdkAdapter;
use crate::app_state::MarketBooks;
use crate::broker::RawSdkEvent;
use crate::domain::{EventType, Money, RiskEvent};
use crate::engine::EngineMsg;
use crate::errors::RiskError;
use crate::persistence::Store;

/// Duplicate suppression window.
const DEDUP_WINDOW: Duration = Duration::from_secs(2);
/// Minimum move in account-total unrealized P&L before an
/// UNREALIZED_PNL_UPDATE is synthesized.
const UNREALIZED_EMIT_THRESHOLD: Decimal = dec!(10);

pub struct EventRouter {
    account_id: String,
    adapter: SdkAdapter,
    books: Arc<MarketBooks>,
    store: Arc<Store>,
    engine_tx: mpsc::UnboundedSender<EngineMsg>,
    /// Dedup hashes -> first-seen instant.
    seen: HashMap<u64, Instant>,
    /// Account-total unrealized P&L at the last synthesized emit.
    last_emitted_unrealized: Option<Money>,
}

impl EventRouter {
    pub fn new(
        account_id: String,
        adapter: SdkAdapter,
        books: Arc<MarketBooks>,
        store: Arc<Store>,
        engine_tx: mpsc::UnboundedSender<EngineMsg>,
    ) -> Self {
        Self {
            account_id,
            adapter,
            books,
            store,
            engine_tx,
            seen: HashMap::new(),
            last_emitted_unrealized: None,
        }
    }

    /// Router queue loop. Drains bursts so queued quotes for the same symbol
    /// coalesce to the newest before processing.
    pub async fn run(mut self, mut rx: mpsc::UnboundedReceiver<RawSdkEvent>) {
        info!(account = %self.account_id, "event router running");
        while let Some(first) = rx.recv().await {
            let mut batch = vec![first];
            while let Ok(next) = rx.try_recv() {
                batch.push(next);
            }
            for raw in coalesce_quotes(batch) {
                self.handle(raw);
            }
        }
        info!("raw event stream closed; router stopping");
    }

    /// Process one raw payload. Public so tests can drive the router
    /// synchronously.
    pub fn handle(&mut self, raw: RawSdkEvent) {
        if self.is_duplicate(&raw) {
            debug!(kind = raw.kind(), "duplicate payload suppressed");
            return;
        }

        let result = match raw {
            RawSdkEvent::OrderFilled(v) => self.on_order(v, EventType::OrderFilled),
            RawSdkEvent::OrderPlaced(v) => self.on_order(v, EventType::OrderPlaced),
            RawSdkEvent::OrderCancelled(v) => self.on_order(v, EventType::OrderCancelled),
            RawSdkEvent::PositionOpened(v) => self.on_position(v, EventType::PositionOpened),
            RawSdkEvent::PositionUpdated(v) => self.on_position(v, EventType::PositionUpdated),
            RawSdkEvent::PositionClosed(v) => self.on_position_closed(v),
            RawSdkEvent::Quote(v) => self.on_quote(v),
            RawSdkEvent::AuthState(v) => self.on_auth_state(v),
            RawSdkEvent::Connected(v) => {
                self.publish(RiskEvent::new(EventType::SdkConnected, &self.account_id).with_raw(v));
                Ok(())
            }
            RawSdkEvent::Disconnected(v) => {
                self.publish(
                    RiskEvent::new(EventType::SdkDisconnected, &self.account_id).with_raw(v),
                );
                Ok(())
            }
        };

        if let Err(e) = result {
            self.drop_event(e);
        }
    }

    // -------------------------------------------------------------------------
    // Per-kind handlers
    // -------------------------------------------------------------------------

    fn on_order(&mut self, raw: Value, event_type: EventType) -> Result<(), RiskError> {
        let order = self.adapter.normalize_order(&raw)?;

        // Track stop orders for the grace rule and trade management.
        match event_type {
            EventType::OrderPlaced if order.order_type.is_stop() => {
                self.books.stop_orders.write().insert(order.contract_id.clone(), order.clone());
            }
            EventType::OrderCancelled | EventType::OrderFilled => {
                let mut stops = self.books.stop_orders.write();
                if stops.get(&order.contract_id).map(|o| o.order_id == order.order_id)
                    == Some(true)
                {
                    stops.remove(&order.contract_id);
                }
            }
            _ => {}
        }

        self.publish(
            RiskEvent::new(event_type, &self.account_id).with_order(order).with_raw(raw),
        );
        Ok(())
    }

    fn on_position(&mut self, raw: Value, event_type: EventType) -> Result<(), RiskError> {
        let mark = self.mark_for_raw(&raw);
        let position = self.adapter.normalize_position(&raw, mark)?;
        self.books
            .positions
            .write()
            .insert(position.contract_id.clone(), position.clone());

        self.publish(
            RiskEvent::new(event_type, &self.account_id).with_position(position).with_raw(raw),
        );
        Ok(())
    }

    fn on_position_closed(&mut self, raw: Value) -> Result<(), RiskError> {
        let contract_id = raw
            .get("contractId")
            .and_then(Value::as_str)
            .ok_or_else(|| RiskError::mapping("missing field 'contractId'"))?
            .to_string();

        let previous = self.books.positions.write().remove(&contract_id);
        self.books.stop_orders.write().remove(&contract_id);

        let mut event = RiskEvent::new(EventType::PositionClosed, &self.account_id);
        if let Some(prev) = previous {
            // Verify the realized P&L sign against the last known mark.
            let exit = self.books.marks.read().get(&prev.symbol_root).copied();
            let realized =
                self.adapter.realized_pnl_on_close(&raw, prev.entry_price, prev.side, exit)?;
            event = event.with_position(prev).with_realized_pnl(realized);
        } else {
            // Close for an untracked position (e.g. first event after a
            // restart): the realized amount is still required.
            let realized = Money::new(
                raw.get("profitAndLoss")
                    .and_then(Value::as_f64)
                    .and_then(|f| Decimal::try_from(f).ok())
                    .or_else(|| {
                        raw.get("profitAndLoss")
                            .and_then(Value::as_str)
                            .and_then(|s| s.parse().ok())
                    })
                    .ok_or_else(|| RiskError::mapping("missing field 'profitAndLoss'"))?,
            );
            event = event.with_realized_pnl(realized);
        }

        self.publish(event.with_raw(raw));
        Ok(())
    }

    fn on_quote(&mut self, raw: Value) -> Result<(), RiskError> {
        let quote = self.adapter.normalize_quote(&raw)?;
        let Some(reference) = quote.reference_price() else {
            // A quote with neither last price nor a two-sided book carries
            // no mark information.
            return Ok(());
        };
        let root = self.adapter.normalize_symbol(&quote.symbol)?;
        self.books.marks.write().insert(root.clone(), reference);

        // Recompute unrealized P&L for tracked positions in this root.
        let ticks = self.adapter.registry().get(&root)?;
        {
            let mut positions = self.books.positions.write();
            for position in positions.values_mut().filter(|p| p.symbol_root == root) {
                position.unrealized_pnl = Some(position.unrealized_at(reference, &ticks));
            }
        }

        // Emit only when the account total moved enough to matter.
        let total = self.books.total_unrealized();
        let moved = match self.last_emitted_unrealized {
            Some(last) => (total - last).abs().amount() >= UNREALIZED_EMIT_THRESHOLD,
            None => !self.books.positions.read().is_empty(),
        };
        if moved {
            self.last_emitted_unrealized = Some(total);
            self.publish(
                RiskEvent::new(EventType::UnrealizedPnlUpdate, &self.account_id).with_raw(
                    serde_json::json!({
                        "total_unrealized": total.amount().to_string(),
                        "symbol": root,
                    }),
                ),
            );
        }
        Ok(())
    }

    fn on_auth_state(&mut self, raw: Value) -> Result<(), RiskError> {
        let can_trade = raw
            .get("canTrade")
            .and_then(Value::as_bool)
            .ok_or_else(|| RiskError::mapping("missing field 'canTrade'"))?;
        let event_type =
            if can_trade { EventType::SdkConnected } else { EventType::AuthFailed };
        self.publish(RiskEvent::new(event_type, &self.account_id).with_raw(raw));
        Ok(())
    }

    // -------------------------------------------------------------------------
    // Dedup
    // -------------------------------------------------------------------------

    fn is_duplicate(&mut self, raw: &RawSdkEvent) -> bool {
        let payload = match raw {
            RawSdkEvent::OrderFilled(v)
            | RawSdkEvent::OrderPlaced(v)
            | RawSdkEvent::OrderCancelled(v)
            | RawSdkEvent::PositionOpened(v)
            | RawSdkEvent::PositionUpdated(v)
            | RawSdkEvent::PositionClosed(v) => v,
            // Quotes, auth, and connection transitions are not re-emitted by
            // the broker in duplicate bursts.
            _ => return false,
        };

        let now = Instant::now();
        self.seen.retain(|_, first_seen| now.duration_since(*first_seen) < DEDUP_WINDOW);

        let mut hasher = DefaultHasher::new();
        raw.kind().hash(&mut hasher);
        for key in ["contractId", "id", "size"] {
            hash_value(payload.get(key), &mut hasher);
        }
        for key in ["averagePrice", "filledPrice", "stopPrice", "limitPrice"] {
            hash_value(payload.get(key), &mut hasher);
        }
        hash_value(payload.get("creationTimestamp"), &mut hasher);
        let digest = hasher.finish();

        if self.seen.contains_key(&digest) {
            return true;
        }
        self.seen.insert(digest, now);
        false
    }

    // -------------------------------------------------------------------------
    // Output
    // -------------------------------------------------------------------------

    fn publish(&self, event: RiskEvent) {
        debug!(event = %event.event_type, "canonical event published");
        if self.engine_tx.send(EngineMsg::Event(event)).is_err() {
            warn!("engine queue closed; event dropped");
        }
    }

    /// An invalid payload is audited and dropped, never forwarded.
    fn drop_event(&self, error: RiskError) {
        warn!(error = %error, "event dropped at ingest");
        if let Err(e) = self.store.insert_violation(
            &self.account_id,
            "ingest",
            "warning",
            &error.to_string(),
            "event dropped",
            "{}",
        ) {
            warn!(error = %e, "ingest audit row failed");
        }
    }

    fn mark_for_raw(&self, raw: &Value) -> Option<Decimal> {
        let contract_id = raw.get("contractId").and_then(Value::as_str)?;
        let root = self.adapter.normalize_symbol(contract_id).ok()?;
        self.books.marks.read().get(&root).copied()
    }
}

/// Keep only the newest queued quote per symbol; everything else passes
/// through in arrival order.
fn coalesce_quotes(batch: Vec<RawSdkEvent>) -> Vec<RawSdkEvent> {
    let mut newest_quote_index: HashMap<String, usize> = HashMap::new();
    for (index, event) in batch.iter().enumerate() {
        if let RawSdkEvent::Quote(v) = event {
            if let Some(symbol) = v.get("symbol").and_then(Value::as_str) {
                newest_quote_index.insert(symbol.to_string(), index);
            }
        }
    }
    batch
        .into_iter()
        .enumerate()
        .filter(|(index, event)| match event {
            RawSdkEvent::Quote(v) => v
                .get("symbol")
                .and_then(Value::as_str)
                .map(|s| newest_quote_index.get(s) == Some(index))
                .unwrap_or(true),
            _ => true,
        })
        .map(|(_, event)| event)
        .collect()
}

fn hash_value(value: Option<&Value>, hasher: &mut DefaultHasher) {
    match value {
        Some(v) => v.to_string().hash(hasher),
        None => "-".hash(hasher),
    }
}

// =============================================================================
// Tests
// =============================================================================
#[cfg(test)]
mod tests {
    use super::*;
    use crate::engine::EngineMsg;
    use serde_json::json;

    fn router() -> (EventRouter, mpsc::UnboundedReceiver<EngineMsg>, Arc<MarketBooks>, Arc<Store>)
    {
        let registry = Arc::new(crate::rules::testutil::registry());
        let adapter = SdkAdapter::new(registry);
        let books = Arc::new(MarketBooks::new());
        let store = Arc::new(Store::open_in_memory().unwrap());
        let (tx, rx) = mpsc::unbounded_channel();
        let r = EventRouter::new("ACC-1".into(), adapter, books.clone(), store.clone(), tx);
        (r, rx, books, store)
    }

    fn position_payload() -> Value {
        json!({
            "id": 42,
            "accountId": 7,
            "contractId": "CON.F.US.MNQ.Z25",
            "type": 1,
            "size": 2,
            "averagePrice": "21000.00",
            "creationTimestamp": "2025-11-03T14:30:00Z"
        })
    }

    fn quote_payload(bid: f64, ask: f64, last: f64) -> Value {
        json!({
            "symbol": "F.US.MNQ",
            "bid": bid,
            "ask": ask,
            "last_price": last,
            "timestamp": "2025-11-03T14:30:01Z"
        })
    }

    fn expect_event(rx: &mut mpsc::UnboundedReceiver<EngineMsg>) -> RiskEvent {
        match rx.try_recv().expect("expected an engine message") {
            EngineMsg::Event(event) => event,
            other => panic!("unexpected message {other:?}"),
        }
    }

    #[test]
    fn position_opened_is_normalized_and_tracked() {
        let (mut r, mut rx, books, _) = router();
        r.handle(RawSdkEvent::PositionOpened(position_payload()));

        let event = expect_event(&mut rx);
        assert_eq!(event.event_type, EventType::PositionOpened);
        let position = event.position.unwrap();
        assert_eq!(position.symbol_root, "MNQ");
        assert!(books.positions.read().contains_key("CON.F.US.MNQ.Z25"));
    }

    #[test]
    fn duplicates_within_window_produce_one_event() {
        let (mut r, mut rx, _, _) = router();
        r.handle(RawSdkEvent::PositionOpened(position_payload()));
        r.handle(RawSdkEvent::PositionOpened(position_payload()));
        r.handle(RawSdkEvent::PositionOpened(position_payload()));

        expect_event(&mut rx);
        assert!(rx.try_recv().is_err(), "duplicates must be suppressed");
    }

    #[test]
    fn unknown_symbol_is_dropped_with_ingest_audit() {
        // An unknown root raises UnitsError and the event is dropped.
        let (mut r, mut rx, _, store) = router();
        let mut payload = position_payload();
        payload["contractId"] = json!("CON.F.US.XYZ.Z25");
        r.handle(RawSdkEvent::PositionOpened(payload));

        assert!(rx.try_recv().is_err(), "no event may reach the engine");
        let rows = store.recent_violations(5).unwrap();
        assert_eq!(rows.len(), 1);
        assert_eq!(rows[0].rule_id, "ingest");
        assert_eq!(rows[0].severity, "warning");
        assert!(rows[0].message.contains("XYZ"));
    }

    #[test]
    fn quote_updates_marks_and_synthesizes_unrealized_update() {
        let (mut r, mut rx, books, _) = router();
        r.handle(RawSdkEvent::PositionOpened(position_payload()));
        expect_event(&mut rx);

        // Mark 21010: 40 ticks x $0.50 x 2 = $40 unrealized.
        r.handle(RawSdkEvent::Quote(quote_payload(21009.75, 21010.25, 21010.00)));

        let event = expect_event(&mut rx);
        assert_eq!(event.event_type, EventType::UnrealizedPnlUpdate);
        let total: Decimal =
            event.raw_data["total_unrealized"].as_str().unwrap().parse().unwrap();
        assert_eq!(total, rust_decimal_macros::dec!(40));

        let positions = books.positions.read();
        let pos = positions.get("CON.F.US.MNQ.Z25").unwrap();
        assert_eq!(pos.unrealized_pnl.unwrap().amount(), rust_decimal_macros::dec!(40));
    }

    #[test]
    fn small_unrealized_moves_are_throttled() {
        let (mut r, mut rx, _, _) = router();
        r.handle(RawSdkEvent::PositionOpened(position_payload()));
        expect_event(&mut rx);

        r.handle(RawSdkEvent::Quote(quote_payload(0.0, 0.0, 21010.00)));
        expect_event(&mut rx); // first emit

        // +$1 total move: below the $10 threshold.
        r.handle(RawSdkEvent::Quote(quote_payload(0.0, 0.0, 21010.25)));
        assert!(rx.try_recv().is_err(), "sub-threshold move must not emit");

        // Another $10+ move emits again.
        r.handle(RawSdkEvent::Quote(quote_payload(0.0, 0.0, 21020.25)));
        expect_event(&mut rx);
    }

    #[test]
    fn quote_with_zero_last_uses_midpoint() {
        let (mut r, mut rx, books, _) = router();
        r.handle(RawSdkEvent::PositionOpened(position_payload()));
        expect_event(&mut rx);

        r.handle(RawSdkEvent::Quote(quote_payload(21009.75, 21010.25, 0.0)));
        expect_event(&mut rx);
        assert_eq!(*books.marks.read().get("MNQ").unwrap(), rust_decimal_macros::dec!(21010));
    }

    #[test]
    fn position_closed_carries_realized_pnl_and_clears_books() {
        let (mut r, mut rx, books, _) = router();
        r.handle(RawSdkEvent::PositionOpened(position_payload()));
        expect_event(&mut rx);

        let close = json!({
            "id": 42,
            "contractId": "CON.F.US.MNQ.Z25",
            "profitAndLoss": -25.0,
        });
        r.handle(RawSdkEvent::PositionClosed(close));

        let event = expect_event(&mut rx);
        assert_eq!(event.event_type, EventType::PositionClosed);
        assert_eq!(event.realized_pnl.unwrap(), Money::new(rust_decimal_macros::dec!(-25)));
        assert!(books.positions.read().is_empty());
    }

    #[test]
    fn stop_order_lifecycle_is_tracked() {
        let (mut r, mut rx, books, _) = router();
        let stop = json!({
            "id": 9001,
            "contractId": "CON.F.US.MNQ.Z25",
            "type": 4,
            "side": 1,
            "size": 2,
            "stopPrice": "20950.00",
            "status": 1
        });
        r.handle(RawSdkEvent::OrderPlaced(stop.clone()));
        expect_event(&mut rx);
        assert!(books.stop_orders.read().contains_key("CON.F.US.MNQ.Z25"));

        r.handle(RawSdkEvent::OrderCancelled(stop));
        expect_event(&mut rx);
        assert!(books.stop_orders.read().is_empty());
    }

    #[test]
    fn auth_state_maps_to_auth_failed_or_connected() {
        let (mut r, mut rx, _, _) = router();
        r.handle(RawSdkEvent::AuthState(json!({"canTrade": false, "reason": "expired"})));
        assert_eq!(expect_event(&mut rx).event_type, EventType::AuthFailed);

        r.handle(RawSdkEvent::AuthState(json!({"canTrade": true})));
        assert_eq!(expect_event(&mut rx).event_type, EventType::SdkConnected);
    }

    #[test]
    fn coalesce_keeps_only_newest_quote_per_symbol() {
        let batch = vec![
            RawSdkEvent::Quote(quote_payload(0.0, 0.0, 21000.00)),
            RawSdkEvent::PositionOpened(position_payload()),
            RawSdkEvent::Quote(quote_payload(0.0, 0.0, 21005.00)),
            RawSdkEvent::Quote(quote_payload(0.0, 0.0, 21010.00)),
        ];
        let coalesced = coalesce_quotes(batch);
        assert_eq!(coalesced.len(), 2);
        assert!(matches!(coalesced[0], RawSdkEvent::PositionOpened(_)));
        match &coalesced[1] {
            RawSdkEvent::Quote(v) => assert_eq!(v["last_price"], 21010.00),
            other => panic!("expected quote, got {other:?}"),
        }
    }
}
