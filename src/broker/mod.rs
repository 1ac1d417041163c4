// =============================================================================
// Broker port — the narrow seam between the daemon and the broker SDK
// =============================================================================
//
// Inbound raw events arrive over the WebSocket feed (stream.rs); outbound
// enforcement commands go through `BrokerPort`, implemented by the signed
// REST client (client.rs) in production and by in-memory fakes in tests.
// =============================================================================

pub mod client;
pub mod stream;

use async_trait::async_trait;
use serde_json::Value;

use crate::rules::StopOrderUpdate;

/// Raw inbound SDK payload, exactly as decoded from the feed. The event
/// router owns all normalization; nothing downstream sees these.
#[derive(Debug, Clone)]
pub enum RawSdkEvent {
    OrderFilled(Value),
    OrderPlaced(Value),
    OrderCancelled(Value),
    PositionOpened(Value),
    PositionUpdated(Value),
    PositionClosed(Value),
    Quote(Value),
    /// Authorization state change: `{canTrade, reason?}`.
    AuthState(Value),
    Connected(Value),
    Disconnected(Value),
}

impl RawSdkEvent {
    /// Stable kind tag used for dedup hashing and logs.
    pub fn kind(&self) -> &'static str {
        match self {
            Self::OrderFilled(_) => "order_filled",
            Self::OrderPlaced(_) => "order_placed",
            Self::OrderCancelled(_) => "order_cancelled",
            Self::PositionOpened(_) => "position_opened",
            Self::PositionUpdated(_) => "position_updated",
            Self::PositionClosed(_) => "position_closed",
            Self::Quote(_) => "quote",
            Self::AuthState(_) => "auth_state",
            Self::Connected(_) => "connected",
            Self::Disconnected(_) => "disconnected",
        }
    }
}

/// Broker acknowledgement of an outbound command.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BrokerAck {
    /// The command was applied.
    Done,
    /// Nothing to do: the position was already flat / the order already gone.
    AlreadyFlat,
}

/// A failed broker command. The executor decides whether to retry.
#[derive(Debug, Clone)]
pub struct BrokerError {
    pub message: String,
}

impl BrokerError {
    pub fn new(message: impl Into<String>) -> Self {
        Self { message: message.into() }
    }
}

impl std::fmt::Display for BrokerError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.message)
    }
}

impl std::error::Error for BrokerError {}

/// Outbound command surface. Idempotency is the caller's responsibility;
/// implementations report `AlreadyFlat` instead of erroring on repeats where
/// the broker allows it.
#[async_trait]
pub trait BrokerPort: Send + Sync {
    async fn close_position(&self, contract_id: &str) -> Result<BrokerAck, BrokerError>;

    async fn close_all_positions(&self, account_id: &str) -> Result<BrokerAck, BrokerError>;

    async fn cancel_order(&self, order_id: &str) -> Result<BrokerAck, BrokerError>;

    async fn modify_order(
        &self,
        order_id: &str,
        updates: &StopOrderUpdate,
    ) -> Result<BrokerAck, BrokerError>;
}
