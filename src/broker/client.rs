// =============================================================================
// Broker REST client — HMAC-SHA256 signed enforcement commands
// =============================================================================
//
// SECURITY: the secret key is never logged or serialized. Every request
// carries the API key header, a millisecond timestamp, and a recvWindow of
// 5 000 ms to tolerate minor clock drift against the broker gateway.
// =============================================================================

use std::time::{SystemTime, UNIX_EPOCH};

use async_trait::async_trait;
use hmac::{Hmac, Mac};
use sha2::Sha256;
use tracing::{debug, warn};

use crate::broker::{BrokerAck, BrokerError, BrokerPort};
use crate::rules::StopOrderUpdate;

type HmacSha256 = Hmac<Sha256>;

/// Default recv-window sent with every signed request (milliseconds).
const RECV_WINDOW: u64 = 5000;

/// REST implementation of the outbound broker port.
#[derive(Clone)]
pub struct RestBrokerClient {
    api_key: String,
    secret: String,
    base_url: String,
    client: reqwest::Client,
}

impl RestBrokerClient {
    /// Create a client against `base_url` (no trailing slash).
    pub fn new(
        api_key: impl Into<String>,
        secret: impl Into<String>,
        base_url: impl Into<String>,
    ) -> Result<Self, BrokerError> {
        let api_key = api_key.into();

        let mut default_headers = reqwest::header::HeaderMap::new();
        if let Ok(value) = reqwest::header::HeaderValue::from_str(&api_key) {
            default_headers.insert("X-API-KEY", value);
        }

        let client = reqwest::Client::builder()
            .default_headers(default_headers)
            .timeout(std::time::Duration::from_secs(10))
            .build()
            .map_err(|e| BrokerError::new(format!("failed to build http client: {e}")))?;

        Ok(Self { api_key, secret: secret.into(), base_url: base_url.into(), client })
    }

    // -------------------------------------------------------------------------
    // Signing helpers
    // -------------------------------------------------------------------------

    /// HMAC-SHA256 hex signature of `payload`.
    fn sign(&self, payload: &str) -> Result<String, BrokerError> {
        let mut mac = HmacSha256::new_from_slice(self.secret.as_bytes())
            .map_err(|e| BrokerError::new(format!("hmac init failed: {e}")))?;
        mac.update(payload.as_bytes());
        Ok(hex::encode(mac.finalize().into_bytes()))
    }

    fn timestamp_ms() -> u64 {
        SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .map(|d| d.as_millis() as u64)
            .unwrap_or(0)
    }

    /// Issue one signed POST and interpret the broker's response.
    async fn signed_post(
        &self,
        path: &str,
        body: serde_json::Value,
    ) -> Result<BrokerAck, BrokerError> {
        let ts = Self::timestamp_ms();
        let mut body = body;
        if let Some(map) = body.as_object_mut() {
            map.insert("timestamp".into(), serde_json::json!(ts));
            map.insert("recvWindow".into(), serde_json::json!(RECV_WINDOW));
        }
        let raw_body = body.to_string();
        let signature = self.sign(&raw_body)?;
        let url = format!("{}{}", self.base_url, path);

        debug!(path, "broker command dispatched");
        let response = self
            .client
            .post(&url)
            .header("X-SIGNATURE", signature)
            .header("content-type", "application/json")
            .body(raw_body)
            .send()
            .await
            .map_err(|e| BrokerError::new(format!("POST {path} failed: {e}")))?;

        let status = response.status();
        let payload: serde_json::Value = response
            .json()
            .await
            .unwrap_or_else(|_| serde_json::json!({}));

        if !status.is_success() {
            warn!(path, status = %status, "broker command rejected");
            return Err(BrokerError::new(format!(
                "POST {path} returned {status}: {payload}"
            )));
        }

        // The gateway reports repeats of already-applied commands as
        // "already_flat" / "not_found" rather than errors.
        match payload.get("status").and_then(serde_json::Value::as_str) {
            Some("already_flat") | Some("not_found") => Ok(BrokerAck::AlreadyFlat),
            _ => Ok(BrokerAck::Done),
        }
    }
}

#[async_trait]
impl BrokerPort for RestBrokerClient {
    async fn close_position(&self, contract_id: &str) -> Result<BrokerAck, BrokerError> {
        self.signed_post(
            "/api/v1/positions/close",
            serde_json::json!({ "contractId": contract_id }),
        )
        .await
    }

    async fn close_all_positions(&self, account_id: &str) -> Result<BrokerAck, BrokerError> {
        self.signed_post(
            "/api/v1/positions/close-all",
            serde_json::json!({ "accountId": account_id }),
        )
        .await
    }

    async fn cancel_order(&self, order_id: &str) -> Result<BrokerAck, BrokerError> {
        self.signed_post("/api/v1/orders/cancel", serde_json::json!({ "orderId": order_id }))
            .await
    }

    async fn modify_order(
        &self,
        order_id: &str,
        updates: &StopOrderUpdate,
    ) -> Result<BrokerAck, BrokerError> {
        self.signed_post(
            "/api/v1/orders/modify",
            serde_json::json!({
                "orderId": order_id,
                "stopPrice": updates.stop_price.to_string(),
            }),
        )
        .await
    }
}

impl std::fmt::Debug for RestBrokerClient {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RestBrokerClient")
            .field("base_url", &self.base_url)
            .field("api_key", &format!("{}...", &self.api_key.chars().take(4).collect::<String>()))
            .finish()
    }
}

// =============================================================================
// Tests
// =============================================================================
#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn signature_is_deterministic_hex() {
        let client =
            RestBrokerClient::new("key", "secret", "https://gateway.example").unwrap();
        let a = client.sign(r#"{"contractId":"C-1"}"#).unwrap();
        let b = client.sign(r#"{"contractId":"C-1"}"#).unwrap();
        assert_eq!(a, b);
        assert_eq!(a.len(), 64);
        assert!(a.chars().all(|c| c.is_ascii_hexdigit()));
    }

    #[test]
    fn different_payloads_sign_differently() {
        let client =
            RestBrokerClient::new("key", "secret", "https://gateway.example").unwrap();
        let a = client.sign("payload-a").unwrap();
        let b = client.sign("payload-b").unwrap();
        assert_ne!(a, b);
    }

    #[test]
    fn debug_does_not_leak_the_secret() {
        let client = RestBrokerClient::new("key-1234", "super-secret-value", "https://x").unwrap();
        let debug = format!("{client:?}");
        assert!(!debug.contains("super-secret-value"));
    }
}
