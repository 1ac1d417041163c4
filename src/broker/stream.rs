// =============================================================================
// Broker feed bridge — WebSocket ingress to the event router
// =============================================================================
//
// Decodes broker JSON frames into raw SDK payloads and forwards them to the
// router queue. Runs one connection at a time; the caller loop reconnects
// after a 5-second sleep. Connection transitions are surfaced as synthetic
// Connected / Disconnected payloads so the auth guard can react.
//
// Frame shape: `{"kind": "<event kind>", "data": { ... }}`.
// =============================================================================

use anyhow::{Context, Result};
use futures_util::StreamExt;
use tokio::sync::mpsc;
use tokio_tungstenite::connect_async;
use tracing::{error, info, warn};

use crate::broker::RawSdkEvent;

/// Delay before reconnecting a dropped feed.
const RECONNECT_DELAY: std::time::Duration = std::time::Duration::from_secs(5);

/// Connect once and pump frames until the stream ends or errors.
pub async fn run_feed(url: &str, tx: &mpsc::UnboundedSender<RawSdkEvent>) -> Result<()> {
    info!(url = %url, "connecting to broker feed");
    let (ws_stream, _response) =
        connect_async(url).await.context("failed to connect to broker feed")?;

    info!("broker feed connected");
    let _ = tx.send(RawSdkEvent::Connected(serde_json::json!({})));

    let (_write, mut read) = ws_stream.split();
    loop {
        match read.next().await {
            Some(Ok(message)) => {
                if let tokio_tungstenite::tungstenite::Message::Text(text) = message {
                    match parse_frame(&text) {
                        Ok(event) => {
                            if tx.send(event).is_err() {
                                warn!("router queue closed; feed stopping");
                                return Ok(());
                            }
                        }
                        Err(e) => {
                            warn!(error = %e, "unparseable feed frame skipped");
                        }
                    }
                }
            }
            Some(Err(e)) => {
                error!(error = %e, "broker feed read error");
                return Err(e.into());
            }
            None => {
                warn!("broker feed stream ended");
                return Ok(());
            }
        }
    }
}

/// Reconnect loop: run the feed, emit Disconnected on each drop, sleep, and
/// try again. Runs until the router queue closes.
pub async fn run_feed_forever(url: String, tx: mpsc::UnboundedSender<RawSdkEvent>) {
    loop {
        let result = run_feed(&url, &tx).await;
        if tx
            .send(RawSdkEvent::Disconnected(serde_json::json!({
                "reason": match &result {
                    Ok(()) => "stream ended".to_string(),
                    Err(e) => e.to_string(),
                }
            })))
            .is_err()
        {
            return;
        }
        if let Err(e) = result {
            error!(error = %e, "broker feed error — reconnecting in 5s");
        }
        tokio::time::sleep(RECONNECT_DELAY).await;
    }
}

/// Parse one feed frame into a raw SDK payload.
fn parse_frame(text: &str) -> Result<RawSdkEvent> {
    let frame: serde_json::Value =
        serde_json::from_str(text).context("failed to parse feed frame JSON")?;
    let kind = frame
        .get("kind")
        .and_then(serde_json::Value::as_str)
        .context("frame missing 'kind'")?;
    let data = frame.get("data").cloned().context("frame missing 'data'")?;

    let event = match kind {
        "order_filled" => RawSdkEvent::OrderFilled(data),
        "order_placed" => RawSdkEvent::OrderPlaced(data),
        "order_cancelled" => RawSdkEvent::OrderCancelled(data),
        "position_opened" => RawSdkEvent::PositionOpened(data),
        "position_updated" => RawSdkEvent::PositionUpdated(data),
        "position_closed" => RawSdkEvent::PositionClosed(data),
        "quote" => RawSdkEvent::Quote(data),
        "auth_state" => RawSdkEvent::AuthState(data),
        other => anyhow::bail!("unknown frame kind '{other}'"),
    };
    Ok(event)
}
