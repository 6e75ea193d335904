use std::sync::Arc;
use std::time::Duration;

use futures_util::{SinkExt, StreamExt};
use tokio::sync::{watch, Notify};
use tokio::time::sleep;
use tokio_tungstenite::{connect_async, tungstenite::Message};

use super::ledger_reader::parse_quantity;

const BASE_RECONNECT_DELAY: Duration = Duration::from_secs(2);
const MAX_RECONNECT_DELAY: Duration = Duration::from_secs(60);

/// Subscribe to `newHeads` over WebSocket and wake the pipeline driver on
/// every new head. Only a wake-up: block contents are always read through the
/// polling path. Reconnects with exponential backoff until `stop` flips.
pub async fn run_head_listener(ws_url: String, wake: Arc<Notify>, mut stop: watch::Receiver<bool>) {
    let mut attempt: u32 = 0;

    while !*stop.borrow() {
        tracing::info!(url = %ws_url, "Head listener connecting...");

        match connect_async(&ws_url).await {
            Ok((ws_stream, _response)) => {
                tracing::info!("Head listener connected");
                attempt = 0;

                let (mut write, mut read) = ws_stream.split();

                let subscribe_msg = serde_json::json!({
                    "jsonrpc": "2.0",
                    "id": 1,
                    "method": "eth_subscribe",
                    "params": ["newHeads"]
                });

                if let Err(e) = write
                    .send(Message::Text(subscribe_msg.to_string().into()))
                    .await
                {
                    tracing::error!(error = %e, "Failed to send eth_subscribe");
                } else {
                    loop {
                        tokio::select! {
                            msg = read.next() => {
                                match msg {
                                    Some(Ok(Message::Text(text))) => {
                                        if let Some(number) = parse_new_head(text.as_ref()) {
                                            tracing::debug!(block = number, "New head");
                                            wake.notify_one();
                                        }
                                    }
                                    Some(Ok(Message::Ping(data))) => {
                                        if let Err(e) = write.send(Message::Pong(data)).await {
                                            tracing::warn!(error = %e, "Failed to send pong");
                                            break;
                                        }
                                    }
                                    Some(Ok(Message::Close(_))) => {
                                        tracing::warn!("Head listener: server sent close frame");
                                        break;
                                    }
                                    Some(Ok(_)) => {}
                                    Some(Err(e)) => {
                                        tracing::error!(error = %e, "Head listener: WS read error");
                                        break;
                                    }
                                    None => {
                                        tracing::warn!("Head listener: WS stream ended");
                                        break;
                                    }
                                }
                            }
                            _ = stop.changed() => {
                                tracing::info!("Head listener stopping");
                                return;
                            }
                        }
                    }
                }
            }
            Err(e) => {
                tracing::error!(error = %e, "Head listener: connection failed");
            }
        }

        // Exponential backoff
        let delay = BASE_RECONNECT_DELAY * 2u32.saturating_pow(attempt);
        let delay = delay.min(MAX_RECONNECT_DELAY);
        attempt = attempt.saturating_add(1);
        tracing::info!(delay_secs = delay.as_secs(), attempt, "Head listener reconnecting...");

        tokio::select! {
            _ = sleep(delay) => {}
            _ = stop.changed() => return,
        }
    }
}

/// Block number from an `eth_subscription` newHeads notification.
/// Subscription confirmations and anything else yield `None`.
pub fn parse_new_head(text: &str) -> Option<u64> {
    let msg: serde_json::Value = serde_json::from_str(text).ok()?;

    if msg.get("id").is_some() && msg.get("result").is_some() {
        tracing::debug!(result = %msg["result"], "Head listener: subscription confirmed");
        return None;
    }

    let number = msg.get("params")?.get("result")?.get("number")?.as_str()?;
    parse_quantity(number)
}
