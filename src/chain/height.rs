//! Chain height tracker.
//!
//! Subscribes to the node's new-block-header events over the Tendermint RPC
//! websocket and forwards each new height into a single-slot channel. When
//! the voting loop is still busy with the previous height, the slot is full
//! and the height is dropped, which is the only backpressure between the
//! two.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use futures_util::{SinkExt, StreamExt};
use serde_json::json;
use tokio::sync::mpsc;
use tokio_tungstenite::{connect_async, tungstenite::Message};
use tokio_util::sync::CancellationToken;

use crate::chain::ChainClientError;
use crate::providers::backoff_delay;

const NEW_BLOCK_HEADER_QUERY: &str = "tm.event='NewBlockHeader'";

/// The tracker is started once per process; transient restarts of the
/// caller must not produce a second subscription.
static STARTED: AtomicBool = AtomicBool::new(false);

/// Start the tracker task. Subsequent calls are no-ops.
pub fn start_height_updater(
    tmrpc_endpoint: &str,
    last_height: i64,
    heights: mpsc::Sender<i64>,
    cancel: CancellationToken,
) -> Result<(), ChainClientError> {
    if STARTED.swap(true, Ordering::SeqCst) {
        return Ok(());
    }
    let ws_url = websocket_endpoint(tmrpc_endpoint)?;
    tokio::spawn(run(ws_url, last_height, Arc::new(heights), cancel));
    Ok(())
}

/// `http://host:26657` -> `ws://host:26657/websocket`.
pub(crate) fn websocket_endpoint(tmrpc_endpoint: &str) -> Result<String, ChainClientError> {
    let trimmed = tmrpc_endpoint.trim_end_matches('/');
    let ws = if let Some(rest) = trimmed.strip_prefix("https://") {
        format!("wss://{rest}")
    } else if let Some(rest) = trimmed.strip_prefix("http://") {
        format!("ws://{rest}")
    } else if trimmed.starts_with("ws://") || trimmed.starts_with("wss://") {
        trimmed.to_string()
    } else {
        return Err(ChainClientError::HeightSubscription(format!(
            "unsupported tmrpc endpoint {tmrpc_endpoint:?}"
        )));
    };
    Ok(format!("{ws}/websocket"))
}

async fn run(
    ws_url: String,
    mut last_height: i64,
    heights: Arc<mpsc::Sender<i64>>,
    cancel: CancellationToken,
) {
    let mut attempt = 0u32;

    'reconnect: loop {
        if cancel.is_cancelled() {
            return;
        }

        let (ws_stream, _) = match connect_async(&ws_url).await {
            Ok(stream) => stream,
            Err(e) => {
                attempt += 1;
                tracing::warn!(error = %e, attempt, "block header subscription connect failed");
                tokio::select! {
                    _ = cancel.cancelled() => return,
                    _ = tokio::time::sleep(backoff_delay(attempt)) => continue 'reconnect,
                }
            }
        };
        attempt = 0;
        let (mut write, mut read) = ws_stream.split();

        let subscribe = json!({
            "jsonrpc": "2.0",
            "method": "subscribe",
            "id": "price-feeder",
            "params": {"query": NEW_BLOCK_HEADER_QUERY},
        })
        .to_string();
        if write.send(Message::Text(subscribe)).await.is_err() {
            continue 'reconnect;
        }
        tracing::info!("subscribed to new block headers");

        loop {
            tokio::select! {
                _ = cancel.cancelled() => {
                    let _ = write.send(Message::Close(None)).await;
                    return;
                }
                msg = read.next() => match msg {
                    Some(Ok(Message::Text(text))) => {
                        if let Some(height) = parse_header_height(&text) {
                            offer_height(&mut last_height, height, &heights);
                        }
                    }
                    Some(Ok(Message::Ping(data))) => {
                        let _ = write.send(Message::Pong(data)).await;
                    }
                    Some(Ok(Message::Close(_))) | None => {
                        tracing::warn!("block header subscription closed");
                        break;
                    }
                    Some(Err(e)) => {
                        tracing::warn!(error = %e, "block header subscription error");
                        break;
                    }
                    _ => {}
                }
            }
        }

        attempt += 1;
        tokio::select! {
            _ = cancel.cancelled() => return,
            _ = tokio::time::sleep(backoff_delay(attempt)) => {}
        }
    }
}

/// Pull the header height out of a subscription event, if the frame is one.
fn parse_header_height(text: &str) -> Option<i64> {
    let value: serde_json::Value = serde_json::from_str(text).ok()?;
    value["result"]["data"]["value"]["header"]["height"]
        .as_str()?
        .parse()
        .ok()
}

/// Monotonic-height gate plus the single-slot enqueue. Heights at or below
/// the last seen one are discarded; a full slot drops the height because
/// the voting loop is still processing the previous block.
fn offer_height(last_height: &mut i64, height: i64, heights: &mpsc::Sender<i64>) -> bool {
    if height <= *last_height {
        return false;
    }
    *last_height = height;
    match heights.try_send(height) {
        Ok(()) => {
            tracing::info!(height, "received new chain height");
            true
        }
        Err(_) => {
            tracing::info!(height, "skipped block height, vote still in progress");
            false
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_websocket_endpoint_conversion() {
        assert_eq!(
            websocket_endpoint("http://localhost:26657").unwrap(),
            "ws://localhost:26657/websocket"
        );
        assert_eq!(
            websocket_endpoint("https://rpc.example.com/").unwrap(),
            "wss://rpc.example.com/websocket"
        );
        assert!(websocket_endpoint("ftp://nope").is_err());
    }

    #[test]
    fn test_parse_header_height() {
        let event = r#"{"jsonrpc":"2.0","id":"price-feeder","result":{"data":{"type":"tendermint/event/NewBlockHeader","value":{"header":{"height":"1274"}}}}}"#;
        assert_eq!(parse_header_height(event), Some(1274));

        let confirmation = r#"{"jsonrpc":"2.0","id":"price-feeder","result":{}}"#;
        assert_eq!(parse_header_height(confirmation), None);
    }

    #[test]
    fn test_offer_height_discards_non_monotonic() {
        let (tx, mut rx) = mpsc::channel(1);
        let mut last = 10;

        assert!(!offer_height(&mut last, 10, &tx));
        assert!(!offer_height(&mut last, 9, &tx));
        assert!(offer_height(&mut last, 11, &tx));
        assert_eq!(rx.try_recv().unwrap(), 11);
    }

    #[test]
    fn test_offer_height_drops_when_slot_full() {
        let (tx, mut rx) = mpsc::channel(1);
        let mut last = 0;

        assert!(offer_height(&mut last, 1, &tx));
        // the slot is full: the height is dropped, not queued
        assert!(!offer_height(&mut last, 2, &tx));
        assert_eq!(rx.try_recv().unwrap(), 1);
        assert!(rx.try_recv().is_err());

        // but the gate still advanced, so a replay of 2 is discarded
        assert!(!offer_height(&mut last, 2, &tx));
        assert!(offer_height(&mut last, 3, &tx));
    }
}
