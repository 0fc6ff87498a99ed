//! Gate.io websocket worker.
//!
//! Gate spells pairs `ATOM_USDT` and tags candle rows with the interval
//! (`1m_ATOM_USDT`); both are translated at the socket boundary.

use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use chrono::Utc;
use futures_util::{SinkExt, StreamExt};
use serde_json::json;
use tokio::sync::mpsc;
use tokio_tungstenite::{connect_async, tungstenite::Message};
use tokio_util::sync::CancellationToken;

use crate::config::{ProviderEndpoint, PROVIDER_GATE};
use crate::providers::{
    backoff_delay, decimal_from_value, rest_client, PriceStore, Provider, ProviderError,
    SubscriptionSet, READ_SILENCE_LIMIT,
};
use crate::types::{CandlePrice, CurrencyPair, TickerPrice};

const GATE_WS_URL: &str = "wss://api.gateio.ws/ws/v4/";
const GATE_REST_URL: &str = "https://api.gateio.ws";

pub struct GateProvider {
    store: Arc<PriceStore>,
    subscriptions: Arc<SubscriptionSet>,
    resub_tx: mpsc::UnboundedSender<Vec<CurrencyPair>>,
    rest_url: String,
}

impl GateProvider {
    pub fn new(
        endpoint: ProviderEndpoint,
        pairs: &[CurrencyPair],
        ping_interval: Duration,
        cancel: CancellationToken,
    ) -> Result<Self, ProviderError> {
        let store = PriceStore::new();
        let subscriptions = Arc::new(SubscriptionSet::default());
        subscriptions.add(pairs)?;

        let ws_url = if endpoint.websocket.is_empty() {
            GATE_WS_URL.to_string()
        } else {
            endpoint.websocket
        };
        let rest_url = if endpoint.rest.is_empty() {
            GATE_REST_URL.to_string()
        } else {
            endpoint.rest
        };

        let (resub_tx, resub_rx) = mpsc::unbounded_channel();
        tokio::spawn(run_socket(
            ws_url,
            store.clone(),
            subscriptions.clone(),
            ping_interval,
            resub_rx,
            cancel,
        ));

        Ok(Self {
            store,
            subscriptions,
            resub_tx,
            rest_url,
        })
    }
}

#[async_trait]
impl Provider for GateProvider {
    fn name(&self) -> &'static str {
        PROVIDER_GATE
    }

    async fn get_ticker_prices(
        &self,
        pairs: &[CurrencyPair],
    ) -> Result<HashMap<String, TickerPrice>, ProviderError> {
        Ok(self.store.ticker_prices(pairs))
    }

    async fn get_candle_prices(
        &self,
        pairs: &[CurrencyPair],
    ) -> Result<HashMap<String, Vec<CandlePrice>>, ProviderError> {
        Ok(self.store.candle_prices(pairs))
    }

    async fn subscribe_currency_pairs(&self, pairs: &[CurrencyPair]) -> Result<(), ProviderError> {
        let added = self.subscriptions.add(pairs)?;
        if !added.is_empty() {
            let _ = self.resub_tx.send(added);
        }
        Ok(())
    }

    async fn get_available_pairs(&self) -> Result<HashSet<String>, ProviderError> {
        let url = format!("{}/api/v4/spot/currency_pairs", self.rest_url);
        let body: serde_json::Value = rest_client()?.get(&url).send().await?.json().await?;
        let pairs = body.as_array().ok_or_else(|| ProviderError::Parse {
            provider: PROVIDER_GATE,
            detail: "currency_pairs is not an array".to_string(),
        })?;
        Ok(pairs
            .iter()
            .filter_map(|pair| pair["id"].as_str())
            .map(gate_pair_to_currency_pair_symbol)
            .collect())
    }
}

/// `{base: ATOM, quote: USDT}` -> `ATOM_USDT`.
pub(crate) fn currency_pair_to_gate_pair(pair: &CurrencyPair) -> String {
    format!("{}_{}", pair.base, pair.quote)
}

/// `ATOM_USDT` -> `ATOMUSDT`.
pub(crate) fn gate_pair_to_currency_pair_symbol(gate_pair: &str) -> String {
    gate_pair.replace('_', "")
}

fn subscribe_frames(pairs: &[CurrencyPair]) -> Vec<String> {
    let now = Utc::now().timestamp();
    let gate_pairs: Vec<String> = pairs.iter().map(currency_pair_to_gate_pair).collect();
    let candle_payloads: Vec<Vec<String>> = gate_pairs
        .iter()
        .map(|pair| vec!["1m".to_string(), pair.clone()])
        .collect();

    let mut frames = vec![json!({
        "time": now,
        "channel": "spot.tickers",
        "event": "subscribe",
        "payload": gate_pairs,
    })
    .to_string()];
    for payload in candle_payloads {
        frames.push(
            json!({
                "time": now,
                "channel": "spot.candlesticks",
                "event": "subscribe",
                "payload": payload,
            })
            .to_string(),
        );
    }
    frames
}

async fn run_socket(
    ws_url: String,
    store: Arc<PriceStore>,
    subscriptions: Arc<SubscriptionSet>,
    ping_interval: Duration,
    mut resub_rx: mpsc::UnboundedReceiver<Vec<CurrencyPair>>,
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
                tracing::warn!(provider = PROVIDER_GATE, error = %e, attempt, "websocket connect failed");
                tokio::select! {
                    _ = cancel.cancelled() => return,
                    _ = tokio::time::sleep(backoff_delay(attempt)) => continue 'reconnect,
                }
            }
        };
        attempt = 0;
        let (mut write, mut read) = ws_stream.split();

        let mut subscribe_failed = false;
        for frame in subscribe_frames(&subscriptions.all()) {
            if write.send(Message::Text(frame)).await.is_err() {
                subscribe_failed = true;
                break;
            }
        }
        if subscribe_failed {
            continue 'reconnect;
        }
        tracing::info!(provider = PROVIDER_GATE, "websocket connected");

        let mut ping = tokio::time::interval(ping_interval);
        ping.reset();

        loop {
            tokio::select! {
                _ = cancel.cancelled() => {
                    let _ = write.send(Message::Close(None)).await;
                    return;
                }
                _ = ping.tick() => {
                    let frame = json!({"time": Utc::now().timestamp(), "channel": "spot.ping"}).to_string();
                    if write.send(Message::Text(frame)).await.is_err() {
                        break;
                    }
                }
                Some(pairs) = resub_rx.recv() => {
                    let mut failed = false;
                    for frame in subscribe_frames(&pairs) {
                        if write.send(Message::Text(frame)).await.is_err() {
                            failed = true;
                            break;
                        }
                    }
                    if failed {
                        break;
                    }
                }
                msg = tokio::time::timeout(READ_SILENCE_LIMIT, read.next()) => match msg {
                    Ok(Some(Ok(Message::Text(text)))) => {
                        if let Err(e) = handle_message(&text, &store) {
                            tracing::debug!(provider = PROVIDER_GATE, error = %e, "unparsed message");
                        }
                    }
                    Ok(Some(Ok(Message::Ping(data)))) => {
                        let _ = write.send(Message::Pong(data)).await;
                    }
                    Ok(Some(Ok(Message::Close(_)))) | Ok(None) => {
                        tracing::warn!(provider = PROVIDER_GATE, "websocket closed by server");
                        break;
                    }
                    Ok(Some(Err(e))) => {
                        tracing::warn!(provider = PROVIDER_GATE, error = %e, "websocket error");
                        break;
                    }
                    Err(_) => {
                        tracing::warn!(provider = PROVIDER_GATE, "websocket silent too long");
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

fn handle_message(text: &str, store: &PriceStore) -> Result<(), ProviderError> {
    let value: serde_json::Value =
        serde_json::from_str(text).map_err(|e| ProviderError::Parse {
            provider: PROVIDER_GATE,
            detail: e.to_string(),
        })?;

    if value["event"].as_str() != Some("update") {
        return Ok(());
    }
    let result = &value["result"];

    match value["channel"].as_str() {
        Some("spot.tickers") => {
            let gate_pair = result["currency_pair"]
                .as_str()
                .ok_or_else(|| missing("currency_pair"))?;
            let symbol = gate_pair_to_currency_pair_symbol(gate_pair);
            store.set_ticker(
                &symbol,
                TickerPrice {
                    price: decimal_from_value(PROVIDER_GATE, &result["last"])?,
                    volume: decimal_from_value(PROVIDER_GATE, &result["base_volume"])?,
                },
            );
        }
        Some("spot.candlesticks") => {
            // n is "<interval>_<pair>", e.g. "1m_ATOM_USDT"
            let tag = result["n"].as_str().ok_or_else(|| missing("n"))?;
            let gate_pair = tag.split_once('_').map(|(_, pair)| pair).unwrap_or(tag);
            let symbol = gate_pair_to_currency_pair_symbol(gate_pair);
            let secs: i64 = match &result["t"] {
                serde_json::Value::String(s) => s.parse().map_err(|_| missing("t"))?,
                serde_json::Value::Number(n) => n.as_i64().ok_or_else(|| missing("t"))?,
                _ => return Err(missing("t")),
            };
            store.push_candle(
                &symbol,
                CandlePrice {
                    price: decimal_from_value(PROVIDER_GATE, &result["c"])?,
                    volume: decimal_from_value(PROVIDER_GATE, &result["v"])?,
                    timestamp: secs * 1000,
                },
            );
        }
        _ => {}
    }

    Ok(())
}

fn missing(field: &str) -> ProviderError {
    ProviderError::Parse {
        provider: PROVIDER_GATE,
        detail: format!("missing field {field}"),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rust_decimal_macros::dec;

    #[test]
    fn test_gate_pair_round_trip() {
        let pair = CurrencyPair::new("ATOM", "USDT");
        let gate_pair = currency_pair_to_gate_pair(&pair);
        assert_eq!(gate_pair, "ATOM_USDT");
        assert_eq!(gate_pair_to_currency_pair_symbol(&gate_pair), pair.symbol());
    }

    #[test]
    fn test_handle_ticker_update() {
        let store = PriceStore::new();
        let msg = r#"{"channel":"spot.tickers","event":"update","result":{"currency_pair":"ATOM_USDT","last":"28.21","base_volume":"894123.00"}}"#;
        handle_message(msg, &store).unwrap();

        let pair = CurrencyPair::new("ATOM", "USDT");
        let tickers = store.ticker_prices(std::slice::from_ref(&pair));
        assert_eq!(tickers["ATOMUSDT"].price, dec!(28.21));
    }

    #[test]
    fn test_handle_candlestick_update() {
        let store = PriceStore::new();
        let secs = Utc::now().timestamp();
        let msg = format!(
            r#"{{"channel":"spot.candlesticks","event":"update","result":{{"t":"{secs}","v":"2362.32","c":"28.23","n":"1m_ATOM_USDT"}}}}"#
        );
        handle_message(&msg, &store).unwrap();

        let pair = CurrencyPair::new("ATOM", "USDT");
        let candles = store
            .candle_prices(std::slice::from_ref(&pair))
            .remove("ATOMUSDT")
            .unwrap();
        assert_eq!(candles[0].price, dec!(28.23));
        assert_eq!(candles[0].timestamp, secs * 1000);
    }
}
