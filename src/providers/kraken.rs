//! Kraken websocket worker.
//!
//! Kraken addresses pairs as `BASE/QUOTE` and calls Bitcoin `XBT`; both
//! spellings are normalized at the socket boundary so the store only ever
//! sees canonical symbols.

use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use futures_util::{SinkExt, StreamExt};
use serde_json::json;
use tokio::sync::mpsc;
use tokio_tungstenite::{connect_async, tungstenite::Message};
use tokio_util::sync::CancellationToken;

use crate::config::{ProviderEndpoint, PROVIDER_KRAKEN};
use crate::providers::{
    backoff_delay, parse_decimal, rest_client, PriceStore, Provider, ProviderError,
    SubscriptionSet, READ_SILENCE_LIMIT,
};
use crate::types::{CandlePrice, CurrencyPair, TickerPrice};

const KRAKEN_WS_URL: &str = "wss://ws.kraken.com";
const KRAKEN_REST_URL: &str = "https://api.kraken.com";

pub struct KrakenProvider {
    store: Arc<PriceStore>,
    subscriptions: Arc<SubscriptionSet>,
    resub_tx: mpsc::UnboundedSender<Vec<CurrencyPair>>,
    rest_url: String,
}

impl KrakenProvider {
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
            KRAKEN_WS_URL.to_string()
        } else {
            endpoint.websocket
        };
        let rest_url = if endpoint.rest.is_empty() {
            KRAKEN_REST_URL.to_string()
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
impl Provider for KrakenProvider {
    fn name(&self) -> &'static str {
        PROVIDER_KRAKEN
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
        let url = format!("{}/0/public/AssetPairs", self.rest_url);
        let body: serde_json::Value = rest_client()?.get(&url).send().await?.json().await?;
        let result = body["result"]
            .as_object()
            .ok_or_else(|| ProviderError::Parse {
                provider: PROVIDER_KRAKEN,
                detail: "AssetPairs missing result".to_string(),
            })?;
        Ok(result
            .values()
            .filter_map(|pair| pair["wsname"].as_str())
            .map(|wsname| kraken_pair_to_currency_pair_symbol(&normalize_kraken_btc_pair(wsname)))
            .collect())
    }
}

/// `ATOM/USDT` -> `ATOMUSDT`.
pub(crate) fn kraken_pair_to_currency_pair_symbol(kraken_pair: &str) -> String {
    kraken_pair.replace('/', "")
}

/// `{base: ATOM, quote: USDT}` -> `ATOM/USDT`, spelling Bitcoin the way
/// Kraken does.
pub(crate) fn currency_pair_to_kraken_pair(pair: &CurrencyPair) -> String {
    let base = if pair.base == "BTC" { "XBT" } else { &pair.base };
    format!("{}/{}", base, pair.quote)
}

/// Kraken reports Bitcoin as `XBT`; the rest of the pipeline says `BTC`.
pub(crate) fn normalize_kraken_btc_pair(kraken_pair: &str) -> String {
    match kraken_pair.strip_prefix("XBT/") {
        Some(rest) => format!("BTC/{rest}"),
        None => kraken_pair.to_string(),
    }
}

fn subscribe_frames(pairs: &[CurrencyPair]) -> Vec<String> {
    let kraken_pairs: Vec<String> = pairs.iter().map(currency_pair_to_kraken_pair).collect();
    vec![
        json!({
            "event": "subscribe",
            "pair": kraken_pairs,
            "subscription": {"name": "ticker"},
        })
        .to_string(),
        json!({
            "event": "subscribe",
            "pair": kraken_pairs,
            "subscription": {"name": "ohlc", "interval": 1},
        })
        .to_string(),
    ]
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
                tracing::warn!(provider = PROVIDER_KRAKEN, error = %e, attempt, "websocket connect failed");
                tokio::select! {
                    _ = cancel.cancelled() => return,
                    _ = tokio::time::sleep(backoff_delay(attempt)) => continue 'reconnect,
                }
            }
        };
        attempt = 0;
        let (mut write, mut read) = ws_stream.split();

        for frame in subscribe_frames(&subscriptions.all()) {
            if write.send(Message::Text(frame)).await.is_err() {
                continue 'reconnect;
            }
        }
        tracing::info!(provider = PROVIDER_KRAKEN, "websocket connected");

        let mut ping = tokio::time::interval(ping_interval);
        ping.reset();

        loop {
            tokio::select! {
                _ = cancel.cancelled() => {
                    let _ = write.send(Message::Close(None)).await;
                    return;
                }
                _ = ping.tick() => {
                    let frame = json!({"event": "ping"}).to_string();
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
                            tracing::debug!(provider = PROVIDER_KRAKEN, error = %e, "unparsed message");
                        }
                    }
                    Ok(Some(Ok(Message::Ping(data)))) => {
                        let _ = write.send(Message::Pong(data)).await;
                    }
                    Ok(Some(Ok(Message::Close(_)))) | Ok(None) => {
                        tracing::warn!(provider = PROVIDER_KRAKEN, "websocket closed by server");
                        break;
                    }
                    Ok(Some(Err(e))) => {
                        tracing::warn!(provider = PROVIDER_KRAKEN, error = %e, "websocket error");
                        break;
                    }
                    Err(_) => {
                        tracing::warn!(provider = PROVIDER_KRAKEN, "websocket silent too long");
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

/// Channel payloads arrive as arrays: `[id, data, "ticker", "ATOM/USDT"]`.
fn handle_message(text: &str, store: &PriceStore) -> Result<(), ProviderError> {
    let value: serde_json::Value =
        serde_json::from_str(text).map_err(|e| ProviderError::Parse {
            provider: PROVIDER_KRAKEN,
            detail: e.to_string(),
        })?;

    let Some(items) = value.as_array() else {
        // event frames (subscriptionStatus, heartbeat, pong) are ignored
        return Ok(());
    };
    if items.len() < 4 {
        return Ok(());
    }

    let channel = items[items.len() - 2].as_str().unwrap_or_default();
    let kraken_pair = items[items.len() - 3].as_str().unwrap_or_default();
    let symbol = kraken_pair_to_currency_pair_symbol(&normalize_kraken_btc_pair(kraken_pair));
    if symbol.is_empty() {
        return Ok(());
    }

    if channel == "ticker" {
        let data = &items[1];
        let last = data["c"][0].as_str().ok_or_else(|| missing("c"))?;
        let volume = data["v"][1].as_str().ok_or_else(|| missing("v"))?;
        store.set_ticker(
            &symbol,
            TickerPrice {
                price: parse_decimal(PROVIDER_KRAKEN, last)?,
                volume: parse_decimal(PROVIDER_KRAKEN, volume)?,
            },
        );
    } else if channel.starts_with("ohlc") {
        let data = items[1].as_array().ok_or_else(|| missing("ohlc data"))?;
        if data.len() < 8 {
            return Err(missing("ohlc fields"));
        }
        let end_secs: f64 = data[1]
            .as_str()
            .and_then(|s| s.parse().ok())
            .ok_or_else(|| missing("ohlc etime"))?;
        let candle = CandlePrice {
            price: parse_decimal(PROVIDER_KRAKEN, data[5].as_str().ok_or_else(|| missing("close"))?)?,
            volume: parse_decimal(PROVIDER_KRAKEN, data[7].as_str().ok_or_else(|| missing("volume"))?)?,
            timestamp: (end_secs * 1000.0) as i64,
        };
        store.push_candle(&symbol, candle);
    }

    Ok(())
}

fn missing(field: &str) -> ProviderError {
    ProviderError::Parse {
        provider: PROVIDER_KRAKEN,
        detail: format!("missing field {field}"),
    }
}
