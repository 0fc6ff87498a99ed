//! Binance websocket worker.
//!
//! Subscribes to the 24h ticker and 1m kline streams for each pair and keeps
//! the shared price store current.

use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use futures_util::{SinkExt, StreamExt};
use serde::Serialize;
use tokio::sync::mpsc;
use tokio_tungstenite::{connect_async, tungstenite::Message};
use tokio_util::sync::CancellationToken;

use crate::config::{ProviderEndpoint, PROVIDER_BINANCE};
use crate::providers::{
    backoff_delay, parse_decimal, rest_client, PriceStore, Provider, ProviderError,
    SubscriptionSet, READ_SILENCE_LIMIT,
};
use crate::types::{CandlePrice, CurrencyPair, TickerPrice};

const BINANCE_WS_URL: &str = "wss://stream.binance.com:9443/ws";
const BINANCE_REST_URL: &str = "https://api.binance.com";

pub struct BinanceProvider {
    store: Arc<PriceStore>,
    subscriptions: Arc<SubscriptionSet>,
    resub_tx: mpsc::UnboundedSender<Vec<CurrencyPair>>,
    rest_url: String,
}

impl BinanceProvider {
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
            BINANCE_WS_URL.to_string()
        } else {
            endpoint.websocket
        };
        let rest_url = if endpoint.rest.is_empty() {
            BINANCE_REST_URL.to_string()
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
impl Provider for BinanceProvider {
    fn name(&self) -> &'static str {
        PROVIDER_BINANCE
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
        let url = format!("{}/api/v3/exchangeInfo", self.rest_url);
        let body: serde_json::Value = rest_client()?.get(&url).send().await?.json().await?;
        let symbols = body["symbols"]
            .as_array()
            .ok_or_else(|| ProviderError::Parse {
                provider: PROVIDER_BINANCE,
                detail: "exchangeInfo missing symbols".to_string(),
            })?;
        Ok(symbols
            .iter()
            .filter_map(|s| s["symbol"].as_str())
            .map(str::to_string)
            .collect())
    }
}

#[derive(Debug, Serialize)]
struct SubscribeFrame {
    method: &'static str,
    params: Vec<String>,
    id: u64,
}

fn subscribe_frame(pairs: &[CurrencyPair], id: u64) -> SubscribeFrame {
    let params = pairs
        .iter()
        .flat_map(|pair| {
            let stream = currency_pair_to_binance_symbol(pair).to_lowercase();
            [format!("{stream}@ticker"), format!("{stream}@kline_1m")]
        })
        .collect();
    SubscribeFrame {
        method: "SUBSCRIBE",
        params,
        id,
    }
}

/// Binance concatenates base and quote, which is already the canonical
/// symbol used by the store.
pub(crate) fn currency_pair_to_binance_symbol(pair: &CurrencyPair) -> String {
    pair.symbol()
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
    let mut frame_id = 0u64;

    'reconnect: loop {
        if cancel.is_cancelled() {
            return;
        }

        let (ws_stream, _) = match connect_async(&ws_url).await {
            Ok(stream) => stream,
            Err(e) => {
                attempt += 1;
                tracing::warn!(provider = PROVIDER_BINANCE, error = %e, attempt, "websocket connect failed");
                tokio::select! {
                    _ = cancel.cancelled() => return,
                    _ = tokio::time::sleep(backoff_delay(attempt)) => continue 'reconnect,
                }
            }
        };
        attempt = 0;
        let (mut write, mut read) = ws_stream.split();

        // the full set is authoritative after every reconnect
        frame_id += 1;
        let frame = subscribe_frame(&subscriptions.all(), frame_id);
        if let Ok(text) = serde_json::to_string(&frame) {
            if write.send(Message::Text(text)).await.is_err() {
                continue 'reconnect;
            }
        }
        tracing::info!(provider = PROVIDER_BINANCE, "websocket connected");

        let mut ping = tokio::time::interval(ping_interval);
        ping.reset();

        loop {
            tokio::select! {
                _ = cancel.cancelled() => {
                    let _ = write.send(Message::Close(None)).await;
                    return;
                }
                _ = ping.tick() => {
                    if write.send(Message::Ping(Vec::new())).await.is_err() {
                        break;
                    }
                }
                Some(pairs) = resub_rx.recv() => {
                    frame_id += 1;
                    let frame = subscribe_frame(&pairs, frame_id);
                    if let Ok(text) = serde_json::to_string(&frame) {
                        if write.send(Message::Text(text)).await.is_err() {
                            break;
                        }
                    }
                }
                msg = tokio::time::timeout(READ_SILENCE_LIMIT, read.next()) => match msg {
                    Ok(Some(Ok(Message::Text(text)))) => {
                        if let Err(e) = handle_message(&text, &store) {
                            tracing::debug!(provider = PROVIDER_BINANCE, error = %e, "unparsed message");
                        }
                    }
                    Ok(Some(Ok(Message::Ping(data)))) => {
                        let _ = write.send(Message::Pong(data)).await;
                    }
                    Ok(Some(Ok(Message::Close(_)))) | Ok(None) => {
                        tracing::warn!(provider = PROVIDER_BINANCE, "websocket closed by server");
                        break;
                    }
                    Ok(Some(Err(e))) => {
                        tracing::warn!(provider = PROVIDER_BINANCE, error = %e, "websocket error");
                        break;
                    }
                    Err(_) => {
                        tracing::warn!(provider = PROVIDER_BINANCE, "websocket silent too long");
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
            provider: PROVIDER_BINANCE,
            detail: e.to_string(),
        })?;

    match value["e"].as_str() {
        Some("24hrTicker") => {
            let symbol = field_str(&value, "s")?;
            let ticker = TickerPrice {
                price: parse_decimal(PROVIDER_BINANCE, field_str(&value, "c")?)?,
                volume: parse_decimal(PROVIDER_BINANCE, field_str(&value, "v")?)?,
            };
            store.set_ticker(symbol, ticker);
        }
        Some("kline") => {
            let kline = &value["k"];
            let symbol = field_str(kline, "s")?;
            let candle = CandlePrice {
                price: parse_decimal(PROVIDER_BINANCE, field_str(kline, "c")?)?,
                volume: parse_decimal(PROVIDER_BINANCE, field_str(kline, "v")?)?,
                timestamp: kline["T"].as_i64().ok_or_else(|| ProviderError::Parse {
                    provider: PROVIDER_BINANCE,
                    detail: "kline missing close time".to_string(),
                })?,
            };
            store.push_candle(symbol, candle);
        }
        _ => {}
    }

    Ok(())
}

fn field_str<'a>(value: &'a serde_json::Value, field: &str) -> Result<&'a str, ProviderError> {
    value[field].as_str().ok_or_else(|| ProviderError::Parse {
        provider: PROVIDER_BINANCE,
        detail: format!("missing field {field}"),
    })
}
