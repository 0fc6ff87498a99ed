//! OKX websocket worker.

use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use futures_util::{SinkExt, StreamExt};
use serde_json::json;
use tokio::sync::mpsc;
use tokio_tungstenite::{connect_async, tungstenite::Message};
use tokio_util::sync::CancellationToken;

use crate::config::{ProviderEndpoint, PROVIDER_OKX};
use crate::providers::{
    backoff_delay, decimal_from_value, rest_client, PriceStore, Provider, ProviderError,
    SubscriptionSet, READ_SILENCE_LIMIT,
};
use crate::types::{CandlePrice, CurrencyPair, TickerPrice};

const OKX_WS_URL: &str = "wss://ws.okx.com:8443/ws/v5/public";
const OKX_REST_URL: &str = "https://www.okx.com";

pub struct OkxProvider {
    store: Arc<PriceStore>,
    subscriptions: Arc<SubscriptionSet>,
    resub_tx: mpsc::UnboundedSender<Vec<CurrencyPair>>,
    rest_url: String,
}

impl OkxProvider {
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
            OKX_WS_URL.to_string()
        } else {
            endpoint.websocket
        };
        let rest_url = if endpoint.rest.is_empty() {
            OKX_REST_URL.to_string()
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
impl Provider for OkxProvider {
    fn name(&self) -> &'static str {
        PROVIDER_OKX
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
        let url = format!("{}/api/v5/public/instruments?instType=SPOT", self.rest_url);
        let body: serde_json::Value = rest_client()?.get(&url).send().await?.json().await?;
        let instruments = body["data"].as_array().ok_or_else(|| ProviderError::Parse {
            provider: PROVIDER_OKX,
            detail: "instruments missing data".to_string(),
        })?;
        Ok(instruments
            .iter()
            .filter_map(|inst| inst["instId"].as_str())
            .map(okx_inst_to_currency_pair_symbol)
            .collect())
    }
}

/// `{base: ATOM, quote: USDT}` -> `ATOM-USDT`.
pub(crate) fn currency_pair_to_okx_inst(pair: &CurrencyPair) -> String {
    format!("{}-{}", pair.base, pair.quote)
}

/// `ATOM-USDT` -> `ATOMUSDT`.
pub(crate) fn okx_inst_to_currency_pair_symbol(inst: &str) -> String {
    inst.replace('-', "")
}

fn subscribe_frame(pairs: &[CurrencyPair]) -> String {
    let args: Vec<serde_json::Value> = pairs
        .iter()
        .flat_map(|pair| {
            let inst = currency_pair_to_okx_inst(pair);
            [
                json!({"channel": "tickers", "instId": inst}),
                json!({"channel": "candle1m", "instId": inst}),
            ]
        })
        .collect();
    json!({"op": "subscribe", "args": args}).to_string()
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
                tracing::warn!(provider = PROVIDER_OKX, error = %e, attempt, "websocket connect failed");
                tokio::select! {
                    _ = cancel.cancelled() => return,
                    _ = tokio::time::sleep(backoff_delay(attempt)) => continue 'reconnect,
                }
            }
        };
        attempt = 0;
        let (mut write, mut read) = ws_stream.split();

        if write
            .send(Message::Text(subscribe_frame(&subscriptions.all())))
            .await
            .is_err()
        {
            continue 'reconnect;
        }
        tracing::info!(provider = PROVIDER_OKX, "websocket connected");

        let mut ping = tokio::time::interval(ping_interval);
        ping.reset();

        loop {
            tokio::select! {
                _ = cancel.cancelled() => {
                    let _ = write.send(Message::Close(None)).await;
                    return;
                }
                _ = ping.tick() => {
                    // OKX expects a literal "ping" as the keepalive
                    if write.send(Message::Text("ping".to_string())).await.is_err() {
                        break;
                    }
                }
                Some(pairs) = resub_rx.recv() => {
                    if write.send(Message::Text(subscribe_frame(&pairs))).await.is_err() {
                        break;
                    }
                }
                msg = tokio::time::timeout(READ_SILENCE_LIMIT, read.next()) => match msg {
                    Ok(Some(Ok(Message::Text(text)))) => {
                        if text == "pong" {
                            continue;
                        }
                        if let Err(e) = handle_message(&text, &store) {
                            tracing::debug!(provider = PROVIDER_OKX, error = %e, "unparsed message");
                        }
                    }
                    Ok(Some(Ok(Message::Ping(data)))) => {
                        let _ = write.send(Message::Pong(data)).await;
                    }
                    Ok(Some(Ok(Message::Close(_)))) | Ok(None) => {
                        tracing::warn!(provider = PROVIDER_OKX, "websocket closed by server");
                        break;
                    }
                    Ok(Some(Err(e))) => {
                        tracing::warn!(provider = PROVIDER_OKX, error = %e, "websocket error");
                        break;
                    }
                    Err(_) => {
                        tracing::warn!(provider = PROVIDER_OKX, "websocket silent too long");
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
            provider: PROVIDER_OKX,
            detail: e.to_string(),
        })?;

    let channel = value["arg"]["channel"].as_str().unwrap_or_default();
    let inst = value["arg"]["instId"].as_str().unwrap_or_default();
    let Some(data) = value["data"].as_array() else {
        return Ok(());
    };
    let symbol = okx_inst_to_currency_pair_symbol(inst);

    match channel {
        "tickers" => {
            for entry in data {
                store.set_ticker(
                    &symbol,
                    TickerPrice {
                        price: decimal_from_value(PROVIDER_OKX, &entry["last"])?,
                        volume: decimal_from_value(PROVIDER_OKX, &entry["vol24h"])?,
                    },
                );
            }
        }
        "candle1m" => {
            for entry in data {
                let row = entry.as_array().ok_or_else(|| ProviderError::Parse {
                    provider: PROVIDER_OKX,
                    detail: "candle row is not an array".to_string(),
                })?;
                if row.len() < 6 {
                    continue;
                }
                let timestamp: i64 = row[0]
                    .as_str()
                    .and_then(|s| s.parse().ok())
                    .ok_or_else(|| ProviderError::Parse {
                        provider: PROVIDER_OKX,
                        detail: "candle missing timestamp".to_string(),
                    })?;
                store.push_candle(
                    &symbol,
                    CandlePrice {
                        price: decimal_from_value(PROVIDER_OKX, &row[4])?,
                        volume: decimal_from_value(PROVIDER_OKX, &row[5])?,
                        timestamp,
                    },
                );
            }
        }
        _ => {}
    }

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::now_unix_ms;
    use rust_decimal_macros::dec;

    #[test]
    fn test_inst_round_trip() {
        let pair = CurrencyPair::new("ATOM", "USDT");
        let inst = currency_pair_to_okx_inst(&pair);
        assert_eq!(inst, "ATOM-USDT");
        assert_eq!(okx_inst_to_currency_pair_symbol(&inst), pair.symbol());
    }

    #[test]
    fn test_handle_ticker_message() {
        let store = PriceStore::new();
        let msg = r#"{"arg":{"channel":"tickers","instId":"ATOM-USDT"},"data":[{"last":"3.717","vol24h":"1994674.34"}]}"#;
        handle_message(msg, &store).unwrap();

        let pair = CurrencyPair::new("ATOM", "USDT");
        let tickers = store.ticker_prices(std::slice::from_ref(&pair));
        assert_eq!(tickers["ATOMUSDT"].price, dec!(3.717));
    }

    #[test]
    fn test_handle_candle_message() {
        let store = PriceStore::new();
        let now = now_unix_ms();
        let msg = format!(
            r#"{{"arg":{{"channel":"candle1m","instId":"ATOM-USDT"}},"data":[["{now}","3.70","3.72","3.69","3.717","1000"]]}}"#
        );
        handle_message(&msg, &store).unwrap();

        let pair = CurrencyPair::new("ATOM", "USDT");
        let candles = store
            .candle_prices(std::slice::from_ref(&pair))
            .remove("ATOMUSDT")
            .unwrap();
        assert_eq!(candles[0].price, dec!(3.717));
        assert_eq!(candles[0].volume, dec!(1000));
        assert_eq!(candles[0].timestamp, now);
    }
}
