//! Coinbase Exchange websocket worker.
//!
//! Coinbase has no kline channel, so candles are built locally by folding
//! the `matches` trade stream into minute buckets.

use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use chrono::DateTime;
use futures_util::{SinkExt, StreamExt};
use serde_json::json;
use tokio::sync::mpsc;
use tokio_tungstenite::{connect_async, tungstenite::Message};
use tokio_util::sync::CancellationToken;

use crate::config::{ProviderEndpoint, PROVIDER_COINBASE};
use crate::providers::{
    backoff_delay, parse_decimal, rest_client, PriceStore, Provider, ProviderError,
    SubscriptionSet, READ_SILENCE_LIMIT,
};
use crate::types::{CandlePrice, CurrencyPair, TickerPrice};

const COINBASE_WS_URL: &str = "wss://ws-feed.exchange.coinbase.com";
const COINBASE_REST_URL: &str = "https://api.exchange.coinbase.com";

pub struct CoinbaseProvider {
    store: Arc<PriceStore>,
    subscriptions: Arc<SubscriptionSet>,
    resub_tx: mpsc::UnboundedSender<Vec<CurrencyPair>>,
    rest_url: String,
}

impl CoinbaseProvider {
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
            COINBASE_WS_URL.to_string()
        } else {
            endpoint.websocket
        };
        let rest_url = if endpoint.rest.is_empty() {
            COINBASE_REST_URL.to_string()
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
impl Provider for CoinbaseProvider {
    fn name(&self) -> &'static str {
        PROVIDER_COINBASE
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
        let url = format!("{}/products", self.rest_url);
        let body: serde_json::Value = rest_client()?.get(&url).send().await?.json().await?;
        let products = body.as_array().ok_or_else(|| ProviderError::Parse {
            provider: PROVIDER_COINBASE,
            detail: "products is not an array".to_string(),
        })?;
        Ok(products
            .iter()
            .filter_map(|product| product["id"].as_str())
            .map(coinbase_product_to_currency_pair_symbol)
            .collect())
    }
}

/// `{base: ATOM, quote: USD}` -> `ATOM-USD`.
pub(crate) fn currency_pair_to_coinbase_product(pair: &CurrencyPair) -> String {
    format!("{}-{}", pair.base, pair.quote)
}

/// `ATOM-USD` -> `ATOMUSD`.
pub(crate) fn coinbase_product_to_currency_pair_symbol(product: &str) -> String {
    product.replace('-', "")
}

fn subscribe_frame(pairs: &[CurrencyPair]) -> String {
    let products: Vec<String> = pairs.iter().map(currency_pair_to_coinbase_product).collect();
    json!({
        "type": "subscribe",
        "product_ids": products,
        "channels": ["ticker", "matches"],
    })
    .to_string()
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
                tracing::warn!(provider = PROVIDER_COINBASE, error = %e, attempt, "websocket connect failed");
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
        tracing::info!(provider = PROVIDER_COINBASE, "websocket connected");

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
                    if write.send(Message::Text(subscribe_frame(&pairs))).await.is_err() {
                        break;
                    }
                }
                msg = tokio::time::timeout(READ_SILENCE_LIMIT, read.next()) => match msg {
                    Ok(Some(Ok(Message::Text(text)))) => {
                        if let Err(e) = handle_message(&text, &store) {
                            tracing::debug!(provider = PROVIDER_COINBASE, error = %e, "unparsed message");
                        }
                    }
                    Ok(Some(Ok(Message::Ping(data)))) => {
                        let _ = write.send(Message::Pong(data)).await;
                    }
                    Ok(Some(Ok(Message::Close(_)))) | Ok(None) => {
                        tracing::warn!(provider = PROVIDER_COINBASE, "websocket closed by server");
                        break;
                    }
                    Ok(Some(Err(e))) => {
                        tracing::warn!(provider = PROVIDER_COINBASE, error = %e, "websocket error");
                        break;
                    }
                    Err(_) => {
                        tracing::warn!(provider = PROVIDER_COINBASE, "websocket silent too long");
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
            provider: PROVIDER_COINBASE,
            detail: e.to_string(),
        })?;

    match value["type"].as_str() {
        Some("ticker") => {
            let product = value["product_id"].as_str().ok_or_else(|| missing("product_id"))?;
            let symbol = coinbase_product_to_currency_pair_symbol(product);
            store.set_ticker(
                &symbol,
                TickerPrice {
                    price: parse_decimal(
                        PROVIDER_COINBASE,
                        value["price"].as_str().ok_or_else(|| missing("price"))?,
                    )?,
                    volume: parse_decimal(
                        PROVIDER_COINBASE,
                        value["volume_24h"]
                            .as_str()
                            .ok_or_else(|| missing("volume_24h"))?,
                    )?,
                },
            );
        }
        Some("match") | Some("last_match") => {
            let product = value["product_id"].as_str().ok_or_else(|| missing("product_id"))?;
            let symbol = coinbase_product_to_currency_pair_symbol(product);
            let time = value["time"].as_str().ok_or_else(|| missing("time"))?;
            let timestamp = DateTime::parse_from_rfc3339(time)
                .map_err(|e| ProviderError::Parse {
                    provider: PROVIDER_COINBASE,
                    detail: format!("bad trade time {time:?}: {e}"),
                })?
                .timestamp_millis();
            let price = parse_decimal(
                PROVIDER_COINBASE,
                value["price"].as_str().ok_or_else(|| missing("price"))?,
            )?;
            let size = parse_decimal(
                PROVIDER_COINBASE,
                value["size"].as_str().ok_or_else(|| missing("size"))?,
            )?;
            store.merge_trade(&symbol, timestamp, price, size);
        }
        _ => {}
    }

    Ok(())
}

fn missing(field: &str) -> ProviderError {
    ProviderError::Parse {
        provider: PROVIDER_COINBASE,
        detail: format!("missing field {field}"),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Utc;
    use rust_decimal_macros::dec;

    #[test]
    fn test_product_round_trip() {
        let pair = CurrencyPair::new("ATOM", "USD");
        let product = currency_pair_to_coinbase_product(&pair);
        assert_eq!(product, "ATOM-USD");
        assert_eq!(coinbase_product_to_currency_pair_symbol(&product), pair.symbol());
    }

    #[test]
    fn test_handle_ticker_message() {
        let store = PriceStore::new();
        let msg = r#"{"type":"ticker","product_id":"ATOM-USD","price":"28.21","volume_24h":"894123.00"}"#;
        handle_message(msg, &store).unwrap();

        let pair = CurrencyPair::new("ATOM", "USD");
        let tickers = store.ticker_prices(std::slice::from_ref(&pair));
        assert_eq!(tickers["ATOMUSD"].price, dec!(28.21));
    }

    #[test]
    fn test_matches_accumulate_into_candles() {
        let store = PriceStore::new();
        let time = Utc::now().to_rfc3339();
        let first = format!(
            r#"{{"type":"match","product_id":"ATOM-USD","price":"28.21","size":"5","time":"{time}"}}"#
        );
        let second = format!(
            r#"{{"type":"match","product_id":"ATOM-USD","price":"28.25","size":"3","time":"{time}"}}"#
        );
        handle_message(&first, &store).unwrap();
        handle_message(&second, &store).unwrap();

        let pair = CurrencyPair::new("ATOM", "USD");
        let candles = store
            .candle_prices(std::slice::from_ref(&pair))
            .remove("ATOMUSD")
            .unwrap();
        assert_eq!(candles.len(), 1);
        assert_eq!(candles[0].price, dec!(28.25));
        assert_eq!(candles[0].volume, dec!(8));
    }
}
