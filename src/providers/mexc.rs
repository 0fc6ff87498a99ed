//! MEXC polling worker.

use std::collections::{HashMap, HashSet};
use std::sync::Arc;

use async_trait::async_trait;
use tokio_util::sync::CancellationToken;

use crate::config::{ProviderEndpoint, PROVIDER_MEXC};
use crate::providers::{
    decimal_from_value, rest_client, PriceStore, Provider, ProviderError, SubscriptionSet,
    POLL_INTERVAL,
};
use crate::types::{CandlePrice, CurrencyPair, TickerPrice};

const MEXC_REST_URL: &str = "https://www.mexc.com";

pub struct MexcProvider {
    store: Arc<PriceStore>,
    subscriptions: Arc<SubscriptionSet>,
    rest_url: String,
}

impl MexcProvider {
    pub fn new(
        endpoint: ProviderEndpoint,
        pairs: &[CurrencyPair],
        cancel: CancellationToken,
    ) -> Result<Self, ProviderError> {
        let store = PriceStore::new();
        let subscriptions = Arc::new(SubscriptionSet::default());
        subscriptions.add(pairs)?;

        let rest_url = if endpoint.rest.is_empty() {
            MEXC_REST_URL.to_string()
        } else {
            endpoint.rest
        };

        tokio::spawn(run_poll(
            rest_url.clone(),
            store.clone(),
            subscriptions.clone(),
            cancel,
        ));

        Ok(Self {
            store,
            subscriptions,
            rest_url,
        })
    }
}

#[async_trait]
impl Provider for MexcProvider {
    fn name(&self) -> &'static str {
        PROVIDER_MEXC
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
        self.subscriptions.add(pairs)?;
        Ok(())
    }

    async fn get_available_pairs(&self) -> Result<HashSet<String>, ProviderError> {
        let url = format!("{}/open/api/v2/market/symbols", self.rest_url);
        let body: serde_json::Value = rest_client()?.get(&url).send().await?.json().await?;
        let symbols = body["data"].as_array().ok_or_else(|| ProviderError::Parse {
            provider: PROVIDER_MEXC,
            detail: "symbols missing data".to_string(),
        })?;
        Ok(symbols
            .iter()
            .filter_map(|entry| entry["symbol"].as_str())
            .map(mexc_pair_to_currency_pair_symbol)
            .collect())
    }
}

/// `{base: ATOM, quote: USDT}` -> `ATOM_USDT`.
pub(crate) fn currency_pair_to_mexc_pair(pair: &CurrencyPair) -> String {
    format!("{}_{}", pair.base, pair.quote)
}

/// `ATOM_USDT` -> `ATOMUSDT`.
pub(crate) fn mexc_pair_to_currency_pair_symbol(mexc_pair: &str) -> String {
    mexc_pair.replace('_', "")
}

async fn run_poll(
    rest_url: String,
    store: Arc<PriceStore>,
    subscriptions: Arc<SubscriptionSet>,
    cancel: CancellationToken,
) {
    let client = match rest_client() {
        Ok(client) => client,
        Err(e) => {
            tracing::error!(provider = PROVIDER_MEXC, error = %e, "failed to build REST client");
            return;
        }
    };

    loop {
        for pair in subscriptions.all() {
            if let Err(e) = poll_pair(&client, &rest_url, &store, &pair).await {
                tracing::warn!(provider = PROVIDER_MEXC, pair = %pair, error = %e, "poll failed");
            }
        }
        tokio::select! {
            _ = cancel.cancelled() => return,
            _ = tokio::time::sleep(POLL_INTERVAL) => {}
        }
    }
}

async fn poll_pair(
    client: &reqwest::Client,
    rest_url: &str,
    store: &PriceStore,
    pair: &CurrencyPair,
) -> Result<(), ProviderError> {
    let mexc_pair = currency_pair_to_mexc_pair(pair);
    let symbol = pair.symbol();

    let url = format!("{rest_url}/open/api/v2/market/ticker?symbol={mexc_pair}");
    let body: serde_json::Value = client.get(&url).send().await?.json().await?;
    if let Some(entries) = body["data"].as_array() {
        for entry in entries {
            store.set_ticker(
                &symbol,
                TickerPrice {
                    price: decimal_from_value(PROVIDER_MEXC, &entry["last"])?,
                    volume: decimal_from_value(PROVIDER_MEXC, &entry["volume"])?,
                },
            );
        }
    }

    let url = format!("{rest_url}/open/api/v2/market/kline?symbol={mexc_pair}&interval=1m&limit=5");
    let body: serde_json::Value = client.get(&url).send().await?.json().await?;
    if let Some(rows) = body["data"].as_array() {
        for row in rows {
            let Some(row) = row.as_array() else { continue };
            if row.len() < 6 {
                continue;
            }
            let Some(secs) = row[0].as_i64() else { continue };
            store.push_candle(
                &symbol,
                CandlePrice {
                    price: decimal_from_value(PROVIDER_MEXC, &row[2])?,
                    volume: decimal_from_value(PROVIDER_MEXC, &row[5])?,
                    timestamp: secs * 1000,
                },
            );
        }
    }

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use rust_decimal_macros::dec;

    #[test]
    fn test_currency_pair_to_mexc_pair() {
        let pair = CurrencyPair::new("ATOM", "USDT");
        assert_eq!(currency_pair_to_mexc_pair(&pair), "ATOM_USDT");
        assert_eq!(mexc_pair_to_currency_pair_symbol("ATOM_USDT"), "ATOMUSDT");
    }

    #[tokio::test]
    async fn test_get_ticker_prices_reads_store() {
        let provider = MexcProvider::new(
            ProviderEndpoint {
                name: PROVIDER_MEXC.to_string(),
                rest: "http://127.0.0.1:1".to_string(),
                websocket: String::new(),
            },
            &[CurrencyPair::new("ATOM", "USDT")],
            CancellationToken::new(),
        )
        .unwrap();

        provider.store.set_ticker(
            "ATOMUSDT",
            TickerPrice {
                price: dec!(34.69),
                volume: dec!(2396974.02),
            },
        );
        provider.store.set_ticker(
            "KIIUSDT",
            TickerPrice {
                price: dec!(41.35),
                volume: dec!(2396974.02),
            },
        );

        let prices = provider
            .get_ticker_prices(&[
                CurrencyPair::new("ATOM", "USDT"),
                CurrencyPair::new("KII", "USDT"),
            ])
            .await
            .unwrap();
        assert_eq!(prices.len(), 2);
        assert_eq!(prices["ATOMUSDT"].price, dec!(34.69));
        assert_eq!(prices["KIIUSDT"].price, dec!(41.35));

        let none = provider
            .get_ticker_prices(&[CurrencyPair::new("FOO", "BAR")])
            .await
            .unwrap();
        assert!(none.is_empty());
    }

    #[tokio::test]
    async fn test_subscribe_rejects_empty_pairs() {
        let provider = MexcProvider::new(
            ProviderEndpoint {
                name: PROVIDER_MEXC.to_string(),
                rest: "http://127.0.0.1:1".to_string(),
                websocket: String::new(),
            },
            &[CurrencyPair::new("ATOM", "USDT")],
            CancellationToken::new(),
        )
        .unwrap();
        let err = provider.subscribe_currency_pairs(&[]).await.unwrap_err();
        assert!(err.to_string().contains("currency pairs is empty"));
    }
}
