//! Crypto.com polling worker.

use std::collections::{HashMap, HashSet};
use std::sync::Arc;

use async_trait::async_trait;
use tokio_util::sync::CancellationToken;

use crate::config::{ProviderEndpoint, PROVIDER_CRYPTO};
use crate::providers::{
    decimal_from_value, rest_client, PriceStore, Provider, ProviderError, SubscriptionSet,
    POLL_INTERVAL,
};
use crate::types::{CandlePrice, CurrencyPair, TickerPrice};

const CRYPTO_REST_URL: &str = "https://api.crypto.com";

pub struct CryptoProvider {
    store: Arc<PriceStore>,
    subscriptions: Arc<SubscriptionSet>,
    rest_url: String,
}

impl CryptoProvider {
    pub fn new(
        endpoint: ProviderEndpoint,
        pairs: &[CurrencyPair],
        cancel: CancellationToken,
    ) -> Result<Self, ProviderError> {
        let store = PriceStore::new();
        let subscriptions = Arc::new(SubscriptionSet::default());
        subscriptions.add(pairs)?;

        let rest_url = if endpoint.rest.is_empty() {
            CRYPTO_REST_URL.to_string()
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
impl Provider for CryptoProvider {
    fn name(&self) -> &'static str {
        PROVIDER_CRYPTO
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
        let url = format!("{}/v2/public/get-instruments", self.rest_url);
        let body: serde_json::Value = rest_client()?.get(&url).send().await?.json().await?;
        let instruments =
            body["result"]["instruments"]
                .as_array()
                .ok_or_else(|| ProviderError::Parse {
                    provider: PROVIDER_CRYPTO,
                    detail: "get-instruments missing result".to_string(),
                })?;
        Ok(instruments
            .iter()
            .filter_map(|inst| inst["instrument_name"].as_str())
            .map(crypto_pair_to_currency_pair_symbol)
            .collect())
    }
}

/// `{base: ATOM, quote: USDT}` -> `ATOM_USDT`.
pub(crate) fn currency_pair_to_crypto_pair(pair: &CurrencyPair) -> String {
    format!("{}_{}", pair.base, pair.quote)
}

/// `ATOM_USDT` -> `ATOMUSDT`.
pub(crate) fn crypto_pair_to_currency_pair_symbol(crypto_pair: &str) -> String {
    crypto_pair.replace('_', "")
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
            tracing::error!(provider = PROVIDER_CRYPTO, error = %e, "failed to build REST client");
            return;
        }
    };

    loop {
        for pair in subscriptions.all() {
            if let Err(e) = poll_pair(&client, &rest_url, &store, &pair).await {
                tracing::warn!(provider = PROVIDER_CRYPTO, pair = %pair, error = %e, "poll failed");
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
    let crypto_pair = currency_pair_to_crypto_pair(pair);
    let symbol = pair.symbol();

    let url = format!("{rest_url}/v2/public/get-ticker?instrument_name={crypto_pair}");
    let body: serde_json::Value = client.get(&url).send().await?.json().await?;
    if let Some(entries) = body["result"]["data"].as_array() {
        for entry in entries {
            store.set_ticker(
                &symbol,
                TickerPrice {
                    price: decimal_from_value(PROVIDER_CRYPTO, &entry["a"])?,
                    volume: decimal_from_value(PROVIDER_CRYPTO, &entry["v"])?,
                },
            );
        }
    }

    let url = format!(
        "{rest_url}/v2/public/get-candlestick?instrument_name={crypto_pair}&timeframe=1m"
    );
    let body: serde_json::Value = client.get(&url).send().await?.json().await?;
    if let Some(rows) = body["result"]["data"].as_array() {
        for row in rows.iter().rev().take(5) {
            let Some(timestamp) = row["t"].as_i64() else {
                continue;
            };
            store.push_candle(
                &symbol,
                CandlePrice {
                    price: decimal_from_value(PROVIDER_CRYPTO, &row["c"])?,
                    volume: decimal_from_value(PROVIDER_CRYPTO, &row["v"])?,
                    timestamp,
                },
            );
        }
    }

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_crypto_pair_round_trip() {
        let pair = CurrencyPair::new("ATOM", "USDT");
        let crypto_pair = currency_pair_to_crypto_pair(&pair);
        assert_eq!(crypto_pair, "ATOM_USDT");
        assert_eq!(crypto_pair_to_currency_pair_symbol(&crypto_pair), pair.symbol());
    }
}
