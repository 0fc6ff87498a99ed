//! Huobi polling worker.
//!
//! Huobi's websocket feed is gzip-framed, so this worker polls the REST API
//! instead: the merged ticker and the 1m kline history for each pair every
//! poll interval.

use std::collections::{HashMap, HashSet};
use std::sync::Arc;

use async_trait::async_trait;
use tokio_util::sync::CancellationToken;

use crate::config::{ProviderEndpoint, PROVIDER_HUOBI};
use crate::providers::{
    decimal_from_value, rest_client, PriceStore, Provider, ProviderError, SubscriptionSet,
    POLL_INTERVAL,
};
use crate::types::{CandlePrice, CurrencyPair, TickerPrice};

const HUOBI_REST_URL: &str = "https://api.huobi.pro";

pub struct HuobiProvider {
    store: Arc<PriceStore>,
    subscriptions: Arc<SubscriptionSet>,
    rest_url: String,
}

impl HuobiProvider {
    pub fn new(
        endpoint: ProviderEndpoint,
        pairs: &[CurrencyPair],
        cancel: CancellationToken,
    ) -> Result<Self, ProviderError> {
        let store = PriceStore::new();
        let subscriptions = Arc::new(SubscriptionSet::default());
        subscriptions.add(pairs)?;

        let rest_url = if endpoint.rest.is_empty() {
            HUOBI_REST_URL.to_string()
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
impl Provider for HuobiProvider {
    fn name(&self) -> &'static str {
        PROVIDER_HUOBI
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
        // the poll loop reads the shared set, so adding is enough
        self.subscriptions.add(pairs)?;
        Ok(())
    }

    async fn get_available_pairs(&self) -> Result<HashSet<String>, ProviderError> {
        let url = format!("{}/v1/common/symbols", self.rest_url);
        let body: serde_json::Value = rest_client()?.get(&url).send().await?.json().await?;
        let symbols = body["data"].as_array().ok_or_else(|| ProviderError::Parse {
            provider: PROVIDER_HUOBI,
            detail: "symbols missing data".to_string(),
        })?;
        Ok(symbols
            .iter()
            .filter_map(|entry| entry["symbol"].as_str())
            .map(|symbol| symbol.to_uppercase())
            .collect())
    }
}

/// Huobi spells pairs lowercase, e.g. `atomusdt`.
pub(crate) fn currency_pair_to_huobi_symbol(pair: &CurrencyPair) -> String {
    pair.symbol().to_lowercase()
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
            tracing::error!(provider = PROVIDER_HUOBI, error = %e, "failed to build REST client");
            return;
        }
    };

    loop {
        for pair in subscriptions.all() {
            if let Err(e) = poll_pair(&client, &rest_url, &store, &pair).await {
                tracing::warn!(provider = PROVIDER_HUOBI, pair = %pair, error = %e, "poll failed");
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
    let huobi_symbol = currency_pair_to_huobi_symbol(pair);
    let symbol = pair.symbol();

    let url = format!("{rest_url}/market/detail/merged?symbol={huobi_symbol}");
    let body: serde_json::Value = client.get(&url).send().await?.json().await?;
    if body["status"].as_str() == Some("ok") {
        let tick = &body["tick"];
        store.set_ticker(
            &symbol,
            TickerPrice {
                price: decimal_from_value(PROVIDER_HUOBI, &tick["close"])?,
                volume: decimal_from_value(PROVIDER_HUOBI, &tick["vol"])?,
            },
        );
    }

    let url = format!("{rest_url}/market/history/kline?period=1min&size=5&symbol={huobi_symbol}");
    let body: serde_json::Value = client.get(&url).send().await?.json().await?;
    if let Some(rows) = body["data"].as_array() {
        for row in rows {
            let Some(secs) = row["id"].as_i64() else {
                continue;
            };
            store.push_candle(
                &symbol,
                CandlePrice {
                    price: decimal_from_value(PROVIDER_HUOBI, &row["close"])?,
                    volume: decimal_from_value(PROVIDER_HUOBI, &row["vol"])?,
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

    #[test]
    fn test_huobi_symbol_is_lowercase_concatenation() {
        let pair = CurrencyPair::new("ATOM", "USDT");
        assert_eq!(currency_pair_to_huobi_symbol(&pair), "atomusdt");
    }
}
