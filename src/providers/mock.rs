//! Mock provider.
//!
//! Serves deterministic synthetic prices so a configuration can run without
//! any network access. A pair served by `mock` is exempt from the
//! three-provider minimum, which makes this the provider of choice for
//! local development and integration tests.

use std::collections::{HashMap, HashSet};
use std::sync::Arc;

use async_trait::async_trait;
use rust_decimal::Decimal;

use crate::providers::{Provider, ProviderError, SubscriptionSet, CANDLE_WINDOW_MS};
use crate::types::{now_unix_ms, CandlePrice, CurrencyPair, TickerPrice};

pub struct MockProvider {
    subscriptions: Arc<SubscriptionSet>,
}

impl MockProvider {
    pub fn new(pairs: &[CurrencyPair]) -> Result<Self, ProviderError> {
        let subscriptions = Arc::new(SubscriptionSet::default());
        subscriptions.add(pairs)?;
        Ok(Self { subscriptions })
    }
}

#[async_trait]
impl Provider for MockProvider {
    fn name(&self) -> &'static str {
        crate::config::PROVIDER_MOCK
    }

    async fn get_ticker_prices(
        &self,
        pairs: &[CurrencyPair],
    ) -> Result<HashMap<String, TickerPrice>, ProviderError> {
        let subscribed: HashSet<String> = self
            .subscriptions
            .all()
            .iter()
            .map(CurrencyPair::symbol)
            .collect();
        Ok(pairs
            .iter()
            .map(CurrencyPair::symbol)
            .filter(|symbol| subscribed.contains(symbol))
            .map(|symbol| {
                let ticker = TickerPrice {
                    price: synthetic_price(&symbol),
                    volume: Decimal::from(1_000_000u32),
                };
                (symbol, ticker)
            })
            .collect())
    }

    async fn get_candle_prices(
        &self,
        pairs: &[CurrencyPair],
    ) -> Result<HashMap<String, Vec<CandlePrice>>, ProviderError> {
        let now = now_unix_ms();
        let subscribed: HashSet<String> = self
            .subscriptions
            .all()
            .iter()
            .map(CurrencyPair::symbol)
            .collect();
        Ok(pairs
            .iter()
            .map(CurrencyPair::symbol)
            .filter(|symbol| subscribed.contains(symbol))
            .map(|symbol| {
                let price = synthetic_price(&symbol);
                let candles = (1..=3)
                    .map(|i| CandlePrice {
                        price,
                        volume: Decimal::from(1_000u32),
                        timestamp: now - i * (CANDLE_WINDOW_MS / 4),
                    })
                    .collect();
                (symbol, candles)
            })
            .collect())
    }

    async fn subscribe_currency_pairs(&self, pairs: &[CurrencyPair]) -> Result<(), ProviderError> {
        self.subscriptions.add(pairs)?;
        Ok(())
    }

    async fn get_available_pairs(&self) -> Result<HashSet<String>, ProviderError> {
        Ok(self
            .subscriptions
            .all()
            .iter()
            .map(CurrencyPair::symbol)
            .collect())
    }
}

/// A stable pseudo-price derived from the symbol text, two decimals,
/// somewhere in (0, 655.36].
fn synthetic_price(symbol: &str) -> Decimal {
    let seed = symbol
        .bytes()
        .fold(0u32, |acc, b| acc.wrapping_mul(31).wrapping_add(b as u32));
    Decimal::new(i64::from(seed % 65_536) + 1, 2)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_prices_are_deterministic() {
        let pair = CurrencyPair::new("ATOM", "USD");
        let provider = MockProvider::new(std::slice::from_ref(&pair)).unwrap();

        let first = provider
            .get_ticker_prices(std::slice::from_ref(&pair))
            .await
            .unwrap();
        let second = provider
            .get_ticker_prices(std::slice::from_ref(&pair))
            .await
            .unwrap();
        assert_eq!(first["ATOMUSD"].price, second["ATOMUSD"].price);
        assert!(first["ATOMUSD"].price > Decimal::ZERO);
    }

    #[tokio::test]
    async fn test_candles_match_ticker_price_and_window() {
        let pair = CurrencyPair::new("ATOM", "USD");
        let provider = MockProvider::new(std::slice::from_ref(&pair)).unwrap();

        let tickers = provider
            .get_ticker_prices(std::slice::from_ref(&pair))
            .await
            .unwrap();
        let candles = provider
            .get_candle_prices(std::slice::from_ref(&pair))
            .await
            .unwrap();

        let cutoff = now_unix_ms() - CANDLE_WINDOW_MS;
        for candle in &candles["ATOMUSD"] {
            assert_eq!(candle.price, tickers["ATOMUSD"].price);
            assert!(candle.timestamp >= cutoff);
        }
    }

    #[tokio::test]
    async fn test_unsubscribed_pairs_are_dropped() {
        let provider = MockProvider::new(&[CurrencyPair::new("ATOM", "USD")]).unwrap();
        let prices = provider
            .get_ticker_prices(&[CurrencyPair::new("FOO", "BAR")])
            .await
            .unwrap();
        assert!(prices.is_empty());
    }
}
