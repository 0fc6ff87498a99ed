//! Provider workers.
//!
//! One worker per market keeps a live in-memory view of tickers and candles
//! for its subscribed pairs. Streaming workers own a websocket and reconnect
//! with bounded backoff; polling workers hit REST endpoints on a fixed
//! interval. The aggregation engine only ever samples the in-memory state,
//! so transport failures never leave this module.

mod binance;
mod coinbase;
mod crypto;
mod gate;
mod huobi;
mod kraken;
mod mexc;
mod mock;
mod okx;

pub use binance::BinanceProvider;
pub use coinbase::CoinbaseProvider;
pub use crypto::CryptoProvider;
pub use gate::GateProvider;
pub use huobi::HuobiProvider;
pub use kraken::KrakenProvider;
pub use mexc::MexcProvider;
pub use mock::MockProvider;
pub use okx::OkxProvider;

use std::collections::{BTreeSet, HashMap, HashSet};
use std::sync::{Arc, Mutex, RwLock};
use std::time::Duration;

use async_trait::async_trait;
use rust_decimal::Decimal;
use thiserror::Error;
use tokio_util::sync::CancellationToken;

use crate::config::{self, ProviderEndpoint};
use crate::types::{now_unix_ms, CandlePrice, CurrencyPair, TickerPrice};

/// Candles older than this are pruned on every insertion and on read.
pub const CANDLE_WINDOW_MS: i64 = 3 * 60 * 1000;

/// Bucket width used when candles are built locally from a trade stream.
pub(crate) const CANDLE_BUCKET_MS: i64 = 60_000;

pub(crate) const RECONNECT_MAX_DELAY: Duration = Duration::from_secs(30);
pub(crate) const READ_SILENCE_LIMIT: Duration = Duration::from_secs(60);
pub(crate) const POLL_INTERVAL: Duration = Duration::from_secs(3);
pub(crate) const REST_TIMEOUT: Duration = Duration::from_secs(10);

#[derive(Debug, Error)]
pub enum ProviderError {
    #[error("currency pairs is empty")]
    EmptyCurrencyPairs,
    #[error("provider {0} is not supported")]
    UnsupportedProvider(String),
    #[error("transport: {0}")]
    Transport(String),
    #[error(transparent)]
    Http(#[from] reqwest::Error),
    #[error("failed to parse {provider} payload: {detail}")]
    Parse {
        provider: &'static str,
        detail: String,
    },
}

/// The capability set every market adapter exposes to the aggregation
/// engine. Result maps are keyed by the canonical pair symbol, e.g.
/// `ATOMUSDT`; symbols the worker has never seen are dropped silently.
#[async_trait]
pub trait Provider: Send + Sync {
    fn name(&self) -> &'static str;

    async fn get_ticker_prices(
        &self,
        pairs: &[CurrencyPair],
    ) -> Result<HashMap<String, TickerPrice>, ProviderError>;

    async fn get_candle_prices(
        &self,
        pairs: &[CurrencyPair],
    ) -> Result<HashMap<String, Vec<CandlePrice>>, ProviderError>;

    async fn subscribe_currency_pairs(&self, pairs: &[CurrencyPair]) -> Result<(), ProviderError>;

    async fn get_available_pairs(&self) -> Result<HashSet<String>, ProviderError>;
}

/// Construct the worker registered under `name`. Streaming workers spawn
/// their socket task immediately, pinging on `ping_interval`; the task
/// observes `cancel`.
pub fn new_provider(
    name: &str,
    endpoint: ProviderEndpoint,
    pairs: &[CurrencyPair],
    ping_interval: Duration,
    cancel: CancellationToken,
) -> Result<Box<dyn Provider>, ProviderError> {
    match name {
        config::PROVIDER_BINANCE => Ok(Box::new(BinanceProvider::new(
            endpoint,
            pairs,
            ping_interval,
            cancel,
        )?)),
        config::PROVIDER_KRAKEN => Ok(Box::new(KrakenProvider::new(
            endpoint,
            pairs,
            ping_interval,
            cancel,
        )?)),
        config::PROVIDER_COINBASE => Ok(Box::new(CoinbaseProvider::new(
            endpoint,
            pairs,
            ping_interval,
            cancel,
        )?)),
        config::PROVIDER_OKX => Ok(Box::new(OkxProvider::new(
            endpoint,
            pairs,
            ping_interval,
            cancel,
        )?)),
        config::PROVIDER_GATE => Ok(Box::new(GateProvider::new(
            endpoint,
            pairs,
            ping_interval,
            cancel,
        )?)),
        config::PROVIDER_HUOBI => Ok(Box::new(HuobiProvider::new(endpoint, pairs, cancel)?)),
        config::PROVIDER_MEXC => Ok(Box::new(MexcProvider::new(endpoint, pairs, cancel)?)),
        config::PROVIDER_CRYPTO => Ok(Box::new(CryptoProvider::new(endpoint, pairs, cancel)?)),
        config::PROVIDER_MOCK => Ok(Box::new(MockProvider::new(pairs)?)),
        other => Err(ProviderError::UnsupportedProvider(other.to_string())),
    }
}

/// Ticker and candle tables owned by one worker. Writers are the worker's
/// socket or poll task; readers are the aggregation engine.
#[derive(Debug, Default)]
pub struct PriceStore {
    inner: RwLock<StoreInner>,
}

#[derive(Debug, Default)]
struct StoreInner {
    tickers: HashMap<String, TickerPrice>,
    candles: HashMap<String, Vec<CandlePrice>>,
}

impl PriceStore {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub fn set_ticker(&self, symbol: &str, ticker: TickerPrice) {
        let mut inner = self.inner.write().expect("price store lock poisoned");
        inner.tickers.insert(symbol.to_string(), ticker);
    }

    /// Insert or replace the candle with this timestamp, keeping the list
    /// ordered and pruned to the retention window.
    pub fn push_candle(&self, symbol: &str, candle: CandlePrice) {
        let mut inner = self.inner.write().expect("price store lock poisoned");
        let candles = inner.candles.entry(symbol.to_string()).or_default();
        match candles.iter_mut().find(|c| c.timestamp == candle.timestamp) {
            Some(existing) => *existing = candle,
            None => {
                candles.push(candle);
                candles.sort_by_key(|c| c.timestamp);
            }
        }
        prune_candles(candles, now_unix_ms());
    }

    /// Fold one trade into the minute-bucketed candle list. Used by workers
    /// whose market only streams raw trades.
    pub fn merge_trade(&self, symbol: &str, timestamp: i64, price: Decimal, size: Decimal) {
        let bucket = timestamp - timestamp.rem_euclid(CANDLE_BUCKET_MS);
        let mut inner = self.inner.write().expect("price store lock poisoned");
        let candles = inner.candles.entry(symbol.to_string()).or_default();
        match candles.iter_mut().find(|c| c.timestamp == bucket) {
            Some(candle) => {
                candle.price = price;
                candle.volume += size;
            }
            None => {
                candles.push(CandlePrice {
                    price,
                    volume: size,
                    timestamp: bucket,
                });
                candles.sort_by_key(|c| c.timestamp);
            }
        }
        prune_candles(candles, now_unix_ms());
    }

    pub fn ticker_prices(&self, pairs: &[CurrencyPair]) -> HashMap<String, TickerPrice> {
        let inner = self.inner.read().expect("price store lock poisoned");
        let mut out = HashMap::new();
        for pair in pairs {
            let symbol = pair.symbol();
            if let Some(ticker) = inner.tickers.get(&symbol) {
                out.insert(symbol, ticker.clone());
            }
        }
        out
    }

    /// Candles for the requested pairs, pruned at the moment of read.
    /// Staleness is per symbol: a tracked symbol whose window ran dry is
    /// omitted so the engine sees it as absent input, without touching the
    /// other pairs in the same batch. A symbol the worker never saw is
    /// skipped silently.
    pub fn candle_prices(&self, pairs: &[CurrencyPair]) -> HashMap<String, Vec<CandlePrice>> {
        let now = now_unix_ms();
        let mut inner = self.inner.write().expect("price store lock poisoned");
        let mut out = HashMap::new();
        for pair in pairs {
            let symbol = pair.symbol();
            if let Some(candles) = inner.candles.get_mut(&symbol) {
                prune_candles(candles, now);
                if candles.is_empty() {
                    tracing::warn!(%symbol, "no candles left in the retention window");
                    continue;
                }
                out.insert(symbol, candles.clone());
            }
        }
        out
    }
}

/// The worker's subscription set. `add` rejects empty input, deduplicates
/// and returns only the pairs that were actually new, so re-subscribing an
/// existing pair is a no-op.
#[derive(Debug, Default)]
pub struct SubscriptionSet {
    pairs: Mutex<BTreeSet<CurrencyPair>>,
}

impl SubscriptionSet {
    pub fn add(&self, pairs: &[CurrencyPair]) -> Result<Vec<CurrencyPair>, ProviderError> {
        if pairs.is_empty() {
            return Err(ProviderError::EmptyCurrencyPairs);
        }
        let mut subscribed = self.pairs.lock().expect("subscription lock poisoned");
        let mut added = Vec::new();
        for pair in pairs {
            if subscribed.insert(pair.clone()) {
                added.push(pair.clone());
            }
        }
        Ok(added)
    }

    pub fn all(&self) -> Vec<CurrencyPair> {
        self.pairs
            .lock()
            .expect("subscription lock poisoned")
            .iter()
            .cloned()
            .collect()
    }
}

pub(crate) fn prune_candles(candles: &mut Vec<CandlePrice>, now_ms: i64) {
    let cutoff = now_ms - CANDLE_WINDOW_MS;
    candles.retain(|candle| candle.timestamp >= cutoff);
}

/// Exponential backoff starting at 1s, capped at 30s.
pub(crate) fn backoff_delay(attempt: u32) -> Duration {
    let exp = attempt.saturating_sub(1).min(5);
    let delay = Duration::from_secs(1 << exp);
    delay.min(RECONNECT_MAX_DELAY)
}

pub(crate) fn parse_decimal(
    provider: &'static str,
    value: &str,
) -> Result<Decimal, ProviderError> {
    Decimal::from_str_exact(value.trim()).map_err(|e| ProviderError::Parse {
        provider,
        detail: format!("{value:?}: {e}"),
    })
}

/// Numeric JSON fields arrive as either numbers or strings depending on the
/// exchange; go through the textual form either way to avoid float detours.
pub(crate) fn decimal_from_value(
    provider: &'static str,
    value: &serde_json::Value,
) -> Result<Decimal, ProviderError> {
    match value {
        serde_json::Value::String(s) => parse_decimal(provider, s),
        serde_json::Value::Number(n) => parse_decimal(provider, &n.to_string()),
        other => Err(ProviderError::Parse {
            provider,
            detail: format!("expected numeric field, got {other}"),
        }),
    }
}

pub(crate) fn rest_client() -> Result<reqwest::Client, ProviderError> {
    Ok(reqwest::Client::builder()
        .timeout(REST_TIMEOUT)
        .build()?)
}

#[cfg(test)]
mod tests {
    use super::*;
    use rust_decimal_macros::dec;

    #[test]
    fn test_subscription_set_rejects_empty_and_dedupes() {
        let subs = SubscriptionSet::default();
        assert!(matches!(
            subs.add(&[]),
            Err(ProviderError::EmptyCurrencyPairs)
        ));

        let pair = CurrencyPair::new("ATOM", "USDT");
        let added = subs.add(std::slice::from_ref(&pair)).unwrap();
        assert_eq!(added.len(), 1);

        // already-subscribed pairs are a silent no-op
        let added = subs.add(std::slice::from_ref(&pair)).unwrap();
        assert!(added.is_empty());
        assert_eq!(subs.all().len(), 1);
    }

    #[test]
    fn test_store_prunes_stale_candles_on_read() {
        let store = PriceStore::new();
        let pair = CurrencyPair::new("ATOM", "USDT");
        store.push_candle(
            "ATOMUSDT",
            CandlePrice {
                price: dec!(28.21),
                volume: dec!(100),
                timestamp: now_unix_ms() - CANDLE_WINDOW_MS - 1000,
            },
        );
        store.push_candle(
            "ATOMUSDT",
            CandlePrice {
                price: dec!(28.23),
                volume: dec!(100),
                timestamp: now_unix_ms(),
            },
        );

        let candles = store
            .candle_prices(std::slice::from_ref(&pair))
            .remove("ATOMUSDT")
            .unwrap();
        assert_eq!(candles.len(), 1);
        assert_eq!(candles[0].price, dec!(28.23));
    }

    #[test]
    fn test_store_staleness_is_per_symbol() {
        let store = PriceStore::new();
        let stale = CurrencyPair::new("ATOM", "USDT");
        let fresh = CurrencyPair::new("KII", "USDT");
        store.push_candle(
            "ATOMUSDT",
            CandlePrice {
                price: dec!(28.21),
                volume: dec!(100),
                timestamp: now_unix_ms() - CANDLE_WINDOW_MS - 1000,
            },
        );
        store.push_candle(
            "KIIUSDT",
            CandlePrice {
                price: dec!(41.35),
                volume: dec!(100),
                timestamp: now_unix_ms(),
            },
        );

        // one dry symbol must not cost the batch its fresh entries
        let unknown = CurrencyPair::new("FOO", "BAR");
        let candles = store.candle_prices(&[stale, fresh, unknown]);
        assert_eq!(candles.len(), 1);
        assert_eq!(candles["KIIUSDT"][0].price, dec!(41.35));
    }

    #[test]
    fn test_merge_trade_buckets_by_minute() {
        let store = PriceStore::new();
        let pair = CurrencyPair::new("ATOM", "USD");
        let now = now_unix_ms();
        let bucket = now - now.rem_euclid(CANDLE_BUCKET_MS);

        store.merge_trade("ATOMUSD", now, dec!(28.20), dec!(5));
        store.merge_trade("ATOMUSD", now + 1, dec!(28.25), dec!(3));

        let candles = store
            .candle_prices(std::slice::from_ref(&pair))
            .remove("ATOMUSD")
            .unwrap();
        assert_eq!(candles.len(), 1);
        assert_eq!(candles[0].timestamp, bucket);
        assert_eq!(candles[0].price, dec!(28.25));
        assert_eq!(candles[0].volume, dec!(8));
    }

    #[test]
    fn test_backoff_is_bounded() {
        assert_eq!(backoff_delay(1), Duration::from_secs(1));
        assert_eq!(backoff_delay(3), Duration::from_secs(4));
        assert_eq!(backoff_delay(6), RECONNECT_MAX_DELAY);
        assert_eq!(backoff_delay(60), RECONNECT_MAX_DELAY);
    }

    #[test]
    fn test_ticker_overwrite_replaces_in_full() {
        let store = PriceStore::new();
        let pair = CurrencyPair::new("ATOM", "USDT");
        store.set_ticker(
            "ATOMUSDT",
            TickerPrice {
                price: dec!(28.21),
                volume: dec!(100),
            },
        );
        store.set_ticker(
            "ATOMUSDT",
            TickerPrice {
                price: dec!(28.31),
                volume: dec!(90),
            },
        );

        let tickers = store.ticker_prices(std::slice::from_ref(&pair));
        assert_eq!(tickers["ATOMUSDT"].price, dec!(28.31));
        assert_eq!(tickers["ATOMUSDT"].volume, dec!(90));
    }
}
