//! Oracle engine: provider fan-in, one aggregation cycle per block tick and
//! the vote broadcast.
//!
//! The voting loop is the only component that initiates work. Provider
//! workers run autonomously; each tick samples their in-memory snapshots,
//! aggregates them into one USD price per base and, when a new vote window
//! opened, broadcasts the whitelisted subset on-chain.

pub mod cache;
pub mod compute;
pub mod filter;

use std::collections::{BTreeMap, HashMap, HashSet};
use std::sync::{Arc, Mutex, RwLock};
use std::time::{Duration, Instant};

use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use thiserror::Error;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

use crate::chain::tx::MsgAggregateExchangeRateVote;
use crate::chain::{ChainBackend, ChainClientError, OracleParams};
use crate::config::{parse_duration, CurrencyPairConfig, Healthcheck, ProviderEndpoint};
use crate::oracle::cache::{JailCache, ParamCache};
use crate::oracle::compute::get_computed_prices;
use crate::providers::{new_provider, Provider};
use crate::telemetry::Telemetry;
use crate::types::{
    format_exchange_rate, AggregatedProviderCandles, AggregatedProviderPrices, CurrencyPair,
};

#[derive(Debug, Error)]
pub enum OracleError {
    #[error("expected positive block height")]
    NonPositiveHeight,
    #[error("validator {0} is jailed")]
    ValidatorJailed(String),
    #[error("oracle vote period is zero")]
    ZeroVotePeriod,
    #[error("no price available for {0}")]
    InsufficientData(String),
    #[error(transparent)]
    Chain(#[from] ChainClientError),
}

pub struct Oracle {
    chain: Arc<dyn ChainBackend>,
    provider_pairs: HashMap<String, Vec<CurrencyPair>>,
    chain_denoms: HashMap<String, String>,
    provider_timeout: Duration,
    provider_ping_interval: Duration,
    deviations: HashMap<String, Decimal>,
    endpoints: HashMap<String, ProviderEndpoint>,
    healthchecks: Vec<Healthcheck>,
    telemetry: Arc<Telemetry>,

    providers: tokio::sync::RwLock<HashMap<String, Arc<dyn Provider>>>,
    failed_providers: Mutex<HashMap<String, String>>,

    /// Last successfully computed price table, keyed by chain denom. Written
    /// only by the voting loop, read by the HTTP layer.
    prices: RwLock<BTreeMap<String, Decimal>>,
    last_price_sync: RwLock<Option<DateTime<Utc>>>,

    previous_vote_period: Mutex<Option<i64>>,
    param_cache: tokio::sync::Mutex<ParamCache>,
    jail_cache: tokio::sync::Mutex<JailCache>,
}

impl Oracle {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        chain: Arc<dyn ChainBackend>,
        currency_pairs: &[CurrencyPairConfig],
        provider_timeout: Duration,
        provider_ping_interval: Duration,
        deviations: HashMap<String, Decimal>,
        endpoints: HashMap<String, ProviderEndpoint>,
        healthchecks: Vec<Healthcheck>,
        telemetry: Arc<Telemetry>,
    ) -> Self {
        let (provider_pairs, chain_denoms) = create_mappings_from_pairs(currency_pairs);
        Self {
            chain,
            provider_pairs,
            chain_denoms,
            provider_timeout,
            provider_ping_interval,
            deviations,
            endpoints,
            healthchecks,
            telemetry,
            providers: tokio::sync::RwLock::new(HashMap::new()),
            failed_providers: Mutex::new(HashMap::new()),
            prices: RwLock::new(BTreeMap::new()),
            last_price_sync: RwLock::new(None),
            previous_vote_period: Mutex::new(None),
            param_cache: tokio::sync::Mutex::new(ParamCache::default()),
            jail_cache: tokio::sync::Mutex::new(JailCache::default()),
        }
    }

    /// Construct one worker per configured provider name. A worker that
    /// fails to construct is remembered and skipped by later cycles rather
    /// than blocking them.
    pub async fn init_providers(&self, cancel: CancellationToken) {
        let mut providers = self.providers.write().await;
        for (name, pairs) in &self.provider_pairs {
            if providers.contains_key(name) {
                continue;
            }
            let endpoint = self.endpoints.get(name).cloned().unwrap_or_default();
            match new_provider(
                name,
                endpoint,
                pairs,
                self.provider_ping_interval,
                cancel.child_token(),
            ) {
                Ok(provider) => {
                    providers.insert(name.clone(), Arc::from(provider));
                }
                Err(e) => {
                    tracing::error!(provider = %name, error = %e, "failed to initialize provider");
                    self.failed_providers
                        .lock()
                        .expect("failed-provider lock poisoned")
                        .insert(name.clone(), e.to_string());
                }
            }
        }

        // advisory: warn about configured pairs the market does not list
        for (name, provider) in providers.iter() {
            let provider = provider.clone();
            let name = name.clone();
            let pairs = self.provider_pairs.get(&name).cloned().unwrap_or_default();
            tokio::spawn(async move {
                match provider.get_available_pairs().await {
                    Ok(available) => {
                        for pair in pairs {
                            if !available.contains(&pair.symbol()) {
                                tracing::warn!(provider = %name, pair = %pair, "pair not listed by provider");
                            }
                        }
                    }
                    Err(e) => {
                        tracing::debug!(provider = %name, error = %e, "could not list available pairs");
                    }
                }
            });
        }
    }

    /// Run the voting loop until cancellation: one tick per height received
    /// from the tracker, ticks strictly serialized.
    pub async fn start(
        self: Arc<Self>,
        mut heights: mpsc::Receiver<i64>,
        cancel: CancellationToken,
    ) -> anyhow::Result<()> {
        self.init_providers(cancel.clone()).await;
        tracing::info!("starting price-feeder oracle");

        loop {
            tokio::select! {
                _ = cancel.cancelled() => {
                    tracing::info!("shutting down price-feeder oracle");
                    return Ok(());
                }
                height = heights.recv() => match height {
                    Some(height) => {
                        if let Err(e) = self.tick(height).await {
                            tracing::error!(height, error = %e, "oracle tick failed");
                        }
                    }
                    None => anyhow::bail!("block height channel closed"),
                }
            }
        }
    }

    /// One voting-loop iteration for block `height`.
    pub async fn tick(&self, height: i64) -> Result<(), OracleError> {
        tracing::debug!(height, "executing oracle tick");
        if height <= 0 {
            return Err(OracleError::NonPositiveHeight);
        }

        if self.cached_jailed_state(height).await? {
            return Err(OracleError::ValidatorJailed(
                self.chain.validator_address().to_string(),
            ));
        }

        let params = self.cached_params(height).await?;
        if params.vote_period == 0 {
            return Err(OracleError::ZeroVotePeriod);
        }
        let vote_period = params.vote_period as i64;
        let current_vote_period = height / vote_period;
        let index_in_period = height % vote_period;

        {
            let previous = self
                .previous_vote_period
                .lock()
                .expect("vote period lock poisoned");
            // at most one broadcast per window, and none so late that the
            // vote would land in the next one
            if *previous == Some(current_vote_period) || index_in_period > vote_period / 2 {
                tracing::info!(
                    height,
                    current_vote_period,
                    index_in_period,
                    "skipping vote until the next voting period"
                );
                return Ok(());
            }
        }

        self.set_prices().await?;

        let prices = self.get_prices();
        let whitelisted = filter_prices_by_denoms(&prices, &params.whitelist);
        let msg = MsgAggregateExchangeRateVote {
            exchange_rates: generate_exchange_rates_string(&whitelisted),
            feeder: self.chain.feeder_address().to_string(),
            validator: self.chain.validator_address().to_string(),
        };
        tracing::info!(exchange_rates = %msg.exchange_rates, height, "broadcasting vote");

        let started = Instant::now();
        let response = self.chain.broadcast_vote(msg).await?;
        self.telemetry
            .observe_broadcast_latency(started.elapsed().as_millis() as u64);
        tracing::info!(txhash = %response.txhash, height, "vote accepted by node");

        *self
            .previous_vote_period
            .lock()
            .expect("vote period lock poisoned") = Some(current_vote_period);

        self.ping_healthchecks().await;
        Ok(())
    }

    /// One aggregation cycle: sample every provider, convert, filter and
    /// compute, then publish the table keyed by chain denom. The previous
    /// table is kept when the cycle fails.
    pub async fn set_prices(&self) -> Result<(), OracleError> {
        let mut provider_prices = AggregatedProviderPrices::new();
        let mut provider_candles = AggregatedProviderCandles::new();

        let providers = self.providers.read().await;
        for (name, pairs) in &self.provider_pairs {
            let never_initialized = self
                .failed_providers
                .lock()
                .expect("failed-provider lock poisoned")
                .contains_key(name);
            if never_initialized {
                self.telemetry.provider_failure(name, "", "init", "");
                continue;
            }

            let (tickers, candles) = match providers.get(name) {
                Some(provider) => self.sample_provider(name, provider.as_ref(), pairs).await,
                None => Default::default(),
            };

            for pair in pairs {
                let symbol = pair.symbol();
                match tickers.get(&symbol) {
                    Some(ticker) => {
                        provider_prices
                            .entry(name.clone())
                            .or_default()
                            .insert(pair.base.clone(), ticker.clone());
                    }
                    None => self
                        .telemetry
                        .provider_failure(name, &pair.base, "error", "ticker"),
                }
                match candles.get(&symbol) {
                    Some(candles) => {
                        provider_candles
                            .entry(name.clone())
                            .or_default()
                            .insert(pair.base.clone(), candles.clone());
                    }
                    None => self
                        .telemetry
                        .provider_failure(name, &pair.base, "error", "candle"),
                }
            }
        }
        drop(providers);

        let required = self.required_rates().await;
        let computed = get_computed_prices(
            &provider_candles,
            &provider_prices,
            &self.provider_pairs,
            &self.deviations,
            &required,
        )?;

        {
            let mut prices = self.prices.write().expect("price table lock poisoned");
            prices.clear();
            for (base, price) in computed {
                if let Some(denom) = self.chain_denoms.get(&base) {
                    prices.insert(denom.clone(), price);
                }
            }
        }
        *self
            .last_price_sync
            .write()
            .expect("price sync lock poisoned") = Some(Utc::now());
        Ok(())
    }

    async fn sample_provider(
        &self,
        name: &str,
        provider: &dyn Provider,
        pairs: &[CurrencyPair],
    ) -> (
        HashMap<String, crate::types::TickerPrice>,
        HashMap<String, Vec<crate::types::CandlePrice>>,
    ) {
        let tickers =
            match tokio::time::timeout(self.provider_timeout, provider.get_ticker_prices(pairs))
                .await
            {
                Ok(Ok(tickers)) => tickers,
                Ok(Err(e)) => {
                    tracing::warn!(provider = name, error = %e, "failed to get ticker prices");
                    HashMap::new()
                }
                Err(_) => {
                    tracing::warn!(provider = name, "ticker query timed out");
                    HashMap::new()
                }
            };

        let candles =
            match tokio::time::timeout(self.provider_timeout, provider.get_candle_prices(pairs))
                .await
            {
                Ok(Ok(candles)) => candles,
                Ok(Err(e)) => {
                    tracing::warn!(provider = name, error = %e, "failed to get candle prices");
                    HashMap::new()
                }
                Err(_) => {
                    tracing::warn!(provider = name, "candle query timed out");
                    HashMap::new()
                }
            };

        (tickers, candles)
    }

    /// Bases the current cycle must price: the whitelisted denoms mapped
    /// back to their base symbols, or every configured base before the
    /// first parameter fetch.
    async fn required_rates(&self) -> HashSet<String> {
        let cache = self.param_cache.lock().await;
        match cache.params() {
            Some(params) => {
                let denom_to_base: HashMap<&String, &String> =
                    self.chain_denoms.iter().map(|(b, d)| (d, b)).collect();
                params
                    .whitelist
                    .iter()
                    .filter_map(|denom| denom_to_base.get(denom).map(|base| (*base).clone()))
                    .collect()
            }
            None => self.chain_denoms.keys().cloned().collect(),
        }
    }

    /// The current price table, keyed by chain denom.
    pub fn get_prices(&self) -> BTreeMap<String, Decimal> {
        self.prices
            .read()
            .expect("price table lock poisoned")
            .clone()
    }

    pub fn get_last_price_sync_timestamp(&self) -> Option<DateTime<Utc>> {
        *self
            .last_price_sync
            .read()
            .expect("price sync lock poisoned")
    }

    async fn cached_params(&self, height: i64) -> Result<OracleParams, OracleError> {
        let mut cache = self.param_cache.lock().await;
        if !cache.is_outdated(height) {
            if let Some(params) = cache.params() {
                return Ok(params.clone());
            }
        }

        let params = self.chain.oracle_params().await?;
        self.check_whitelist(&params);
        cache.update(height, params.clone());
        Ok(params)
    }

    fn check_whitelist(&self, params: &OracleParams) {
        let configured: HashSet<&str> = self.chain_denoms.values().map(String::as_str).collect();
        for denom in &params.whitelist {
            if !configured.contains(denom.as_str()) {
                tracing::warn!(%denom, "price missing for required denom");
            }
        }
    }

    async fn cached_jailed_state(&self, height: i64) -> Result<bool, OracleError> {
        let mut cache = self.jail_cache.lock().await;
        if !cache.is_outdated(height) {
            return Ok(cache.is_jailed());
        }

        let is_jailed = self.chain.validator_jailed().await?;
        cache.update(height, is_jailed);
        Ok(is_jailed)
    }

    /// Success-only pings; failures are logged and never affect the tick.
    async fn ping_healthchecks(&self) {
        for healthcheck in &self.healthchecks {
            let timeout =
                parse_duration(&healthcheck.timeout).unwrap_or(Duration::from_millis(200));
            let Ok(client) = reqwest::Client::builder().timeout(timeout).build() else {
                continue;
            };
            match client.get(&healthcheck.url).send().await {
                Ok(_) => tracing::debug!(url = %healthcheck.url, "healthcheck ping sent"),
                Err(e) => {
                    tracing::warn!(url = %healthcheck.url, error = %e, "healthcheck ping failed")
                }
            }
        }
    }
}

/// providers-by-name and base -> chain denom mappings from the configured
/// pairs.
fn create_mappings_from_pairs(
    currency_pairs: &[CurrencyPairConfig],
) -> (HashMap<String, Vec<CurrencyPair>>, HashMap<String, String>) {
    let mut provider_pairs: HashMap<String, Vec<CurrencyPair>> = HashMap::new();
    let mut chain_denoms = HashMap::new();
    for pair in currency_pairs {
        chain_denoms.insert(pair.base.clone(), pair.chain_denom.clone());
        for provider in &pair.providers {
            let pairs = provider_pairs.entry(provider.clone()).or_default();
            let currency_pair = CurrencyPair::new(pair.base.clone(), pair.quote.clone());
            if !pairs.contains(&currency_pair) {
                pairs.push(currency_pair);
            }
        }
    }
    (provider_pairs, chain_denoms)
}

/// Keep only whitelisted denoms.
pub fn filter_prices_by_denoms(
    prices: &BTreeMap<String, Decimal>,
    whitelist: &[String],
) -> BTreeMap<String, Decimal> {
    prices
        .iter()
        .filter(|(denom, _)| whitelist.iter().any(|entry| entry == *denom))
        .map(|(denom, price)| (denom.clone(), *price))
        .collect()
}

/// `"{price}{denom},…"` ascending by denom, 18 fractional digits.
pub fn generate_exchange_rates_string(prices: &BTreeMap<String, Decimal>) -> String {
    prices
        .iter()
        .map(|(denom, price)| format!("{}{}", format_exchange_rate(*price), denom))
        .collect::<Vec<_>>()
        .join(",")
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::chain::tx::TxResponse;
    use crate::config::{
        PROVIDER_BINANCE, PROVIDER_COINBASE, PROVIDER_HUOBI, PROVIDER_KRAKEN, PROVIDER_OKX,
    };
    use crate::providers::ProviderError;
    use crate::types::{past_unix_ms, CandlePrice, TickerPrice};
    use async_trait::async_trait;
    use rust_decimal_macros::dec;

    const FEEDER: &str = "kii1feeder";
    const VALIDATOR: &str = "kiivaloper1validator";

    struct MockChain {
        params: OracleParams,
        jailed: bool,
        broadcast_err: Option<String>,
        votes: Mutex<Vec<MsgAggregateExchangeRateVote>>,
    }

    impl MockChain {
        fn new(params: OracleParams) -> Self {
            Self {
                params,
                jailed: false,
                broadcast_err: None,
                votes: Mutex::new(Vec::new()),
            }
        }
    }

    #[async_trait]
    impl ChainBackend for MockChain {
        async fn oracle_params(&self) -> Result<OracleParams, ChainClientError> {
            Ok(self.params.clone())
        }

        async fn validator_jailed(&self) -> Result<bool, ChainClientError> {
            Ok(self.jailed)
        }

        async fn broadcast_vote(
            &self,
            msg: MsgAggregateExchangeRateVote,
        ) -> Result<TxResponse, ChainClientError> {
            self.votes.lock().unwrap().push(msg);
            match &self.broadcast_err {
                Some(err) => Err(ChainClientError::Broadcast(err.clone())),
                None => Ok(TxResponse {
                    txhash: "0xhash".into(),
                    code: 0,
                    raw_log: String::new(),
                }),
            }
        }

        fn feeder_address(&self) -> &str {
            FEEDER
        }

        fn validator_address(&self) -> &str {
            VALIDATOR
        }
    }

    /// Provider double that serves a fixed ticker map and derives one
    /// candle per symbol from it.
    struct TestProvider {
        prices: HashMap<String, TickerPrice>,
        candle_ts: i64,
        candle_err: bool,
    }

    impl TestProvider {
        fn new(prices: &[(&str, Decimal, Decimal)], candle_ts: i64) -> Self {
            Self {
                prices: prices
                    .iter()
                    .map(|(symbol, price, volume)| {
                        (
                            symbol.to_string(),
                            TickerPrice {
                                price: *price,
                                volume: *volume,
                            },
                        )
                    })
                    .collect(),
                candle_ts,
                candle_err: false,
            }
        }

        fn with_candle_err(mut self) -> Self {
            self.candle_err = true;
            self
        }
    }

    #[async_trait]
    impl Provider for TestProvider {
        fn name(&self) -> &'static str {
            "test"
        }

        async fn get_ticker_prices(
            &self,
            _pairs: &[CurrencyPair],
        ) -> Result<HashMap<String, TickerPrice>, ProviderError> {
            Ok(self.prices.clone())
        }

        async fn get_candle_prices(
            &self,
            _pairs: &[CurrencyPair],
        ) -> Result<HashMap<String, Vec<CandlePrice>>, ProviderError> {
            if self.candle_err {
                return Err(ProviderError::Transport("test error".into()));
            }
            Ok(self
                .prices
                .iter()
                .map(|(symbol, ticker)| {
                    (
                        symbol.clone(),
                        vec![CandlePrice {
                            price: ticker.price,
                            volume: ticker.volume,
                            timestamp: self.candle_ts,
                        }],
                    )
                })
                .collect())
        }

        async fn subscribe_currency_pairs(
            &self,
            _pairs: &[CurrencyPair],
        ) -> Result<(), ProviderError> {
            Ok(())
        }

        async fn get_available_pairs(&self) -> Result<HashSet<String>, ProviderError> {
            Ok(HashSet::new())
        }
    }

    struct FailingProvider;

    #[async_trait]
    impl Provider for FailingProvider {
        fn name(&self) -> &'static str {
            "failing"
        }

        async fn get_ticker_prices(
            &self,
            _pairs: &[CurrencyPair],
        ) -> Result<HashMap<String, TickerPrice>, ProviderError> {
            Err(ProviderError::Transport("unable to get ticker prices".into()))
        }

        async fn get_candle_prices(
            &self,
            _pairs: &[CurrencyPair],
        ) -> Result<HashMap<String, Vec<CandlePrice>>, ProviderError> {
            Err(ProviderError::Transport("unable to get candle prices".into()))
        }

        async fn subscribe_currency_pairs(
            &self,
            _pairs: &[CurrencyPair],
        ) -> Result<(), ProviderError> {
            Ok(())
        }

        async fn get_available_pairs(&self) -> Result<HashSet<String>, ProviderError> {
            Ok(HashSet::new())
        }
    }

    fn pair_config(
        base: &str,
        chain_denom: &str,
        quote: &str,
        providers: &[&str],
    ) -> CurrencyPairConfig {
        CurrencyPairConfig {
            base: base.to_string(),
            chain_denom: chain_denom.to_string(),
            quote: quote.to_string(),
            providers: providers.iter().map(|s| s.to_string()).collect(),
        }
    }

    fn five_provider_pairs() -> Vec<CurrencyPairConfig> {
        vec![
            pair_config("UMEE", "uumee", "USDT", &[PROVIDER_BINANCE]),
            pair_config("UMEE", "uumee", "USDC", &[PROVIDER_KRAKEN]),
            pair_config("XBT", "uxbt", "USDT", &[PROVIDER_OKX]),
            pair_config("USDC", "uusdc", "USD", &[PROVIDER_HUOBI]),
            pair_config("USDT", "uusdt", "USD", &[PROVIDER_COINBASE]),
        ]
    }

    fn test_oracle(chain: Arc<dyn ChainBackend>, pairs: &[CurrencyPairConfig]) -> Oracle {
        Oracle::new(
            chain,
            pairs,
            Duration::from_millis(100),
            Duration::from_secs(20),
            HashMap::new(),
            HashMap::new(),
            Vec::new(),
            Arc::new(Telemetry::new(true, "test")),
        )
    }

    async fn install_provider(oracle: &Oracle, name: &str, provider: impl Provider + 'static) {
        oracle
            .providers
            .write()
            .await
            .insert(name.to_string(), Arc::new(provider));
    }

    fn assert_close(actual: Decimal, expected: Decimal) {
        let diff = (actual - expected).abs();
        assert!(
            diff < dec!(0.000000000001),
            "expected {expected}, got {actual}"
        );
    }

    #[test]
    fn test_generate_exchange_rates_string() {
        assert_eq!(generate_exchange_rates_string(&BTreeMap::new()), "");

        let single = BTreeMap::from([("UMEE".to_string(), dec!(3.72))]);
        assert_eq!(
            generate_exchange_rates_string(&single),
            "3.720000000000000000UMEE"
        );

        let multi = BTreeMap::from([
            ("UMEE".to_string(), dec!(3.72)),
            ("ATOM".to_string(), dec!(40.13)),
            ("OSMO".to_string(), dec!(8.69)),
        ]);
        assert_eq!(
            generate_exchange_rates_string(&multi),
            "40.130000000000000000ATOM,8.690000000000000000OSMO,3.720000000000000000UMEE"
        );
    }

    #[test]
    fn test_filter_prices_by_denoms() {
        let prices = BTreeMap::from([
            ("uusdt".to_string(), dec!(100)),
            ("ueth".to_string(), dec!(5)),
        ]);

        let filtered = filter_prices_by_denoms(&prices, &["uusdt".to_string()]);
        assert_eq!(filtered.len(), 1);
        assert_eq!(filtered["uusdt"], dec!(100));

        assert!(filter_prices_by_denoms(&prices, &[]).is_empty());
        assert!(filter_prices_by_denoms(&BTreeMap::new(), &["uusdt".to_string()]).is_empty());
    }

    fn whitelist(denoms: &[&str]) -> Vec<String> {
        denoms.iter().map(|s| s.to_string()).collect()
    }

    #[tokio::test]
    async fn test_tick_broadcasts_all_whitelisted_entries() {
        let chain = Arc::new(MockChain::new(OracleParams {
            vote_period: 1,
            whitelist: whitelist(&["uusdt", "ubtc", "ueth"]),
        }));
        let pairs = vec![
            pair_config("USDT", "uusdt", "USD", &[PROVIDER_BINANCE]),
            pair_config("BTC", "ubtc", "USD", &[PROVIDER_BINANCE]),
            pair_config("ETH", "ueth", "USD", &[PROVIDER_BINANCE]),
        ];
        let oracle = test_oracle(chain.clone(), &pairs);
        install_provider(
            &oracle,
            PROVIDER_BINANCE,
            TestProvider::new(
                &[
                    ("USDTUSD", dec!(1.1), dec!(1000)),
                    ("BTCUSD", dec!(2.2), dec!(1000)),
                    ("ETHUSD", dec!(3.3), dec!(1000)),
                ],
                past_unix_ms(60),
            ),
        )
        .await;

        oracle.tick(1).await.unwrap();

        let votes = chain.votes.lock().unwrap();
        assert_eq!(votes.len(), 1);
        assert_eq!(
            votes[0].exchange_rates,
            "2.200000000000000000ubtc,3.300000000000000000ueth,1.100000000000000000uusdt"
        );
        assert_eq!(votes[0].feeder, FEEDER);
        assert_eq!(votes[0].validator, VALIDATOR);
        assert_eq!(*oracle.previous_vote_period.lock().unwrap(), Some(1));
    }

    #[tokio::test]
    async fn test_tick_broadcasts_only_whitelisted_entries() {
        let chain = Arc::new(MockChain::new(OracleParams {
            vote_period: 1,
            whitelist: whitelist(&["uusdt", "ubtc"]),
        }));
        let pairs = vec![
            pair_config("USDT", "uusdt", "USD", &[PROVIDER_BINANCE]),
            pair_config("BTC", "ubtc", "USD", &[PROVIDER_BINANCE]),
            pair_config("OTHER", "uother", "USD", &[PROVIDER_BINANCE]),
        ];
        let oracle = test_oracle(chain.clone(), &pairs);
        install_provider(
            &oracle,
            PROVIDER_BINANCE,
            TestProvider::new(
                &[
                    ("USDTUSD", dec!(1.1), dec!(1000)),
                    ("BTCUSD", dec!(2.2), dec!(1000)),
                    ("OTHERUSD", dec!(3.3), dec!(1000)),
                ],
                past_unix_ms(60),
            ),
        )
        .await;

        oracle.tick(1).await.unwrap();

        let votes = chain.votes.lock().unwrap();
        assert_eq!(
            votes[0].exchange_rates,
            "2.200000000000000000ubtc,1.100000000000000000uusdt"
        );
    }

    #[tokio::test]
    async fn test_tick_broadcast_error_keeps_vote_period() {
        let mut chain = MockChain::new(OracleParams {
            vote_period: 1,
            whitelist: whitelist(&["uusdt"]),
        });
        chain.broadcast_err = Some("test error".to_string());
        let chain = Arc::new(chain);

        let pairs = vec![pair_config("USDT", "uusdt", "USD", &[PROVIDER_BINANCE])];
        let oracle = test_oracle(chain.clone(), &pairs);
        install_provider(
            &oracle,
            PROVIDER_BINANCE,
            TestProvider::new(&[("USDTUSD", dec!(1.1), dec!(1000))], past_unix_ms(60)),
        )
        .await;

        let err = oracle.tick(1).await.unwrap_err();
        assert!(matches!(err, OracleError::Chain(_)));

        // the broadcast was attempted but the window is not burned
        assert_eq!(chain.votes.lock().unwrap().len(), 1);
        assert_eq!(*oracle.previous_vote_period.lock().unwrap(), None);
    }

    #[tokio::test]
    async fn test_tick_skips_same_vote_period_without_error() {
        let chain = Arc::new(MockChain::new(OracleParams {
            vote_period: 2,
            whitelist: whitelist(&["uusdt"]),
        }));
        let pairs = vec![pair_config("USDT", "uusdt", "USD", &[PROVIDER_BINANCE])];
        let oracle = test_oracle(chain.clone(), &pairs);
        *oracle.previous_vote_period.lock().unwrap() = Some(1);

        // height 3 is vote period 1, which was already voted
        oracle.tick(3).await.unwrap();

        assert!(chain.votes.lock().unwrap().is_empty());
        assert_eq!(*oracle.previous_vote_period.lock().unwrap(), Some(1));
    }

    #[tokio::test]
    async fn test_tick_skips_late_in_vote_period() {
        let chain = Arc::new(MockChain::new(OracleParams {
            vote_period: 4,
            whitelist: whitelist(&["uusdt"]),
        }));
        let pairs = vec![pair_config("USDT", "uusdt", "USD", &[PROVIDER_BINANCE])];
        let oracle = test_oracle(chain.clone(), &pairs);

        // index 3 of 4 is past the halfway point
        oracle.tick(3).await.unwrap();
        assert!(chain.votes.lock().unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_tick_jailed_validator_errors() {
        let mut chain = MockChain::new(OracleParams {
            vote_period: 1,
            whitelist: whitelist(&["uusdt"]),
        });
        chain.jailed = true;
        let chain = Arc::new(chain);

        let pairs = vec![pair_config("USDT", "uusdt", "USD", &[PROVIDER_BINANCE])];
        let oracle = test_oracle(chain.clone(), &pairs);
        *oracle.jail_cache.lock().await = JailCache::with_jailed(true);

        let err = oracle.tick(1).await.unwrap_err();
        assert_eq!(err.to_string(), format!("validator {VALIDATOR} is jailed"));
        assert!(chain.votes.lock().unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_tick_rejects_non_positive_height() {
        let chain = Arc::new(MockChain::new(OracleParams {
            vote_period: 1,
            whitelist: whitelist(&["uusdt"]),
        }));
        let pairs = vec![pair_config("USDT", "uusdt", "USD", &[PROVIDER_BINANCE])];
        let oracle = test_oracle(chain, &pairs);

        let err = oracle.tick(0).await.unwrap_err();
        assert_eq!(err.to_string(), "expected positive block height");
    }

    #[tokio::test]
    async fn test_set_prices_unknown_symbols_fail_cycle() {
        let chain = Arc::new(MockChain::new(OracleParams {
            vote_period: 1,
            whitelist: whitelist(&["uumee", "uusdc", "uusdt"]),
        }));
        let oracle = test_oracle(chain, &five_provider_pairs());
        oracle.param_cache.lock().await.update(
            1,
            OracleParams {
                vote_period: 1,
                whitelist: whitelist(&["uumee", "uusdc", "uusdt"]),
            },
        );

        // providers report a symbol nobody asked for
        let ts = past_unix_ms(60);
        install_provider(
            &oracle,
            PROVIDER_BINANCE,
            TestProvider::new(&[("UMEEUSDX", dec!(3.72), dec!(2396974.02))], ts),
        )
        .await;
        install_provider(
            &oracle,
            PROVIDER_KRAKEN,
            TestProvider::new(&[("UMEEUSDX", dec!(3.70), dec!(1994674.34))], ts),
        )
        .await;

        assert!(oracle.set_prices().await.is_err());
        assert!(oracle.get_prices().is_empty());

        // every configured (provider, pair) misses both the ticker and the
        // candle lookup
        assert_eq!(oracle.telemetry.failure_count(), 10);
        for (provider, base) in [
            (PROVIDER_BINANCE, "UMEE"),
            (PROVIDER_KRAKEN, "UMEE"),
            (PROVIDER_OKX, "XBT"),
            (PROVIDER_HUOBI, "USDC"),
            (PROVIDER_COINBASE, "USDT"),
        ] {
            assert!(oracle.telemetry.has_failure(provider, base, "error", "ticker"));
            assert!(oracle.telemetry.has_failure(provider, base, "error", "candle"));
        }
    }

    #[tokio::test]
    async fn test_set_prices_computes_and_converts_all_pairs() {
        let params = OracleParams {
            vote_period: 1,
            whitelist: whitelist(&["uumee", "uusdc", "uusdt"]),
        };
        let chain = Arc::new(MockChain::new(params.clone()));
        let oracle = test_oracle(chain, &five_provider_pairs());
        oracle.param_cache.lock().await.update(1, params);

        let ts = past_unix_ms(60);
        install_provider(
            &oracle,
            PROVIDER_BINANCE,
            TestProvider::new(&[("UMEEUSDT", dec!(3.72), dec!(2396974.02))], ts),
        )
        .await;
        install_provider(
            &oracle,
            PROVIDER_KRAKEN,
            TestProvider::new(&[("UMEEUSDC", dec!(3.70), dec!(1994674.34))], ts),
        )
        .await;
        install_provider(
            &oracle,
            PROVIDER_HUOBI,
            TestProvider::new(&[("USDCUSD", dec!(1), dec!(2396974.34))], ts),
        )
        .await;
        install_provider(
            &oracle,
            PROVIDER_COINBASE,
            TestProvider::new(&[("USDTUSD", dec!(1), dec!(1994674.34))], ts),
        )
        .await;
        install_provider(
            &oracle,
            PROVIDER_OKX,
            TestProvider::new(&[("XBTUSDT", dec!(3.717), dec!(1994674.34))], ts),
        )
        .await;

        oracle.set_prices().await.unwrap();
        assert_eq!(oracle.telemetry.failure_count(), 0);

        let prices = oracle.get_prices();
        assert_eq!(prices.len(), 4);
        assert_close(
            prices["uumee"],
            Decimal::from_str_exact("3.710916056220858266").unwrap(),
        );
        assert_eq!(prices["uxbt"], dec!(3.717));
        assert_eq!(prices["uusdc"], dec!(1));
        assert_eq!(prices["uusdt"], dec!(1));
    }

    #[tokio::test]
    async fn test_set_prices_survives_failing_provider_via_ticker_fallback() {
        let params = OracleParams {
            vote_period: 1,
            whitelist: whitelist(&["uumee", "uusdc", "uusdt"]),
        };
        let chain = Arc::new(MockChain::new(params.clone()));
        let oracle = test_oracle(chain, &five_provider_pairs());
        oracle.param_cache.lock().await.update(1, params);

        let ts = past_unix_ms(60);
        install_provider(&oracle, PROVIDER_BINANCE, FailingProvider).await;
        install_provider(
            &oracle,
            PROVIDER_KRAKEN,
            TestProvider::new(&[("UMEEUSDC", dec!(3.71), dec!(1994674.34))], ts)
                .with_candle_err(),
        )
        .await;
        install_provider(
            &oracle,
            PROVIDER_HUOBI,
            TestProvider::new(&[("USDCUSD", dec!(1), dec!(2396974.34))], ts),
        )
        .await;
        install_provider(
            &oracle,
            PROVIDER_COINBASE,
            TestProvider::new(&[("USDTUSD", dec!(1), dec!(1994674.34))], ts),
        )
        .await;
        install_provider(
            &oracle,
            PROVIDER_OKX,
            TestProvider::new(&[("XBTUSDT", dec!(3.717), dec!(1994674.34))], ts),
        )
        .await;

        oracle.set_prices().await.unwrap();

        assert_eq!(oracle.telemetry.failure_count(), 3);
        assert!(oracle
            .telemetry
            .has_failure(PROVIDER_BINANCE, "UMEE", "error", "ticker"));
        assert!(oracle
            .telemetry
            .has_failure(PROVIDER_BINANCE, "UMEE", "error", "candle"));
        assert!(oracle
            .telemetry
            .has_failure(PROVIDER_KRAKEN, "UMEE", "error", "candle"));

        let prices = oracle.get_prices();
        assert_eq!(prices.len(), 4);
        assert_eq!(prices["uumee"], dec!(3.71));
        assert_eq!(prices["uxbt"], dec!(3.717));
    }

    #[tokio::test]
    async fn test_set_prices_skips_providers_that_never_initialized() {
        let params = OracleParams {
            vote_period: 1,
            whitelist: whitelist(&["uumee", "uusdc", "uusdt"]),
        };
        let chain = Arc::new(MockChain::new(params.clone()));
        let oracle = test_oracle(chain, &five_provider_pairs());
        oracle.param_cache.lock().await.update(1, params);
        oracle
            .failed_providers
            .lock()
            .unwrap()
            .insert(PROVIDER_BINANCE.to_string(), "test error".to_string());

        let ts = past_unix_ms(60);
        install_provider(
            &oracle,
            PROVIDER_KRAKEN,
            TestProvider::new(&[("UMEEUSDC", dec!(3.71), dec!(1994674.34))], ts),
        )
        .await;
        install_provider(
            &oracle,
            PROVIDER_HUOBI,
            TestProvider::new(&[("USDCUSD", dec!(1), dec!(2396974.34))], ts),
        )
        .await;
        install_provider(
            &oracle,
            PROVIDER_COINBASE,
            TestProvider::new(&[("USDTUSD", dec!(1), dec!(1994674.34))], ts),
        )
        .await;
        install_provider(&oracle, PROVIDER_OKX, FailingProvider).await;

        oracle.set_prices().await.unwrap();

        assert_eq!(oracle.telemetry.failure_count(), 3);
        assert!(oracle
            .telemetry
            .has_failure(PROVIDER_BINANCE, "", "init", ""));
        assert!(oracle
            .telemetry
            .has_failure(PROVIDER_OKX, "XBT", "error", "ticker"));
        assert!(oracle
            .telemetry
            .has_failure(PROVIDER_OKX, "XBT", "error", "candle"));

        // XBT is not whitelisted, so the cycle succeeds without it
        let prices = oracle.get_prices();
        assert_eq!(prices.len(), 3);
        assert_eq!(prices["uumee"], dec!(3.71));
        assert_eq!(prices["uusdc"], dec!(1));
        assert_eq!(prices["uusdt"], dec!(1));
    }
}
