//! Configuration management for the price feeder.
//!
//! Loads a TOML file + environment variables and validates the currency-pair
//! topology before the engine starts.

use std::collections::{HashMap, HashSet};
use std::path::Path;
use std::time::Duration;

use anyhow::{bail, Context, Result};
use config::{File, FileFormat};
use rust_decimal::Decimal;
use serde::Deserialize;

use crate::types::{CurrencyPair, DENOM_USD};

pub const PROVIDER_KRAKEN: &str = "kraken";
pub const PROVIDER_BINANCE: &str = "binance";
pub const PROVIDER_CRYPTO: &str = "crypto";
pub const PROVIDER_MEXC: &str = "mexc";
pub const PROVIDER_HUOBI: &str = "huobi";
pub const PROVIDER_OKX: &str = "okx";
pub const PROVIDER_GATE: &str = "gate";
pub const PROVIDER_COINBASE: &str = "coinbase";
pub const PROVIDER_MOCK: &str = "mock";

/// Every market a currency pair may list as a source.
pub const SUPPORTED_PROVIDERS: &[&str] = &[
    PROVIDER_KRAKEN,
    PROVIDER_BINANCE,
    PROVIDER_CRYPTO,
    PROVIDER_MEXC,
    PROVIDER_HUOBI,
    PROVIDER_OKX,
    PROVIDER_GATE,
    PROVIDER_COINBASE,
    PROVIDER_MOCK,
];

/// Assets accepted on the quote side of a pair.
pub const SUPPORTED_QUOTES: &[&str] = &[
    DENOM_USD, "AXLUSDC", "USDC", "USDT", "DAI", "BTC", "ETH", "ATOM",
];

const DEFAULT_PROVIDER_TIMEOUT: &str = "100ms";
const DEFAULT_PROVIDER_PING_INTERVAL: &str = "20s";

/// Maximum amount of standard deviations an operator may configure for a
/// given asset.
const MAX_DEVIATION_THRESHOLD: &str = "3.0";

/// All price-feeder configuration parameters.
#[derive(Debug, Clone, Deserialize)]
pub struct Config {
    pub currency_pairs: Vec<CurrencyPairConfig>,
    #[serde(default)]
    pub deviation_thresholds: Vec<Deviation>,
    pub account: AccountConfig,
    pub keyring: KeyringConfig,
    pub rpc: RpcConfig,
    pub gas: GasConfig,
    #[serde(default)]
    pub telemetry: TelemetryConfig,
    /// Duration string, e.g. "100ms". Budget for sampling one provider.
    #[serde(default = "default_provider_timeout")]
    pub provider_timeout: String,
    /// Duration string, e.g. "20s". Keepalive ping cadence for streaming
    /// workers.
    #[serde(default = "default_provider_ping_interval")]
    pub provider_ping_interval: String,
    #[serde(default)]
    pub provider_endpoints: Vec<ProviderEndpoint>,
    #[serde(default)]
    pub healthchecks: Vec<Healthcheck>,
    #[serde(default)]
    pub server: ServerConfig,
    #[serde(default)]
    pub main: MainConfig,
}

fn default_provider_timeout() -> String {
    DEFAULT_PROVIDER_TIMEOUT.to_string()
}

fn default_provider_ping_interval() -> String {
    DEFAULT_PROVIDER_PING_INTERVAL.to_string()
}

/// One priced asset: the provider-side base symbol, the on-chain denom it
/// votes as, the quote it is priced against and the markets that serve it.
#[derive(Debug, Clone, Deserialize)]
pub struct CurrencyPairConfig {
    pub base: String,
    pub chain_denom: String,
    pub quote: String,
    pub providers: Vec<String>,
}

/// Per-base override of the 1.0 sigma outlier threshold.
#[derive(Debug, Clone, Deserialize)]
pub struct Deviation {
    pub base: String,
    pub threshold: String,
}

/// Network identity and transaction signing addresses.
#[derive(Debug, Clone, Deserialize)]
pub struct AccountConfig {
    pub chain_id: String,
    /// Feeder (oracle) account that signs and pays for votes.
    pub address: String,
    /// Validator the votes are cast for.
    pub validator: String,
    #[serde(default)]
    pub fee_granter: String,
    pub prefix: String,
}

#[derive(Debug, Clone, Deserialize)]
pub struct KeyringConfig {
    pub backend: String,
    pub dir: String,
}

/// Endpoints of the chain node. `grpc_endpoint` is the query API base URL,
/// `tmrpc_endpoint` the Tendermint RPC used for block events and broadcast.
#[derive(Debug, Clone, Deserialize)]
pub struct RpcConfig {
    pub tmrpc_endpoint: String,
    pub grpc_endpoint: String,
    pub rpc_timeout: String,
}

#[derive(Debug, Clone, Deserialize)]
pub struct GasConfig {
    /// Multiplier applied to gas estimates; carried for operators even
    /// though the steady-state path never simulates.
    pub gas_adjustment: f64,
    /// e.g. "0.025ukii".
    pub gas_prices: String,
    pub gas_limit: u64,
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct TelemetryConfig {
    #[serde(default)]
    pub enabled: bool,
    #[serde(default)]
    pub service_name: String,
    #[serde(default)]
    pub global_labels: Vec<Vec<String>>,
}

/// Override of a provider's hardcoded REST and websocket endpoints.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct ProviderEndpoint {
    pub name: String,
    #[serde(default)]
    pub rest: String,
    #[serde(default)]
    pub websocket: String,
}

#[derive(Debug, Clone, Deserialize)]
pub struct Healthcheck {
    pub url: String,
    /// Duration string, e.g. "200ms".
    pub timeout: String,
}

#[derive(Debug, Clone, Deserialize)]
pub struct ServerConfig {
    #[serde(default = "default_listen_addr")]
    pub listen_addr: String,
    #[serde(default = "default_server_timeout")]
    pub read_timeout: String,
    #[serde(default = "default_server_timeout")]
    pub write_timeout: String,
    #[serde(default)]
    pub enable_cors: bool,
    #[serde(default)]
    pub allowed_origins: Vec<String>,
}

fn default_listen_addr() -> String {
    "0.0.0.0:7171".to_string()
}

fn default_server_timeout() -> String {
    "20s".to_string()
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            listen_addr: default_listen_addr(),
            read_timeout: default_server_timeout(),
            write_timeout: default_server_timeout(),
            enable_cors: false,
            allowed_origins: Vec::new(),
        }
    }
}

/// Service toggles.
#[derive(Debug, Clone, Deserialize)]
pub struct MainConfig {
    #[serde(default = "default_true")]
    pub enable_server: bool,
    #[serde(default = "default_true")]
    pub enable_voter: bool,
}

fn default_true() -> bool {
    true
}

impl Default for MainConfig {
    fn default() -> Self {
        Self {
            enable_server: true,
            enable_voter: true,
        }
    }
}

impl Config {
    /// Validate the pair topology and thresholds. Any violation is fatal at
    /// startup.
    pub fn validate(&self) -> Result<()> {
        if self.currency_pairs.is_empty() {
            bail!("no currency pairs configured");
        }

        let max_threshold = Decimal::from_str_exact(MAX_DEVIATION_THRESHOLD)
            .expect("static threshold literal");

        let mut providers_by_base: HashMap<&str, HashSet<&str>> = HashMap::new();
        let mut non_usd_quotes: HashSet<&str> = HashSet::new();

        for pair in &self.currency_pairs {
            if pair.quote.to_uppercase() != DENOM_USD {
                non_usd_quotes.insert(pair.quote.as_str());
            }

            if !SUPPORTED_QUOTES.contains(&pair.quote.to_uppercase().as_str()) {
                bail!("unsupported quote: {}", pair.quote);
            }

            let providers = providers_by_base.entry(pair.base.as_str()).or_default();
            for provider in &pair.providers {
                if !SUPPORTED_PROVIDERS.contains(&provider.as_str()) {
                    bail!("unsupported provider: {}", provider);
                }
                providers.insert(provider.as_str());
            }
        }

        // Every non-USD quote needs its own USD feed so prices can be
        // normalized before voting.
        for quote in non_usd_quotes {
            let convertible = self
                .currency_pairs
                .iter()
                .any(|pair| pair.base == quote && pair.quote.to_uppercase() == DENOM_USD);
            if !convertible {
                bail!("all non-usd quotes require a conversion rate feed");
            }
        }

        for (base, providers) in providers_by_base {
            if !providers.contains(PROVIDER_MOCK) && providers.len() < 3 {
                bail!("must have at least three providers for {base}");
            }
        }

        for deviation in &self.deviation_thresholds {
            let threshold = Decimal::from_str_exact(&deviation.threshold)
                .with_context(|| {
                    format!(
                        "deviation threshold for {} must be numeric",
                        deviation.base
                    )
                })?;
            if threshold > max_threshold {
                bail!("deviation thresholds must not exceed {MAX_DEVIATION_THRESHOLD}");
            }
        }

        parse_duration(&self.provider_timeout).context("invalid provider_timeout")?;
        parse_duration(&self.provider_ping_interval)
            .context("invalid provider_ping_interval")?;
        parse_duration(&self.rpc.rpc_timeout).context("invalid rpc_timeout")?;
        for healthcheck in &self.healthchecks {
            parse_duration(&healthcheck.timeout)
                .with_context(|| format!("invalid healthcheck timeout for {}", healthcheck.url))?;
        }

        for endpoint in &self.provider_endpoints {
            if !SUPPORTED_PROVIDERS.contains(&endpoint.name.as_str()) {
                bail!("endpoint override for unsupported provider: {}", endpoint.name);
            }
            if endpoint.rest.is_empty() && endpoint.websocket.is_empty() {
                bail!("endpoint override for {} has no endpoints", endpoint.name);
            }
        }

        Ok(())
    }

    /// Deviation overrides parsed to decimals, keyed by base.
    pub fn deviations(&self) -> Result<HashMap<String, Decimal>> {
        let mut deviations = HashMap::with_capacity(self.deviation_thresholds.len());
        for deviation in &self.deviation_thresholds {
            let threshold = Decimal::from_str_exact(&deviation.threshold)
                .context("deviation thresholds must be numeric")?;
            deviations.insert(deviation.base.clone(), threshold);
        }
        Ok(deviations)
    }

    /// Endpoint overrides keyed by provider name.
    pub fn provider_endpoints_by_name(&self) -> HashMap<String, ProviderEndpoint> {
        self.provider_endpoints
            .iter()
            .map(|endpoint| (endpoint.name.clone(), endpoint.clone()))
            .collect()
    }

    /// The pairs each provider is asked to serve.
    pub fn provider_pairs(&self) -> HashMap<String, Vec<CurrencyPair>> {
        let mut by_provider: HashMap<String, Vec<CurrencyPair>> = HashMap::new();
        for pair in &self.currency_pairs {
            for provider in &pair.providers {
                let pairs = by_provider.entry(provider.clone()).or_default();
                let currency_pair = CurrencyPair::new(pair.base.clone(), pair.quote.clone());
                if !pairs.contains(&currency_pair) {
                    pairs.push(currency_pair);
                }
            }
        }
        by_provider
    }

    /// base symbol -> on-chain denom.
    pub fn chain_denom_mapping(&self) -> HashMap<String, String> {
        self.currency_pairs
            .iter()
            .map(|pair| (pair.base.clone(), pair.chain_denom.clone()))
            .collect()
    }

    pub fn provider_timeout_duration(&self) -> Duration {
        parse_duration(&self.provider_timeout).unwrap_or(Duration::from_millis(100))
    }

    pub fn provider_ping_interval_duration(&self) -> Duration {
        parse_duration(&self.provider_ping_interval).unwrap_or(Duration::from_secs(20))
    }

    pub fn rpc_timeout_duration(&self) -> Result<Duration> {
        parse_duration(&self.rpc.rpc_timeout).context("failed to parse RPC timeout")
    }
}

/// Read and parse configuration from the given file path.
pub fn parse_config(path: impl AsRef<Path>) -> Result<Config> {
    let path = path.as_ref();
    dotenvy::dotenv().ok();

    let raw = config::Config::builder()
        .add_source(File::from(path).format(FileFormat::Toml))
        .add_source(config::Environment::with_prefix("PRICE_FEEDER").separator("__"))
        .build()
        .with_context(|| format!("failed to read config from {}", path.display()))?;

    let cfg: Config = raw
        .try_deserialize()
        .context("failed to deserialize configuration")?;

    cfg.validate()?;
    Ok(cfg)
}

/// Parse Go-style duration strings: "100ms", "15s", "2m", "1h".
pub fn parse_duration(value: &str) -> Result<Duration> {
    let value = value.trim();
    let split = value
        .find(|c: char| !c.is_ascii_digit() && c != '.')
        .ok_or_else(|| anyhow::anyhow!("duration {value:?} is missing a unit"))?;
    let (number, unit) = value.split_at(split);
    let number: f64 = number
        .parse()
        .with_context(|| format!("invalid duration value {value:?}"))?;

    let secs = match unit {
        "ms" => number / 1000.0,
        "s" => number,
        "m" => number * 60.0,
        "h" => number * 3600.0,
        _ => bail!("unknown duration unit {unit:?}"),
    };
    Ok(Duration::from_secs_f64(secs))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn base_toml(pairs: &str, extra: &str) -> String {
        format!(
            r#"
{pairs}

{extra}

[account]
chain_id = "testchain-1"
address = "kii1feeder"
validator = "kiivaloper1validator"
prefix = "kii"

[keyring]
backend = "test"
dir = "/tmp/keyring"

[rpc]
tmrpc_endpoint = "http://localhost:26657"
grpc_endpoint = "http://localhost:1317"
rpc_timeout = "15s"

[gas]
gas_adjustment = 1.5
gas_prices = "0.025ukii"
gas_limit = 200000
"#
        )
    }

    fn parse(toml: &str) -> Result<Config> {
        let raw = config::Config::builder()
            .add_source(File::from_str(toml, FileFormat::Toml))
            .build()
            .unwrap();
        let cfg: Config = raw.try_deserialize().unwrap();
        cfg.validate()?;
        Ok(cfg)
    }

    #[test]
    fn test_valid_config() {
        let toml = base_toml(
            r#"
[[currency_pairs]]
base = "ATOM"
chain_denom = "uatom"
quote = "USDT"
providers = ["binance", "kraken", "okx"]

[[currency_pairs]]
base = "USDT"
chain_denom = "uusdt"
quote = "USD"
providers = ["coinbase", "huobi", "gate"]
"#,
            r#"
[[deviation_thresholds]]
base = "ATOM"
threshold = "2"
"#,
        );

        let cfg = parse(&toml).unwrap();
        assert_eq!(cfg.provider_timeout, "100ms");
        assert_eq!(cfg.provider_ping_interval, "20s");
        assert_eq!(
            cfg.provider_ping_interval_duration(),
            Duration::from_secs(20)
        );
        assert_eq!(cfg.chain_denom_mapping()["ATOM"], "uatom");
        assert_eq!(cfg.provider_pairs()["binance"].len(), 1);
        assert_eq!(
            cfg.deviations().unwrap()["ATOM"],
            Decimal::from_str_exact("2").unwrap()
        );
    }

    #[test]
    fn test_rejects_too_few_providers() {
        let toml = base_toml(
            r#"
[[currency_pairs]]
base = "ATOM"
chain_denom = "uatom"
quote = "USD"
providers = ["binance", "kraken"]
"#,
            "",
        );
        let err = parse(&toml).unwrap_err();
        assert!(err.to_string().contains("at least three providers"));
    }

    #[test]
    fn test_mock_provider_lifts_minimum() {
        let toml = base_toml(
            r#"
[[currency_pairs]]
base = "ATOM"
chain_denom = "uatom"
quote = "USD"
providers = ["mock"]
"#,
            "",
        );
        assert!(parse(&toml).is_ok());
    }

    #[test]
    fn test_rejects_unsupported_provider() {
        let toml = base_toml(
            r#"
[[currency_pairs]]
base = "ATOM"
chain_denom = "uatom"
quote = "USD"
providers = ["binance", "kraken", "nyse"]
"#,
            "",
        );
        let err = parse(&toml).unwrap_err();
        assert!(err.to_string().contains("unsupported provider"));
    }

    #[test]
    fn test_rejects_unsupported_quote() {
        let toml = base_toml(
            r#"
[[currency_pairs]]
base = "ATOM"
chain_denom = "uatom"
quote = "JPY"
providers = ["binance", "kraken", "okx"]
"#,
            "",
        );
        let err = parse(&toml).unwrap_err();
        assert!(err.to_string().contains("unsupported quote"));
    }

    #[test]
    fn test_rejects_missing_conversion_path() {
        let toml = base_toml(
            r#"
[[currency_pairs]]
base = "ATOM"
chain_denom = "uatom"
quote = "USDT"
providers = ["binance", "kraken", "okx"]
"#,
            "",
        );
        let err = parse(&toml).unwrap_err();
        assert!(err
            .to_string()
            .contains("all non-usd quotes require a conversion rate feed"));
    }

    #[test]
    fn test_rejects_excessive_deviation_threshold() {
        let toml = base_toml(
            r#"
[[currency_pairs]]
base = "ATOM"
chain_denom = "uatom"
quote = "USD"
providers = ["binance", "kraken", "okx"]
"#,
            r#"
[[deviation_thresholds]]
base = "ATOM"
threshold = "3.5"
"#,
        );
        let err = parse(&toml).unwrap_err();
        assert!(err.to_string().contains("must not exceed"));
    }

    #[test]
    fn test_parse_duration_units() {
        assert_eq!(parse_duration("100ms").unwrap(), Duration::from_millis(100));
        assert_eq!(parse_duration("15s").unwrap(), Duration::from_secs(15));
        assert_eq!(parse_duration("2m").unwrap(), Duration::from_secs(120));
        assert!(parse_duration("15").is_err());
        assert!(parse_duration("15parsecs").is_err());
    }
}
