//! Price computation: VWAP, TVWAP, standard deviation and USD conversion.
//!
//! All functions are pure over the sampled provider snapshots; the voting
//! loop owns the only clock they see.

use std::collections::{BTreeMap, HashMap, HashSet};

use rust_decimal::{Decimal, MathematicalOps};

use crate::oracle::filter::{filter_candle_deviations, filter_ticker_deviations};
use crate::oracle::OracleError;
use crate::types::{
    now_unix_ms, round_exchange_rate, AggregatedProviderCandles, AggregatedProviderPrices,
    CurrencyPair, DENOM_USD,
};

/// Sliding window considered by the time-volume-weighted average.
pub const TVWAP_PERIOD_MS: i64 = 3 * 60 * 1000;

/// The filter needs this many independent observations before it trusts a
/// standard deviation.
const MIN_DEVIATION_SAMPLES: usize = 3;

/// Volume-weighted average price per base across all providers. When every
/// reported volume is zero the weights degrade to unity and the result is
/// the arithmetic mean.
pub fn compute_vwap(prices: &AggregatedProviderPrices) -> BTreeMap<String, Decimal> {
    let mut weighted_sum: HashMap<&str, Decimal> = HashMap::new();
    let mut volume_sum: HashMap<&str, Decimal> = HashMap::new();
    let mut price_sum: HashMap<&str, Decimal> = HashMap::new();
    let mut counts: HashMap<&str, u32> = HashMap::new();

    for tickers in prices.values() {
        for (base, ticker) in tickers {
            *weighted_sum.entry(base).or_insert(Decimal::ZERO) += ticker.price * ticker.volume;
            *volume_sum.entry(base).or_insert(Decimal::ZERO) += ticker.volume;
            *price_sum.entry(base).or_insert(Decimal::ZERO) += ticker.price;
            *counts.entry(base).or_insert(0) += 1;
        }
    }

    let mut vwap = BTreeMap::new();
    for (base, count) in counts {
        let volume = volume_sum[base];
        let price = if volume.is_zero() {
            price_sum[base] / Decimal::from(count)
        } else {
            weighted_sum[base] / volume
        };
        vwap.insert(base.to_string(), round_exchange_rate(price));
    }
    vwap
}

/// Time- and volume-weighted average over the candles of the last three
/// minutes, evaluated at the current wall clock.
pub fn compute_tvwap(candles: &AggregatedProviderCandles) -> BTreeMap<String, Decimal> {
    compute_tvwap_at(now_unix_ms(), candles)
}

/// TVWAP against an explicit `now`. Each candle's weight is its volume
/// scaled linearly by its distance from the window start, so newer candles
/// dominate. All-zero weights degrade to the arithmetic mean.
pub fn compute_tvwap_at(now_ms: i64, candles: &AggregatedProviderCandles) -> BTreeMap<String, Decimal> {
    let window_start = now_ms - TVWAP_PERIOD_MS;

    let mut weighted_sum: HashMap<&str, Decimal> = HashMap::new();
    let mut weight_sum: HashMap<&str, Decimal> = HashMap::new();
    let mut price_sum: HashMap<&str, Decimal> = HashMap::new();
    let mut counts: HashMap<&str, u32> = HashMap::new();

    for per_base in candles.values() {
        for (base, candles) in per_base {
            for candle in candles {
                if candle.timestamp < window_start {
                    continue;
                }
                let time_weight = Decimal::from(candle.timestamp - window_start);
                let weight = candle.volume * time_weight;
                *weighted_sum.entry(base).or_insert(Decimal::ZERO) += candle.price * weight;
                *weight_sum.entry(base).or_insert(Decimal::ZERO) += weight;
                *price_sum.entry(base).or_insert(Decimal::ZERO) += candle.price;
                *counts.entry(base).or_insert(0) += 1;
            }
        }
    }

    let mut tvwap = BTreeMap::new();
    for (base, count) in counts {
        let weight = weight_sum[base];
        let price = if weight.is_zero() {
            price_sum[base] / Decimal::from(count)
        } else {
            weighted_sum[base] / weight
        };
        tvwap.insert(base.to_string(), round_exchange_rate(price));
    }
    tvwap
}

/// Population mean and standard deviation of each base's per-provider
/// prices. Bases observed by fewer than three providers are omitted.
pub fn standard_deviation(
    prices: &HashMap<String, HashMap<String, Decimal>>,
) -> (HashMap<String, Decimal>, HashMap<String, Decimal>) {
    let mut samples: HashMap<&str, Vec<Decimal>> = HashMap::new();
    for per_base in prices.values() {
        for (base, price) in per_base {
            samples.entry(base).or_default().push(*price);
        }
    }

    let mut deviations = HashMap::new();
    let mut means = HashMap::new();
    for (base, prices) in samples {
        if prices.len() < MIN_DEVIATION_SAMPLES {
            continue;
        }
        let count = Decimal::from(prices.len());
        let mean = prices.iter().sum::<Decimal>() / count;
        let variance = prices
            .iter()
            .map(|price| (*price - mean) * (*price - mean))
            .sum::<Decimal>()
            / count;
        let deviation = variance.sqrt().unwrap_or(Decimal::ZERO);
        means.insert(base.to_string(), round_exchange_rate(mean));
        deviations.insert(base.to_string(), round_exchange_rate(deviation));
    }
    (deviations, means)
}

/// Replace non-USD-quoted candle prices with their USD value. The
/// conversion rate for each quote is the filtered TVWAP of that quote's own
/// USD feed, computed from the same cycle's candles. Symbols carried by a
/// provider outside its registered pairs pass through unconverted; the
/// deviation filter deals with them afterwards.
pub fn convert_candles_to_usd(
    candles: &AggregatedProviderCandles,
    provider_pairs: &HashMap<String, Vec<CurrencyPair>>,
    deviations: &HashMap<String, Decimal>,
) -> AggregatedProviderCandles {
    if candles.is_empty() {
        return candles.clone();
    }

    let mut conversion_rates: HashMap<String, Decimal> = HashMap::new();
    for quote in non_usd_quotes(provider_pairs) {
        let mut rate_candles: AggregatedProviderCandles = HashMap::new();
        for (provider, pairs) in provider_pairs {
            let registered = pairs
                .iter()
                .any(|pair| pair.base == quote && pair.quote == DENOM_USD);
            if !registered {
                continue;
            }
            if let Some(quote_candles) = candles.get(provider).and_then(|m| m.get(&quote)) {
                rate_candles
                    .entry(provider.clone())
                    .or_default()
                    .insert(quote.clone(), quote_candles.clone());
            }
        }

        let filtered = filter_candle_deviations(&rate_candles, deviations);
        if let Some(rate) = compute_tvwap(&filtered).remove(&quote) {
            conversion_rates.insert(quote, rate);
        }
    }

    let mut converted = candles.clone();
    for (provider, pairs) in provider_pairs {
        for pair in pairs {
            if pair.quote == DENOM_USD {
                continue;
            }
            let Some(rate) = conversion_rates.get(&pair.quote) else {
                continue;
            };
            if let Some(candles) = converted
                .get_mut(provider)
                .and_then(|m| m.get_mut(&pair.base))
            {
                for candle in candles {
                    candle.price = round_exchange_rate(candle.price * rate);
                }
            }
        }
    }
    converted
}

/// Ticker analogue of [`convert_candles_to_usd`], using filtered VWAP for
/// the conversion rates.
pub fn convert_tickers_to_usd(
    prices: &AggregatedProviderPrices,
    provider_pairs: &HashMap<String, Vec<CurrencyPair>>,
    deviations: &HashMap<String, Decimal>,
) -> AggregatedProviderPrices {
    if prices.is_empty() {
        return prices.clone();
    }

    let mut conversion_rates: HashMap<String, Decimal> = HashMap::new();
    for quote in non_usd_quotes(provider_pairs) {
        let mut rate_tickers: AggregatedProviderPrices = HashMap::new();
        for (provider, pairs) in provider_pairs {
            let registered = pairs
                .iter()
                .any(|pair| pair.base == quote && pair.quote == DENOM_USD);
            if !registered {
                continue;
            }
            if let Some(ticker) = prices.get(provider).and_then(|m| m.get(&quote)) {
                rate_tickers
                    .entry(provider.clone())
                    .or_default()
                    .insert(quote.clone(), ticker.clone());
            }
        }

        let filtered = filter_ticker_deviations(&rate_tickers, deviations);
        if let Some(rate) = compute_vwap(&filtered).remove(&quote) {
            conversion_rates.insert(quote, rate);
        }
    }

    let mut converted = prices.clone();
    for (provider, pairs) in provider_pairs {
        for pair in pairs {
            if pair.quote == DENOM_USD {
                continue;
            }
            let Some(rate) = conversion_rates.get(&pair.quote) else {
                continue;
            };
            if let Some(ticker) = converted
                .get_mut(provider)
                .and_then(|m| m.get_mut(&pair.base))
            {
                ticker.price = round_exchange_rate(ticker.price * rate);
            }
        }
    }
    converted
}

fn non_usd_quotes(provider_pairs: &HashMap<String, Vec<CurrencyPair>>) -> HashSet<String> {
    provider_pairs
        .values()
        .flatten()
        .filter(|pair| pair.quote != DENOM_USD)
        .map(|pair| pair.quote.clone())
        .collect()
}

/// One full aggregation cycle over the sampled snapshots: convert to USD,
/// filter outliers, prefer TVWAP over candles and fall back to ticker VWAP
/// when the candle path cannot price every required base.
pub fn get_computed_prices(
    provider_candles: &AggregatedProviderCandles,
    provider_prices: &AggregatedProviderPrices,
    provider_pairs: &HashMap<String, Vec<CurrencyPair>>,
    deviations: &HashMap<String, Decimal>,
    required_rates: &HashSet<String>,
) -> Result<BTreeMap<String, Decimal>, OracleError> {
    let converted_candles = convert_candles_to_usd(provider_candles, provider_pairs, deviations);
    let filtered_candles = filter_candle_deviations(&converted_candles, deviations);
    let tvwap = compute_tvwap(&filtered_candles);

    if !tvwap.is_empty() && required_rates.iter().all(|base| tvwap.contains_key(base)) {
        return Ok(tvwap);
    }

    let converted_tickers = convert_tickers_to_usd(provider_prices, provider_pairs, deviations);
    let filtered_tickers = filter_ticker_deviations(&converted_tickers, deviations);
    let vwap = compute_vwap(&filtered_tickers);

    for base in required_rates {
        if !vwap.contains_key(base) {
            return Err(OracleError::InsufficientData(base.clone()));
        }
    }
    Ok(vwap)
}
