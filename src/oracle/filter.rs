//! Standard-deviation outlier filtering.
//!
//! A provider whose price for a base falls outside the configured band
//! around the cross-provider mean is excluded from that cycle, for that
//! base. With fewer than three providers no deviation exists and nothing is
//! filtered.

use std::collections::HashMap;

use rust_decimal::Decimal;

use crate::oracle::compute::{compute_tvwap_at, standard_deviation};
use crate::types::{
    now_unix_ms, AggregatedProviderCandles, AggregatedProviderPrices,
};

/// Default acceptance band, in standard deviations.
const DEFAULT_DEVIATION_THRESHOLD: Decimal = Decimal::ONE;

/// Filter candles: each provider is represented by the TVWAP of its own
/// candles for the base, and providers outside the band lose that base's
/// candles for this cycle.
pub fn filter_candle_deviations(
    candles: &AggregatedProviderCandles,
    deviations: &HashMap<String, Decimal>,
) -> AggregatedProviderCandles {
    let now = now_unix_ms();
    let mut prices_by_provider: HashMap<String, HashMap<String, Decimal>> = HashMap::new();
    for (provider, per_base) in candles {
        let single = AggregatedProviderCandles::from([(provider.clone(), per_base.clone())]);
        let tvwap = compute_tvwap_at(now, &single);
        prices_by_provider.insert(provider.clone(), tvwap.into_iter().collect());
    }

    let (stddevs, means) = standard_deviation(&prices_by_provider);

    let mut filtered = AggregatedProviderCandles::new();
    for (provider, per_base) in candles {
        for (base, base_candles) in per_base {
            let price = prices_by_provider
                .get(provider)
                .and_then(|m| m.get(base))
                .copied();
            if let Some(price) = price {
                if !within_band(base, price, &stddevs, &means, deviations) {
                    tracing::warn!(
                        %provider,
                        %base,
                        %price,
                        "provider candle price outside the acceptable range"
                    );
                    continue;
                }
            }
            filtered
                .entry(provider.clone())
                .or_default()
                .insert(base.clone(), base_candles.clone());
        }
    }
    filtered
}

/// Ticker analogue of [`filter_candle_deviations`].
pub fn filter_ticker_deviations(
    prices: &AggregatedProviderPrices,
    deviations: &HashMap<String, Decimal>,
) -> AggregatedProviderPrices {
    let mut prices_by_provider: HashMap<String, HashMap<String, Decimal>> = HashMap::new();
    for (provider, per_base) in prices {
        prices_by_provider.insert(
            provider.clone(),
            per_base
                .iter()
                .map(|(base, ticker)| (base.clone(), ticker.price))
                .collect(),
        );
    }

    let (stddevs, means) = standard_deviation(&prices_by_provider);

    let mut filtered = AggregatedProviderPrices::new();
    for (provider, per_base) in prices {
        for (base, ticker) in per_base {
            if !within_band(base, ticker.price, &stddevs, &means, deviations) {
                tracing::warn!(
                    %provider,
                    %base,
                    price = %ticker.price,
                    "provider ticker price outside the acceptable range"
                );
                continue;
            }
            filtered
                .entry(provider.clone())
                .or_default()
                .insert(base.clone(), ticker.clone());
        }
    }
    filtered
}

fn within_band(
    base: &str,
    price: Decimal,
    stddevs: &HashMap<String, Decimal>,
    means: &HashMap<String, Decimal>,
    deviations: &HashMap<String, Decimal>,
) -> bool {
    let (Some(stddev), Some(mean)) = (stddevs.get(base), means.get(base)) else {
        // fewer than three providers: nothing to filter against
        return true;
    };
    let threshold = deviations
        .get(base)
        .copied()
        .unwrap_or(DEFAULT_DEVIATION_THRESHOLD);
    price >= *mean - threshold * *stddev && price <= *mean + threshold * *stddev
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{
        PROVIDER_BINANCE, PROVIDER_COINBASE, PROVIDER_HUOBI, PROVIDER_KRAKEN,
    };
    use crate::types::{past_unix_ms, CandlePrice, TickerPrice};
    use rust_decimal_macros::dec;

    fn candle_fixture() -> AggregatedProviderCandles {
        let atom_candle = vec![CandlePrice {
            price: dec!(29.93),
            volume: dec!(1994674.34),
            timestamp: past_unix_ms(60),
        }];

        let mut candles = AggregatedProviderCandles::new();
        for provider in [PROVIDER_BINANCE, PROVIDER_HUOBI, PROVIDER_KRAKEN] {
            candles.insert(
                provider.to_string(),
                HashMap::from([("ATOM".to_string(), atom_candle.clone())]),
            );
        }
        candles.insert(
            PROVIDER_COINBASE.to_string(),
            HashMap::from([(
                "ATOM".to_string(),
                vec![CandlePrice {
                    price: dec!(27.1),
                    volume: dec!(1994674.34),
                    timestamp: past_unix_ms(60),
                }],
            )]),
        );
        candles
    }

    #[test]
    fn test_candle_filter_drops_single_outlier() {
        let filtered = filter_candle_deviations(&candle_fixture(), &HashMap::new());
        assert!(!filtered.contains_key(PROVIDER_COINBASE));
        assert!(filtered.contains_key(PROVIDER_BINANCE));
        assert!(filtered.contains_key(PROVIDER_HUOBI));
        assert!(filtered.contains_key(PROVIDER_KRAKEN));
    }

    #[test]
    fn test_candle_filter_custom_threshold_keeps_outlier() {
        let deviations = HashMap::from([("ATOM".to_string(), dec!(2))]);
        let filtered = filter_candle_deviations(&candle_fixture(), &deviations);
        assert!(filtered.contains_key(PROVIDER_COINBASE));
    }

    fn ticker_fixture() -> AggregatedProviderPrices {
        let atom_ticker = TickerPrice {
            price: dec!(29.93),
            volume: dec!(1994674.34),
        };

        let mut prices = AggregatedProviderPrices::new();
        for provider in [PROVIDER_BINANCE, PROVIDER_HUOBI, PROVIDER_KRAKEN] {
            prices.insert(
                provider.to_string(),
                HashMap::from([("ATOM".to_string(), atom_ticker.clone())]),
            );
        }
        prices.insert(
            PROVIDER_COINBASE.to_string(),
            HashMap::from([(
                "ATOM".to_string(),
                TickerPrice {
                    price: dec!(27.1),
                    volume: dec!(1994674.34),
                },
            )]),
        );
        prices
    }

    #[test]
    fn test_ticker_filter_drops_single_outlier() {
        let filtered = filter_ticker_deviations(&ticker_fixture(), &HashMap::new());
        assert!(!filtered.contains_key(PROVIDER_COINBASE));
        assert_eq!(filtered.len(), 3);
    }

    #[test]
    fn test_ticker_filter_custom_threshold_keeps_outlier() {
        let deviations = HashMap::from([("ATOM".to_string(), dec!(2))]);
        let filtered = filter_ticker_deviations(&ticker_fixture(), &deviations);
        assert!(filtered.contains_key(PROVIDER_COINBASE));
        assert_eq!(filtered.len(), 4);
    }

    #[test]
    fn test_filter_passes_everything_below_three_providers() {
        let mut prices = AggregatedProviderPrices::new();
        prices.insert(
            PROVIDER_BINANCE.to_string(),
            HashMap::from([(
                "ATOM".to_string(),
                TickerPrice {
                    price: dec!(29.93),
                    volume: dec!(100),
                },
            )]),
        );
        prices.insert(
            PROVIDER_KRAKEN.to_string(),
            HashMap::from([(
                "ATOM".to_string(),
                TickerPrice {
                    price: dec!(5.0),
                    volume: dec!(100),
                },
            )]),
        );

        let filtered = filter_ticker_deviations(&prices, &HashMap::new());
        assert_eq!(filtered.len(), 2);
    }
}
