//! Core types shared by the provider workers, the aggregation engine and the
//! voting loop.

use std::collections::HashMap;
use std::fmt;

use chrono::Utc;
use rust_decimal::{Decimal, RoundingStrategy};
use serde::{Deserialize, Serialize};

/// Quote denom that needs no conversion before voting.
pub const DENOM_USD: &str = "USD";

/// Number of fractional digits carried by on-chain exchange rates.
pub const EXCHANGE_RATE_DECIMALS: u32 = 18;

/// A base/quote pair as understood by the provider workers. The on-chain
/// denom and the provider list live in the configuration; the aggregation
/// pipeline only ever needs these two symbols.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct CurrencyPair {
    pub base: String,
    pub quote: String,
}

impl CurrencyPair {
    pub fn new(base: impl Into<String>, quote: impl Into<String>) -> Self {
        Self {
            base: base.into(),
            quote: quote.into(),
        }
    }

    /// Canonical symbol used as the key of every provider's internal maps,
    /// e.g. `ATOMUSDT`.
    pub fn symbol(&self) -> String {
        format!("{}{}", self.base, self.quote)
    }
}

impl fmt::Display for CurrencyPair {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}{}", self.base, self.quote)
    }
}

/// Latest ticker snapshot reported by one provider for one symbol. Replaced
/// in full on every provider update.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TickerPrice {
    pub price: Decimal,
    pub volume: Decimal,
}

/// One time-indexed sample of a provider's candle stream. Timestamps are
/// unix milliseconds.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CandlePrice {
    pub price: Decimal,
    pub volume: Decimal,
    pub timestamp: i64,
}

/// provider name -> base symbol -> latest ticker.
pub type AggregatedProviderPrices = HashMap<String, HashMap<String, TickerPrice>>;

/// provider name -> base symbol -> candles ordered by timestamp.
pub type AggregatedProviderCandles = HashMap<String, HashMap<String, Vec<CandlePrice>>>;

/// Current wall clock in unix milliseconds.
pub fn now_unix_ms() -> i64 {
    Utc::now().timestamp_millis()
}

/// Unix milliseconds `secs` seconds in the past.
pub fn past_unix_ms(secs: i64) -> i64 {
    now_unix_ms() - secs * 1000
}

/// Round to the 18 fractional digits carried on-chain, banker's rounding.
pub fn round_exchange_rate(value: Decimal) -> Decimal {
    value.round_dp_with_strategy(EXCHANGE_RATE_DECIMALS, RoundingStrategy::MidpointNearestEven)
}

/// Render a price the way the oracle module expects it in a vote payload:
/// exactly 18 fractional digits, no exponent.
pub fn format_exchange_rate(value: Decimal) -> String {
    let mut rounded = round_exchange_rate(value);
    rounded.rescale(EXCHANGE_RATE_DECIMALS);
    rounded.to_string()
}

#[cfg(test)]
mod tests {
    use super::*;
    use rust_decimal_macros::dec;

    #[test]
    fn test_pair_symbol() {
        let pair = CurrencyPair::new("ATOM", "USDT");
        assert_eq!(pair.symbol(), "ATOMUSDT");
        assert_eq!(pair.to_string(), "ATOMUSDT");
    }

    #[test]
    fn test_format_exchange_rate_pads_to_18_digits() {
        assert_eq!(format_exchange_rate(dec!(3.72)), "3.720000000000000000");
        assert_eq!(format_exchange_rate(dec!(1)), "1.000000000000000000");
    }

    #[test]
    fn test_format_exchange_rate_rounds_long_fractions() {
        let long = Decimal::from_str_exact("1.1234567890123456789012").unwrap();
        assert_eq!(format_exchange_rate(long), "1.123456789012345679");
    }
}
