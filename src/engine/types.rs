use std::fmt;

use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use thiserror::Error;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Side {
    Buy,
    Sell,
}

impl Side {
    pub fn as_str(&self) -> &'static str {
        match self {
            Side::Buy => "buy",
            Side::Sell => "sell",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum TimeInForce {
    /// Good till cancelled
    Gtc,
    /// Immediate or cancel
    Ioc,
}

impl TimeInForce {
    pub fn as_str(&self) -> &'static str {
        match self {
            TimeInForce::Gtc => "GTC",
            TimeInForce::Ioc => "IOC",
        }
    }
}

/// Step sizes for one tradeable pair. All three are strictly positive.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct PairSpec {
    pub base_increment: Decimal,
    pub quote_increment: Decimal,
    pub price_increment: Decimal,
}

impl PairSpec {
    pub fn new(
        base_increment: Decimal,
        quote_increment: Decimal,
        price_increment: Decimal,
    ) -> Result<Self, SizingError> {
        for (name, inc) in [
            ("base", base_increment),
            ("quote", quote_increment),
            ("price", price_increment),
        ] {
            if inc <= Decimal::ZERO {
                return Err(SizingError::ZeroIncrement { which: name });
            }
        }
        Ok(Self { base_increment, quote_increment, price_increment })
    }

    /// Builds a spec where any non-positive increment is replaced by `fallback`.
    /// Venues that only publish a precision can report 0, which must never reach a division.
    pub fn with_fallback(
        base_increment: Decimal,
        quote_increment: Decimal,
        price_increment: Decimal,
        fallback: Decimal,
    ) -> Self {
        let pick = |inc: Decimal| if inc > Decimal::ZERO { inc } else { fallback };
        Self {
            base_increment: pick(base_increment),
            quote_increment: pick(quote_increment),
            price_increment: pick(price_increment),
        }
    }
}

/// Which side of the trade the caller fixed the amount on.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TradeAmount {
    /// Amount of the token being given up
    Sell(Decimal),
    /// Amount of the token being acquired
    Buy(Decimal),
}

impl TradeAmount {
    pub fn value(&self) -> Decimal {
        match self {
            TradeAmount::Sell(v) | TradeAmount::Buy(v) => *v,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TradeIntent {
    pub sell_token: String,
    pub buy_token: String,
    pub amount: TradeAmount,
    pub max_impact: Decimal,
    pub time_in_force: TimeInForce,
}

impl TradeIntent {
    /// Validates the raw intent: exactly one amount, positive, and `max_impact` in `[0, 1)`.
    pub fn new(
        sell_token: &str,
        buy_token: &str,
        amount_sell: Option<Decimal>,
        amount_buy: Option<Decimal>,
        max_impact: Decimal,
        time_in_force: TimeInForce,
    ) -> Result<Self, SizingError> {
        let amount = match (amount_sell, amount_buy) {
            (Some(v), None) => TradeAmount::Sell(v),
            (None, Some(v)) => TradeAmount::Buy(v),
            (Some(_), Some(_)) => {
                return Err(SizingError::InvalidIntent("both sell and buy amounts set".into()))
            }
            (None, None) => {
                return Err(SizingError::InvalidIntent("no amount specified".into()))
            }
        };
        if amount.value() <= Decimal::ZERO {
            return Err(SizingError::InvalidIntent(format!(
                "amount must be positive, got {}",
                amount.value()
            )));
        }
        if max_impact < Decimal::ZERO || max_impact >= Decimal::ONE {
            return Err(SizingError::InvalidIntent(format!(
                "max impact must be in [0, 1), got {max_impact}"
            )));
        }
        if sell_token == buy_token {
            return Err(SizingError::InvalidIntent(format!("cannot trade {sell_token} for itself")));
        }
        Ok(Self {
            sell_token: sell_token.to_string(),
            buy_token: buy_token.to_string(),
            amount,
            max_impact,
            time_in_force,
        })
    }

    pub fn sell(
        sell_token: &str,
        buy_token: &str,
        amount_sell: Decimal,
        max_impact: Decimal,
        time_in_force: TimeInForce,
    ) -> Result<Self, SizingError> {
        Self::new(sell_token, buy_token, Some(amount_sell), None, max_impact, time_in_force)
    }
}

/// Exchange-legal limit order produced by the sizer.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SizedOrder {
    pub pair: String,
    pub side: Side,
    pub limit_price: Decimal,
    pub base_quantity: Decimal,
}

/// One price push. `value` is always strictly positive; failures travel as `FeedError`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PriceObservation {
    pub value: Decimal,
    pub sequence: u64,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum ExitReason {
    ProfitTake,
    StopLoss,
    TrailingStop,
    Cancelled,
    FeedLost,
}

impl ExitReason {
    pub fn as_str(&self) -> &'static str {
        match self {
            ExitReason::ProfitTake => "profit-take",
            ExitReason::StopLoss => "stop-loss",
            ExitReason::TrailingStop => "trailing-stop hit",
            ExitReason::Cancelled => "cancelled",
            ExitReason::FeedLost => "feed lost",
        }
    }
}

impl fmt::Display for ExitReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum SizingError {
    #[error("invalid trade intent: {0}")]
    InvalidIntent(String),
    #[error("unknown pair {0}")]
    UnknownPair(String),
    #[error("{which} increment must be positive")]
    ZeroIncrement { which: &'static str },
    #[error("reference price must be positive, got {0}")]
    InvalidPrice(Decimal),
    #[error("order on {pair} rounds down to zero quantity")]
    EmptyOrder { pair: String },
}

#[cfg(test)]
mod tests {
    use super::*;
    use rust_decimal_macros::dec;

    #[test]
    fn test_intent_requires_exactly_one_amount() {
        let both = TradeIntent::new("USDT", "AAVE", Some(dec!(1)), Some(dec!(1)), dec!(0.1), TimeInForce::Ioc);
        assert!(matches!(both, Err(SizingError::InvalidIntent(_))));

        let neither = TradeIntent::new("USDT", "AAVE", None, None, dec!(0.1), TimeInForce::Ioc);
        assert!(matches!(neither, Err(SizingError::InvalidIntent(_))));

        let buy = TradeIntent::new("USDT", "AAVE", None, Some(dec!(2)), dec!(0.1), TimeInForce::Ioc).unwrap();
        assert_eq!(buy.amount, TradeAmount::Buy(dec!(2)));
    }

    #[test]
    fn test_intent_rejects_bad_impact() {
        let res = TradeIntent::sell("USDT", "AAVE", dec!(10), dec!(1), TimeInForce::Ioc);
        assert!(matches!(res, Err(SizingError::InvalidIntent(_))));
        let res = TradeIntent::sell("USDT", "AAVE", dec!(10), dec!(-0.1), TimeInForce::Ioc);
        assert!(matches!(res, Err(SizingError::InvalidIntent(_))));
    }

    #[test]
    fn test_pair_spec_fallback() {
        let spec = PairSpec::with_fallback(dec!(0), dec!(0.001), dec!(0), dec!(0.01));
        assert_eq!(spec.base_increment, dec!(0.01));
        assert_eq!(spec.quote_increment, dec!(0.001));
        assert_eq!(spec.price_increment, dec!(0.01));

        assert_eq!(
            PairSpec::new(dec!(0.1), dec!(0), dec!(0.1)),
            Err(SizingError::ZeroIncrement { which: "quote" })
        );
    }

    #[test]
    fn test_exit_reason_labels() {
        assert_eq!(ExitReason::TrailingStop.to_string(), "trailing-stop hit");
        assert_eq!(ExitReason::ProfitTake.as_str(), "profit-take");
    }
}
