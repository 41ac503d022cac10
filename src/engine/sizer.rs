// Converts a trade amount into an exchange-legal limit order.
//
// Everything rounds toward zero: a wallet must always be able to cover the order
// that leaves here. The limit price is rounded first and the base quantity is
// derived from the rounded price, so `price * quantity` stays consistent.

use std::collections::HashMap;

use rust_decimal::Decimal;
use tracing::{debug, instrument};

use crate::engine::types::{PairSpec, Side, SizedOrder, SizingError, TradeAmount};

/// Largest multiple of `increment` not exceeding `x` (for positive `x`).
pub fn round_down(x: Decimal, increment: Decimal) -> Decimal {
    if increment <= Decimal::ZERO {
        return x;
    }
    ((x / increment).floor() * increment).normalize()
}

/// Sizes one order on `pair_name`.
///
/// `forward` means the caller gives up the pair's base token (A in A/B) and the order is a
/// sell at no less than `reference_price * (1 - max_impact)`. Otherwise the caller gives
/// up the quote token and buys at no more than `reference_price * (1 + max_impact)`.
/// `reference_price` is always the base token priced in the quote token.
#[instrument(level = "debug", skip(specs))]
pub fn size_order(
    specs: &HashMap<String, PairSpec>,
    pair_name: &str,
    forward: bool,
    amount: TradeAmount,
    reference_price: Decimal,
    max_impact: Decimal,
) -> Result<SizedOrder, SizingError> {
    let spec = specs
        .get(pair_name)
        .ok_or_else(|| SizingError::UnknownPair(pair_name.to_string()))?;

    if reference_price <= Decimal::ZERO {
        return Err(SizingError::InvalidPrice(reference_price));
    }
    if max_impact < Decimal::ZERO || max_impact >= Decimal::ONE {
        return Err(SizingError::InvalidIntent(format!("max impact {max_impact} out of range")));
    }

    let (side, raw_price) = if forward {
        (Side::Sell, reference_price * (Decimal::ONE - max_impact))
    } else {
        (Side::Buy, reference_price * (Decimal::ONE + max_impact))
    };
    let limit_price = round_down(raw_price, spec.price_increment);
    if limit_price <= Decimal::ZERO {
        return Err(SizingError::InvalidPrice(limit_price));
    }

    // base-denominated amounts round straight to the base step; quote-denominated
    // amounts round to the quote step and convert through the rounded limit price
    let base_quantity = match (forward, amount) {
        (true, TradeAmount::Sell(base)) | (false, TradeAmount::Buy(base)) => {
            round_down(base, spec.base_increment)
        }
        (true, TradeAmount::Buy(quote)) | (false, TradeAmount::Sell(quote)) => {
            let quote = round_down(quote, spec.quote_increment);
            round_down(quote / limit_price, spec.base_increment)
        }
    };

    if base_quantity <= Decimal::ZERO {
        return Err(SizingError::EmptyOrder { pair: pair_name.to_string() });
    }

    debug!(pair = pair_name, ?side, %limit_price, %base_quantity, %reference_price, "Sized order");
    Ok(SizedOrder {
        pair: pair_name.to_string(),
        side,
        limit_price,
        base_quantity,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;
    use rust_decimal_macros::dec;

    fn specs() -> HashMap<String, PairSpec> {
        let mut m = HashMap::new();
        m.insert(
            "AAVE-USDT".to_string(),
            PairSpec::new(dec!(0.0001), dec!(0.000001), dec!(0.001)).unwrap(),
        );
        m
    }

    fn is_multiple(x: Decimal, inc: Decimal) -> bool {
        (x / inc).fract().is_zero()
    }

    #[test]
    fn test_round_down_basic() {
        assert_eq!(round_down(dec!(1.23456), dec!(0.01)), dec!(1.23));
        assert_eq!(round_down(dec!(7), dec!(2)), dec!(6));
        assert_eq!(round_down(dec!(0.0009), dec!(0.001)), dec!(0));
    }

    #[test]
    fn test_forward_sell_base_amount() {
        let order = size_order(&specs(), "AAVE-USDT", true, TradeAmount::Sell(dec!(1.23456789)), dec!(100), dec!(0.2)).unwrap();
        assert_eq!(order.side, Side::Sell);
        assert_eq!(order.limit_price, dec!(80));
        assert_eq!(order.base_quantity, dec!(1.2345));
    }

    #[test]
    fn test_reverse_buy_with_quote_amount() {
        // 130 USDT into AAVE at +10% impact: price 110, quantity 130 / 110 floored to 0.0001
        let order = size_order(&specs(), "AAVE-USDT", false, TradeAmount::Sell(dec!(130)), dec!(100), dec!(0.1)).unwrap();
        assert_eq!(order.side, Side::Buy);
        assert_eq!(order.limit_price, dec!(110));
        assert_eq!(order.base_quantity, dec!(1.1818));
        assert!(order.limit_price * order.base_quantity <= dec!(130));
    }

    #[test]
    fn test_forward_quote_amount_uses_rounded_price() {
        let order = size_order(&specs(), "AAVE-USDT", true, TradeAmount::Buy(dec!(50)), dec!(123.4567), dec!(0.05)).unwrap();
        // 123.4567 * 0.95 = 117.283865 -> 117.283
        assert_eq!(order.limit_price, dec!(117.283));
        assert_eq!(order.base_quantity, round_down(dec!(50) / dec!(117.283), dec!(0.0001)));
    }

    #[test]
    fn test_unknown_pair() {
        let res = size_order(&specs(), "DOGE-USDT", true, TradeAmount::Sell(dec!(1)), dec!(1), dec!(0.1));
        assert_eq!(res, Err(SizingError::UnknownPair("DOGE-USDT".into())));
    }

    #[test]
    fn test_dust_is_rejected() {
        let res = size_order(&specs(), "AAVE-USDT", true, TradeAmount::Sell(dec!(0.00001)), dec!(100), dec!(0.1));
        assert!(matches!(res, Err(SizingError::EmptyOrder { .. })));
    }

    #[test]
    fn test_non_positive_reference_price() {
        let res = size_order(&specs(), "AAVE-USDT", true, TradeAmount::Sell(dec!(1)), dec!(0), dec!(0.1));
        assert!(matches!(res, Err(SizingError::InvalidPrice(_))));
    }

    fn decimal(lo: i64, hi: i64, scale: u32) -> impl Strategy<Value = Decimal> {
        (lo..hi).prop_map(move |n| Decimal::new(n, scale))
    }

    proptest! {
        #[test]
        fn prop_round_down_idempotent(x in decimal(1, 10_000_000_000, 6), inc in decimal(1, 100_000, 4)) {
            let once = round_down(x, inc);
            prop_assert_eq!(round_down(once, inc), once);
            prop_assert!(once <= x);
        }

        #[test]
        fn prop_forward_limit_never_above_reference(
            ticks in 1i64..10_000_000,
            impact in decimal(1, 999, 3),
            amount in decimal(1, 1_000_000, 2),
        ) {
            let reference = Decimal::new(ticks, 3);
            if let Ok(order) = size_order(&specs(), "AAVE-USDT", true, TradeAmount::Sell(amount), reference, impact) {
                prop_assert!(order.limit_price <= reference);
                prop_assert!(is_multiple(order.limit_price, dec!(0.001)));
                prop_assert!(is_multiple(order.base_quantity, dec!(0.0001)));
            }
        }

        #[test]
        fn prop_reverse_limit_never_below_reference(
            ticks in 1i64..10_000_000,
            impact in decimal(1, 999, 3),
            amount in decimal(1, 1_000_000, 2),
        ) {
            // reference on the price grid, as every venue quote is
            let reference = Decimal::new(ticks, 3);
            if let Ok(order) = size_order(&specs(), "AAVE-USDT", false, TradeAmount::Sell(amount), reference, impact) {
                prop_assert!(order.limit_price >= reference);
                prop_assert!(is_multiple(order.limit_price, dec!(0.001)));
                prop_assert!(is_multiple(order.base_quantity, dec!(0.0001)));
                prop_assert!(order.limit_price * order.base_quantity <= amount);
            }
        }
    }
}
