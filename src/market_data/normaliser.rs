// Convert wire strings and precision metadata into exact decimals.

use std::str::FromStr;

use rust_decimal::Decimal;

use crate::engine::types::PairSpec;
use crate::market_data::adapters::AdapterError;

#[derive(Debug, Clone, Copy)]
pub struct Normaliser {
    /// Step used when a venue reports an increment (or precision) of zero
    pub fallback_increment: Decimal,
}

impl Normaliser {
    pub fn new(fallback_increment: Decimal) -> Self {
        Self { fallback_increment }
    }

    /// Parse a decimal wire string ("1234.56", "1e-8").
    pub fn decimal(&self, field: &str, s: &str) -> Result<Decimal, AdapterError> {
        parse_decimal(field, s)
    }

    /// Prices may be null or empty when a book side is empty.
    pub fn price(&self, field: &str, s: Option<&str>) -> Result<Option<Decimal>, AdapterError> {
        match s.map(str::trim) {
            None | Some("") => Ok(None),
            Some(v) => {
                let p = parse_decimal(field, v)?;
                Ok((p > Decimal::ZERO).then_some(p))
            }
        }
    }

    /// `10^-decimals`, or the fallback step when the venue reports 0 decimals.
    pub fn increment_from_precision(&self, decimals: u32) -> Decimal {
        if decimals == 0 || decimals > 28 {
            return self.fallback_increment;
        }
        Decimal::new(1, decimals)
    }

    pub fn pair_spec(&self, base: &str, quote: &str, price: &str) -> Result<PairSpec, AdapterError> {
        Ok(PairSpec::with_fallback(
            parse_decimal("baseIncrement", base)?,
            parse_decimal("quoteIncrement", quote)?,
            parse_decimal("priceIncrement", price)?,
            self.fallback_increment,
        ))
    }
}

pub fn parse_decimal(field: &str, s: &str) -> Result<Decimal, AdapterError> {
    let s = s.trim();
    let parsed = if s.contains(['e', 'E']) {
        Decimal::from_scientific(s)
    } else {
        Decimal::from_str(s)
    };
    parsed.map_err(|e| AdapterError::Decode(format!("{field}: '{s}' is not a decimal ({e})")))
}
