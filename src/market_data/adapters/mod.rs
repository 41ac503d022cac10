// Shared exchange contract + wire-independent value types

use std::collections::HashMap;

use async_trait::async_trait;
use rust_decimal::Decimal;
use thiserror::Error;

use crate::engine::types::{PairSpec, SizedOrder, TimeInForce};
use crate::market_data::metadata::MetadataCache;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BestPrice {
    pub bid: Option<Decimal>,
    pub ask: Option<Decimal>,
}

impl BestPrice {
    /// Highest price at which `token` can be sold for the other side of the pair.
    /// `token_is_base` selects between the bid and the inverted ask.
    pub fn sell_price(&self, token_is_base: bool) -> Option<Decimal> {
        sell_price(self.bid, self.ask, token_is_base)
    }
}

/// Prices a token in the other leg of its pair. An empty or non-positive side yields `None`,
/// never zero.
pub fn sell_price(bid: Option<Decimal>, ask: Option<Decimal>, token_is_base: bool) -> Option<Decimal> {
    if token_is_base {
        bid.filter(|b| *b > Decimal::ZERO)
    } else {
        ask.filter(|a| *a > Decimal::ZERO).map(|a| Decimal::ONE / a)
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct OrderAck {
    pub order_id: String,
    pub status_code: String,
    pub message: Option<String>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct OrderFill {
    pub filled_base: Decimal,
    pub filled_quote: Decimal,
    pub requested_base: Decimal,
    pub is_active: bool,
}

impl OrderFill {
    /// Nothing matched. A fill with only one side reported is still a position.
    pub fn is_empty(&self) -> bool {
        self.filled_base.is_zero() && self.filled_quote.is_zero()
    }

    pub fn is_partial(&self) -> bool {
        !self.is_empty() && self.filled_base < self.requested_base
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct Balance {
    pub total: Decimal,
    pub available: Decimal,
}

/// Top of book as pushed by a streaming subscription.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RawTick {
    pub best_bid: Option<Decimal>,
    pub best_ask: Option<Decimal>,
    pub sequence: u64,
}

#[derive(Debug, Error)]
pub enum AdapterError {
    #[error("HTTP error: {0}")]
    Http(#[from] reqwest::Error),

    #[error("WebSocket error: {0}")]
    WebSocket(#[from] tokio_tungstenite::tungstenite::Error),

    #[error("JSON parse error: {0}")]
    Parse(#[from] serde_json::Error),

    #[error("malformed response: {0}")]
    Decode(String),

    #[error("pair {0} unavailable")]
    PairUnavailable(String),

    #[error("{exchange} API error {code}: {message}")]
    Api { exchange: String, code: String, message: String },

    #[error("order {0} not found")]
    UnknownOrder(String),

    #[error("insufficient {token} balance: need {needed}, have {available}")]
    InsufficientBalance { token: String, needed: Decimal, available: Decimal },

    #[error("request signing is not configured")]
    MissingSigner,

    #[error("{0} is not supported by this exchange")]
    Unsupported(&'static str),

    #[error("stream ended")]
    StreamEnded,
}

impl AdapterError {
    /// Connection-level failures that a later attempt may not hit again.
    pub fn is_transient(&self) -> bool {
        matches!(
            self,
            AdapterError::Http(_)
                | AdapterError::WebSocket(_)
                | AdapterError::Parse(_)
                | AdapterError::Decode(_)
                | AdapterError::StreamEnded
        )
    }
}

/// A live top-of-book subscription for one pair.
#[async_trait]
pub trait PriceStream: Send {
    /// Next decoded tick; `None` once the connection is gone.
    async fn next_tick(&mut self) -> Option<Result<RawTick, AdapterError>>;

    /// Keep-alive for venues that drop idle connections.
    async fn ping(&mut self) -> Result<(), AdapterError>;

    async fn close(&mut self);
}

/// Capability surface every exchange implementation provides.
///
/// Instances are shared between concurrent reactions. Credentials are read-only after
/// construction; any nonce or timestamp used for signing is produced per call.
#[async_trait]
pub trait ExchangeAdapter: Send + Sync {
    fn name(&self) -> &str;

    /// Status code the venue returns for an accepted order.
    fn success_code(&self) -> &str;

    fn supports_streaming(&self) -> bool {
        false
    }

    /// Pair and token snapshot, refreshed in the background.
    fn metadata(&self) -> &MetadataCache;

    async fn fetch_pairs(&self) -> Result<HashMap<String, PairSpec>, AdapterError>;

    /// Symbol to full token name; empty names when the venue does not publish them.
    async fn fetch_tokens(&self) -> Result<HashMap<String, String>, AdapterError>;

    async fn best_price(&self, pair: &str) -> Result<BestPrice, AdapterError>;

    async fn place_limit_order(
        &self,
        order: &SizedOrder,
        time_in_force: TimeInForce,
    ) -> Result<OrderAck, AdapterError>;

    async fn order_fill(&self, order_id: &str) -> Result<OrderFill, AdapterError>;

    async fn balance(&self, token: &str) -> Result<Balance, AdapterError>;

    async fn subscribe_price_stream(&self, _pair: &str) -> Result<Box<dyn PriceStream>, AdapterError> {
        Err(AdapterError::Unsupported("price streaming"))
    }
}

pub mod kucoin;
pub mod kucoin_types;
pub mod paper;

#[cfg(test)]
mod tests {
    use super::*;
    use rust_decimal_macros::dec;

    #[test]
    fn test_sell_price_orientation() {
        assert_eq!(sell_price(Some(dec!(2)), Some(dec!(4)), true), Some(dec!(2)));
        assert_eq!(sell_price(Some(dec!(2)), Some(dec!(4)), false), Some(dec!(0.25)));
    }

    #[test]
    fn test_sell_price_never_zero() {
        assert_eq!(sell_price(Some(dec!(0)), Some(dec!(1)), true), None);
        assert_eq!(sell_price(None, Some(dec!(0)), false), None);
        assert_eq!(sell_price(None, None, true), None);
    }

    #[test]
    fn test_fill_states() {
        let empty = OrderFill { requested_base: dec!(1), ..Default::default() };
        assert!(empty.is_empty());
        let partial = OrderFill { filled_base: dec!(0.5), filled_quote: dec!(5), requested_base: dec!(1), is_active: false };
        assert!(partial.is_partial());
        // notional not reported yet, but base was bought
        let base_only = OrderFill { filled_base: dec!(1), requested_base: dec!(1), ..Default::default() };
        assert!(!base_only.is_empty());
    }
}
