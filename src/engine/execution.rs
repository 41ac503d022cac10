// Turn a trade intent into one placed, sized order and its fill.

use std::time::Duration;

use rust_decimal::Decimal;
use thiserror::Error;
use tracing::{debug, info, instrument, warn};

use crate::engine::sizer::size_order;
use crate::engine::types::{SizedOrder, SizingError, TradeIntent};
use crate::market_data::adapters::{AdapterError, ExchangeAdapter, OrderAck, OrderFill};
use crate::market_data::metadata::MarketRef;

const FILL_POLL_ATTEMPTS: usize = 5;
const FILL_POLL_DELAY: Duration = Duration::from_millis(200);

#[derive(Debug, Error)]
pub enum ExecutionError {
    #[error(transparent)]
    Sizing(#[from] SizingError),
    #[error(transparent)]
    Adapter(#[from] AdapterError),
    #[error("no pair trades {sell} against {buy}")]
    NoMarket { sell: String, buy: String },
    #[error("no bid on {0} to price the order")]
    NoReferencePrice(String),
    #[error("order rejected with code {code}: {message}")]
    OrderRejected { code: String, message: String },
}

/// One placed order and what it filled.
#[derive(Debug, Clone)]
pub struct Execution {
    pub market: MarketRef,
    pub order: SizedOrder,
    pub ack: OrderAck,
    pub fill: OrderFill,
}

impl Execution {
    /// Realized price of `token` in the pair's other token; `None` unless both sides filled.
    pub fn average_price(&self, token: &str) -> Option<Decimal> {
        let (base, quote) = (self.fill.filled_base, self.fill.filled_quote);
        if base.is_zero() || quote.is_zero() {
            return None;
        }
        let price = if self.market.is_base(token) { quote / base } else { base / quote };
        Some(price.normalize())
    }

    /// Limit price of `token` in the pair's other token, the worst price the order accepted.
    pub fn limit_price(&self, token: &str) -> Decimal {
        if self.market.is_base(token) {
            self.order.limit_price
        } else {
            (Decimal::ONE / self.order.limit_price).normalize()
        }
    }
}

#[instrument(skip(adapter, intent), fields(exchange = adapter.name(), sell = %intent.sell_token, buy = %intent.buy_token))]
pub async fn execute_intent(
    adapter: &dyn ExchangeAdapter,
    intent: &TradeIntent,
) -> Result<Execution, ExecutionError> {
    let meta = adapter.metadata().snapshot();
    let market = meta
        .resolve(&intent.sell_token, &intent.buy_token)
        .ok_or_else(|| ExecutionError::NoMarket {
            sell: intent.sell_token.clone(),
            buy: intent.buy_token.clone(),
        })?;
    let forward = market.is_base(&intent.sell_token);

    let best = adapter.best_price(&market.pair).await?;
    let reference = best
        .sell_price(true)
        .ok_or_else(|| ExecutionError::NoReferencePrice(market.pair.clone()))?;

    let order = size_order(
        &meta.pairs,
        &market.pair,
        forward,
        intent.amount,
        reference,
        intent.max_impact,
    )?;

    let ack = adapter.place_limit_order(&order, intent.time_in_force).await?;
    if ack.status_code != adapter.success_code() {
        warn!(code = %ack.status_code, message = ?ack.message, "Order rejected");
        return Err(ExecutionError::OrderRejected {
            code: ack.status_code,
            message: ack.message.unwrap_or_default(),
        });
    }

    let fill = await_fill(adapter, &ack.order_id).await?;
    info!(
        order_id = %ack.order_id,
        pair = %order.pair,
        side = order.side.as_str(),
        filled_base = %fill.filled_base,
        filled_quote = %fill.filled_quote,
        "Order done"
    );
    Ok(Execution { market, order, ack, fill })
}

/// Re-reads the fill while the venue still reports the order as working.
async fn await_fill(adapter: &dyn ExchangeAdapter, order_id: &str) -> Result<OrderFill, AdapterError> {
    let mut fill = adapter.order_fill(order_id).await?;
    for _ in 1..FILL_POLL_ATTEMPTS {
        if !fill.is_active {
            break;
        }
        debug!(order_id, "Order still active, polling fill");
        tokio::time::sleep(FILL_POLL_DELAY).await;
        fill = adapter.order_fill(order_id).await?;
    }
    Ok(fill)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::engine::types::{PairSpec, Side, TimeInForce};
    use crate::market_data::adapters::paper::PaperAdapter;
    use crate::market_data::metadata::refresh_metadata;
    use rust_decimal_macros::dec;

    async fn paper() -> PaperAdapter {
        let paper = PaperAdapter::new("paper")
            .with_pair("AAVE-USDT", PairSpec::new(dec!(0.0001), dec!(0.01), dec!(0.01)).unwrap())
            .with_token("AAVE", "Aave")
            .with_token("USDT", "Tether");
        paper.set_quote("AAVE-USDT", Some(dec!(100)), Some(dec!(100.5)));
        paper.set_balance("USDT", dec!(1000));
        refresh_metadata(&paper).await.unwrap();
        paper
    }

    #[tokio::test]
    async fn test_buy_with_quote_amount() {
        let paper = paper().await;
        let intent = TradeIntent::sell("USDT", "AAVE", dec!(130), dec!(0.1), TimeInForce::Ioc).unwrap();
        let exec = execute_intent(&paper, &intent).await.unwrap();

        assert_eq!(exec.order.side, Side::Buy);
        assert_eq!(exec.order.limit_price, dec!(110));
        assert_eq!(exec.order.base_quantity, dec!(1.1818));
        assert_eq!(exec.average_price("AAVE"), Some(dec!(100.5)));
        assert_eq!(paper.balance_of("AAVE"), dec!(1.1818));
        assert_eq!(exec.limit_price("AAVE"), dec!(110));
    }

    #[tokio::test]
    async fn test_one_sided_fill_has_no_average() {
        let paper = paper().await;
        let intent = TradeIntent::sell("USDT", "AAVE", dec!(130), dec!(0.1), TimeInForce::Ioc).unwrap();
        let mut exec = execute_intent(&paper, &intent).await.unwrap();
        exec.fill.filled_quote = Decimal::ZERO;

        assert!(!exec.fill.is_empty());
        assert_eq!(exec.average_price("AAVE"), None);
        assert_eq!(exec.limit_price("USDT"), dec!(1) / dec!(110));
    }

    #[tokio::test]
    async fn test_sell_base_amount() {
        let paper = paper().await;
        paper.set_balance("AAVE", dec!(2));
        let intent = TradeIntent::sell("AAVE", "USDT", dec!(2), dec!(0.2), TimeInForce::Ioc).unwrap();
        let exec = execute_intent(&paper, &intent).await.unwrap();

        assert_eq!(exec.order.side, Side::Sell);
        assert_eq!(exec.order.limit_price, dec!(80));
        assert_eq!(exec.fill.filled_quote, dec!(200));
        assert_eq!(paper.balance_of("AAVE"), dec!(0));
    }

    #[tokio::test]
    async fn test_rejection_code_surfaces() {
        let paper = paper().await;
        paper.reject_orders_with("400100");
        let intent = TradeIntent::sell("USDT", "AAVE", dec!(130), dec!(0.1), TimeInForce::Ioc).unwrap();
        let err = execute_intent(&paper, &intent).await.unwrap_err();
        assert!(matches!(err, ExecutionError::OrderRejected { ref code, .. } if code == "400100"));
    }

    #[tokio::test]
    async fn test_unknown_market() {
        let paper = paper().await;
        let intent = TradeIntent::sell("USDT", "DOGE", dec!(130), dec!(0.1), TimeInForce::Ioc).unwrap();
        let err = execute_intent(&paper, &intent).await.unwrap_err();
        assert!(matches!(err, ExecutionError::NoMarket { .. }));
    }
}
