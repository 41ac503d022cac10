use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use rust_decimal::Decimal;
use rust_decimal_macros::dec;
use tokio::sync::mpsc;

use listx_rs::config::{FeedSettings, ReactionSettings};
use listx_rs::engine::trailing::TrailingParams;
use listx_rs::engine::types::{ExitReason, PairSpec, SizedOrder, TimeInForce};
use listx_rs::market_data::adapters::paper::{PaperAdapter, StreamEvent};
use listx_rs::market_data::adapters::{
    AdapterError, Balance, BestPrice, ExchangeAdapter, OrderAck, OrderFill, PriceStream, RawTick,
};
use listx_rs::market_data::feed::AdaptiveFeedFactory;
use listx_rs::market_data::metadata::{refresh_metadata, MetadataCache};
use listx_rs::reactor::router::{ListingEvent, Router};
use listx_rs::reactor::{ReactionError, Reactor};

const PAIR: &str = "AAVE-USDT";

async fn exchange(name: &str) -> Arc<PaperAdapter> {
    let paper = PaperAdapter::new(name)
        .with_pair(PAIR, PairSpec::new(dec!(0.0001), dec!(0.01), dec!(0.01)).unwrap())
        .with_token("AAVE", "Aave")
        .with_token("USDT", "Tether")
        .with_streaming();
    paper.set_quote(PAIR, Some(dec!(100)), Some(dec!(100)));
    paper.set_balance("USDT", dec!(1000));
    refresh_metadata(&paper).await.unwrap();
    Arc::new(paper)
}

fn reactor() -> Arc<Reactor> {
    let feed = FeedSettings { warmup_ms: 0, ..FeedSettings::default() };
    let reaction = ReactionSettings { tick_timeout_ms: 100, retry_delay_ms: 10, ..ReactionSettings::default() };
    Arc::new(Reactor::new(
        Arc::new(AdaptiveFeedFactory::new(feed)),
        reaction,
        TrailingParams::default(),
    ))
}

fn push(tx: &mpsc::UnboundedSender<StreamEvent>, prices: &[Decimal]) {
    for (i, p) in prices.iter().enumerate() {
        let tick = RawTick { best_bid: Some(*p), best_ask: None, sequence: i as u64 + 1 };
        tx.send(StreamEvent::Tick(tick)).unwrap();
    }
}

async fn react(reactor: &Reactor, paper: &Arc<PaperAdapter>, symbol: &str, name: &str) -> listx_rs::reactor::ReactionResult {
    react_on(reactor, paper.clone(), symbol, name).await
}

async fn react_on(
    reactor: &Reactor,
    adapter: Arc<dyn ExchangeAdapter>,
    symbol: &str,
    name: &str,
) -> listx_rs::reactor::ReactionResult {
    tokio::time::timeout(
        Duration::from_secs(10),
        reactor.react(adapter, symbol, name, dec!(0.1), dec!(130)),
    )
    .await
    .expect("reaction hung")
}

#[tokio::test]
async fn name_mismatch_places_no_order() {
    let paper = exchange("paper").await;
    let result = react(&reactor(), &paper, "AAVE", "Totally Unrelated Token").await;

    assert!(matches!(result, Err(ReactionError::NameMismatch { .. })));
    assert!(paper.placed_orders().is_empty());
}

#[tokio::test]
async fn unlisted_symbol_is_rejected() {
    let paper = exchange("paper").await;
    let result = react(&reactor(), &paper, "DOGE", "Dogecoin").await;
    assert!(matches!(result, Err(ReactionError::NotListed { .. })));
}

#[tokio::test]
async fn empty_fill_aborts_without_tracking() {
    let paper = exchange("paper").await;
    paper.fill_nothing(true);

    let result = react(&reactor(), &paper, "AAVE", "Aave").await;
    assert!(matches!(result, Err(ReactionError::EmptyFill)));
    assert_eq!(paper.placed_orders().len(), 1);
    assert_eq!(paper.subscriptions(), 0);
}

#[tokio::test]
async fn rejected_acquisition_is_reported() {
    let paper = exchange("paper").await;
    paper.reject_orders_with("400100");

    let result = react(&reactor(), &paper, "AAVE", "Aave").await;
    assert!(matches!(result, Err(ReactionError::OrderRejected { ref code, .. }) if code == "400100"));
}

#[tokio::test]
async fn profit_take_exit() {
    let paper = exchange("paper").await;
    let tx = paper.queue_stream(PAIR);
    push(&tx, &[dec!(150), dec!(210)]);

    let report = react(&reactor(), &paper, "AAVE", "Aave").await.unwrap();
    assert_eq!(report.exit_reason, ExitReason::ProfitTake);
    assert_eq!(report.entry_price, dec!(100));
    assert_eq!(report.trigger_price, Some(dec!(210)));
    assert_eq!(report.filled_base, dec!(1.1818));
    assert_eq!(paper.balance_of("AAVE"), dec!(0));
}

#[tokio::test]
async fn trailing_stop_exit() {
    let paper = exchange("paper").await;
    let tx = paper.queue_stream(PAIR);
    push(&tx, &[dec!(100), dec!(130), dec!(115)]);

    let report = react(&reactor(), &paper, "AAVE", "Aave").await.unwrap();
    assert_eq!(report.exit_reason, ExitReason::TrailingStop);
    assert_eq!(report.max_reached_price, dec!(130));
    assert_eq!(report.trailing_sell_price, dec!(117));
    assert_eq!(report.trigger_price, Some(dec!(115)));
}

#[tokio::test]
async fn duplicate_reaction_is_refused_and_cancel_sells_out() {
    let paper = exchange("paper").await;
    let _tx = paper.queue_stream(PAIR);
    let reactor = reactor();

    let first = {
        let reactor = Arc::clone(&reactor);
        let adapter: Arc<dyn ExchangeAdapter> = paper.clone();
        tokio::spawn(async move { reactor.react(adapter, "AAVE", "Aave", dec!(0.1), dec!(130)).await })
    };
    tokio::time::timeout(Duration::from_secs(5), async {
        while paper.subscriptions() == 0 {
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
    })
    .await
    .unwrap();

    let second = react(&reactor, &paper, "AAVE", "Aave").await;
    assert!(matches!(second, Err(ReactionError::AlreadyActive { .. })));
    assert_eq!(reactor.active(), vec![("paper".to_string(), "AAVE".to_string())]);

    assert!(reactor.cancel("paper", "AAVE"));
    let report = first.await.unwrap().unwrap();
    assert_eq!(report.exit_reason, ExitReason::Cancelled);
    assert_eq!(paper.balance_of("AAVE"), dec!(0));
    assert!(reactor.active().is_empty());
}

#[tokio::test]
async fn router_reacts_on_every_exchange() {
    let a = exchange("a").await;
    let b = exchange("b").await;
    let router = Router::new(reactor(), vec![a.clone() as Arc<dyn ExchangeAdapter>, b.clone()]);

    let event = ListingEvent { symbol: "AAVE".into(), token_name: "Some Other Coin".into() };
    let handles = router.dispatch(&event);
    assert_eq!(handles.len(), 2);
    for handle in handles {
        let result = handle.await.unwrap();
        assert!(matches!(result, Err(ReactionError::NameMismatch { .. })));
    }
}

/// Venue that reports the bought base size but not yet the notional.
struct NotionalLagging(Arc<PaperAdapter>);

#[async_trait]
impl ExchangeAdapter for NotionalLagging {
    fn name(&self) -> &str {
        self.0.name()
    }

    fn success_code(&self) -> &str {
        self.0.success_code()
    }

    fn supports_streaming(&self) -> bool {
        self.0.supports_streaming()
    }

    fn metadata(&self) -> &MetadataCache {
        self.0.metadata()
    }

    async fn fetch_pairs(&self) -> Result<HashMap<String, PairSpec>, AdapterError> {
        self.0.fetch_pairs().await
    }

    async fn fetch_tokens(&self) -> Result<HashMap<String, String>, AdapterError> {
        self.0.fetch_tokens().await
    }

    async fn best_price(&self, pair: &str) -> Result<BestPrice, AdapterError> {
        self.0.best_price(pair).await
    }

    async fn place_limit_order(&self, order: &SizedOrder, tif: TimeInForce) -> Result<OrderAck, AdapterError> {
        self.0.place_limit_order(order, tif).await
    }

    async fn order_fill(&self, order_id: &str) -> Result<OrderFill, AdapterError> {
        let fill = self.0.order_fill(order_id).await?;
        Ok(OrderFill { filled_quote: Decimal::ZERO, ..fill })
    }

    async fn balance(&self, token: &str) -> Result<Balance, AdapterError> {
        self.0.balance(token).await
    }

    async fn subscribe_price_stream(&self, pair: &str) -> Result<Box<dyn PriceStream>, AdapterError> {
        self.0.subscribe_price_stream(pair).await
    }
}

#[tokio::test]
async fn base_only_fill_is_still_tracked() {
    let paper = exchange("paper").await;
    let tx = paper.queue_stream(PAIR);
    push(&tx, &[dec!(50)]);

    let lagging: Arc<dyn ExchangeAdapter> = Arc::new(NotionalLagging(paper.clone()));
    let report = react_on(&reactor(), lagging, "AAVE", "Aave").await.unwrap();

    // entry priced at the 110 limit since no notional came back
    assert_eq!(report.entry_price, dec!(110));
    assert_eq!(report.exit_reason, ExitReason::StopLoss);
    assert_eq!(report.filled_base, dec!(1.1818));
    assert_eq!(paper.balance_of("AAVE"), dec!(0));
}

#[tokio::test]
async fn router_run_consumes_events_until_closed() {
    let paper = exchange("paper").await;
    let stream = paper.queue_stream(PAIR);
    push(&stream, &[dec!(150), dec!(210)]);
    let router = Router::new(reactor(), vec![paper.clone() as Arc<dyn ExchangeAdapter>]);
    let reactor = Arc::clone(router.reactor());

    let (tx, rx) = mpsc::channel(4);
    tx.send(ListingEvent { symbol: "AAVE".into(), token_name: "Aave".into() }).await.unwrap();
    drop(tx);
    tokio::time::timeout(Duration::from_secs(5), router.run(rx)).await.unwrap();

    // reactions run detached; wait for the buy and the exit
    tokio::time::timeout(Duration::from_secs(10), async {
        while paper.placed_orders().len() < 2 || !reactor.active().is_empty() {
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
    })
    .await
    .unwrap();
    assert_eq!(paper.balance_of("AAVE"), dec!(0));
}
