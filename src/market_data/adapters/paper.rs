// In-process simulated exchange.
//
// Used for dry runs (live quotes from a wrapped adapter, simulated orders and balances)
// and as the test double for reactions. IOC limit orders fill completely at the touch
// when the limit crosses it and not at all otherwise; there is no depth model.

use std::collections::{HashMap, VecDeque};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

use async_trait::async_trait;
use parking_lot::Mutex;
use rust_decimal::Decimal;
use tokio::sync::mpsc;
use tracing::{debug, info};

use super::{AdapterError, Balance, BestPrice, ExchangeAdapter, OrderAck, OrderFill, PriceStream, RawTick};
use crate::engine::types::{PairSpec, Side, SizedOrder, TimeInForce};
use crate::market_data::metadata::MetadataCache;

pub const PAPER_SUCCESS_CODE: &str = "200000";
pub const PAPER_INSUFFICIENT_BALANCE: &str = "200004";

/// Scripted input for one simulated subscription.
#[derive(Debug, Clone)]
pub enum StreamEvent {
    Tick(RawTick),
    /// Undecodable frame; the connection stays up
    Error(String),
    /// Server-side hang-up
    Disconnect,
}

#[derive(Default)]
struct PaperBook {
    pairs: HashMap<String, PairSpec>,
    tokens: HashMap<String, String>,
    quotes: HashMap<String, BestPrice>,
    balances: HashMap<String, Decimal>,
    orders: HashMap<String, OrderFill>,
    placed: Vec<SizedOrder>,
    next_order_id: u64,
    reject_code: Option<String>,
    fill_nothing: bool,
    streams: HashMap<String, VecDeque<mpsc::UnboundedReceiver<StreamEvent>>>,
}

pub struct PaperAdapter {
    name: String,
    separator: String,
    source: Option<Arc<dyn ExchangeAdapter>>,
    streaming: bool,
    book: Mutex<PaperBook>,
    metadata: MetadataCache,
    subscriptions: AtomicUsize,
    pings: Arc<AtomicUsize>,
}

impl PaperAdapter {
    pub fn new(name: &str) -> Self {
        Self {
            name: name.to_string(),
            separator: "-".to_string(),
            source: None,
            streaming: false,
            book: Mutex::new(PaperBook { next_order_id: 1, ..Default::default() }),
            metadata: MetadataCache::new("-", true),
            subscriptions: AtomicUsize::new(0),
            pings: Arc::new(AtomicUsize::new(0)),
        }
    }

    /// Simulate orders against the quotes and metadata of a live venue.
    pub fn over(name: &str, source: Arc<dyn ExchangeAdapter>) -> Self {
        let separator = source.metadata().snapshot().separator.clone();
        let has_full_names = source.metadata().snapshot().has_full_names;
        let mut paper = Self::new(name);
        paper.metadata = MetadataCache::new(&separator, has_full_names);
        paper.separator = separator;
        paper.source = Some(source);
        paper
    }

    pub fn with_pair(mut self, pair: &str, spec: PairSpec) -> Self {
        self.book.get_mut().pairs.insert(pair.to_string(), spec);
        self
    }

    pub fn with_token(mut self, symbol: &str, full_name: &str) -> Self {
        self.book.get_mut().tokens.insert(symbol.to_string(), full_name.to_string());
        self
    }

    /// Advertise streaming even without a live source (scripted streams).
    pub fn with_streaming(mut self) -> Self {
        self.streaming = true;
        self
    }

    pub fn set_quote(&self, pair: &str, bid: Option<Decimal>, ask: Option<Decimal>) {
        self.book.lock().quotes.insert(pair.to_string(), BestPrice { bid, ask });
    }

    pub fn set_balance(&self, token: &str, amount: Decimal) {
        self.book.lock().balances.insert(token.to_string(), amount);
    }

    /// Every later order is answered with `code` and never fills.
    pub fn reject_orders_with(&self, code: &str) {
        self.book.lock().reject_code = Some(code.to_string());
    }

    /// Orders are accepted but never match.
    pub fn fill_nothing(&self, on: bool) {
        self.book.lock().fill_nothing = on;
    }

    /// Queue a scripted subscription for `pair`. Each subscribe call consumes the next one.
    pub fn queue_stream(&self, pair: &str) -> mpsc::UnboundedSender<StreamEvent> {
        let (tx, rx) = mpsc::unbounded_channel();
        self.book.lock().streams.entry(pair.to_string()).or_default().push_back(rx);
        tx
    }

    pub fn placed_orders(&self) -> Vec<SizedOrder> {
        self.book.lock().placed.clone()
    }

    pub fn balance_of(&self, token: &str) -> Decimal {
        self.book.lock().balances.get(token).copied().unwrap_or_default()
    }

    pub fn subscriptions(&self) -> usize {
        self.subscriptions.load(Ordering::Relaxed)
    }

    pub fn pings(&self) -> usize {
        self.pings.load(Ordering::Relaxed)
    }

    fn split_pair<'a>(&self, pair: &'a str) -> Result<(&'a str, &'a str), AdapterError> {
        pair.split_once(self.separator.as_str())
            .ok_or_else(|| AdapterError::PairUnavailable(pair.to_string()))
    }

    fn next_id(book: &mut PaperBook) -> String {
        let id = format!("paper-{}", book.next_order_id);
        book.next_order_id += 1;
        id
    }
}

#[async_trait]
impl ExchangeAdapter for PaperAdapter {
    fn name(&self) -> &str {
        &self.name
    }

    fn success_code(&self) -> &str {
        PAPER_SUCCESS_CODE
    }

    fn supports_streaming(&self) -> bool {
        self.streaming || self.source.as_ref().is_some_and(|s| s.supports_streaming())
    }

    fn metadata(&self) -> &MetadataCache {
        &self.metadata
    }

    async fn fetch_pairs(&self) -> Result<HashMap<String, PairSpec>, AdapterError> {
        let mut pairs = match &self.source {
            Some(source) => source.fetch_pairs().await?,
            None => HashMap::new(),
        };
        pairs.extend(self.book.lock().pairs.iter().map(|(k, v)| (k.clone(), *v)));
        Ok(pairs)
    }

    async fn fetch_tokens(&self) -> Result<HashMap<String, String>, AdapterError> {
        let mut tokens = match &self.source {
            Some(source) => source.fetch_tokens().await?,
            None => HashMap::new(),
        };
        tokens.extend(self.book.lock().tokens.iter().map(|(k, v)| (k.clone(), v.clone())));
        Ok(tokens)
    }

    async fn best_price(&self, pair: &str) -> Result<BestPrice, AdapterError> {
        let local = self.book.lock().quotes.get(pair).copied();
        match (local, &self.source) {
            (Some(quote), _) => Ok(quote),
            (None, Some(source)) => source.best_price(pair).await,
            (None, None) => Err(AdapterError::PairUnavailable(pair.to_string())),
        }
    }

    async fn place_limit_order(
        &self,
        order: &SizedOrder,
        time_in_force: TimeInForce,
    ) -> Result<OrderAck, AdapterError> {
        let (base, quote) = self.split_pair(&order.pair)?;
        let touch = self.best_price(&order.pair).await?;

        let mut book = self.book.lock();
        book.placed.push(order.clone());

        if let Some(code) = book.reject_code.clone() {
            return Ok(OrderAck { order_id: String::new(), status_code: code, message: Some("rejected".into()) });
        }

        let fill_price = match order.side {
            Side::Buy => touch.ask.filter(|ask| *ask <= order.limit_price),
            Side::Sell => touch.bid.filter(|bid| *bid >= order.limit_price),
        }
        .filter(|_| !book.fill_nothing);

        let mut fill = OrderFill {
            requested_base: order.base_quantity,
            is_active: fill_price.is_none() && time_in_force == TimeInForce::Gtc,
            ..Default::default()
        };

        if let Some(price) = fill_price {
            let notional = order.base_quantity * price;
            let (spend_token, spend, get_token, get) = match order.side {
                Side::Buy => (quote, notional, base, order.base_quantity),
                Side::Sell => (base, order.base_quantity, quote, notional),
            };
            let available = book.balances.get(spend_token).copied().unwrap_or_default();
            if available < spend {
                return Ok(OrderAck {
                    order_id: String::new(),
                    status_code: PAPER_INSUFFICIENT_BALANCE.to_string(),
                    message: Some(format!("insufficient {spend_token}: need {spend}, have {available}")),
                });
            }
            *book.balances.entry(spend_token.to_string()).or_default() -= spend;
            *book.balances.entry(get_token.to_string()).or_default() += get;
            fill.filled_base = order.base_quantity;
            fill.filled_quote = notional;
        }

        let order_id = Self::next_id(&mut book);
        info!(%order_id, pair = %order.pair, side = order.side.as_str(), price = %order.limit_price,
              qty = %order.base_quantity, filled = %fill.filled_base, "Paper order");
        book.orders.insert(order_id.clone(), fill);
        Ok(OrderAck { order_id, status_code: PAPER_SUCCESS_CODE.to_string(), message: None })
    }

    async fn order_fill(&self, order_id: &str) -> Result<OrderFill, AdapterError> {
        self.book
            .lock()
            .orders
            .get(order_id)
            .copied()
            .ok_or_else(|| AdapterError::UnknownOrder(order_id.to_string()))
    }

    async fn balance(&self, token: &str) -> Result<Balance, AdapterError> {
        let amount = self.balance_of(token);
        Ok(Balance { total: amount, available: amount })
    }

    async fn subscribe_price_stream(&self, pair: &str) -> Result<Box<dyn PriceStream>, AdapterError> {
        self.subscriptions.fetch_add(1, Ordering::Relaxed);
        let scripted = self.book.lock().streams.get_mut(pair).and_then(VecDeque::pop_front);
        if let Some(rx) = scripted {
            debug!(pair, "Opening scripted stream");
            return Ok(Box::new(ScriptedStream { rx, pings: Arc::clone(&self.pings) }));
        }
        match &self.source {
            Some(source) => source.subscribe_price_stream(pair).await,
            None => Err(AdapterError::Unsupported("price streaming")),
        }
    }
}

struct ScriptedStream {
    rx: mpsc::UnboundedReceiver<StreamEvent>,
    pings: Arc<AtomicUsize>,
}

#[async_trait]
impl PriceStream for ScriptedStream {
    async fn next_tick(&mut self) -> Option<Result<RawTick, AdapterError>> {
        match self.rx.recv().await? {
            StreamEvent::Tick(tick) => Some(Ok(tick)),
            StreamEvent::Error(msg) => Some(Err(AdapterError::Decode(msg))),
            StreamEvent::Disconnect => None,
        }
    }

    async fn ping(&mut self) -> Result<(), AdapterError> {
        self.pings.fetch_add(1, Ordering::Relaxed);
        Ok(())
    }

    async fn close(&mut self) {
        self.rx.close();
    }
}
