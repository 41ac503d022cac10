// Price feeds: one "wait for the next price" surface over polling and streaming sources.
//
// PollingFeed asks the venue for its top of book on every call. StreamingFeed owns a
// background task that keeps one subscription alive and forwards de-duplicated prices
// through a bounded channel. WarmupFeed polls for the first seconds of a reaction while
// the subscription delivers its first message.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use metrics::counter;
use rust_decimal::Decimal;
use thiserror::Error;
use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tracing::{debug, info, trace, warn};

use crate::cancel::CancelToken;
use crate::config::FeedSettings;
use crate::engine::sizer::round_down;
use crate::engine::types::PriceObservation;
use crate::market_data::adapters::{sell_price, AdapterError, ExchangeAdapter, PriceStream};
use crate::market_data::metadata::MarketRef;

#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum FeedError {
    #[error("no new price within {0:?}")]
    Timeout(Duration),
    #[error("feed closed")]
    Closed,
    /// Nothing usable this tick; retry later
    #[error("price unavailable: {0}")]
    Transient(String),
}

/// What a feed prices: one token of a pair, in the pair's other token.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PriceTarget {
    pub pair: String,
    pub token_is_base: bool,
    pub price_increment: Decimal,
}

impl PriceTarget {
    pub fn new(market: &MarketRef, token: &str, price_increment: Decimal) -> Self {
        Self {
            pair: market.pair.clone(),
            token_is_base: market.is_base(token),
            price_increment,
        }
    }

    /// Sell price of the token. Base prices are cut to the pair's price grid; inverted
    /// quotes live off-grid and are compared as they are.
    pub fn price(&self, bid: Option<Decimal>, ask: Option<Decimal>) -> Option<Decimal> {
        let raw = sell_price(bid, ask, self.token_is_base)?;
        let price = if self.token_is_base { round_down(raw, self.price_increment) } else { raw };
        (price > Decimal::ZERO).then_some(price)
    }
}

#[async_trait]
pub trait PriceFeed: Send {
    /// Waits at most `timeout` for the next price. Never yields a zero or stale value
    /// as a successful observation.
    async fn next_price(&mut self, timeout: Duration) -> Result<PriceObservation, FeedError>;

    /// Idempotent; every later `next_price` returns [`FeedError::Closed`].
    fn close(&self) {
        self.closer().cancel();
    }

    /// Handle that closes this feed from another owner.
    fn closer(&self) -> CancelToken;
}

pub struct PollingFeed {
    adapter: Arc<dyn ExchangeAdapter>,
    target: PriceTarget,
    interval: Duration,
    last_poll: Option<Instant>,
    sequence: u64,
    closed: CancelToken,
}

impl PollingFeed {
    pub fn new(
        adapter: Arc<dyn ExchangeAdapter>,
        target: PriceTarget,
        interval: Duration,
        closed: CancelToken,
    ) -> Self {
        Self { adapter, target, interval, last_poll: None, sequence: 0, closed }
    }
}

#[async_trait]
impl PriceFeed for PollingFeed {
    async fn next_price(&mut self, timeout: Duration) -> Result<PriceObservation, FeedError> {
        if self.closed.is_cancelled() {
            return Err(FeedError::Closed);
        }
        let adapter = Arc::clone(&self.adapter);
        let pair = self.target.pair.clone();
        let not_before = self.last_poll.map(|t| t + self.interval);
        let poll = async move {
            if let Some(at) = not_before {
                tokio::time::sleep_until(at).await;
            }
            adapter.best_price(&pair).await
        };

        let closed = self.closed.clone();
        let best = tokio::select! {
            biased;
            _ = closed.cancelled() => return Err(FeedError::Closed),
            r = tokio::time::timeout(timeout, poll) => match r {
                Err(_) => return Err(FeedError::Timeout(timeout)),
                Ok(r) => r,
            },
        };
        self.last_poll = Some(Instant::now());

        let best = best.map_err(|e| FeedError::Transient(e.to_string()))?;
        let value = self
            .target
            .price(best.bid, best.ask)
            .ok_or_else(|| FeedError::Transient(format!("no quote on {}", self.target.pair)))?;
        self.sequence += 1;
        counter!("listx_price_observations_total", "exchange" => self.adapter.name().to_string()).increment(1);
        Ok(PriceObservation { value, sequence: self.sequence })
    }

    fn closer(&self) -> CancelToken {
        self.closed.clone()
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StreamState {
    Connecting,
    Subscribed,
    /// Lost the connection, waiting out the backoff before reconnecting
    Degraded,
    Closed,
}

/// Timings for one streaming subscription.
#[derive(Debug, Clone, Copy)]
pub struct StreamTimings {
    pub keepalive: Duration,
    pub token_lifetime: Duration,
    pub backoff_initial: Duration,
    pub backoff_max: Duration,
}

impl From<&FeedSettings> for StreamTimings {
    fn from(s: &FeedSettings) -> Self {
        Self {
            keepalive: s.keepalive(),
            token_lifetime: s.token_lifetime(),
            backoff_initial: s.backoff_initial(),
            backoff_max: s.backoff_max(),
        }
    }
}

type Delivery = Result<PriceObservation, FeedError>;
/// A delivery and when the worker produced it.
type Stamped = (Instant, Delivery);

pub struct StreamingFeed {
    rx: mpsc::Receiver<Stamped>,
    /// Read before the channel
    pending: Option<Delivery>,
    state: watch::Receiver<StreamState>,
    closed: CancelToken,
    task: JoinHandle<()>,
}

impl StreamingFeed {
    /// Starts the subscription task. Must be called inside a Tokio runtime.
    pub fn spawn(
        adapter: Arc<dyn ExchangeAdapter>,
        target: PriceTarget,
        timings: StreamTimings,
        capacity: usize,
        closed: CancelToken,
    ) -> Self {
        let (tx, rx) = mpsc::channel(capacity.max(1));
        let (state_tx, state) = watch::channel(StreamState::Connecting);
        let worker = StreamWorker {
            adapter,
            target,
            timings,
            tx,
            state: state_tx,
            closed: closed.clone(),
            last_delivered: None,
            sequence: 0,
        };
        let task = tokio::spawn(worker.run());
        Self { rx, pending: None, state, closed, task }
    }

    /// Drops buffered deliveries produced before `cutoff`. The first one produced at or
    /// after it is kept for the next read. Returns how many were dropped.
    pub fn discard_before(&mut self, cutoff: Instant) -> usize {
        let mut dropped = 0;
        while let Ok((at, delivery)) = self.rx.try_recv() {
            if at >= cutoff {
                self.pending = Some(delivery);
                break;
            }
            dropped += 1;
        }
        dropped
    }

    pub fn state(&self) -> StreamState {
        *self.state.borrow()
    }

    pub fn is_finished(&self) -> bool {
        self.task.is_finished()
    }
}

impl Drop for StreamingFeed {
    fn drop(&mut self) {
        self.closed.cancel();
    }
}

#[async_trait]
impl PriceFeed for StreamingFeed {
    async fn next_price(&mut self, timeout: Duration) -> Result<PriceObservation, FeedError> {
        if self.closed.is_cancelled() {
            return Err(FeedError::Closed);
        }
        if let Some(delivery) = self.pending.take() {
            return delivery;
        }
        tokio::select! {
            biased;
            _ = self.closed.cancelled() => Err(FeedError::Closed),
            r = tokio::time::timeout(timeout, self.rx.recv()) => match r {
                Err(_) => Err(FeedError::Timeout(timeout)),
                Ok(None) => Err(FeedError::Closed),
                Ok(Some((_, delivery))) => delivery,
            },
        }
    }

    fn closer(&self) -> CancelToken {
        self.closed.clone()
    }
}

/// How one connection ended.
enum SessionEnd {
    Closed,
    /// Token about to expire
    Rotate,
    Lost(String),
}

struct StreamWorker {
    adapter: Arc<dyn ExchangeAdapter>,
    target: PriceTarget,
    timings: StreamTimings,
    tx: mpsc::Sender<Stamped>,
    state: watch::Sender<StreamState>,
    closed: CancelToken,
    last_delivered: Option<Decimal>,
    sequence: u64,
}

impl StreamWorker {
    async fn run(mut self) {
        let exchange = self.adapter.name().to_string();
        let mut backoff = self.timings.backoff_initial;

        loop {
            if self.closed.is_cancelled() {
                break;
            }
            let connect = tokio::select! {
                biased;
                _ = self.closed.cancelled() => break,
                r = self.adapter.subscribe_price_stream(&self.target.pair) => r,
            };

            let reason = match connect {
                Ok(mut stream) => {
                    self.state.send_replace(StreamState::Subscribed);
                    info!(%exchange, pair = %self.target.pair, "Price stream subscribed");
                    backoff = self.timings.backoff_initial;
                    let end = self.session(stream.as_mut()).await;
                    stream.close().await;
                    match end {
                        SessionEnd::Closed => break,
                        SessionEnd::Rotate => {
                            info!(%exchange, pair = %self.target.pair, "Rotating subscription before token expiry");
                            self.state.send_replace(StreamState::Connecting);
                            continue;
                        }
                        SessionEnd::Lost(reason) => reason,
                    }
                }
                Err(e) => e.to_string(),
            };

            self.state.send_replace(StreamState::Degraded);
            counter!("listx_feed_reconnects_total", "exchange" => exchange.clone()).increment(1);
            warn!(%exchange, pair = %self.target.pair, %reason, ?backoff, "Price stream lost, reconnecting");
            if !self.deliver(Err(FeedError::Transient(reason))).await {
                break;
            }
            tokio::select! {
                biased;
                _ = self.closed.cancelled() => break,
                _ = tokio::time::sleep(backoff) => {}
            }
            backoff = (backoff * 2).min(self.timings.backoff_max);
            self.state.send_replace(StreamState::Connecting);
        }

        self.state.send_replace(StreamState::Closed);
        debug!(%exchange, pair = %self.target.pair, "Price stream task finished");
    }

    async fn session(&mut self, stream: &mut dyn PriceStream) -> SessionEnd {
        let expires = Instant::now() + self.timings.token_lifetime;
        loop {
            let next = tokio::select! {
                biased;
                _ = self.closed.cancelled() => return SessionEnd::Closed,
                _ = tokio::time::sleep_until(expires) => return SessionEnd::Rotate,
                r = tokio::time::timeout(self.timings.keepalive, stream.next_tick()) => r,
            };

            let tick = match next {
                Err(_) => {
                    trace!(pair = %self.target.pair, "Idle, sending keep-alive");
                    if let Err(e) = stream.ping().await {
                        return SessionEnd::Lost(e.to_string());
                    }
                    continue;
                }
                Ok(None) => return SessionEnd::Lost("stream ended".into()),
                Ok(Some(Err(e))) if is_connection_error(&e) => return SessionEnd::Lost(e.to_string()),
                Ok(Some(Err(e))) => {
                    debug!(error = %e, "Undecodable tick");
                    if !self.deliver(Err(FeedError::Transient(e.to_string()))).await {
                        return SessionEnd::Closed;
                    }
                    continue;
                }
                Ok(Some(Ok(tick))) => tick,
            };

            let Some(price) = self.target.price(tick.best_bid, tick.best_ask) else {
                trace!(pair = %self.target.pair, "Tick without a usable price");
                continue;
            };
            if self.last_delivered == Some(price) {
                continue;
            }
            self.last_delivered = Some(price);
            self.sequence = tick.sequence.max(self.sequence + 1);
            counter!("listx_price_observations_total", "exchange" => self.adapter.name().to_string()).increment(1);

            let observation = PriceObservation { value: price, sequence: self.sequence };
            if !self.deliver(Ok(observation)).await {
                return SessionEnd::Closed;
            }
        }
    }

    /// False once the consumer is gone or the feed was closed.
    async fn deliver(&self, delivery: Delivery) -> bool {
        tokio::select! {
            biased;
            _ = self.closed.cancelled() => false,
            r = self.tx.send((Instant::now(), delivery)) => r.is_ok(),
        }
    }
}

fn is_connection_error(e: &AdapterError) -> bool {
    matches!(
        e,
        AdapterError::WebSocket(_) | AdapterError::Http(_) | AdapterError::StreamEnded
    )
}

/// Polls until `switch_at`, then reads the subscription that was opened alongside.
/// Stream output buffered before the last poll returned is never delivered.
pub struct WarmupFeed {
    polling: PollingFeed,
    streaming: StreamingFeed,
    switch_at: Instant,
    last_polled: Option<Instant>,
    switched: bool,
    closed: CancelToken,
}

impl WarmupFeed {
    pub fn new(polling: PollingFeed, streaming: StreamingFeed, warmup: Duration) -> Self {
        let closed = polling.closer();
        Self {
            polling,
            streaming,
            switch_at: Instant::now() + warmup,
            last_polled: None,
            switched: false,
            closed,
        }
    }
}

#[async_trait]
impl PriceFeed for WarmupFeed {
    async fn next_price(&mut self, timeout: Duration) -> Result<PriceObservation, FeedError> {
        if Instant::now() < self.switch_at {
            let r = self.polling.next_price(timeout).await;
            self.last_polled = Some(Instant::now());
            return r;
        }
        if !self.switched {
            self.switched = true;
            if let Some(cutoff) = self.last_polled {
                let dropped = self.streaming.discard_before(cutoff);
                debug!(dropped, "Warm-up over, reading the stream");
            }
        }
        self.streaming.next_price(timeout).await
    }

    fn close(&self) {
        self.closed.cancel();
        self.streaming.close();
    }

    fn closer(&self) -> CancelToken {
        self.closed.clone()
    }
}

/// Builds the feed for one reaction.
pub trait FeedFactory: Send + Sync {
    fn open(&self, adapter: Arc<dyn ExchangeAdapter>, target: PriceTarget) -> Box<dyn PriceFeed>;
}

/// Streams (after a polling warm-up) when the venue supports it, polls otherwise.
pub struct AdaptiveFeedFactory {
    settings: FeedSettings,
}

impl AdaptiveFeedFactory {
    pub fn new(settings: FeedSettings) -> Self {
        Self { settings }
    }
}

impl FeedFactory for AdaptiveFeedFactory {
    fn open(&self, adapter: Arc<dyn ExchangeAdapter>, target: PriceTarget) -> Box<dyn PriceFeed> {
        let closed = CancelToken::new();
        let polling = PollingFeed::new(
            Arc::clone(&adapter),
            target.clone(),
            self.settings.poll_interval(),
            closed.clone(),
        );
        if !adapter.supports_streaming() {
            return Box::new(polling);
        }
        let streaming = StreamingFeed::spawn(
            adapter,
            target,
            StreamTimings::from(&self.settings),
            self.settings.channel_capacity,
            closed,
        );
        if self.settings.warmup().is_zero() {
            Box::new(streaming)
        } else {
            Box::new(WarmupFeed::new(polling, streaming, self.settings.warmup()))
        }
    }
}
