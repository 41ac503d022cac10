// Trailing-stop state machine for one open position.
//
// After entry every observation is checked against, in order:
//
// 1. price > ceil   exits as profit-take
// 2. price < floor  exits as stop-loss
// 3. price < trail while trail > reference exits as trailing-stop hit
// 4. a new high ratchets trail = high * trail_ratio (never down)
//
// The first rule that matches wins. Cancellation and a dead feed also exit, so a
// position is never left open without monitoring.

use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use metrics::counter;
use rust_decimal::Decimal;
use serde::Serialize;
use tracing::{debug, error, info, instrument, trace};

use crate::cancel::CancelToken;
use crate::engine::execution::{execute_intent, Execution, ExecutionError};
use crate::engine::types::{ExitReason, TimeInForce, TradeIntent};
use crate::market_data::adapters::ExchangeAdapter;
use crate::market_data::feed::{FeedError, PriceFeed};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TrailingParams {
    /// Stop-loss level relative to the reference price
    pub floor_ratio: Decimal,
    /// Profit-take level relative to the execution price
    pub ceil_multiple: Decimal,
    pub trail_ratio: Decimal,
}

impl Default for TrailingParams {
    fn default() -> Self {
        Self {
            floor_ratio: Decimal::new(94, 2),
            ceil_multiple: Decimal::from(2),
            trail_ratio: Decimal::new(9, 1),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ReactionState {
    pub reference_price: Decimal,
    pub floor_sell_price: Decimal,
    pub ceil_sell_price: Decimal,
    pub trailing_sell_price: Decimal,
    pub max_reached_price: Decimal,
    pub start_time: DateTime<Utc>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Decision {
    Hold,
    /// New high; the trail moved up to the contained price
    Ratchet(Decimal),
    Exit(ExitReason),
}

impl ReactionState {
    pub fn enter(params: &TrailingParams, reference_price: Decimal, execution_price: Decimal) -> Self {
        let floor_sell_price = params.floor_ratio * reference_price;
        Self {
            reference_price,
            floor_sell_price,
            ceil_sell_price: params.ceil_multiple * execution_price,
            trailing_sell_price: floor_sell_price,
            max_reached_price: reference_price,
            start_time: Utc::now(),
        }
    }

    /// Applies one observation. The trail starts at the floor and never drops: a new high
    /// with `high * trail_ratio` under the current trail leaves the trail where it is.
    pub fn evaluate(&mut self, price: Decimal, params: &TrailingParams) -> Decision {
        if price > self.ceil_sell_price {
            return Decision::Exit(ExitReason::ProfitTake);
        }
        if price < self.floor_sell_price {
            return Decision::Exit(ExitReason::StopLoss);
        }
        if price < self.trailing_sell_price && self.trailing_sell_price > self.reference_price {
            return Decision::Exit(ExitReason::TrailingStop);
        }
        if price > self.max_reached_price {
            self.max_reached_price = price;
            self.trailing_sell_price = (price * params.trail_ratio).max(self.trailing_sell_price);
            return Decision::Ratchet(self.trailing_sell_price);
        }
        Decision::Hold
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Phase {
    Entering,
    Tracking,
    Exiting,
    Done,
}

#[derive(Debug, Clone)]
pub struct EngineSettings {
    pub quote_token: String,
    pub exit_impact: Decimal,
    pub tick_timeout: Duration,
    pub retry_delay: Duration,
}

/// Outcome of one managed position.
#[derive(Debug, Clone, Serialize)]
pub struct ExitReport {
    pub exchange: String,
    pub symbol: String,
    pub exit_reason: ExitReason,
    pub entry_price: Decimal,
    pub reference_price: Decimal,
    pub max_reached_price: Decimal,
    pub trailing_sell_price: Decimal,
    /// Observation that triggered the exit, if one did
    pub trigger_price: Option<Decimal>,
    /// Realized liquidation price; `None` when nothing sold
    pub exit_price: Option<Decimal>,
    pub filled_base: Decimal,
    pub filled_quote: Decimal,
    pub liquidation_error: Option<String>,
    pub started_at: DateTime<Utc>,
    pub finished_at: DateTime<Utc>,
}

pub struct TrailingStopEngine {
    adapter: Arc<dyn ExchangeAdapter>,
    symbol: String,
    entry_price: Decimal,
    state: ReactionState,
    params: TrailingParams,
    settings: EngineSettings,
    phase: Phase,
}

impl TrailingStopEngine {
    pub fn new(
        adapter: Arc<dyn ExchangeAdapter>,
        symbol: &str,
        params: TrailingParams,
        settings: EngineSettings,
        reference_price: Decimal,
        execution_price: Decimal,
    ) -> Self {
        let state = ReactionState::enter(&params, reference_price, execution_price);
        Self {
            adapter,
            symbol: symbol.to_string(),
            entry_price: execution_price,
            state,
            params,
            settings,
            phase: Phase::Entering,
        }
    }

    pub fn state(&self) -> &ReactionState {
        &self.state
    }

    pub fn phase(&self) -> Phase {
        self.phase
    }

    fn transition(&mut self, next: Phase) {
        debug!(symbol = %self.symbol, from = ?self.phase, to = ?next, "Phase change");
        self.phase = next;
    }

    /// Tracks `feed` until an exit triggers, then liquidates. Cancelling before the exit
    /// starts forces an immediate exit; a liquidation already in flight is completed.
    #[instrument(skip_all, fields(exchange = self.adapter.name(), symbol = %self.symbol))]
    pub async fn run(mut self, mut feed: Box<dyn PriceFeed>, cancel: CancelToken) -> ExitReport {
        info!(
            reference = %self.state.reference_price,
            floor = %self.state.floor_sell_price,
            ceil = %self.state.ceil_sell_price,
            "Tracking position"
        );
        self.transition(Phase::Tracking);
        let (reason, trigger_price) = self.track(feed.as_mut(), &cancel).await;

        info!(%reason, trigger = ?trigger_price, "Exit triggered");
        self.transition(Phase::Exiting);
        feed.close();
        let liquidation = self.liquidate().await;
        self.transition(Phase::Done);

        counter!(
            "listx_exits_total",
            "exchange" => self.adapter.name().to_string(),
            "reason" => reason.as_str()
        )
        .increment(1);
        self.report(reason, trigger_price, liquidation)
    }

    /// Feeds observations into the state until one exits. Timeouts and transient feed
    /// errors leave the state untouched.
    async fn track(&mut self, feed: &mut dyn PriceFeed, cancel: &CancelToken) -> (ExitReason, Option<Decimal>) {
        loop {
            let next = tokio::select! {
                biased;
                _ = cancel.cancelled() => None,
                r = feed.next_price(self.settings.tick_timeout) => Some(r),
            };
            let Some(next) = next else {
                return (ExitReason::Cancelled, None);
            };

            match next {
                Ok(obs) => match self.state.evaluate(obs.value, &self.params) {
                    Decision::Hold => trace!(price = %obs.value, "Hold"),
                    Decision::Ratchet(trail) => {
                        debug!(price = %obs.value, %trail, "New high, trail raised")
                    }
                    Decision::Exit(reason) => return (reason, Some(obs.value)),
                },
                Err(FeedError::Timeout(_)) => continue,
                Err(FeedError::Transient(msg)) => {
                    trace!(%msg, "No price this tick");
                    tokio::select! {
                        biased;
                        _ = cancel.cancelled() => return (ExitReason::Cancelled, None),
                        _ = tokio::time::sleep(self.settings.retry_delay) => {}
                    }
                }
                Err(FeedError::Closed) if cancel.is_cancelled() => return (ExitReason::Cancelled, None),
                Err(FeedError::Closed) => return (ExitReason::FeedLost, None),
            }
        }
    }

    async fn liquidate(&self) -> Result<Execution, ExecutionError> {
        let balance = self.adapter.balance(&self.symbol).await?;
        let intent = TradeIntent::sell(
            &self.symbol,
            &self.settings.quote_token,
            balance.available,
            self.settings.exit_impact,
            TimeInForce::Ioc,
        )?;
        execute_intent(self.adapter.as_ref(), &intent).await
    }

    fn report(
        &self,
        exit_reason: ExitReason,
        trigger_price: Option<Decimal>,
        liquidation: Result<Execution, ExecutionError>,
    ) -> ExitReport {
        let (exit_price, filled_base, filled_quote, liquidation_error) = match liquidation {
            Ok(exec) => (
                exec.average_price(&self.symbol),
                exec.fill.filled_base,
                exec.fill.filled_quote,
                None,
            ),
            Err(e) => {
                error!(error = %e, "Liquidation failed, position may still be open");
                (None, Decimal::ZERO, Decimal::ZERO, Some(e.to_string()))
            }
        };
        ExitReport {
            exchange: self.adapter.name().to_string(),
            symbol: self.symbol.clone(),
            exit_reason,
            entry_price: self.entry_price,
            reference_price: self.state.reference_price,
            max_reached_price: self.state.max_reached_price,
            trailing_sell_price: self.state.trailing_sell_price,
            trigger_price,
            exit_price,
            filled_base,
            filled_quote,
            liquidation_error,
            started_at: self.state.start_time,
            finished_at: Utc::now(),
        }
    }
}
