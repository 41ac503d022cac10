// One reaction per (exchange, symbol) listing event: check eligibility, buy, then hand
// the position to a TrailingStopEngine until it exits.

pub mod router;

use std::collections::HashMap;
use std::sync::Arc;

use metrics::{counter, gauge};
use parking_lot::Mutex;
use rust_decimal::Decimal;
use thiserror::Error;
use tracing::{info, instrument, warn};

use crate::cancel::CancelToken;
use crate::config::ReactionSettings;
use crate::engine::execution::{execute_intent, ExecutionError};
use crate::engine::trailing::{EngineSettings, ExitReport, TrailingParams, TrailingStopEngine};
use crate::engine::types::{SizingError, TimeInForce, TradeIntent};
use crate::market_data::adapters::{AdapterError, ExchangeAdapter};
use crate::market_data::feed::{FeedFactory, PriceTarget};

#[derive(Debug, Error)]
pub enum ReactionError {
    #[error("{symbol} is not listed on {exchange}")]
    NotListed { exchange: String, symbol: String },

    #[error("announced name '{announced}' does not match listed name '{listed}'")]
    NameMismatch { announced: String, listed: String },

    #[error("a reaction for {symbol} on {exchange} is already running")]
    AlreadyActive { exchange: String, symbol: String },

    #[error("no pair trades {symbol} against {quote}")]
    NoMarket { symbol: String, quote: String },

    #[error("acquisition order rejected with code {code}: {message}")]
    OrderRejected { code: String, message: String },

    /// The acquisition never matched; there is no position to manage
    #[error("acquisition order did not fill")]
    EmptyFill,

    #[error(transparent)]
    Validation(#[from] SizingError),

    #[error(transparent)]
    Adapter(#[from] AdapterError),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorKind {
    Validation,
    Transient,
    Rejection,
    Fatal,
}

impl ReactionError {
    pub fn kind(&self) -> ErrorKind {
        match self {
            ReactionError::Validation(_) => ErrorKind::Validation,
            ReactionError::Adapter(e) if e.is_transient() => ErrorKind::Transient,
            ReactionError::NotListed { .. }
            | ReactionError::NameMismatch { .. }
            | ReactionError::AlreadyActive { .. }
            | ReactionError::OrderRejected { .. }
            | ReactionError::EmptyFill => ErrorKind::Rejection,
            ReactionError::NoMarket { .. } | ReactionError::Adapter(_) => ErrorKind::Fatal,
        }
    }

    fn label(&self) -> &'static str {
        match self {
            ReactionError::NotListed { .. } => "not_listed",
            ReactionError::NameMismatch { .. } => "name_mismatch",
            ReactionError::AlreadyActive { .. } => "already_active",
            ReactionError::NoMarket { .. } => "no_market",
            ReactionError::OrderRejected { .. } => "order_rejected",
            ReactionError::EmptyFill => "empty_fill",
            ReactionError::Validation(_) => "validation",
            ReactionError::Adapter(_) => "adapter",
        }
    }
}

impl From<ExecutionError> for ReactionError {
    fn from(e: ExecutionError) -> Self {
        match e {
            ExecutionError::Sizing(e) => ReactionError::Validation(e),
            ExecutionError::Adapter(e) => ReactionError::Adapter(e),
            ExecutionError::NoMarket { sell, buy } => ReactionError::NoMarket { symbol: buy, quote: sell },
            ExecutionError::NoReferencePrice(pair) => ReactionError::Adapter(AdapterError::PairUnavailable(pair)),
            ExecutionError::OrderRejected { code, message } => ReactionError::OrderRejected { code, message },
        }
    }
}

pub type ReactionResult = Result<ExitReport, ReactionError>;

/// Case-insensitive substring match in either direction.
pub fn names_match(listed: &str, announced: &str) -> bool {
    let listed = listed.to_lowercase();
    let announced = announced.to_lowercase();
    listed.contains(&announced) || announced.contains(&listed)
}

type ReactionKey = (String, String);

/// Holds a registry slot for the lifetime of one reaction.
struct ActiveGuard {
    registry: Arc<Mutex<HashMap<ReactionKey, CancelToken>>>,
    key: ReactionKey,
}

impl Drop for ActiveGuard {
    fn drop(&mut self) {
        self.registry.lock().remove(&self.key);
        gauge!("listx_active_reactions").decrement(1.0);
    }
}

pub struct Reactor {
    feeds: Arc<dyn FeedFactory>,
    settings: ReactionSettings,
    params: TrailingParams,
    active: Arc<Mutex<HashMap<ReactionKey, CancelToken>>>,
}

impl Reactor {
    pub fn new(feeds: Arc<dyn FeedFactory>, settings: ReactionSettings, params: TrailingParams) -> Self {
        Self {
            feeds,
            settings,
            params,
            active: Arc::new(Mutex::new(HashMap::new())),
        }
    }

    pub fn settings(&self) -> &ReactionSettings {
        &self.settings
    }

    fn claim(&self, exchange: &str, symbol: &str) -> Result<(ActiveGuard, CancelToken), ReactionError> {
        let key = (exchange.to_string(), symbol.to_string());
        let mut active = self.active.lock();
        if active.contains_key(&key) {
            return Err(ReactionError::AlreadyActive {
                exchange: exchange.to_string(),
                symbol: symbol.to_string(),
            });
        }
        let cancel = CancelToken::new();
        active.insert(key.clone(), cancel.clone());
        gauge!("listx_active_reactions").increment(1.0);
        Ok((ActiveGuard { registry: Arc::clone(&self.active), key }, cancel))
    }

    /// Cancels the running reaction, which then sells out immediately. False if none was running.
    pub fn cancel(&self, exchange: &str, symbol: &str) -> bool {
        let key = (exchange.to_string(), symbol.to_string());
        match self.active.lock().get(&key) {
            Some(token) => {
                token.cancel();
                true
            }
            None => false,
        }
    }

    pub fn active(&self) -> Vec<(String, String)> {
        let mut keys: Vec<_> = self.active.lock().keys().cloned().collect();
        keys.sort();
        keys
    }

    #[instrument(skip(self, adapter, max_impact, sell_amount), fields(exchange = adapter.name()))]
    pub async fn react(
        &self,
        adapter: Arc<dyn ExchangeAdapter>,
        symbol: &str,
        token_name: &str,
        max_impact: Decimal,
        sell_amount: Decimal,
    ) -> ReactionResult {
        let result = self.run_reaction(adapter.clone(), symbol, token_name, max_impact, sell_amount).await;
        let outcome = match &result {
            Ok(report) => {
                info!(
                    reason = %report.exit_reason,
                    entry = %report.entry_price,
                    exit = ?report.exit_price,
                    filled_base = %report.filled_base,
                    filled_quote = %report.filled_quote,
                    "Reaction finished"
                );
                "exited"
            }
            Err(e) => {
                warn!(error = %e, kind = ?e.kind(), "Reaction aborted");
                e.label()
            }
        };
        counter!("listx_reactions_total", "exchange" => adapter.name().to_string(), "outcome" => outcome)
            .increment(1);
        result
    }

    async fn run_reaction(
        &self,
        adapter: Arc<dyn ExchangeAdapter>,
        symbol: &str,
        token_name: &str,
        max_impact: Decimal,
        sell_amount: Decimal,
    ) -> ReactionResult {
        let exchange = adapter.name().to_string();
        let meta = adapter.metadata().snapshot();
        if !meta.is_listed(symbol) {
            return Err(ReactionError::NotListed { exchange, symbol: symbol.to_string() });
        }
        if meta.has_full_names {
            let listed = meta.full_name(symbol).unwrap_or_default();
            if !names_match(listed, token_name) {
                return Err(ReactionError::NameMismatch {
                    announced: token_name.to_string(),
                    listed: listed.to_string(),
                });
            }
        }

        let (_guard, cancel) = self.claim(&exchange, symbol)?;

        let quote = self.settings.quote_token.as_str();
        let intent = TradeIntent::sell(quote, symbol, sell_amount, max_impact, TimeInForce::Ioc)?;
        let acquisition = execute_intent(adapter.as_ref(), &intent).await?;
        if acquisition.fill.is_empty() {
            return Err(ReactionError::EmptyFill);
        }
        let execution_price = acquisition.average_price(symbol).unwrap_or_else(|| {
            let limit = acquisition.limit_price(symbol);
            warn!(fill = ?acquisition.fill, %limit, "One-sided fill report, pricing entry at the limit");
            limit
        });
        info!(%execution_price, filled = %acquisition.fill.filled_base, "Position opened");

        let price_increment = meta
            .pairs
            .get(&acquisition.market.pair)
            .map(|spec| spec.price_increment)
            .unwrap_or(Decimal::ZERO);
        let target = PriceTarget::new(&acquisition.market, symbol, price_increment);

        let reference_price = match adapter.best_price(&target.pair).await {
            Ok(best) => target.price(best.bid, best.ask),
            Err(e) => {
                warn!(error = %e, "Reference price lookup failed");
                None
            }
        }
        .unwrap_or_else(|| {
            warn!(%execution_price, "No reference price after entry, using execution price");
            execution_price
        });

        let engine = TrailingStopEngine::new(
            Arc::clone(&adapter),
            symbol,
            self.params,
            EngineSettings {
                quote_token: self.settings.quote_token.clone(),
                exit_impact: self.settings.exit_impact,
                tick_timeout: self.settings.tick_timeout(),
                retry_delay: self.settings.retry_delay(),
            },
            reference_price,
            execution_price,
        );
        let feed = self.feeds.open(Arc::clone(&adapter), target);
        Ok(engine.run(feed, cancel).await)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_names_match_either_direction() {
        assert!(names_match("Aave", "AAVE"));
        assert!(names_match("Aave", "Aave Token"));
        assert!(names_match("Wrapped Bitcoin", "bitcoin"));
        assert!(!names_match("Aave", "Totally Unrelated Token"));
    }

    #[test]
    fn test_error_kinds() {
        assert_eq!(ReactionError::EmptyFill.kind(), ErrorKind::Rejection);
        assert_eq!(
            ReactionError::Validation(SizingError::UnknownPair("X-Y".into())).kind(),
            ErrorKind::Validation
        );
        assert_eq!(ReactionError::Adapter(AdapterError::StreamEnded).kind(), ErrorKind::Transient);
        assert_eq!(
            ReactionError::Adapter(AdapterError::PairUnavailable("X-Y".into())).kind(),
            ErrorKind::Fatal
        );
    }
}
