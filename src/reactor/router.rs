// Router fans listing events out to every configured exchange
use std::sync::Arc;

use rust_decimal::Decimal;
use serde::Deserialize;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::{error, info};

use super::{ReactionResult, Reactor};
use crate::market_data::adapters::ExchangeAdapter;

/// One detected listing, as produced by the announcement scraper.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
pub struct ListingEvent {
    pub symbol: String,
    pub token_name: String,
}

pub struct Router {
    reactor: Arc<Reactor>,
    exchanges: Vec<Arc<dyn ExchangeAdapter>>,
    max_impact: Decimal,
    sell_amount: Decimal,
}

impl Router {
    pub fn new(reactor: Arc<Reactor>, exchanges: Vec<Arc<dyn ExchangeAdapter>>) -> Self {
        let max_impact = reactor.settings().max_impact;
        let sell_amount = reactor.settings().sell_amount;
        Self { reactor, exchanges, max_impact, sell_amount }
    }

    pub fn reactor(&self) -> &Arc<Reactor> {
        &self.reactor
    }

    pub fn exchanges(&self) -> &[Arc<dyn ExchangeAdapter>] {
        &self.exchanges
    }

    /// Spawns one independent reaction per exchange.
    pub fn dispatch(&self, event: &ListingEvent) -> Vec<JoinHandle<ReactionResult>> {
        info!(symbol = %event.symbol, name = %event.token_name, venues = self.exchanges.len(), "Listing event");
        self.exchanges
            .iter()
            .map(|adapter| {
                let reactor = Arc::clone(&self.reactor);
                let adapter = Arc::clone(adapter);
                let event = event.clone();
                let (max_impact, sell_amount) = (self.max_impact, self.sell_amount);
                tokio::spawn(async move {
                    reactor
                        .react(adapter, &event.symbol, &event.token_name, max_impact, sell_amount)
                        .await
                })
            })
            .collect()
    }

    /// Consumes events until the sender side is dropped.
    pub async fn run(self, mut rx: mpsc::Receiver<ListingEvent>) {
        while let Some(event) = rx.recv().await {
            for handle in self.dispatch(&event) {
                tokio::spawn(async move {
                    // outcomes are logged by the reactor; only a panicking task lands here
                    if let Err(e) = handle.await {
                        error!(error = %e, "Reaction task failed");
                    }
                });
            }
        }
        info!("Listing channel closed, router stopped");
    }
}
