// Pair and token metadata shared by every reaction on one exchange.
//
// Readers take an `Arc` snapshot and never block on a refresh. A refresh builds a
// whole new snapshot and swaps the pointer, so a reader sees either the old or the
// new metadata, never a mix.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use parking_lot::RwLock;
use tokio::task::JoinHandle;
use tracing::{debug, info, instrument, warn};

use crate::cancel::CancelToken;
use crate::engine::types::PairSpec;
use crate::market_data::adapters::{AdapterError, ExchangeAdapter};

/// A pair resolved from two token symbols.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MarketRef {
    pub pair: String,
    pub base: String,
    pub quote: String,
}

impl MarketRef {
    pub fn is_base(&self, token: &str) -> bool {
        self.base == token
    }
}

#[derive(Debug, Clone, Default)]
pub struct MarketMetadata {
    pub pairs: HashMap<String, PairSpec>,
    pub listed_tokens: HashMap<String, String>,
    pub separator: String,
    pub has_full_names: bool,
    pub refreshed_at: Option<DateTime<Utc>>,
}

impl MarketMetadata {
    /// Finds the pair trading `a` against `b` in either orientation.
    pub fn resolve(&self, a: &str, b: &str) -> Option<MarketRef> {
        let forward = format!("{a}{}{b}", self.separator);
        if self.pairs.contains_key(&forward) {
            return Some(MarketRef { pair: forward, base: a.to_string(), quote: b.to_string() });
        }
        let reverse = format!("{b}{}{a}", self.separator);
        if self.pairs.contains_key(&reverse) {
            return Some(MarketRef { pair: reverse, base: b.to_string(), quote: a.to_string() });
        }
        None
    }

    pub fn is_listed(&self, symbol: &str) -> bool {
        self.listed_tokens.contains_key(symbol)
    }

    pub fn full_name(&self, symbol: &str) -> Option<&str> {
        self.listed_tokens.get(symbol).map(String::as_str)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RefreshOutcome {
    Updated { pairs: usize, tokens: usize },
    /// Another refresh for the same exchange was already running
    Skipped,
}

#[derive(Debug)]
pub struct MetadataCache {
    current: RwLock<Arc<MarketMetadata>>,
    refresh_lock: tokio::sync::Mutex<()>,
}

impl MetadataCache {
    pub fn new(separator: &str, has_full_names: bool) -> Self {
        let empty = MarketMetadata {
            separator: separator.to_string(),
            has_full_names,
            ..Default::default()
        };
        Self {
            current: RwLock::new(Arc::new(empty)),
            refresh_lock: tokio::sync::Mutex::new(()),
        }
    }

    pub fn snapshot(&self) -> Arc<MarketMetadata> {
        Arc::clone(&self.current.read())
    }

    /// Swap in a freshly built snapshot.
    pub fn replace(&self, pairs: HashMap<String, PairSpec>, listed_tokens: HashMap<String, String>) {
        let prev = self.snapshot();
        let next = MarketMetadata {
            pairs,
            listed_tokens,
            separator: prev.separator.clone(),
            has_full_names: prev.has_full_names,
            refreshed_at: Some(Utc::now()),
        };
        *self.current.write() = Arc::new(next);
    }

    /// Fetch pairs and tokens through `adapter` and publish them. Mutually exclusive per cache.
    pub async fn refresh(&self, adapter: &dyn ExchangeAdapter) -> Result<RefreshOutcome, AdapterError> {
        let Ok(_guard) = self.refresh_lock.try_lock() else {
            debug!(exchange = adapter.name(), "Refresh already in progress, skipping");
            return Ok(RefreshOutcome::Skipped);
        };
        let pairs = adapter.fetch_pairs().await?;
        let tokens = adapter.fetch_tokens().await?;
        let outcome = RefreshOutcome::Updated { pairs: pairs.len(), tokens: tokens.len() };
        self.replace(pairs, tokens);
        Ok(outcome)
    }
}

#[instrument(skip(adapter), fields(exchange = adapter.name()))]
pub async fn refresh_metadata(adapter: &dyn ExchangeAdapter) -> Result<RefreshOutcome, AdapterError> {
    let outcome = adapter.metadata().refresh(adapter).await?;
    if let RefreshOutcome::Updated { pairs, tokens } = outcome {
        info!(pairs, tokens, "Refreshed exchange metadata");
    }
    Ok(outcome)
}

/// Refresh now, then every `interval` until `cancel` fires. Failures keep the previous snapshot.
pub fn spawn_refresh_loop(
    adapter: Arc<dyn ExchangeAdapter>,
    interval: Duration,
    cancel: CancelToken,
) -> JoinHandle<()> {
    tokio::spawn(async move {
        let mut ticker = tokio::time::interval(interval);
        loop {
            tokio::select! {
                _ = cancel.cancelled() => {
                    info!(exchange = adapter.name(), "Metadata refresh loop stopped");
                    return;
                }
                _ = ticker.tick() => {
                    if let Err(e) = refresh_metadata(adapter.as_ref()).await {
                        warn!(exchange = adapter.name(), error = %e, "Metadata refresh failed, keeping previous snapshot");
                    }
                }
            }
        }
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use rust_decimal_macros::dec;

    fn spec() -> PairSpec {
        PairSpec::new(dec!(0.1), dec!(0.1), dec!(0.1)).unwrap()
    }

    #[test]
    fn test_resolve_both_orientations() {
        let cache = MetadataCache::new("-", true);
        let mut pairs = HashMap::new();
        pairs.insert("AAVE-USDT".to_string(), spec());
        cache.replace(pairs, HashMap::new());
        let meta = cache.snapshot();

        let fwd = meta.resolve("AAVE", "USDT").unwrap();
        assert_eq!(fwd.pair, "AAVE-USDT");
        assert!(fwd.is_base("AAVE"));

        let rev = meta.resolve("USDT", "AAVE").unwrap();
        assert_eq!(rev.pair, "AAVE-USDT");
        assert!(!rev.is_base("USDT"));

        assert!(meta.resolve("USDT", "DOGE").is_none());
    }

    #[test]
    fn test_old_snapshot_survives_replace() {
        let cache = MetadataCache::new("_", false);
        let before = cache.snapshot();
        let mut tokens = HashMap::new();
        tokens.insert("AAVE".to_string(), String::new());
        cache.replace(HashMap::new(), tokens);

        assert!(!before.is_listed("AAVE"));
        let after = cache.snapshot();
        assert!(after.is_listed("AAVE"));
        assert_eq!(after.separator, "_");
        assert!(!after.has_full_names);
        assert!(after.refreshed_at.is_some());
    }
}
