// Layered settings: built-in defaults, then an optional TOML file, then LISTX_*
// environment variables (LISTX_REACTION__SELL_AMOUNT=50).

use std::collections::HashMap;
use std::path::Path;
use std::time::Duration;

use anyhow::Context;
use config::{Config, Environment, File};
use rust_decimal::Decimal;
use serde::Deserialize;

use crate::engine::trailing::TrailingParams;

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct Settings {
    pub log_filter: String,
    pub metrics_port: Option<u16>,
    pub reaction: ReactionSettings,
    pub strategy: StrategySettings,
    pub feed: FeedSettings,
    pub kucoin: KucoinSettings,
    pub paper: PaperSettings,
}

impl Default for Settings {
    fn default() -> Self {
        Self {
            log_filter: "info,listx_rs=debug".to_string(),
            metrics_port: None,
            reaction: ReactionSettings::default(),
            strategy: StrategySettings::default(),
            feed: FeedSettings::default(),
            kucoin: KucoinSettings::default(),
            paper: PaperSettings::default(),
        }
    }
}

impl Settings {
    pub fn load(path: Option<&Path>) -> anyhow::Result<Self> {
        let mut builder = Config::builder();
        if let Some(path) = path {
            builder = builder.add_source(File::from(path).required(false));
        }
        builder
            .add_source(Environment::with_prefix("LISTX").prefix_separator("_").separator("__"))
            .build()
            .context("reading configuration")?
            .try_deserialize()
            .context("invalid configuration")
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct ReactionSettings {
    /// Token spent on acquisitions and received on exits
    pub quote_token: String,
    pub max_impact: Decimal,
    /// Quote-token notional spent per reaction
    pub sell_amount: Decimal,
    pub exit_impact: Decimal,
    pub tick_timeout_ms: u64,
    pub retry_delay_ms: u64,
}

impl Default for ReactionSettings {
    fn default() -> Self {
        Self {
            quote_token: "USDT".to_string(),
            max_impact: Decimal::new(1, 1),
            sell_amount: Decimal::from(130),
            exit_impact: Decimal::new(2, 1),
            tick_timeout_ms: 1_000,
            retry_delay_ms: 500,
        }
    }
}

impl ReactionSettings {
    pub fn tick_timeout(&self) -> Duration {
        Duration::from_millis(self.tick_timeout_ms)
    }

    pub fn retry_delay(&self) -> Duration {
        Duration::from_millis(self.retry_delay_ms)
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct StrategySettings {
    pub floor_ratio: Decimal,
    pub ceil_multiple: Decimal,
    pub trail_ratio: Decimal,
}

impl Default for StrategySettings {
    fn default() -> Self {
        let params = TrailingParams::default();
        Self {
            floor_ratio: params.floor_ratio,
            ceil_multiple: params.ceil_multiple,
            trail_ratio: params.trail_ratio,
        }
    }
}

impl From<&StrategySettings> for TrailingParams {
    fn from(s: &StrategySettings) -> Self {
        TrailingParams {
            floor_ratio: s.floor_ratio,
            ceil_multiple: s.ceil_multiple,
            trail_ratio: s.trail_ratio,
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct FeedSettings {
    /// Poll instead of trusting a fresh subscription for this long
    pub warmup_ms: u64,
    pub poll_interval_ms: u64,
    pub keepalive_ms: u64,
    /// Venue tokens live 24h; rotate a little earlier
    pub token_lifetime_secs: u64,
    pub backoff_initial_ms: u64,
    pub backoff_max_ms: u64,
    pub channel_capacity: usize,
}

impl Default for FeedSettings {
    fn default() -> Self {
        Self {
            warmup_ms: 2_000,
            poll_interval_ms: 500,
            keepalive_ms: 8_000,
            token_lifetime_secs: 86_400 - 500,
            backoff_initial_ms: 1_000,
            backoff_max_ms: 30_000,
            channel_capacity: 64,
        }
    }
}

impl FeedSettings {
    pub fn warmup(&self) -> Duration {
        Duration::from_millis(self.warmup_ms)
    }

    pub fn poll_interval(&self) -> Duration {
        Duration::from_millis(self.poll_interval_ms)
    }

    pub fn keepalive(&self) -> Duration {
        Duration::from_millis(self.keepalive_ms)
    }

    pub fn token_lifetime(&self) -> Duration {
        Duration::from_secs(self.token_lifetime_secs)
    }

    pub fn backoff_initial(&self) -> Duration {
        Duration::from_millis(self.backoff_initial_ms)
    }

    pub fn backoff_max(&self) -> Duration {
        Duration::from_millis(self.backoff_max_ms)
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct KucoinSettings {
    pub rest_url: String,
    pub fallback_increment: Decimal,
    pub refresh_interval_secs: u64,
}

impl Default for KucoinSettings {
    fn default() -> Self {
        Self {
            rest_url: "https://api.kucoin.com".to_string(),
            fallback_increment: Decimal::new(1, 2),
            refresh_interval_secs: 3_600,
        }
    }
}

impl KucoinSettings {
    pub fn refresh_interval(&self) -> Duration {
        Duration::from_secs(self.refresh_interval_secs)
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct PaperSettings {
    pub balances: HashMap<String, Decimal>,
}

impl Default for PaperSettings {
    fn default() -> Self {
        Self { balances: HashMap::from([("USDT".to_string(), Decimal::from(1_000))]) }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rust_decimal_macros::dec;

    #[test]
    fn test_defaults() {
        let s = Settings::default();
        assert_eq!(s.reaction.quote_token, "USDT");
        assert_eq!(s.reaction.max_impact, dec!(0.1));
        assert_eq!(s.reaction.exit_impact, dec!(0.2));
        assert_eq!(s.feed.token_lifetime(), Duration::from_secs(85_900));
        assert_eq!(s.kucoin.fallback_increment, dec!(0.01));
        let params = TrailingParams::from(&s.strategy);
        assert_eq!(params, TrailingParams::default());
    }

    #[test]
    fn test_missing_file_falls_back_to_defaults() {
        let s = Settings::load(Some(Path::new("/nonexistent/listx.toml"))).unwrap();
        assert_eq!(s.feed.poll_interval(), Duration::from_millis(500));
    }
}
