pub mod cancel;
pub mod config;
pub mod engine;
pub mod market_data;
pub mod reactor;
pub mod telemetry;
