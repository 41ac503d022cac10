// Market data module entrypoint
pub mod adapters;   // venue contract + KuCoin / paper implementations
pub mod feed;       // polling + streaming price feeds
pub mod metadata;   // pair/token snapshots and background refresh
pub mod normaliser; // wire strings -> decimals and increments
