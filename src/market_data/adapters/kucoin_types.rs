// Source: https://www.kucoin.com/docs (spot REST v1 + public websocket)
use serde::{Deserialize, Serialize};

/// Every REST response is wrapped in `{ "code": "200000", "data": ... }`.
#[derive(Debug, Deserialize)]
pub struct Envelope<T> {
    pub code: String,
    #[serde(default)]
    pub msg: Option<String>,
    pub data: Option<T>,
}

// GET /api/v1/symbols
#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SymbolInfo {
    pub symbol: String,
    pub base_increment: String,
    pub quote_increment: String,
    pub price_increment: String,
    #[serde(default = "enabled")]
    pub enable_trading: bool,
}

fn enabled() -> bool {
    true
}

// GET /api/v1/currencies
#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Currency {
    pub currency: String,
    #[serde(default)]
    pub full_name: Option<String>,
}

// GET /api/v1/market/orderbook/level1?symbol=
#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Level1 {
    #[serde(default)]
    pub sequence: Option<String>,
    pub best_bid: Option<String>,
    pub best_ask: Option<String>,
}

// POST /api/v1/orders
#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct NewOrder<'a> {
    pub client_oid: String,
    pub symbol: &'a str,
    #[serde(rename = "type")]
    pub order_type: &'static str,
    pub side: &'static str,
    pub price: String,
    pub size: String,
    pub time_in_force: &'static str,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct OrderCreated {
    pub order_id: String,
}

// GET /api/v1/orders/{orderId}
#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct OrderDetails {
    pub size: String,
    pub deal_size: String,
    pub deal_funds: String,
    #[serde(default)]
    pub is_active: bool,
}

// GET /api/v1/accounts?currency=&type=trade
#[derive(Debug, Deserialize)]
pub struct Account {
    pub balance: String,
    pub available: String,
}

// POST /api/v1/bullet-public
#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Bullet {
    pub token: String,
    pub instance_servers: Vec<InstanceServer>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct InstanceServer {
    pub endpoint: String,
    #[serde(default)]
    pub ping_interval: Option<u64>,
}

// Websocket frames: {"type":"message","topic":"/market/ticker:BTC-USDT","subject":"trade.ticker","data":{...}}
#[derive(Debug, Deserialize)]
pub struct WsFrame {
    #[serde(rename = "type")]
    pub frame_type: String,
    #[serde(default)]
    pub topic: Option<String>,
    #[serde(default)]
    pub data: Option<WsTicker>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct WsTicker {
    #[serde(default)]
    pub sequence: Option<String>,
    pub best_bid: Option<String>,
    pub best_ask: Option<String>,
}

#[derive(Debug, Serialize)]
pub struct WsRequest {
    pub id: String,
    #[serde(rename = "type")]
    pub request_type: &'static str,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub topic: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub response: Option<bool>,
}
