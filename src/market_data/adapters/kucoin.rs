// KuCoin spot adapter: public market data over REST + websocket, private endpoints through an
// injected request signer.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use chrono::Utc;
use futures::{SinkExt, StreamExt};
use reqwest::header::CONTENT_TYPE;
use reqwest::Method;
use rust_decimal::Decimal;
use serde::de::DeserializeOwned;
use tokio::net::TcpStream;
use tokio_tungstenite::tungstenite::Message;
use tokio_tungstenite::{MaybeTlsStream, WebSocketStream};
use tracing::{debug, info, instrument, trace, warn};

use super::kucoin_types::{
    Account, Bullet, Currency, Envelope, Level1, NewOrder, OrderCreated, OrderDetails, SymbolInfo,
    WsFrame, WsRequest,
};
use super::{AdapterError, Balance, BestPrice, ExchangeAdapter, OrderAck, OrderFill, PriceStream, RawTick};
use crate::engine::types::{PairSpec, SizedOrder, TimeInForce};
use crate::market_data::metadata::MetadataCache;
use crate::market_data::normaliser::Normaliser;

pub const KUCOIN_REST_URL: &str = "https://api.kucoin.com";
pub const KUCOIN_SUCCESS_CODE: &str = "200000";

/// Produces the authentication headers for one private request.
///
/// `timestamp_ms` is taken fresh for every call so concurrent requests never share a nonce.
pub trait RequestSigner: Send + Sync {
    fn sign(&self, timestamp_ms: i64, method: &str, endpoint: &str, body: &str) -> Vec<(String, String)>;
}

pub struct KucoinAdapter {
    client: reqwest::Client,
    rest_url: String,
    normaliser: Normaliser,
    signer: Option<Arc<dyn RequestSigner>>,
    metadata: MetadataCache,
}

impl KucoinAdapter {
    pub fn new(rest_url: &str, fallback_increment: Decimal) -> Result<Self, AdapterError> {
        let client = reqwest::Client::builder()
            .timeout(Duration::from_secs(10))
            .gzip(true)
            .build()?;
        Ok(Self {
            client,
            rest_url: rest_url.trim_end_matches('/').to_string(),
            normaliser: Normaliser::new(fallback_increment),
            signer: None,
            metadata: MetadataCache::new("-", true),
        })
    }

    pub fn with_signer(mut self, signer: Arc<dyn RequestSigner>) -> Self {
        self.signer = Some(signer);
        self
    }

    fn url(&self, endpoint: &str) -> String {
        format!("{}{}", self.rest_url, endpoint)
    }

    fn unwrap_envelope<T>(&self, env: Envelope<T>) -> Result<T, AdapterError> {
        if env.code != KUCOIN_SUCCESS_CODE {
            return Err(AdapterError::Api {
                exchange: "kucoin".into(),
                code: env.code,
                message: env.msg.unwrap_or_default(),
            });
        }
        env.data.ok_or_else(|| AdapterError::Decode("response without data".into()))
    }

    async fn get_public<T: DeserializeOwned>(&self, endpoint: &str) -> Result<T, AdapterError> {
        let env: Envelope<T> = self.client.get(self.url(endpoint)).send().await?.json().await?;
        self.unwrap_envelope(env)
    }

    async fn send_private<T: DeserializeOwned>(
        &self,
        method: Method,
        endpoint: &str,
        body: Option<String>,
    ) -> Result<Envelope<T>, AdapterError> {
        let signer = self.signer.as_ref().ok_or(AdapterError::MissingSigner)?;
        let body = body.unwrap_or_default();
        let timestamp_ms = Utc::now().timestamp_millis();

        let mut req = self
            .client
            .request(method.clone(), self.url(endpoint))
            .header(CONTENT_TYPE, "application/json");
        for (name, value) in signer.sign(timestamp_ms, method.as_str(), endpoint, &body) {
            req = req.header(name, value);
        }
        if !body.is_empty() {
            req = req.body(body);
        }
        // error statuses still carry a JSON envelope with the venue's code
        Ok(req.send().await?.json().await?)
    }

    async fn fetch_bullet(&self) -> Result<Bullet, AdapterError> {
        let env: Envelope<Bullet> = self.client.post(self.url("/api/v1/bullet-public")).send().await?.json().await?;
        self.unwrap_envelope(env)
    }
}

#[async_trait]
impl ExchangeAdapter for KucoinAdapter {
    fn name(&self) -> &str {
        "kucoin"
    }

    fn success_code(&self) -> &str {
        KUCOIN_SUCCESS_CODE
    }

    fn supports_streaming(&self) -> bool {
        true
    }

    fn metadata(&self) -> &MetadataCache {
        &self.metadata
    }

    async fn fetch_pairs(&self) -> Result<HashMap<String, PairSpec>, AdapterError> {
        let symbols: Vec<SymbolInfo> = self.get_public("/api/v1/symbols").await?;
        let mut pairs = HashMap::with_capacity(symbols.len());
        for s in symbols.into_iter().filter(|s| s.enable_trading) {
            match self.normaliser.pair_spec(&s.base_increment, &s.quote_increment, &s.price_increment) {
                Ok(spec) => {
                    pairs.insert(s.symbol, spec);
                }
                Err(e) => warn!(symbol = %s.symbol, error = %e, "Skipping pair with malformed increments"),
            }
        }
        Ok(pairs)
    }

    async fn fetch_tokens(&self) -> Result<HashMap<String, String>, AdapterError> {
        let currencies: Vec<Currency> = self.get_public("/api/v1/currencies").await?;
        // `currency` is the symbol the trading endpoints use
        Ok(currencies
            .into_iter()
            .map(|c| (c.currency, c.full_name.unwrap_or_default()))
            .collect())
    }

    #[instrument(level = "trace", skip(self))]
    async fn best_price(&self, pair: &str) -> Result<BestPrice, AdapterError> {
        let endpoint = format!("/api/v1/market/orderbook/level1?symbol={pair}");
        let level1: Option<Level1> = match self.get_public(&endpoint).await {
            Ok(l) => Some(l),
            // unknown symbols come back as a success envelope with null data
            Err(AdapterError::Decode(_)) => None,
            Err(e) => return Err(e),
        };
        let level1 = level1.ok_or_else(|| AdapterError::PairUnavailable(pair.to_string()))?;
        Ok(BestPrice {
            bid: self.normaliser.price("bestBid", level1.best_bid.as_deref())?,
            ask: self.normaliser.price("bestAsk", level1.best_ask.as_deref())?,
        })
    }

    #[instrument(skip(self), fields(pair = %order.pair))]
    async fn place_limit_order(
        &self,
        order: &SizedOrder,
        time_in_force: TimeInForce,
    ) -> Result<OrderAck, AdapterError> {
        let body = NewOrder {
            client_oid: format!("{:032x}", rand::random::<u128>()),
            symbol: &order.pair,
            order_type: "limit",
            side: order.side.as_str(),
            price: order.limit_price.normalize().to_string(),
            size: order.base_quantity.normalize().to_string(),
            time_in_force: time_in_force.as_str(),
        };
        let body = serde_json::to_string(&body)?;
        debug!(%body, "Placing limit order");

        let env: Envelope<OrderCreated> = self.send_private(Method::POST, "/api/v1/orders", Some(body)).await?;
        let ack = OrderAck {
            order_id: env.data.map(|d| d.order_id).unwrap_or_default(),
            status_code: env.code,
            message: env.msg,
        };
        info!(order_id = %ack.order_id, code = %ack.status_code, "Order response");
        Ok(ack)
    }

    async fn order_fill(&self, order_id: &str) -> Result<OrderFill, AdapterError> {
        let endpoint = format!("/api/v1/orders/{order_id}");
        let env: Envelope<OrderDetails> = self.send_private(Method::GET, &endpoint, None).await?;
        let details = self.unwrap_envelope(env)?;
        Ok(OrderFill {
            filled_base: self.normaliser.decimal("dealSize", &details.deal_size)?,
            filled_quote: self.normaliser.decimal("dealFunds", &details.deal_funds)?,
            requested_base: self.normaliser.decimal("size", &details.size)?,
            is_active: details.is_active,
        })
    }

    async fn balance(&self, token: &str) -> Result<Balance, AdapterError> {
        let endpoint = format!("/api/v1/accounts?currency={token}&type=trade");
        let env: Envelope<Vec<Account>> = self.send_private(Method::GET, &endpoint, None).await?;
        let accounts = self.unwrap_envelope(env)?;
        let Some(account) = accounts.first() else {
            return Ok(Balance::default());
        };
        Ok(Balance {
            total: self.normaliser.decimal("balance", &account.balance)?,
            available: self.normaliser.decimal("available", &account.available)?,
        })
    }

    async fn subscribe_price_stream(&self, pair: &str) -> Result<Box<dyn PriceStream>, AdapterError> {
        let bullet = self.fetch_bullet().await?;
        let server = bullet
            .instance_servers
            .first()
            .ok_or_else(|| AdapterError::Decode("bullet without instance servers".into()))?;
        let connect_id = Utc::now().timestamp_millis();
        let url = format!("{}?token={}&connectId={connect_id}", server.endpoint, bullet.token);

        let (mut ws, response) = tokio_tungstenite::connect_async(url.as_str()).await?;
        debug!(status = %response.status(), ping_interval = ?server.ping_interval, "Websocket connected");

        let topic = format!("/market/ticker:{pair}");
        let subscribe = WsRequest {
            id: connect_id.to_string(),
            request_type: "subscribe",
            topic: Some(topic.clone()),
            response: Some(true),
        };
        ws.send(Message::Text(serde_json::to_string(&subscribe)?)).await?;
        info!(%topic, "Subscribed to ticker");

        Ok(Box::new(KucoinTickerStream { ws, topic, normaliser: self.normaliser }))
    }
}

pub struct KucoinTickerStream {
    ws: WebSocketStream<MaybeTlsStream<TcpStream>>,
    topic: String,
    normaliser: Normaliser,
}

/// Decode one text frame. `Ok(None)` for frames that carry no ticker (welcome, ack, pong).
pub fn decode_ticker_frame(
    text: &str,
    topic: &str,
    normaliser: &Normaliser,
) -> Result<Option<RawTick>, AdapterError> {
    let frame: WsFrame = serde_json::from_str(text)?;
    match frame.frame_type.as_str() {
        "message" if frame.topic.as_deref() == Some(topic) => {
            let data = frame
                .data
                .ok_or_else(|| AdapterError::Decode("ticker frame without data".into()))?;
            Ok(Some(RawTick {
                best_bid: normaliser.price("bestBid", data.best_bid.as_deref())?,
                best_ask: normaliser.price("bestAsk", data.best_ask.as_deref())?,
                sequence: data.sequence.and_then(|s| s.parse().ok()).unwrap_or_default(),
            }))
        }
        "error" => Err(AdapterError::Api {
            exchange: "kucoin".into(),
            code: "ws".into(),
            message: text.to_string(),
        }),
        _ => Ok(None),
    }
}

#[async_trait]
impl PriceStream for KucoinTickerStream {
    async fn next_tick(&mut self) -> Option<Result<RawTick, AdapterError>> {
        loop {
            match self.ws.next().await? {
                Ok(Message::Text(text)) => match decode_ticker_frame(&text, &self.topic, &self.normaliser) {
                    Ok(Some(tick)) => return Some(Ok(tick)),
                    Ok(None) => trace!(%text, "Ignoring control frame"),
                    Err(e) => return Some(Err(e)),
                },
                Ok(Message::Ping(data)) => {
                    if let Err(e) = self.ws.send(Message::Pong(data)).await {
                        return Some(Err(e.into()));
                    }
                }
                Ok(Message::Close(frame)) => {
                    info!(?frame, "Websocket closed by server");
                    return None;
                }
                Ok(_) => {}
                Err(e) => return Some(Err(e.into())),
            }
        }
    }

    async fn ping(&mut self) -> Result<(), AdapterError> {
        let ping = WsRequest {
            id: Utc::now().timestamp_millis().to_string(),
            request_type: "ping",
            topic: None,
            response: None,
        };
        self.ws.send(Message::Text(serde_json::to_string(&ping)?)).await?;
        Ok(())
    }

    async fn close(&mut self) {
        if let Err(e) = self.ws.close(None).await {
            debug!(error = %e, "Websocket close failed");
        }
    }
}
