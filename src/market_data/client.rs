// =============================================================================
// Market-Data Client — upstream stream transport and REST fetches
// =============================================================================
//
// The upstream service speaks a bidirectional stream: the client sends one
// order-book subscription and one trades subscription, then the server
// delivers messages each carrying exactly one of an order-book payload or a
// trade payload. Prices arrive as `{units, nano}` fixed-point quotations.
//
// Runs until the stream disconnects or the stop signal fires, forwarding
// messages in arrival order; the caller (the manager) handles reconnection.

use anyhow::{Context, Result};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use futures_util::{SinkExt, StreamExt};
use serde::Deserialize;
use tokio::sync::{mpsc, watch};
use tokio_tungstenite::connect_async;
use tokio_tungstenite::tungstenite::client::IntoClientRequest;
use tokio_tungstenite::tungstenite::http::header::AUTHORIZATION;
use tokio_tungstenite::tungstenite::http::HeaderValue;
use tokio_tungstenite::tungstenite::Message;
use tracing::{error, info, warn};

use crate::config::InstrumentStatus;
use crate::market_data::resolver::{InstrumentInfo, InstrumentsClient, Quotation};
use crate::types::{OrderBookLevel, OrderBookSnapshot, Side, Trade};

const DEFAULT_API_BASE: &str = "https://invest-public-api.tbank.ru/rest";
const DEFAULT_STREAM_URL: &str = "wss://invest-public-api.tbank.ru/ws/market-data-stream";

/// One inbound stream message, already mapped to the internal model.
#[derive(Debug, Clone)]
pub enum StreamMessage {
    OrderBook(OrderBookSnapshot),
    Trade(Trade),
}

/// Upstream market-data capability consumed by the manager. Implemented by
/// the production client below and by fakes in tests.
#[async_trait]
pub trait MarketDataApi: Send + Sync {
    /// Resolve symbols into instruments; returns `(resolved, failed_symbols)`.
    async fn resolve_instruments(
        &self,
        symbols: &[String],
    ) -> Result<(Vec<InstrumentInfo>, Vec<String>)>;

    /// Open the stream, subscribe, and forward messages into `tx` in arrival
    /// order until the stream ends or `stop` fires.
    async fn stream_market_data(
        &self,
        instruments: &[InstrumentInfo],
        depth: u32,
        tx: mpsc::Sender<StreamMessage>,
        stop: watch::Receiver<bool>,
    ) -> Result<()>;

    /// Single-shot order-book fetch (used by the periodic dump task).
    async fn get_order_book(&self, instrument_id: &str, depth: u32) -> Result<OrderBookSnapshot>;
}

// =============================================================================
// Wire shapes
// =============================================================================

#[derive(Debug, Deserialize)]
struct WireLevel {
    price: Quotation,
    quantity: f64,
}

#[derive(Debug, Deserialize)]
struct WireOrderBook {
    instrument_id: String,
    #[serde(default)]
    bids: Vec<WireLevel>,
    #[serde(default)]
    asks: Vec<WireLevel>,
    #[serde(default)]
    time: Option<DateTime<Utc>>,
}

#[derive(Debug, Deserialize)]
struct WireTrade {
    instrument_id: String,
    price: Quotation,
    quantity: f64,
    #[serde(default)]
    direction: i32,
    #[serde(default)]
    time: Option<DateTime<Utc>>,
}

#[derive(Debug, Deserialize)]
struct WireMessage {
    #[serde(default)]
    orderbook: Option<WireOrderBook>,
    #[serde(default)]
    trade: Option<WireTrade>,
}

#[derive(Debug, Deserialize)]
struct OrderBookResponse {
    orderbook: WireOrderBook,
}

fn map_order_book(payload: WireOrderBook) -> OrderBookSnapshot {
    let bids: Vec<OrderBookLevel> = payload
        .bids
        .into_iter()
        .map(|level| OrderBookLevel {
            price: level.price.to_f64(),
            quantity: level.quantity,
        })
        .collect();
    let asks: Vec<OrderBookLevel> = payload
        .asks
        .into_iter()
        .map(|level| OrderBookLevel {
            price: level.price.to_f64(),
            quantity: level.quantity,
        })
        .collect();
    OrderBookSnapshot {
        instrument_id: payload.instrument_id,
        best_bid: bids.first().map(|level| level.price),
        best_ask: asks.first().map(|level| level.price),
        bids,
        asks,
        ts: payload.time.unwrap_or_else(Utc::now),
    }
}

fn map_trade(payload: WireTrade) -> Trade {
    let side = match payload.direction {
        1 => Some(Side::Buy),
        2 => Some(Side::Sell),
        _ => None,
    };
    Trade {
        instrument_id: payload.instrument_id,
        price: payload.price.to_f64(),
        quantity: payload.quantity,
        side,
        ts: payload.time.unwrap_or_else(Utc::now),
    }
}

/// Parse one stream frame. Frames carrying neither payload (acks,
/// keep-alives) map to `None`.
fn parse_stream_message(text: &str) -> Result<Option<StreamMessage>> {
    let message: WireMessage =
        serde_json::from_str(text).context("failed to parse stream JSON")?;
    if let Some(orderbook) = message.orderbook {
        return Ok(Some(StreamMessage::OrderBook(map_order_book(orderbook))));
    }
    if let Some(trade) = message.trade {
        return Ok(Some(StreamMessage::Trade(map_trade(trade))));
    }
    Ok(None)
}

fn subscribe_order_book_request(instruments: &[InstrumentInfo], depth: u32) -> serde_json::Value {
    serde_json::json!({
        "subscribe_order_book_request": {
            "subscription_action": "SUBSCRIBE",
            "instruments": instruments
                .iter()
                .map(|info| serde_json::json!({
                    "instrument_id": info.instrument_id,
                    "depth": depth,
                }))
                .collect::<Vec<_>>(),
        }
    })
}

fn subscribe_trades_request(instruments: &[InstrumentInfo]) -> serde_json::Value {
    serde_json::json!({
        "subscribe_trades_request": {
            "subscription_action": "SUBSCRIBE",
            "instruments": instruments
                .iter()
                .map(|info| serde_json::json!({
                    "instrument_id": info.instrument_id,
                }))
                .collect::<Vec<_>>(),
        }
    })
}

// =============================================================================
// Production client
// =============================================================================

/// Client for the upstream market-data service: WebSocket stream plus REST
/// instrument resolution and single-shot book fetches.
pub struct MarketDataClient {
    token: String,
    api_base: String,
    stream_url: String,
    http: reqwest::Client,
    instruments: InstrumentsClient,
    stream_idle_sleep_seconds: f64,
}

impl MarketDataClient {
    pub fn new(
        token: impl Into<String>,
        instrument_status: InstrumentStatus,
        stream_idle_sleep_seconds: f64,
    ) -> Self {
        let token = token.into();
        let http = reqwest::Client::builder()
            .timeout(std::time::Duration::from_secs(10))
            .build()
            .expect("failed to build reqwest client");
        let instruments = InstrumentsClient::new(
            http.clone(),
            DEFAULT_API_BASE,
            token.clone(),
            instrument_status,
        );
        Self {
            token,
            api_base: DEFAULT_API_BASE.to_string(),
            stream_url: DEFAULT_STREAM_URL.to_string(),
            http,
            instruments,
            stream_idle_sleep_seconds,
        }
    }
}

#[async_trait]
impl MarketDataApi for MarketDataClient {
    async fn resolve_instruments(
        &self,
        symbols: &[String],
    ) -> Result<(Vec<InstrumentInfo>, Vec<String>)> {
        let mut resolved = Vec::new();
        let mut failures = Vec::new();
        for symbol in symbols {
            match self.instruments.resolve_symbol(symbol).await {
                Ok(Some(info)) => resolved.push(info),
                Ok(None) => failures.push(symbol.clone()),
                Err(error) => {
                    warn!(symbol = %symbol, error = %error, "instrument_resolve_failed");
                    failures.push(symbol.clone());
                }
            }
        }
        Ok((resolved, failures))
    }

    async fn stream_market_data(
        &self,
        instruments: &[InstrumentInfo],
        depth: u32,
        tx: mpsc::Sender<StreamMessage>,
        mut stop: watch::Receiver<bool>,
    ) -> Result<()> {
        let mut request = self
            .stream_url
            .as_str()
            .into_client_request()
            .context("invalid stream url")?;
        request.headers_mut().insert(
            AUTHORIZATION,
            HeaderValue::from_str(&format!("Bearer {}", self.token))
                .context("token is not a valid header value")?,
        );

        info!(url = %self.stream_url, instruments = instruments.len(), "connecting to market data stream");
        let (ws_stream, _response) = connect_async(request)
            .await
            .context("failed to connect to market data stream")?;
        info!("market data stream connected");

        let (mut write, mut read) = ws_stream.split();
        write
            .send(Message::Text(
                subscribe_order_book_request(instruments, depth).to_string(),
            ))
            .await
            .context("failed to send order book subscription")?;
        write
            .send(Message::Text(
                subscribe_trades_request(instruments).to_string(),
            ))
            .await
            .context("failed to send trades subscription")?;

        let idle = std::time::Duration::from_secs_f64(self.stream_idle_sleep_seconds.max(1.0));
        loop {
            tokio::select! {
                changed = stop.changed() => {
                    if changed.is_err() || *stop.borrow() {
                        return Ok(());
                    }
                }
                message = read.next() => match message {
                    Some(Ok(Message::Text(text))) => match parse_stream_message(&text) {
                        Ok(Some(msg)) => {
                            if tx.send(msg).await.is_err() {
                                // Receiver gone; the session is over.
                                return Ok(());
                            }
                        }
                        Ok(None) => {}
                        Err(error) => {
                            warn!(error = %error, "failed to parse stream message");
                        }
                    },
                    Some(Ok(_)) => {}
                    Some(Err(error)) => {
                        error!(error = %error, "market data stream read error");
                        return Err(error.into());
                    }
                    None => {
                        warn!("market data stream ended");
                        return Ok(());
                    }
                },
                _ = tokio::time::sleep(idle) => {
                    // Long silence; nudge the connection so dead peers surface.
                    write
                        .send(Message::Ping(Vec::new()))
                        .await
                        .context("keep-alive ping failed")?;
                }
            }
        }
    }

    async fn get_order_book(&self, instrument_id: &str, depth: u32) -> Result<OrderBookSnapshot> {
        let url = format!("{}/marketdata/order-book", self.api_base);
        let body = serde_json::json!({
            "instrument_id": instrument_id,
            "depth": depth,
        });
        let response = self
            .http
            .post(&url)
            .bearer_auth(&self.token)
            .json(&body)
            .send()
            .await
            .context("order book request failed")?
            .error_for_status()
            .context("order book request returned an error status")?
            .json::<OrderBookResponse>()
            .await
            .context("order book response did not parse")?;
        Ok(map_order_book(response.orderbook))
    }
}
