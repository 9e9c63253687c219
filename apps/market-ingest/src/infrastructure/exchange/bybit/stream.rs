//! Bybit Public Stream
//!
//! [`StreamConnector`] / [`StreamSession`] adapters for the Bybit v5 public
//! WebSocket.
//!
//! # Stream URL
//!
//! - Linear perpetuals: `wss://stream.bybit.com/v5/public/linear`
//! - Spot: `wss://stream.bybit.com/v5/public/spot`
//! - Testnet: `wss://stream-testnet.bybit.com/v5/public/{category}`
//!
//! # Protocol
//!
//! Subscriptions are sent in batches of at most ten topics, each with a
//! `req_id` so the asynchronous response can be matched. Data frames are
//! merged by the [`StreamNormalizer`]; a delta that cannot be applied ends
//! the session so the reconnect brings a fresh snapshot.

use std::collections::HashMap;
use std::time::Duration;

use async_trait::async_trait;
use futures_util::stream::{SplitSink, SplitStream};
use futures_util::{SinkExt, StreamExt};
use tokio::net::TcpStream;
use tokio::time::{Instant, Interval};
use tokio_tungstenite::tungstenite::Message;
use tokio_tungstenite::{MaybeTlsStream, WebSocketStream};
use uuid::Uuid;

use super::codec::{self, CHANNEL_ORDERBOOK, CHANNEL_TICKERS, CHANNEL_TRADES, CodecError, Inbound, StreamNormalizer};
use super::heartbeat::{Heartbeat, HeartbeatConfig, HeartbeatEvent};
use super::messages::{WsOpResponse, WsRequest};
use crate::application::ports::{StreamConnector, StreamError, StreamSession};
use crate::domain::market::{DataClass, NormalizedEvent};
use crate::domain::subscription::SubscriptionKey;

type WsStream = WebSocketStream<MaybeTlsStream<TcpStream>>;

/// Maximum topics per subscribe request.
pub const MAX_TOPICS_PER_REQUEST: usize = 10;

// =============================================================================
// Configuration
// =============================================================================

/// Stream adapter configuration.
#[derive(Debug, Clone)]
pub struct BybitStreamConfig {
    /// Exchange identifier used in symbols.
    pub exchange: String,
    /// WebSocket URL.
    pub url: String,
    /// Order book depth channel (1, 50, 200 or 500 for linear).
    pub book_depth: usize,
    /// Heartbeat timing.
    pub heartbeat: HeartbeatConfig,
    /// Deadline for the WebSocket handshake.
    pub connect_timeout: Duration,
    /// Topics per subscribe request.
    pub batch_size: usize,
}

impl BybitStreamConfig {
    /// Configuration for the public stream of `category` on mainnet.
    #[must_use]
    pub fn public(category: &str) -> Self {
        Self::new(format!("wss://stream.bybit.com/v5/public/{category}"))
    }

    /// Configuration for an explicit URL.
    #[must_use]
    pub fn new(url: impl Into<String>) -> Self {
        Self {
            exchange: "bybit".to_string(),
            url: url.into(),
            book_depth: 50,
            heartbeat: HeartbeatConfig::default(),
            connect_timeout: Duration::from_secs(10),
            batch_size: MAX_TOPICS_PER_REQUEST,
        }
    }
}

// =============================================================================
// Connector
// =============================================================================

/// Opens Bybit public stream sessions.
#[derive(Debug, Clone)]
pub struct BybitConnector {
    config: BybitStreamConfig,
}

impl BybitConnector {
    /// Create a connector.
    #[must_use]
    pub const fn new(config: BybitStreamConfig) -> Self {
        Self { config }
    }
}

#[async_trait]
impl StreamConnector for BybitConnector {
    fn exchange(&self) -> &str {
        &self.config.exchange
    }

    fn channel_for(&self, data_class: DataClass) -> Option<String> {
        match data_class {
            DataClass::Ticker => Some(CHANNEL_TICKERS.to_string()),
            DataClass::OrderBook => Some(format!("{CHANNEL_ORDERBOOK}.{}", self.config.book_depth)),
            DataClass::Trade => Some(CHANNEL_TRADES.to_string()),
            // Open interest rides on the ticker channel
            DataClass::OpenInterest | DataClass::Derived => None,
        }
    }

    fn stream_classes(&self) -> Vec<DataClass> {
        vec![DataClass::Ticker, DataClass::OrderBook, DataClass::Trade]
    }

    async fn connect(&self) -> Result<Box<dyn StreamSession>, StreamError> {
        tracing::info!(url = %self.config.url, "Connecting to Bybit stream");

        let connect = tokio_tungstenite::connect_async(self.config.url.as_str());
        let (ws, _response) = tokio::time::timeout(self.config.connect_timeout, connect)
            .await
            .map_err(|_| StreamError::Timeout(self.config.connect_timeout))?
            .map_err(map_connect_error)?;

        let (write, read) = ws.split();
        let heartbeat = Heartbeat::new(self.config.heartbeat);
        let ticks = heartbeat.interval();
        Ok(Box::new(BybitSession {
            write,
            read,
            normalizer: StreamNormalizer::new(&self.config.exchange, self.config.book_depth),
            heartbeat,
            ticks,
            batch_size: self.config.batch_size.clamp(1, MAX_TOPICS_PER_REQUEST),
            pending: HashMap::new(),
        }))
    }
}

fn map_connect_error(error: tokio_tungstenite::tungstenite::Error) -> StreamError {
    use tokio_tungstenite::tungstenite::Error;
    match error {
        Error::Http(response) if matches!(response.status().as_u16(), 401 | 403) => {
            StreamError::Auth(format!("handshake rejected with {}", response.status()))
        }
        other => StreamError::Transport(other.to_string()),
    }
}

// =============================================================================
// Session
// =============================================================================

/// One Bybit public WebSocket connection.
pub struct BybitSession {
    write: SplitSink<WsStream, Message>,
    read: SplitStream<WsStream>,
    normalizer: StreamNormalizer,
    heartbeat: Heartbeat,
    ticks: Interval,
    batch_size: usize,
    pending: HashMap<String, Vec<String>>,
}

impl BybitSession {
    async fn send_json(&mut self, request: &WsRequest) -> Result<(), StreamError> {
        let json = serde_json::to_string(request).map_err(|e| StreamError::Protocol(e.to_string()))?;
        self.write
            .send(Message::Text(json.into()))
            .await
            .map_err(|e| StreamError::Transport(e.to_string()))
    }

    async fn send_batches(&mut self, op: &'static str, keys: &[SubscriptionKey]) -> Result<(), StreamError> {
        let topics: Vec<String> = keys.iter().map(SubscriptionKey::topic).collect();
        for chunk in topics.chunks(self.batch_size) {
            let req_id = Uuid::new_v4().to_string();
            let request = if op == "subscribe" {
                WsRequest::subscribe(chunk.to_vec(), req_id.clone())
            } else {
                WsRequest::unsubscribe(chunk.to_vec(), req_id.clone())
            };
            tracing::debug!(op, topics = ?chunk, req_id = %req_id, "Sending stream request");
            self.send_json(&request).await?;
            self.pending.insert(req_id, chunk.to_vec());
        }
        Ok(())
    }

    fn on_op(&mut self, response: WsOpResponse) {
        if matches!(response.op.as_str(), "ping" | "pong") {
            return;
        }
        let topics = response
            .req_id
            .as_ref()
            .and_then(|id| self.pending.remove(id))
            .unwrap_or_default();
        if response.success {
            tracing::debug!(op = %response.op, topics = ?topics, "Stream request confirmed");
        } else {
            tracing::warn!(
                op = %response.op,
                topics = ?topics,
                reason = %response.ret_msg,
                "Stream request rejected"
            );
        }
    }

    fn on_text(&mut self, text: &str) -> Result<Vec<NormalizedEvent>, StreamError> {
        let inbound = match codec::decode(text) {
            Ok(inbound) => inbound,
            Err(error) => {
                tracing::warn!(error = %error, "Dropping undecodable stream frame");
                return Ok(Vec::new());
            }
        };
        match inbound {
            Inbound::Op(response) => {
                self.on_op(response);
                Ok(Vec::new())
            }
            Inbound::Topic(frame) => {
                let topic = frame.topic.clone();
                match self.normalizer.normalize(frame) {
                    Ok(events) => Ok(events),
                    Err(error @ CodecError::OutOfSync { .. }) => Err(StreamError::Protocol(error.to_string())),
                    Err(error) => {
                        tracing::warn!(topic = %topic, error = %error, "Dropping malformed stream frame");
                        Ok(Vec::new())
                    }
                }
            }
        }
    }
}

#[async_trait]
impl StreamSession for BybitSession {
    async fn subscribe(&mut self, keys: &[SubscriptionKey]) -> Result<(), StreamError> {
        self.send_batches("subscribe", keys).await
    }

    async fn unsubscribe(&mut self, keys: &[SubscriptionKey]) -> Result<(), StreamError> {
        for key in keys {
            self.normalizer.forget(&key.topic());
        }
        self.send_batches("unsubscribe", keys).await
    }

    async fn next_event(&mut self) -> Result<Vec<NormalizedEvent>, StreamError> {
        tokio::select! {
            _ = self.ticks.tick() => {
                match self.heartbeat.on_tick(Instant::now()) {
                    Some(HeartbeatEvent::SendPing) => {
                        self.send_json(&WsRequest::ping()).await?;
                        Ok(Vec::new())
                    }
                    Some(HeartbeatEvent::Timeout) => {
                        tracing::warn!(
                            silent_ms = self.heartbeat.time_since_pong().as_millis(),
                            "Heartbeat timeout"
                        );
                        Err(StreamError::Timeout(self.heartbeat.time_since_pong()))
                    }
                    None => Ok(Vec::new()),
                }
            }
            msg = self.read.next() => {
                match msg {
                    Some(Ok(Message::Text(text))) => {
                        self.heartbeat.record_pong();
                        self.on_text(&text)
                    }
                    Some(Ok(Message::Ping(data))) => {
                        self.heartbeat.record_pong();
                        self.write
                            .send(Message::Pong(data))
                            .await
                            .map_err(|e| StreamError::Transport(e.to_string()))?;
                        Ok(Vec::new())
                    }
                    Some(Ok(Message::Pong(_))) => {
                        self.heartbeat.record_pong();
                        Ok(Vec::new())
                    }
                    Some(Ok(Message::Close(frame))) => {
                        tracing::info!(frame = ?frame, "Server sent close frame");
                        Err(StreamError::Closed)
                    }
                    Some(Ok(_)) => Ok(Vec::new()),
                    Some(Err(e)) => Err(StreamError::Transport(e.to_string())),
                    None => {
                        tracing::info!("WebSocket stream ended");
                        Err(StreamError::Closed)
                    }
                }
            }
        }
    }

    async fn close(&mut self) {
        self.normalizer.reset();
        self.pending.clear();
        let _ = self.write.send(Message::Close(None)).await;
        let _ = self.write.close().await;
    }
}
