//! Shared fixtures for integration tests: a scripted exchange stream and a
//! recording event sink.

#![allow(dead_code, clippy::unwrap_used, clippy::expect_used)]

use std::collections::VecDeque;
use std::sync::Arc;
use std::sync::atomic::{AtomicU32, Ordering};
use std::time::Duration;

use async_trait::async_trait;
use chrono::Utc;
use parking_lot::Mutex;
use rust_decimal_macros::dec;
use tokio::sync::mpsc;

use market_ingest::application::ports::{EventSink, StreamConnector, StreamError, StreamSession};
use market_ingest::domain::market::{DataClass, MarketPayload, NormalizedEvent, Symbol, TickerData};
use market_ingest::domain::subscription::SubscriptionKey;

/// Input for a live fake session.
enum SessionInput {
    Event(NormalizedEvent),
    Drop,
}

/// Scripted exchange: counts connects, records subscribe batches, and
/// lets the test push events or drop every live socket.
#[derive(Default)]
pub struct FakeExchange {
    connects: AtomicU32,
    connect_failures: Mutex<VecDeque<StreamError>>,
    subscribed: Mutex<Vec<Vec<SubscriptionKey>>>,
    unsubscribed: Mutex<Vec<Vec<SubscriptionKey>>>,
    sessions: Mutex<Vec<mpsc::UnboundedSender<SessionInput>>>,
    classes: Vec<DataClass>,
}

impl FakeExchange {
    /// Exchange streaming tickers only.
    pub fn new() -> Arc<Self> {
        Self::with_classes(vec![DataClass::Ticker])
    }

    pub fn with_classes(classes: Vec<DataClass>) -> Arc<Self> {
        Arc::new(Self {
            classes,
            ..Self::default()
        })
    }

    /// Fail the next connect attempts with these errors, in order.
    pub fn fail_next_connects(&self, errors: impl IntoIterator<Item = StreamError>) {
        self.connect_failures.lock().extend(errors);
    }

    /// Let every following connect succeed.
    pub fn clear_connect_failures(&self) {
        self.connect_failures.lock().clear();
    }

    pub fn connects(&self) -> u32 {
        self.connects.load(Ordering::SeqCst)
    }

    /// Every subscribe batch sent so far.
    pub fn subscribe_batches(&self) -> Vec<Vec<SubscriptionKey>> {
        self.subscribed.lock().clone()
    }

    pub fn unsubscribe_batches(&self) -> Vec<Vec<SubscriptionKey>> {
        self.unsubscribed.lock().clone()
    }

    /// Push an event to every live session.
    pub fn push(&self, event: &NormalizedEvent) {
        self.sessions
            .lock()
            .retain(|tx| tx.send(SessionInput::Event(event.clone())).is_ok());
    }

    /// Break every live session with a transport error.
    pub fn drop_all(&self) {
        for tx in self.sessions.lock().drain(..) {
            let _ = tx.send(SessionInput::Drop);
        }
    }

    pub fn live_sessions(&self) -> usize {
        self.sessions.lock().iter().filter(|tx| !tx.is_closed()).count()
    }
}

/// Connector handing out sessions of a [`FakeExchange`].
pub struct FakeConnector(pub Arc<FakeExchange>);

#[async_trait]
impl StreamConnector for FakeConnector {
    fn exchange(&self) -> &str {
        "bybit"
    }

    fn channel_for(&self, data_class: DataClass) -> Option<String> {
        match data_class {
            DataClass::Ticker => Some("tickers".to_string()),
            DataClass::OrderBook => Some("orderbook.1".to_string()),
            DataClass::Trade => Some("publicTrade".to_string()),
            DataClass::OpenInterest | DataClass::Derived => None,
        }
    }

    fn stream_classes(&self) -> Vec<DataClass> {
        self.0.classes.clone()
    }

    async fn connect(&self) -> Result<Box<dyn StreamSession>, StreamError> {
        self.0.connects.fetch_add(1, Ordering::SeqCst);
        if let Some(error) = self.0.connect_failures.lock().pop_front() {
            return Err(error);
        }
        let (tx, rx) = mpsc::unbounded_channel();
        self.0.sessions.lock().push(tx);
        Ok(Box::new(FakeSession {
            exchange: Arc::clone(&self.0),
            inputs: rx,
        }))
    }
}

struct FakeSession {
    exchange: Arc<FakeExchange>,
    inputs: mpsc::UnboundedReceiver<SessionInput>,
}

#[async_trait]
impl StreamSession for FakeSession {
    async fn subscribe(&mut self, keys: &[SubscriptionKey]) -> Result<(), StreamError> {
        self.exchange.subscribed.lock().push(keys.to_vec());
        Ok(())
    }

    async fn unsubscribe(&mut self, keys: &[SubscriptionKey]) -> Result<(), StreamError> {
        self.exchange.unsubscribed.lock().push(keys.to_vec());
        Ok(())
    }

    async fn next_event(&mut self) -> Result<Vec<NormalizedEvent>, StreamError> {
        match self.inputs.recv().await {
            Some(SessionInput::Event(event)) => Ok(vec![event]),
            Some(SessionInput::Drop) => Err(StreamError::Transport("connection reset".to_string())),
            None => std::future::pending().await,
        }
    }

    async fn close(&mut self) {
        self.inputs.close();
    }
}

/// Sink that keeps every delivered event.
#[derive(Default)]
pub struct RecordingSink {
    events: Mutex<Vec<NormalizedEvent>>,
}

impl RecordingSink {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub fn events(&self) -> Vec<NormalizedEvent> {
        self.events.lock().clone()
    }
}

#[async_trait]
impl EventSink for RecordingSink {
    async fn deliver(&self, event: NormalizedEvent) {
        self.events.lock().push(event);
    }
}

pub fn symbol(ticker: &str) -> Symbol {
    Symbol::new("bybit", ticker).unwrap()
}

pub fn ticker_event(symbol: &Symbol, last_price: rust_decimal::Decimal) -> NormalizedEvent {
    NormalizedEvent::new(
        symbol.clone(),
        MarketPayload::Ticker(TickerData {
            last_price,
            bid_price: Some(last_price - dec!(0.5)),
            ask_price: Some(last_price + dec!(0.5)),
            volume_24h: None,
        }),
        Utc::now(),
    )
}

/// Poll `check` every 10ms until it holds or `within` elapses.
pub async fn eventually(within: Duration, mut check: impl FnMut() -> bool) -> bool {
    let deadline = tokio::time::Instant::now() + within;
    loop {
        if check() {
            return true;
        }
        if tokio::time::Instant::now() >= deadline {
            return false;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
}
