//! Bybit v5 Adapters
//!
//! Public market data for one product category:
//!
//! - **Stream**: tickers, order book and public trades over WebSocket
//! - **REST**: the same classes plus open interest, for fallback polling
//!   and cache warming
//! - **Auth**: request signing for private endpoints

pub mod auth;
pub mod codec;
pub mod heartbeat;
pub mod messages;
pub mod rest;
pub mod stream;

pub use auth::{AuthError, Credentials, DEFAULT_RECV_WINDOW, SignedHeaders, Signer};
pub use codec::{BookState, CodecError, Inbound, StreamNormalizer};
pub use heartbeat::{Heartbeat, HeartbeatConfig, HeartbeatEvent};
pub use rest::{BybitRest, BybitRestConfig, HttpClientFactory};
pub use stream::{BybitConnector, BybitSession, BybitStreamConfig};
