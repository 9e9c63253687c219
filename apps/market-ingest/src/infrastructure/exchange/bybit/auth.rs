//! Bybit Request Signing
//!
//! Private REST endpoints require an HMAC-SHA256 signature over
//! `timestamp + api_key + recv_window + payload`, where `payload` is the
//! query string for `GET` and the JSON body for `POST`. The signature and
//! its inputs travel in `X-BAPI-*` headers.
//!
//! Public market-data endpoints and channels are unsigned.
//!
//! # References
//!
//! - [Bybit v5 Authentication](https://bybit-exchange.github.io/docs/v5/guide#authentication)

use std::time::Duration;

use chrono::Utc;
use hmac::{Hmac, Mac};
use sha2::Sha256;
use thiserror::Error;

type HmacSha256 = Hmac<Sha256>;

// =============================================================================
// Constants
// =============================================================================

/// API key header.
pub const HEADER_API_KEY: &str = "X-BAPI-API-KEY";
/// Millisecond timestamp header.
pub const HEADER_TIMESTAMP: &str = "X-BAPI-TIMESTAMP";
/// Receive window header.
pub const HEADER_RECV_WINDOW: &str = "X-BAPI-RECV-WINDOW";
/// Signature header.
pub const HEADER_SIGN: &str = "X-BAPI-SIGN";

/// Default validity window of a signed request.
pub const DEFAULT_RECV_WINDOW: Duration = Duration::from_secs(5);

// =============================================================================
// Errors
// =============================================================================

/// Credential errors.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum AuthError {
    /// Key or secret missing.
    #[error("invalid credentials: {0}")]
    InvalidCredentials(String),

    /// The secret could not key the MAC.
    #[error("signing failed: {0}")]
    Signing(String),
}

// =============================================================================
// Credentials
// =============================================================================

/// Bybit API credentials.
///
/// The `Debug` implementation redacts both values for safe logging.
#[derive(Clone, PartialEq, Eq)]
pub struct Credentials {
    api_key: String,
    api_secret: String,
}

impl Credentials {
    /// Create new credentials.
    ///
    /// # Errors
    ///
    /// Returns an error if either key or secret is empty.
    pub fn new(api_key: impl Into<String>, api_secret: impl Into<String>) -> Result<Self, AuthError> {
        let api_key = api_key.into();
        let api_secret = api_secret.into();

        if api_key.trim().is_empty() {
            return Err(AuthError::InvalidCredentials("API key cannot be empty".to_string()));
        }
        if api_secret.trim().is_empty() {
            return Err(AuthError::InvalidCredentials("API secret cannot be empty".to_string()));
        }

        Ok(Self { api_key, api_secret })
    }

    /// API key.
    #[must_use]
    pub fn api_key(&self) -> &str {
        &self.api_key
    }
}

impl std::fmt::Debug for Credentials {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Credentials")
            .field("api_key", &redact(&self.api_key))
            .field("api_secret", &"[REDACTED]")
            .finish()
    }
}

fn redact(value: &str) -> String {
    let visible: String = value.chars().take(4).collect();
    format!("{visible}****")
}

// =============================================================================
// Signer
// =============================================================================

/// Signs private requests.
#[derive(Debug, Clone)]
pub struct Signer {
    credentials: Credentials,
    recv_window: Duration,
}

/// Headers for one signed request.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SignedHeaders {
    /// API key.
    pub api_key: String,
    /// Millisecond timestamp.
    pub timestamp: String,
    /// Receive window in milliseconds.
    pub recv_window: String,
    /// Hex signature.
    pub sign: String,
}

impl SignedHeaders {
    /// `(name, value)` pairs in header order.
    #[must_use]
    pub fn pairs(&self) -> [(&'static str, &str); 4] {
        [
            (HEADER_API_KEY, self.api_key.as_str()),
            (HEADER_TIMESTAMP, self.timestamp.as_str()),
            (HEADER_RECV_WINDOW, self.recv_window.as_str()),
            (HEADER_SIGN, self.sign.as_str()),
        ]
    }
}

impl Signer {
    /// Create a signer.
    #[must_use]
    pub const fn new(credentials: Credentials, recv_window: Duration) -> Self {
        Self {
            credentials,
            recv_window,
        }
    }

    /// Hex HMAC-SHA256 of `timestamp + api_key + recv_window + payload`.
    ///
    /// # Errors
    ///
    /// Returns [`AuthError::Signing`] if the secret cannot key the MAC.
    pub fn sign(&self, timestamp_ms: i64, payload: &str) -> Result<String, AuthError> {
        let prehash = format!(
            "{timestamp_ms}{}{}{payload}",
            self.credentials.api_key,
            self.recv_window.as_millis()
        );
        let mut mac = HmacSha256::new_from_slice(self.credentials.api_secret.as_bytes())
            .map_err(|e| AuthError::Signing(e.to_string()))?;
        mac.update(prehash.as_bytes());
        Ok(hex::encode(mac.finalize().into_bytes()))
    }

    /// Headers for a request with `payload`, stamped now.
    ///
    /// # Errors
    ///
    /// Returns [`AuthError::Signing`] if the secret cannot key the MAC.
    pub fn headers(&self, payload: &str) -> Result<SignedHeaders, AuthError> {
        self.headers_at(Utc::now().timestamp_millis(), payload)
    }

    /// Headers for a request with `payload`, stamped `timestamp_ms`.
    ///
    /// # Errors
    ///
    /// Returns [`AuthError::Signing`] if the secret cannot key the MAC.
    pub fn headers_at(&self, timestamp_ms: i64, payload: &str) -> Result<SignedHeaders, AuthError> {
        Ok(SignedHeaders {
            api_key: self.credentials.api_key.clone(),
            timestamp: timestamp_ms.to_string(),
            recv_window: self.recv_window.as_millis().to_string(),
            sign: self.sign(timestamp_ms, payload)?,
        })
    }
}
