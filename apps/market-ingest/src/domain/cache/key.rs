//! Structured Cache Keys
//!
//! A key is the tuple `(namespace, version, domain, symbol, bucket)`. It is
//! rendered to a flat string only at the shared-tier boundary, as
//! `ns:vN:domain:exchange:TICKER:bucket`. Components are validated so two
//! producers can never render the same string for different meanings.

use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};

use crate::domain::market::{DataClass, Symbol, ValidationError};

const SEPARATOR: char = ':';

fn valid_component(value: &str) -> bool {
    !value.is_empty()
        && value
            .chars()
            .all(|c| c.is_ascii_lowercase() || c.is_ascii_digit() || matches!(c, '_' | '-'))
}

/// Producer namespace and schema generation.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct KeyNamespace {
    name: String,
    version: u16,
}

impl KeyNamespace {
    /// Create a namespace.
    ///
    /// # Errors
    ///
    /// Returns [`ValidationError::InvalidKeyComponent`] if `name` is empty or
    /// contains characters outside `[a-z0-9_-]`.
    pub fn new(name: impl Into<String>, version: u16) -> Result<Self, ValidationError> {
        let name = name.into();
        if !valid_component(&name) {
            return Err(ValidationError::InvalidKeyComponent(name));
        }
        Ok(Self { name, version })
    }

    /// Namespace name.
    #[must_use]
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Schema generation.
    #[must_use]
    pub const fn version(&self) -> u16 {
        self.version
    }
}

/// What the key holds.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(tag = "type", content = "name", rename_all = "snake_case")]
pub enum KeyDomain {
    /// Exchange-published data of one class.
    Market(DataClass),
    /// Downstream-computed metric.
    Derived(String),
}

impl fmt::Display for KeyDomain {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Market(class) => f.write_str(class.as_str()),
            Self::Derived(metric) => write!(f, "derived.{metric}"),
        }
    }
}

/// Time bucket of the value.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Bucket {
    /// Most recent value.
    Latest,
    /// Aggregate over a window of this many seconds.
    Window(u32),
}

impl fmt::Display for Bucket {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Latest => f.write_str("latest"),
            Self::Window(secs) => write!(f, "w{secs}"),
        }
    }
}

/// Structured cache key.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct CacheKey {
    namespace: KeyNamespace,
    domain: KeyDomain,
    symbol: Symbol,
    bucket: Bucket,
}

impl CacheKey {
    /// Key for the latest value of a market data class.
    #[must_use]
    pub fn latest(namespace: &KeyNamespace, symbol: Symbol, data_class: DataClass) -> Self {
        let domain = match data_class {
            DataClass::Derived => KeyDomain::Derived("value".to_string()),
            class => KeyDomain::Market(class),
        };
        Self {
            namespace: namespace.clone(),
            domain,
            symbol,
            bucket: Bucket::Latest,
        }
    }

    /// Key for a derived metric.
    ///
    /// # Errors
    ///
    /// Returns [`ValidationError::InvalidKeyComponent`] for an invalid metric name.
    pub fn derived(
        namespace: &KeyNamespace,
        metric: impl Into<String>,
        symbol: Symbol,
        bucket: Bucket,
    ) -> Result<Self, ValidationError> {
        let metric = metric.into();
        if !valid_component(&metric) {
            return Err(ValidationError::InvalidKeyComponent(metric));
        }
        Ok(Self {
            namespace: namespace.clone(),
            domain: KeyDomain::Derived(metric),
            symbol,
            bucket,
        })
    }

    /// Namespace.
    #[must_use]
    pub const fn namespace(&self) -> &KeyNamespace {
        &self.namespace
    }

    /// Domain.
    #[must_use]
    pub const fn domain(&self) -> &KeyDomain {
        &self.domain
    }

    /// Instrument.
    #[must_use]
    pub const fn symbol(&self) -> &Symbol {
        &self.symbol
    }

    /// Bucket.
    #[must_use]
    pub const fn bucket(&self) -> Bucket {
        self.bucket
    }

    /// Data class governing TTL and validation.
    #[must_use]
    pub const fn data_class(&self) -> DataClass {
        match &self.domain {
            KeyDomain::Market(class) => *class,
            KeyDomain::Derived(_) => DataClass::Derived,
        }
    }

    /// Flat string form for shared tiers.
    #[must_use]
    pub fn render(&self) -> String {
        self.to_string()
    }
}

impl fmt::Display for CacheKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{}:v{}:{}:{}:{}:{}",
            self.namespace.name,
            self.namespace.version,
            self.domain,
            self.symbol.exchange(),
            self.symbol.ticker(),
            self.bucket
        )
    }
}

impl FromStr for CacheKey {
    type Err = ValidationError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let invalid = || ValidationError::InvalidKeyComponent(s.to_string());
        let parts: Vec<&str> = s.split(SEPARATOR).collect();
        let [name, version, domain, exchange, ticker, bucket] = parts.as_slice() else {
            return Err(invalid());
        };

        let version = version
            .strip_prefix('v')
            .and_then(|v| v.parse::<u16>().ok())
            .ok_or_else(invalid)?;
        let namespace = KeyNamespace::new(*name, version)?;

        let domain = match domain.strip_prefix("derived.") {
            Some(metric) if valid_component(metric) => KeyDomain::Derived(metric.to_string()),
            Some(_) => return Err(invalid()),
            None => DataClass::parse(domain)
                .filter(|class| class.is_market())
                .map(KeyDomain::Market)
                .ok_or_else(invalid)?,
        };

        let bucket = match *bucket {
            "latest" => Bucket::Latest,
            other => other
                .strip_prefix('w')
                .and_then(|secs| secs.parse::<u32>().ok())
                .map(Bucket::Window)
                .ok_or_else(invalid)?,
        };

        Ok(Self {
            namespace,
            domain,
            symbol: Symbol::new(exchange, ticker)?,
            bucket,
        })
    }
}
