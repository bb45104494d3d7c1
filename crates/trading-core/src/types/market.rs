//! Market data types delivered by the exchange feed.

use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};

/// Latest traded/quoted price for a symbol.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Tick {
    pub symbol: String,
    pub price: Decimal,
    pub timestamp: DateTime<Utc>,
}

impl Tick {
    pub fn new(symbol: impl Into<String>, price: Decimal, timestamp: DateTime<Utc>) -> Self {
        Self {
            symbol: symbol.into(),
            price,
            timestamp,
        }
    }
}

/// Events yielded by an exchange market-data stream.
///
/// The exchange client owns wire parsing; the core only sees these.
#[derive(Debug, Clone, PartialEq)]
pub enum FeedEvent {
    Tick(Tick),
    /// Keep-alive with no payload. Still proves the connection is live.
    Heartbeat,
    /// Transport reported an error; the connection should be considered dead.
    Error(String),
}

/// Market-data subscription request.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Subscription {
    /// Channel name on the exchange (e.g. `tickers`).
    pub channel: String,
    pub symbols: Vec<String>,
}

impl Subscription {
    pub fn tickers(symbols: Vec<String>) -> Self {
        Self {
            channel: "tickers".to_string(),
            symbols,
        }
    }
}
