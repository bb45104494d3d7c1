//! Trade intents produced by strategies and consumed once by the risk gate.

use crate::{Error, Result};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use std::fmt;

/// Side of a trade intent.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum Side {
    Buy,
    Sell,
}

impl Side {
    /// Whether this side can only ever reduce exposure on a long-only book.
    pub fn is_reducing(&self) -> bool {
        matches!(self, Side::Sell)
    }
}

impl fmt::Display for Side {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Side::Buy => write!(f, "BUY"),
            Side::Sell => write!(f, "SELL"),
        }
    }
}

/// A strategy's request to trade.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TradeIntent {
    /// Instrument symbol (e.g. `BTC-USDT`).
    pub symbol: String,
    pub side: Side,
    /// Order size in quote currency.
    pub notional: Decimal,
    /// Strategy that produced the intent.
    pub strategy_id: String,
}

impl TradeIntent {
    pub fn new(
        symbol: impl Into<String>,
        side: Side,
        notional: Decimal,
        strategy_id: impl Into<String>,
    ) -> Self {
        Self {
            symbol: symbol.into(),
            side,
            notional,
            strategy_id: strategy_id.into(),
        }
    }

    pub fn buy(symbol: impl Into<String>, notional: Decimal, strategy_id: impl Into<String>) -> Self {
        Self::new(symbol, Side::Buy, notional, strategy_id)
    }

    pub fn sell(symbol: impl Into<String>, notional: Decimal, strategy_id: impl Into<String>) -> Self {
        Self::new(symbol, Side::Sell, notional, strategy_id)
    }

    /// Reject malformed intents before any risk evaluation.
    pub fn validate(&self) -> Result<()> {
        if self.symbol.trim().is_empty() {
            return Err(Error::InvalidIntent("symbol must not be empty".to_string()));
        }
        if self.notional <= Decimal::ZERO {
            return Err(Error::InvalidIntent(format!(
                "notional must be positive, got {}",
                self.notional
            )));
        }
        if self.strategy_id.trim().is_empty() {
            return Err(Error::InvalidIntent(
                "strategy_id must not be empty".to_string(),
            ));
        }
        Ok(())
    }
}
