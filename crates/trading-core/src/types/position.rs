//! Open position tracking types.

use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};

/// Lifecycle of a position slot held by the risk gate.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PositionStatus {
    /// Slot reserved by an approved BUY, order not yet filled.
    Reserved,
    /// Order filled, position live on the exchange.
    Open,
}

/// A single open position. At most one exists per symbol.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Position {
    pub symbol: String,
    /// Average fill price. Zero while the slot is only reserved.
    pub entry_price: Decimal,
    /// Base-currency quantity held.
    pub quantity: Decimal,
    /// Quote amount committed to the position.
    pub notional: Decimal,
    /// When the position was opened (or reserved).
    pub entry_time: DateTime<Utc>,
    pub status: PositionStatus,
}

impl Position {
    /// A filled position.
    pub fn open(
        symbol: impl Into<String>,
        entry_price: Decimal,
        quantity: Decimal,
        entry_time: DateTime<Utc>,
    ) -> Self {
        Self {
            symbol: symbol.into(),
            entry_price,
            quantity,
            notional: entry_price * quantity,
            entry_time,
            status: PositionStatus::Open,
        }
    }

    /// A slot reserved for a BUY whose fill has not been confirmed yet.
    pub fn reserved(symbol: impl Into<String>, notional: Decimal, at: DateTime<Utc>) -> Self {
        Self {
            symbol: symbol.into(),
            entry_price: Decimal::ZERO,
            quantity: Decimal::ZERO,
            notional,
            entry_time: at,
            status: PositionStatus::Reserved,
        }
    }

    pub fn is_reserved(&self) -> bool {
        self.status == PositionStatus::Reserved
    }

    /// Realized P&L if the whole position were sold at `exit_price`.
    pub fn pnl_at(&self, exit_price: Decimal) -> Decimal {
        (exit_price - self.entry_price) * self.quantity
    }
}
