//! Order results returned by the exchange client.

use crate::types::Side;
use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Terminal status of a placed order.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum OrderStatus {
    /// Order fully filled.
    Filled,
    /// Order partially filled before being cancelled.
    PartiallyFilled,
    /// Order rejected by exchange.
    Rejected,
}

/// Outcome of `ExchangeClient::place_order`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct OrderResult {
    pub order_id: Uuid,
    pub symbol: String,
    pub side: Side,
    pub status: OrderStatus,
    /// Base quantity filled.
    pub filled_quantity: Decimal,
    /// Volume-weighted fill price.
    pub average_price: Decimal,
    /// Rejection message from the exchange, if any.
    pub reject_reason: Option<String>,
    pub timestamp: DateTime<Utc>,
}

impl OrderResult {
    pub fn filled(symbol: impl Into<String>, side: Side, quantity: Decimal, price: Decimal) -> Self {
        Self {
            order_id: Uuid::new_v4(),
            symbol: symbol.into(),
            side,
            status: OrderStatus::Filled,
            filled_quantity: quantity,
            average_price: price,
            reject_reason: None,
            timestamp: Utc::now(),
        }
    }

    pub fn rejected(symbol: impl Into<String>, side: Side, reason: impl Into<String>) -> Self {
        Self {
            order_id: Uuid::new_v4(),
            symbol: symbol.into(),
            side,
            status: OrderStatus::Rejected,
            filled_quantity: Decimal::ZERO,
            average_price: Decimal::ZERO,
            reject_reason: Some(reason.into()),
            timestamp: Utc::now(),
        }
    }

    /// Whether any quantity was executed.
    pub fn has_fill(&self) -> bool {
        self.status != OrderStatus::Rejected && self.filled_quantity > Decimal::ZERO
    }
}
