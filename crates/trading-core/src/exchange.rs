//! Exchange client seam.
//!
//! The core never speaks a wire protocol. A concrete client (REST + WebSocket,
//! FIX, a paper simulator) implements this trait and is injected into the feed
//! supervisor, the order executor, and the risk gate's reconciliation.

use crate::types::{FeedEvent, OrderResult, Position, Subscription, Tick, TradeIntent};
use crate::Result;
use async_trait::async_trait;
use rust_decimal::Decimal;
use tokio::sync::mpsc;

/// Stream of market-data events for one live connection.
///
/// The connection is considered dead once the sender side is dropped.
pub type FeedStream = mpsc::Receiver<FeedEvent>;

#[cfg_attr(any(test, feature = "mocks"), mockall::automock)]
#[async_trait]
pub trait ExchangeClient: Send + Sync {
    /// Open a market-data connection.
    async fn connect(&self) -> Result<FeedStream>;

    /// Send a subscription on the current connection.
    async fn subscribe(&self, subscription: &Subscription) -> Result<()>;

    /// Place an order for `intent`. `reference_price` is the last known price
    /// and lets the client convert quote notional into base quantity.
    async fn place_order(
        &self,
        intent: &TradeIntent,
        reference_price: Option<Decimal>,
    ) -> Result<OrderResult>;

    /// Poll the current ticker over request/response. Secondary price source
    /// when the streaming feed is stale.
    async fn fetch_ticker(&self, symbol: &str) -> Result<Tick>;

    /// Positions the exchange currently reports as open.
    async fn open_positions(&self) -> Result<Vec<Position>>;
}
