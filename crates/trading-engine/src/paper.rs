//! Paper exchange: an in-process [`ExchangeClient`] for paper runs and tests.
//!
//! Fills every order at the last known price, keeps its own book of open
//! positions, and can be told to fail connects, orders, or ticker polls.

use async_trait::async_trait;
use chrono::Utc;
use dashmap::DashMap;
use rand::Rng;
use rust_decimal::Decimal;
use std::sync::atomic::{AtomicU32, AtomicU64, Ordering};
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;
use tokio::sync::{mpsc, watch};
use tracing::{debug, info, warn};
use trading_core::{
    Error, ExchangeClient, FeedEvent, FeedStream, OrderResult, Position, Result, Side,
    Subscription, Tick, TradeIntent,
};

const FEED_BUFFER: usize = 1024;

#[derive(Debug, Default)]
pub struct PaperExchange {
    prices: DashMap<String, Decimal>,
    positions: DashMap<String, Position>,
    /// Sender for the live connection; replacing it ends the previous stream.
    feed: Mutex<Option<mpsc::Sender<FeedEvent>>>,
    subscribed: Mutex<Vec<String>>,
    connect_delay: Mutex<Duration>,
    fail_connects: AtomicU32,
    fail_orders: AtomicU32,
    fail_tickers: AtomicU32,
    connects: AtomicU64,
    orders: AtomicU64,
    ticker_polls: AtomicU64,
}

impl PaperExchange {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_prices<I, S>(prices: I) -> Self
    where
        I: IntoIterator<Item = (S, Decimal)>,
        S: Into<String>,
    {
        let exchange = Self::new();
        for (symbol, price) in prices {
            exchange.prices.insert(symbol.into(), price);
        }
        exchange
    }

    /// Update the price and stream a tick to the live connection, if any.
    pub fn push_tick(&self, symbol: &str, price: Decimal) {
        self.prices.insert(symbol.to_string(), price);
        self.send_event(FeedEvent::Tick(Tick::new(symbol, price, Utc::now())));
    }

    pub fn push_heartbeat(&self) {
        self.send_event(FeedEvent::Heartbeat);
    }

    /// Signal a transport error on the live connection and close it.
    pub fn push_error(&self, message: &str) {
        self.send_event(FeedEvent::Error(message.to_string()));
        self.drop_connection();
    }

    /// Close the live stream without an error event.
    pub fn drop_connection(&self) {
        self.lock_feed().take();
    }

    pub fn set_connect_delay(&self, delay: Duration) {
        *self
            .connect_delay
            .lock()
            .unwrap_or_else(PoisonError::into_inner) = delay;
    }

    /// The next `n` connects fail with a connection error.
    pub fn fail_next_connects(&self, n: u32) {
        self.fail_connects.store(n, Ordering::SeqCst);
    }

    /// The next `n` orders fail with a 503.
    pub fn fail_next_orders(&self, n: u32) {
        self.fail_orders.store(n, Ordering::SeqCst);
    }

    pub fn fail_next_tickers(&self, n: u32) {
        self.fail_tickers.store(n, Ordering::SeqCst);
    }

    pub fn connect_count(&self) -> u64 {
        self.connects.load(Ordering::SeqCst)
    }

    pub fn order_count(&self) -> u64 {
        self.orders.load(Ordering::SeqCst)
    }

    pub fn ticker_poll_count(&self) -> u64 {
        self.ticker_polls.load(Ordering::SeqCst)
    }

    pub fn price(&self, symbol: &str) -> Option<Decimal> {
        self.prices.get(symbol).map(|p| *p)
    }

    pub fn subscribed_symbols(&self) -> Vec<String> {
        self.subscribed
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    /// Random-walk every known price on `interval` until `shutdown` flips.
    pub fn spawn_price_simulator(
        self: &Arc<Self>,
        interval: Duration,
        mut shutdown: watch::Receiver<bool>,
    ) -> tokio::task::JoinHandle<()> {
        let exchange = self.clone();
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            loop {
                tokio::select! {
                    _ = shutdown.changed() => break,
                    _ = ticker.tick() => exchange.step_prices(),
                }
            }
            debug!("Paper price simulator stopped");
        })
    }

    fn step_prices(&self) {
        let moves: Vec<(String, Decimal)> = {
            let mut rng = rand::thread_rng();
            self.prices
                .iter()
                .map(|entry| {
                    // +/- 0.10% in basis-point steps
                    let bps: i64 = rng.gen_range(-10..=10);
                    let price = *entry.value() * (Decimal::ONE + Decimal::new(bps, 4));
                    (entry.key().clone(), price.round_dp(8))
                })
                .collect()
        };
        for (symbol, price) in moves {
            self.push_tick(&symbol, price);
        }
    }

    fn lock_feed(&self) -> std::sync::MutexGuard<'_, Option<mpsc::Sender<FeedEvent>>> {
        self.feed.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn send_event(&self, event: FeedEvent) {
        let feed = self.lock_feed();
        if let Some(tx) = feed.as_ref() {
            if tx.try_send(event).is_err() {
                debug!("Paper feed buffer full or closed, event dropped");
            }
        }
    }

    fn take_failure(counter: &AtomicU32) -> bool {
        counter
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
            .is_ok()
    }
}

#[async_trait]
impl ExchangeClient for PaperExchange {
    async fn connect(&self) -> Result<FeedStream> {
        self.connects.fetch_add(1, Ordering::SeqCst);
        let delay = *self
            .connect_delay
            .lock()
            .unwrap_or_else(PoisonError::into_inner);
        if !delay.is_zero() {
            tokio::time::sleep(delay).await;
        }

        if Self::take_failure(&self.fail_connects) {
            warn!("[PAPER] Simulated connect failure");
            return Err(Error::Connection("simulated connect failure".to_string()));
        }

        let (tx, rx) = mpsc::channel(FEED_BUFFER);
        *self.lock_feed() = Some(tx);
        info!("[PAPER] Feed connected");
        Ok(rx)
    }

    async fn subscribe(&self, subscription: &Subscription) -> Result<()> {
        if self.lock_feed().is_none() {
            return Err(Error::Connection("not connected".to_string()));
        }
        let mut subscribed = self
            .subscribed
            .lock()
            .unwrap_or_else(PoisonError::into_inner);
        for symbol in &subscription.symbols {
            if !subscribed.contains(symbol) {
                subscribed.push(symbol.clone());
            }
        }
        Ok(())
    }

    async fn place_order(
        &self,
        intent: &TradeIntent,
        reference_price: Option<Decimal>,
    ) -> Result<OrderResult> {
        self.orders.fetch_add(1, Ordering::SeqCst);
        if Self::take_failure(&self.fail_orders) {
            return Err(Error::Api {
                message: "simulated order gateway outage".to_string(),
                status: Some(503),
            });
        }

        let price = match self.price(&intent.symbol).or(reference_price) {
            Some(price) if price > Decimal::ZERO => price,
            _ => {
                return Err(Error::InvalidRequest(format!(
                    "no price available for {}",
                    intent.symbol
                )))
            }
        };

        let result = match intent.side {
            Side::Buy => {
                let quantity = (intent.notional / price).round_dp(8);
                self.positions.insert(
                    intent.symbol.clone(),
                    Position::open(intent.symbol.clone(), price, quantity, Utc::now()),
                );
                OrderResult::filled(&intent.symbol, Side::Buy, quantity, price)
            }
            Side::Sell => match self.positions.remove(&intent.symbol) {
                Some((_, position)) => {
                    OrderResult::filled(&intent.symbol, Side::Sell, position.quantity, price)
                }
                None => OrderResult::rejected(&intent.symbol, Side::Sell, "no position to sell"),
            },
        };

        info!(
            order_id = %result.order_id,
            symbol = %intent.symbol,
            side = %intent.side,
            price = %price,
            filled = %result.filled_quantity,
            "[PAPER] Simulated order"
        );
        Ok(result)
    }

    async fn fetch_ticker(&self, symbol: &str) -> Result<Tick> {
        self.ticker_polls.fetch_add(1, Ordering::SeqCst);
        if Self::take_failure(&self.fail_tickers) {
            return Err(Error::Timeout(Duration::from_secs(5)));
        }
        self.price(symbol)
            .map(|price| Tick::new(symbol, price, Utc::now()))
            .ok_or_else(|| Error::InvalidRequest(format!("unknown symbol {}", symbol)))
    }

    async fn open_positions(&self) -> Result<Vec<Position>> {
        Ok(self.positions.iter().map(|p| p.value().clone()).collect())
    }
}
