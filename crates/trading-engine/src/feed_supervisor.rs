//! Market-data feed supervision.
//!
//! Three tasks cooperate around one shared health record:
//!
//! * the receiver drains the live stream, caches ticks and stamps liveness;
//! * the watchdog checks liveness on a fixed cadence;
//! * the control loop is the only place that connects.
//!
//! The receiver and watchdog never reconnect themselves. They set a pending
//! flag and `try_send` on a one-slot channel, then return; concurrent requests
//! collapse into the single episode the control loop runs. Every connect goes
//! through the `exchange-api` breaker with exponential backoff, and an episode
//! that runs out of attempts leaves the feed STALE so readers fall back to
//! polling.

use chrono::{DateTime, Utc};
use dashmap::DashMap;
use risk_manager::{BreakerError, BreakerRegistry, EXCHANGE_API};
use serde::Serialize;
use std::fmt;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;
use tokio::sync::mpsc::{self, error::TrySendError};
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio::time::{Instant, MissedTickBehavior};
use tracing::{debug, error, info, warn};
use trading_core::config::FeedSettings;
use trading_core::{ExchangeClient, FeedEvent, FeedStream, Subscription, Tick};

#[derive(Debug, Clone)]
pub struct FeedConfig {
    pub symbols: Vec<String>,
    /// Silence longer than this marks the connection stale.
    pub stale_timeout: Duration,
    pub watchdog_interval: Duration,
    pub initial_backoff: Duration,
    pub max_backoff: Duration,
    /// Connect attempts per reconnect episode.
    pub max_attempts: u32,
    /// Wait before a new episode once the feed is STALE.
    pub stale_retry_interval: Duration,
}

impl FeedConfig {
    /// Delay after failed attempt `attempt` (1-based).
    pub fn backoff(&self, attempt: u32) -> Duration {
        let factor = 2u32.saturating_pow(attempt.saturating_sub(1));
        self.initial_backoff
            .saturating_mul(factor)
            .min(self.max_backoff)
    }
}

impl From<&FeedSettings> for FeedConfig {
    fn from(settings: &FeedSettings) -> Self {
        Self {
            symbols: settings.symbols.clone(),
            stale_timeout: Duration::from_secs(settings.stale_timeout_secs),
            watchdog_interval: Duration::from_millis(settings.watchdog_interval_ms),
            initial_backoff: Duration::from_millis(settings.initial_backoff_ms),
            max_backoff: Duration::from_millis(settings.max_backoff_ms),
            max_attempts: settings.max_reconnect_attempts.max(1),
            stale_retry_interval: Duration::from_secs(settings.stale_retry_secs),
        }
    }
}

impl Default for FeedConfig {
    fn default() -> Self {
        Self::from(&FeedSettings::default())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum FeedState {
    Disconnected,
    Connecting,
    Connected,
    Reconnecting,
    /// Reconnect attempts exhausted; readers must poll.
    Stale,
    Stopped,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReconnectReason {
    Startup,
    /// Watchdog saw no message within the stale timeout.
    Silent,
    TransportError,
    StreamClosed,
    /// Retry after the feed went STALE.
    StaleRetry,
    /// Asked for by a caller.
    Requested,
}

impl fmt::Display for ReconnectReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let reason = match self {
            ReconnectReason::Startup => "startup",
            ReconnectReason::Silent => "silent",
            ReconnectReason::TransportError => "transport_error",
            ReconnectReason::StreamClosed => "stream_closed",
            ReconnectReason::StaleRetry => "stale_retry",
            ReconnectReason::Requested => "requested",
        };
        f.write_str(reason)
    }
}

/// Snapshot of feed health for monitoring.
#[derive(Debug, Clone, Serialize)]
pub struct FeedHealth {
    pub state: FeedState,
    pub connected: bool,
    pub last_message_at: Option<DateTime<Utc>>,
    /// Attempt number within the current (or last) reconnect episode.
    pub reconnect_attempts: u32,
    pub total_connects: u64,
    /// Reconnect requests absorbed by one already pending.
    pub collapsed_requests: u64,
    pub watchdog_ticks: u64,
    pub cached_symbols: usize,
}

#[derive(Debug)]
struct HealthState {
    state: FeedState,
    last_message: Option<Instant>,
    last_message_at: Option<DateTime<Utc>>,
    reconnect_attempts: u32,
    total_connects: u64,
    collapsed_requests: u64,
    watchdog_ticks: u64,
}

struct Shared {
    config: FeedConfig,
    exchange: Arc<dyn ExchangeClient>,
    breakers: Arc<BreakerRegistry>,
    health: Mutex<HealthState>,
    prices: DashMap<String, Tick>,
    reconnect_pending: AtomicBool,
    reconnect_tx: mpsc::Sender<ReconnectReason>,
}

impl Shared {
    fn health(&self) -> MutexGuard<'_, HealthState> {
        self.health.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn state(&self) -> FeedState {
        self.health().state
    }

    fn set_state(&self, state: FeedState) {
        let mut health = self.health();
        if health.state != FeedState::Stopped {
            health.state = state;
        }
    }

    fn touch(&self) {
        let mut health = self.health();
        health.last_message = Some(Instant::now());
        health.last_message_at = Some(Utc::now());
    }

    fn begin_attempt(&self, attempt: u32) {
        let mut health = self.health();
        health.state = FeedState::Connecting;
        health.reconnect_attempts = attempt;
    }

    fn mark_connected(&self) {
        let mut health = self.health();
        health.state = FeedState::Connected;
        health.last_message = Some(Instant::now());
        health.last_message_at = Some(Utc::now());
        health.reconnect_attempts = 0;
        health.total_connects += 1;
    }

    fn is_healthy(&self) -> bool {
        let health = self.health();
        health.state == FeedState::Connected
            && health
                .last_message
                .map(|at| at.elapsed() <= self.config.stale_timeout)
                .unwrap_or(false)
    }

    /// Count a watchdog tick. Returns the silence if the connection just
    /// went stale.
    fn check_staleness(&self) -> Option<Duration> {
        let mut health = self.health();
        health.watchdog_ticks += 1;
        if health.state != FeedState::Connected {
            return None;
        }
        let silence = health.last_message.map(|at| at.elapsed())?;
        if silence > self.config.stale_timeout {
            health.state = FeedState::Reconnecting;
            Some(silence)
        } else {
            None
        }
    }

    /// Reconnecting with no episode pending means a request was lost.
    fn reconnect_orphaned(&self) -> bool {
        self.state() == FeedState::Reconnecting && !self.reconnect_pending.load(Ordering::SeqCst)
    }

    fn connection_lost(&self, reason: ReconnectReason) {
        self.set_state(FeedState::Reconnecting);
        self.request_reconnect(reason);
    }

    /// Non-blocking handoff to the control loop.
    fn request_reconnect(&self, reason: ReconnectReason) -> bool {
        if self.reconnect_pending.swap(true, Ordering::SeqCst) {
            self.health().collapsed_requests += 1;
            debug!(reason = %reason, "Reconnect already pending, request collapsed");
            return false;
        }

        match self.reconnect_tx.try_send(reason) {
            Ok(()) => {
                info!(reason = %reason, "Reconnect requested");
                true
            }
            Err(TrySendError::Full(_)) => {
                self.health().collapsed_requests += 1;
                false
            }
            Err(TrySendError::Closed(_)) => {
                self.reconnect_pending.store(false, Ordering::SeqCst);
                debug!(reason = %reason, "Feed control loop not running, request dropped");
                false
            }
        }
    }
}

/// Keeps a market-data connection alive and serves the latest prices.
pub struct FeedSupervisor {
    shared: Arc<Shared>,
    reconnect_rx: Mutex<Option<mpsc::Receiver<ReconnectReason>>>,
    shutdown_tx: watch::Sender<bool>,
    tasks: Mutex<Vec<JoinHandle<()>>>,
}

impl FeedSupervisor {
    pub fn new(
        config: FeedConfig,
        exchange: Arc<dyn ExchangeClient>,
        breakers: Arc<BreakerRegistry>,
    ) -> Self {
        let (reconnect_tx, reconnect_rx) = mpsc::channel(1);
        let (shutdown_tx, _) = watch::channel(false);

        Self {
            shared: Arc::new(Shared {
                config,
                exchange,
                breakers,
                health: Mutex::new(HealthState {
                    state: FeedState::Disconnected,
                    last_message: None,
                    last_message_at: None,
                    reconnect_attempts: 0,
                    total_connects: 0,
                    collapsed_requests: 0,
                    watchdog_ticks: 0,
                }),
                prices: DashMap::new(),
                reconnect_pending: AtomicBool::new(false),
                reconnect_tx,
            }),
            reconnect_rx: Mutex::new(Some(reconnect_rx)),
            shutdown_tx,
            tasks: Mutex::new(Vec::new()),
        }
    }

    /// Spawn the control loop and watchdog. Returns false if already started.
    pub fn start(&self) -> bool {
        let requests = self
            .reconnect_rx
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take();
        let Some(requests) = requests else {
            warn!("Feed supervisor already started");
            return false;
        };

        // Startup episode counts as the pending reconnect.
        self.shared.reconnect_pending.store(true, Ordering::SeqCst);
        let control = tokio::spawn(control_loop(
            self.shared.clone(),
            requests,
            self.shutdown_tx.subscribe(),
        ));
        let watchdog = tokio::spawn(watchdog_loop(
            self.shared.clone(),
            self.shutdown_tx.subscribe(),
        ));
        self.tasks
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .extend([control, watchdog]);

        info!(symbols = ?self.shared.config.symbols, "Feed supervisor started");
        true
    }

    /// Ask the control loop to reconnect. Never blocks. Returns false when
    /// the request collapsed into one already pending.
    pub fn request_reconnect(&self, reason: ReconnectReason) -> bool {
        self.shared.request_reconnect(reason)
    }

    /// Connected and heard from within the stale timeout.
    pub fn is_healthy(&self) -> bool {
        self.shared.is_healthy()
    }

    pub fn health(&self) -> FeedHealth {
        let health = self.shared.health();
        FeedHealth {
            state: health.state,
            connected: health.state == FeedState::Connected,
            last_message_at: health.last_message_at,
            reconnect_attempts: health.reconnect_attempts,
            total_connects: health.total_connects,
            collapsed_requests: health.collapsed_requests,
            watchdog_ticks: health.watchdog_ticks,
            cached_symbols: self.shared.prices.len(),
        }
    }

    /// Last streamed tick for `symbol`, regardless of feed health.
    pub fn cached_price(&self, symbol: &str) -> Option<Tick> {
        self.shared.prices.get(symbol).map(|t| t.value().clone())
    }

    /// Latest price for `symbol`.
    ///
    /// Served from the stream cache while the feed is healthy; otherwise
    /// polled from the exchange through the breaker, which bounds the wait.
    pub async fn latest_price(
        &self,
        symbol: &str,
    ) -> Result<Tick, BreakerError<trading_core::Error>> {
        if self.is_healthy() {
            if let Some(tick) = self.cached_price(symbol) {
                return Ok(tick);
            }
        }

        debug!(symbol = %symbol, "Feed unhealthy or symbol not cached, polling ticker");
        let exchange = &self.shared.exchange;
        self.shared
            .breakers
            .call(EXCHANGE_API, async { exchange.fetch_ticker(symbol).await })
            .await
    }

    /// Signal shutdown and wait for every feed task to finish.
    pub async fn stop(&self) {
        self.shutdown_tx.send_replace(true);

        let tasks: Vec<JoinHandle<()>> = std::mem::take(
            &mut *self.tasks.lock().unwrap_or_else(PoisonError::into_inner),
        );
        for task in tasks {
            if let Err(e) = task.await {
                warn!(error = %e, "Feed task ended abnormally");
            }
        }

        self.shared.health().state = FeedState::Stopped;
        info!("Feed supervisor stopped");
    }
}

enum Episode {
    Connected(FeedStream),
    Exhausted,
    Shutdown,
}

async fn control_loop(
    shared: Arc<Shared>,
    mut requests: mpsc::Receiver<ReconnectReason>,
    mut shutdown: watch::Receiver<bool>,
) {
    let mut receiver: Option<JoinHandle<()>> = None;
    let mut next = Some(ReconnectReason::Startup);

    loop {
        if *shutdown.borrow() {
            break;
        }

        if let Some(reason) = next.take() {
            shared.reconnect_pending.store(true, Ordering::SeqCst);
            if let Some(old) = receiver.take() {
                old.abort();
                let _ = old.await;
            }

            match run_episode(&shared, reason, &mut shutdown).await {
                Episode::Connected(stream) => {
                    // Cleared first so a receiver failing right away can hand
                    // off a fresh request.
                    shared.reconnect_pending.store(false, Ordering::SeqCst);
                    receiver = Some(tokio::spawn(receive_loop(shared.clone(), stream)));
                }
                Episode::Exhausted => {
                    shared.reconnect_pending.store(false, Ordering::SeqCst);
                }
                Episode::Shutdown => break,
            }
        }

        let retry_after = (shared.state() == FeedState::Stale)
            .then_some(shared.config.stale_retry_interval);
        let stale_retry = async move {
            match retry_after {
                Some(delay) => tokio::time::sleep(delay).await,
                None => std::future::pending::<()>().await,
            }
        };

        tokio::select! {
            biased;
            _ = shutdown.changed() => break,
            request = requests.recv() => match request {
                Some(reason) => next = Some(reason),
                None => break,
            },
            _ = stale_retry => {
                info!("Retrying stale feed");
                next = Some(ReconnectReason::StaleRetry);
            }
        }
    }

    if let Some(old) = receiver.take() {
        old.abort();
        let _ = old.await;
    }
    shared.health().state = FeedState::Stopped;
    debug!("Feed control loop stopped");
}

async fn run_episode(
    shared: &Shared,
    reason: ReconnectReason,
    shutdown: &mut watch::Receiver<bool>,
) -> Episode {
    let config = &shared.config;
    if reason != ReconnectReason::Startup {
        shared.set_state(FeedState::Reconnecting);
    }

    for attempt in 1..=config.max_attempts {
        shared.begin_attempt(attempt);

        let connect = shared.breakers.call(EXCHANGE_API, async {
            let stream = shared.exchange.connect().await?;
            shared
                .exchange
                .subscribe(&Subscription::tickers(config.symbols.clone()))
                .await?;
            Ok::<_, trading_core::Error>(stream)
        });
        let outcome = tokio::select! {
            biased;
            _ = shutdown.changed() => return Episode::Shutdown,
            outcome = connect => outcome,
        };

        match outcome {
            Ok(stream) => {
                shared.mark_connected();
                info!(attempt = attempt, reason = %reason, "Feed connected");
                return Episode::Connected(stream);
            }
            Err(e) => warn!(
                attempt = attempt,
                max_attempts = config.max_attempts,
                error = %e,
                "Feed connect attempt failed"
            ),
        }

        if attempt < config.max_attempts {
            let delay = config.backoff(attempt);
            shared.set_state(FeedState::Reconnecting);
            debug!(delay_ms = delay.as_millis() as u64, "Backing off before next connect attempt");
            tokio::select! {
                biased;
                _ = shutdown.changed() => return Episode::Shutdown,
                _ = tokio::time::sleep(delay) => {}
            }
        }
    }

    shared.set_state(FeedState::Stale);
    error!(
        attempts = config.max_attempts,
        retry_secs = config.stale_retry_interval.as_secs(),
        "Feed reconnect attempts exhausted, feed is STALE"
    );
    Episode::Exhausted
}

async fn receive_loop(shared: Arc<Shared>, mut stream: FeedStream) {
    while let Some(event) = stream.recv().await {
        match event {
            FeedEvent::Tick(tick) => {
                shared.touch();
                shared.prices.insert(tick.symbol.clone(), tick);
            }
            FeedEvent::Heartbeat => shared.touch(),
            FeedEvent::Error(message) => {
                warn!(error = %message, "Feed transport error");
                shared.connection_lost(ReconnectReason::TransportError);
                return;
            }
        }
    }

    warn!("Feed stream ended");
    shared.connection_lost(ReconnectReason::StreamClosed);
}

async fn watchdog_loop(shared: Arc<Shared>, mut shutdown: watch::Receiver<bool>) {
    let mut ticker = tokio::time::interval(shared.config.watchdog_interval);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

    loop {
        if *shutdown.borrow() {
            break;
        }
        tokio::select! {
            biased;
            _ = shutdown.changed() => break,
            _ = ticker.tick() => {}
        }

        if let Some(silence) = shared.check_staleness() {
            warn!(
                silence_ms = silence.as_millis() as u64,
                stale_timeout_secs = shared.config.stale_timeout.as_secs(),
                "No feed message within stale timeout"
            );
            shared.request_reconnect(ReconnectReason::Silent);
        } else if shared.reconnect_orphaned() {
            warn!("Feed reconnecting with no episode pending, requesting again");
            shared.request_reconnect(ReconnectReason::Requested);
        }
    }
    debug!("Feed watchdog stopped");
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::paper::PaperExchange;
    use risk_manager::BreakerConfig;
    use rust_decimal::Decimal;

    fn config() -> FeedConfig {
        FeedConfig {
            symbols: vec!["BTC-USDT".to_string()],
            stale_timeout: Duration::from_secs(5),
            watchdog_interval: Duration::from_secs(1),
            initial_backoff: Duration::from_millis(100),
            max_backoff: Duration::from_secs(1),
            max_attempts: 3,
            stale_retry_interval: Duration::from_secs(30),
        }
    }

    fn lenient_breakers() -> Arc<BreakerRegistry> {
        Arc::new(BreakerRegistry::new(BreakerConfig {
            failure_threshold: 100,
            call_timeout: Duration::from_secs(60),
            ..BreakerConfig::default()
        }))
    }

    fn setup(breakers: Arc<BreakerRegistry>) -> (Arc<FeedSupervisor>, Arc<PaperExchange>) {
        let exchange = Arc::new(PaperExchange::with_prices([(
            "BTC-USDT",
            Decimal::new(50_000, 0),
        )]));
        let supervisor = Arc::new(FeedSupervisor::new(config(), exchange.clone(), breakers));
        (supervisor, exchange)
    }

    async fn wait_until(mut condition: impl FnMut() -> bool) {
        for _ in 0..3_000 {
            if condition() {
                return;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        panic!("condition not reached");
    }

    #[test]
    fn test_backoff_doubles_up_to_ceiling() {
        let config = config();
        assert_eq!(config.backoff(1), Duration::from_millis(100));
        assert_eq!(config.backoff(2), Duration::from_millis(200));
        assert_eq!(config.backoff(3), Duration::from_millis(400));
        assert_eq!(config.backoff(5), Duration::from_secs(1));
        assert_eq!(config.backoff(40), Duration::from_secs(1));
    }

    #[tokio::test(start_paused = true)]
    async fn test_connects_and_caches_ticks() {
        let (supervisor, exchange) = setup(lenient_breakers());
        assert!(supervisor.start());
        assert!(!supervisor.start());

        wait_until(|| supervisor.is_healthy()).await;
        assert_eq!(exchange.subscribed_symbols(), vec!["BTC-USDT".to_string()]);

        exchange.push_tick("BTC-USDT", Decimal::new(51_000, 0));
        wait_until(|| supervisor.cached_price("BTC-USDT").is_some()).await;

        let tick = supervisor.latest_price("BTC-USDT").await.unwrap();
        assert_eq!(tick.price, Decimal::new(51_000, 0));
        assert_eq!(exchange.ticker_poll_count(), 0);

        supervisor.stop().await;
    }

    #[tokio::test(start_paused = true)]
    async fn test_watchdog_reconnects_silent_feed() {
        let (supervisor, exchange) = setup(lenient_breakers());
        supervisor.start();
        wait_until(|| supervisor.is_healthy()).await;

        // Heartbeats keep the connection alive.
        for _ in 0..10 {
            exchange.push_heartbeat();
            tokio::time::sleep(Duration::from_secs(1)).await;
        }
        assert_eq!(exchange.connect_count(), 1);

        // Silence past the stale timeout forces a reconnect.
        tokio::time::sleep(Duration::from_secs(7)).await;
        wait_until(|| exchange.connect_count() == 2 && supervisor.is_healthy()).await;
        assert_eq!(supervisor.health().total_connects, 2);

        supervisor.stop().await;
    }

    #[tokio::test(start_paused = true)]
    async fn test_slow_reconnect_does_not_stall_watchdog() {
        let (supervisor, exchange) = setup(lenient_breakers());
        supervisor.start();
        wait_until(|| supervisor.is_healthy()).await;

        exchange.set_connect_delay(Duration::from_secs(20));
        wait_until(|| supervisor.health().state == FeedState::Connecting).await;

        let ticks_before = supervisor.health().watchdog_ticks;
        tokio::time::sleep(Duration::from_secs(10)).await;
        let health = supervisor.health();
        assert_eq!(health.state, FeedState::Connecting);
        assert!(health.watchdog_ticks - ticks_before >= 9);

        // Requests during the episode collapse into it.
        assert!(!supervisor.request_reconnect(ReconnectReason::Requested));

        exchange.set_connect_delay(Duration::ZERO);
        wait_until(|| supervisor.is_healthy()).await;
        assert_eq!(exchange.connect_count(), 2);

        supervisor.stop().await;
    }

    #[tokio::test(start_paused = true)]
    async fn test_concurrent_requests_collapse() {
        let (supervisor, exchange) = setup(lenient_breakers());
        supervisor.start();
        wait_until(|| supervisor.is_healthy()).await;

        let accepted = (0..10)
            .filter(|_| supervisor.request_reconnect(ReconnectReason::Requested))
            .count();
        assert_eq!(accepted, 1);

        wait_until(|| exchange.connect_count() == 2 && supervisor.is_healthy()).await;
        tokio::time::sleep(Duration::from_secs(2)).await;
        assert_eq!(exchange.connect_count(), 2);
        assert_eq!(supervisor.health().collapsed_requests, 9);

        supervisor.stop().await;
    }

    #[tokio::test(start_paused = true)]
    async fn test_transport_error_triggers_reconnect() {
        let (supervisor, exchange) = setup(lenient_breakers());
        supervisor.start();
        wait_until(|| supervisor.is_healthy()).await;

        exchange.push_error("connection reset");
        wait_until(|| exchange.connect_count() == 2 && supervisor.is_healthy()).await;

        supervisor.stop().await;
    }

    #[tokio::test(start_paused = true)]
    async fn test_watchdog_recovers_lost_reconnect_request() {
        let (supervisor, exchange) = setup(lenient_breakers());
        supervisor.start();
        wait_until(|| supervisor.is_healthy()).await;

        // A connection loss whose request never reached the control loop.
        supervisor.shared.set_state(FeedState::Reconnecting);
        assert!(supervisor.shared.reconnect_orphaned());

        wait_until(|| exchange.connect_count() == 2 && supervisor.is_healthy()).await;
        assert!(!supervisor.shared.reconnect_orphaned());

        supervisor.stop().await;
    }

    #[tokio::test(start_paused = true)]
    async fn test_exhausted_episode_goes_stale_and_polls() {
        let (supervisor, exchange) = setup(lenient_breakers());
        exchange.fail_next_connects(3);
        supervisor.start();

        wait_until(|| supervisor.health().state == FeedState::Stale).await;
        assert!(!supervisor.is_healthy());
        assert_eq!(exchange.connect_count(), 3);

        let tick = supervisor.latest_price("BTC-USDT").await.unwrap();
        assert_eq!(tick.price, Decimal::new(50_000, 0));
        assert_eq!(exchange.ticker_poll_count(), 1);

        // A new episode starts after the stale retry interval.
        tokio::time::sleep(Duration::from_secs(31)).await;
        wait_until(|| supervisor.is_healthy()).await;
        assert_eq!(exchange.connect_count(), 4);

        supervisor.stop().await;
    }

    #[tokio::test(start_paused = true)]
    async fn test_open_breaker_stops_retry_storm() {
        let breakers = Arc::new(BreakerRegistry::new(BreakerConfig {
            failure_threshold: 1,
            cool_off: Duration::from_secs(600),
            ..BreakerConfig::default()
        }));
        let (supervisor, exchange) = setup(breakers.clone());
        exchange.fail_next_connects(1);
        supervisor.start();

        wait_until(|| supervisor.health().state == FeedState::Stale).await;
        assert_eq!(exchange.connect_count(), 1);
        assert!(breakers.is_open(EXCHANGE_API));

        supervisor.stop().await;
    }

    #[tokio::test(start_paused = true)]
    async fn test_stop_terminates_tasks() {
        let (supervisor, exchange) = setup(lenient_breakers());
        supervisor.start();
        wait_until(|| supervisor.is_healthy()).await;

        supervisor.stop().await;
        assert_eq!(supervisor.health().state, FeedState::Stopped);
        assert!(!supervisor.is_healthy());
        assert!(!supervisor.request_reconnect(ReconnectReason::Requested));

        let ticks = supervisor.health().watchdog_ticks;
        exchange.push_tick("BTC-USDT", Decimal::new(1, 0));
        tokio::time::sleep(Duration::from_secs(5)).await;
        assert_eq!(supervisor.health().watchdog_ticks, ticks);
        assert_ne!(
            supervisor.cached_price("BTC-USDT").map(|t| t.price),
            Some(Decimal::new(1, 0))
        );
    }
}
