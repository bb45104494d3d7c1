//! Named circuit breakers for calls to remote dependencies.
//!
//! A breaker counts consecutive dependency failures. Once the threshold is hit
//! inside the failure window it opens and fails every call fast, without
//! touching the dependency, until the cool-off elapses. The first call after
//! that is a single half-open trial whose outcome closes or re-opens it.

use chrono::{DateTime, Utc};
use dashmap::DashMap;
use serde::{Deserialize, Serialize};
use std::future::Future;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;
use thiserror::Error;
use tokio::time::Instant;
use tracing::{debug, error, info, warn};
use trading_core::config::BreakerSettings;
use trading_core::DependencyFailure;

/// Breaker guarding every request to the exchange.
pub const EXCHANGE_API: &str = "exchange-api";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum BreakerState {
    Closed,
    Open,
    HalfOpen,
}

/// Thresholds for one breaker.
#[derive(Debug, Clone)]
pub struct BreakerConfig {
    /// Consecutive dependency failures that open the circuit.
    pub failure_threshold: u32,
    /// A failure streak that started longer ago than this restarts the count.
    pub failure_window: Duration,
    /// Time spent open before the half-open trial.
    pub cool_off: Duration,
    /// Upper bound on every admitted call.
    pub call_timeout: Duration,
}

impl Default for BreakerConfig {
    fn default() -> Self {
        Self::from(&BreakerSettings::default())
    }
}

impl From<&BreakerSettings> for BreakerConfig {
    fn from(settings: &BreakerSettings) -> Self {
        Self {
            failure_threshold: settings.failure_threshold.max(1),
            failure_window: Duration::from_secs(settings.failure_window_secs),
            cool_off: Duration::from_secs(settings.cool_off_secs),
            call_timeout: Duration::from_millis(settings.call_timeout_ms),
        }
    }
}

/// Read-only snapshot of a breaker for monitoring.
#[derive(Debug, Clone, Serialize)]
pub struct CircuitState {
    pub name: String,
    pub state: BreakerState,
    /// Failures in the current streak.
    pub failure_count: u32,
    pub opened_at: Option<DateTime<Utc>>,
    pub total_calls: u64,
    pub total_failures: u64,
    /// Calls refused while open.
    pub total_rejections: u64,
    pub total_trips: u64,
}

#[derive(Debug, Error)]
pub enum BreakerError<E> {
    #[error("circuit '{name}' is open")]
    Open { name: String },

    #[error("call through circuit '{name}' timed out after {after:?}")]
    Timeout { name: String, after: Duration },

    #[error("{0}")]
    Inner(E),
}

impl<E> BreakerError<E> {
    /// True when the call was refused without reaching the dependency.
    pub fn is_open(&self) -> bool {
        matches!(self, BreakerError::Open { .. })
    }

    pub fn into_inner(self) -> Option<E> {
        match self {
            BreakerError::Inner(e) => Some(e),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Admission {
    Normal,
    Trial,
}

#[derive(Debug)]
struct Inner {
    state: BreakerState,
    failure_count: u32,
    streak_started: Option<Instant>,
    opened: Option<Instant>,
    opened_at: Option<DateTime<Utc>>,
    trial_in_flight: bool,
    total_calls: u64,
    total_failures: u64,
    total_rejections: u64,
    total_trips: u64,
}

/// A single named breaker. Share it through [`BreakerRegistry`].
#[derive(Debug)]
pub struct CircuitBreaker {
    name: String,
    config: BreakerConfig,
    inner: Mutex<Inner>,
}

impl CircuitBreaker {
    pub fn new(name: impl Into<String>, config: BreakerConfig) -> Self {
        Self {
            name: name.into(),
            config,
            inner: Mutex::new(Inner {
                state: BreakerState::Closed,
                failure_count: 0,
                streak_started: None,
                opened: None,
                opened_at: None,
                trial_in_flight: false,
                total_calls: 0,
                total_failures: 0,
                total_rejections: 0,
                total_trips: 0,
            }),
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn config(&self) -> &BreakerConfig {
        &self.config
    }

    /// Run `fut` under this breaker.
    ///
    /// While open the future is dropped unpolled. Admitted calls are bounded
    /// by `call_timeout`; a timeout counts as a dependency failure.
    pub async fn call<T, E, F>(&self, fut: F) -> Result<T, BreakerError<E>>
    where
        F: Future<Output = Result<T, E>>,
        E: DependencyFailure,
    {
        let Some(admission) = self.admit() else {
            debug!(breaker = %self.name, "Call rejected, circuit open");
            return Err(BreakerError::Open {
                name: self.name.clone(),
            });
        };
        let mut guard = TrialGuard {
            breaker: self,
            armed: admission == Admission::Trial,
        };

        let result = match tokio::time::timeout(self.config.call_timeout, fut).await {
            Ok(Ok(value)) => {
                self.on_success(admission);
                Ok(value)
            }
            Ok(Err(e)) if e.is_dependency_failure() => {
                self.on_failure(admission);
                Err(BreakerError::Inner(e))
            }
            Ok(Err(e)) => {
                // The dependency answered; the request itself was bad.
                if admission == Admission::Trial {
                    self.on_success(admission);
                }
                Err(BreakerError::Inner(e))
            }
            Err(_) => {
                warn!(
                    breaker = %self.name,
                    timeout_ms = self.config.call_timeout.as_millis() as u64,
                    "Guarded call timed out"
                );
                self.on_failure(admission);
                Err(BreakerError::Timeout {
                    name: self.name.clone(),
                    after: self.config.call_timeout,
                })
            }
        };
        guard.armed = false;
        result
    }

    /// Whether a call made now would be refused.
    pub fn is_open(&self) -> bool {
        let inner = self.lock();
        match inner.state {
            BreakerState::Closed => false,
            BreakerState::Open => !self.cool_off_elapsed(&inner),
            BreakerState::HalfOpen => inner.trial_in_flight,
        }
    }

    pub fn snapshot(&self) -> CircuitState {
        let inner = self.lock();
        CircuitState {
            name: self.name.clone(),
            state: inner.state,
            failure_count: inner.failure_count,
            opened_at: inner.opened_at,
            total_calls: inner.total_calls,
            total_failures: inner.total_failures,
            total_rejections: inner.total_rejections,
            total_trips: inner.total_trips,
        }
    }

    /// Force the breaker closed (operator action).
    pub fn reset(&self) {
        let mut inner = self.lock();
        inner.state = BreakerState::Closed;
        inner.failure_count = 0;
        inner.streak_started = None;
        inner.opened = None;
        inner.opened_at = None;
        inner.trial_in_flight = false;
        info!(breaker = %self.name, "Circuit breaker manually reset");
    }

    fn lock(&self) -> MutexGuard<'_, Inner> {
        self.inner.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn cool_off_elapsed(&self, inner: &Inner) -> bool {
        inner
            .opened
            .map(|opened| opened.elapsed() >= self.config.cool_off)
            .unwrap_or(true)
    }

    fn admit(&self) -> Option<Admission> {
        let mut inner = self.lock();
        let state = inner.state;
        match state {
            BreakerState::Closed => {
                inner.total_calls += 1;
                Some(Admission::Normal)
            }
            BreakerState::Open if self.cool_off_elapsed(&inner) => {
                inner.state = BreakerState::HalfOpen;
                inner.trial_in_flight = true;
                inner.total_calls += 1;
                info!(breaker = %self.name, "Circuit half-open, admitting trial call");
                Some(Admission::Trial)
            }
            BreakerState::HalfOpen if !inner.trial_in_flight => {
                inner.trial_in_flight = true;
                inner.total_calls += 1;
                Some(Admission::Trial)
            }
            BreakerState::Open | BreakerState::HalfOpen => {
                inner.total_rejections += 1;
                None
            }
        }
    }

    fn on_success(&self, admission: Admission) {
        let mut inner = self.lock();
        match admission {
            Admission::Trial => {
                inner.state = BreakerState::Closed;
                inner.trial_in_flight = false;
                inner.failure_count = 0;
                inner.streak_started = None;
                inner.opened = None;
                inner.opened_at = None;
                info!(breaker = %self.name, "Trial call succeeded, circuit closed");
            }
            Admission::Normal if inner.state == BreakerState::Closed => {
                inner.failure_count = 0;
                inner.streak_started = None;
            }
            Admission::Normal => {}
        }
    }

    fn on_failure(&self, admission: Admission) {
        let mut inner = self.lock();
        inner.total_failures += 1;
        let now = Instant::now();

        match admission {
            Admission::Trial => {
                inner.trial_in_flight = false;
                self.trip(&mut inner, now);
            }
            Admission::Normal => {
                // Another caller already opened it.
                if inner.state != BreakerState::Closed {
                    return;
                }
                let streak_expired = inner
                    .streak_started
                    .map(|started| now.duration_since(started) > self.config.failure_window)
                    .unwrap_or(true);
                if streak_expired {
                    inner.failure_count = 0;
                    inner.streak_started = Some(now);
                }
                inner.failure_count += 1;

                if inner.failure_count >= self.config.failure_threshold {
                    self.trip(&mut inner, now);
                } else {
                    debug!(
                        breaker = %self.name,
                        failure_count = inner.failure_count,
                        threshold = self.config.failure_threshold,
                        "Dependency failure recorded"
                    );
                }
            }
        }
    }

    fn trip(&self, inner: &mut Inner, now: Instant) {
        inner.state = BreakerState::Open;
        inner.opened = Some(now);
        inner.opened_at = Some(Utc::now());
        inner.total_trips += 1;

        error!(
            breaker = %self.name,
            failure_count = inner.failure_count,
            cool_off_secs = self.config.cool_off.as_secs(),
            "Circuit breaker OPEN - failing fast"
        );
    }
}

/// Frees the half-open slot if a trial call is cancelled before it finishes.
struct TrialGuard<'a> {
    breaker: &'a CircuitBreaker,
    armed: bool,
}

impl Drop for TrialGuard<'_> {
    fn drop(&mut self) {
        if self.armed {
            let mut inner = self.breaker.lock();
            inner.trial_in_flight = false;
        }
    }
}

/// Breakers shared by name across call sites.
#[derive(Debug)]
pub struct BreakerRegistry {
    breakers: DashMap<String, Arc<CircuitBreaker>>,
    default_config: BreakerConfig,
}

impl BreakerRegistry {
    pub fn new(default_config: BreakerConfig) -> Self {
        Self {
            breakers: DashMap::new(),
            default_config,
        }
    }

    /// Get the breaker for `name`, creating it with the default config.
    pub fn get(&self, name: &str) -> Arc<CircuitBreaker> {
        if let Some(breaker) = self.breakers.get(name) {
            return breaker.clone();
        }
        self.breakers
            .entry(name.to_string())
            .or_insert_with(|| Arc::new(CircuitBreaker::new(name, self.default_config.clone())))
            .clone()
    }

    /// Register `name` with its own thresholds. An existing breaker is kept.
    pub fn register(&self, name: &str, config: BreakerConfig) -> Arc<CircuitBreaker> {
        self.breakers
            .entry(name.to_string())
            .or_insert_with(|| Arc::new(CircuitBreaker::new(name, config)))
            .clone()
    }

    pub async fn call<T, E, F>(&self, name: &str, fut: F) -> Result<T, BreakerError<E>>
    where
        F: Future<Output = Result<T, E>>,
        E: DependencyFailure,
    {
        let breaker = self.get(name);
        breaker.call(fut).await
    }

    /// Unknown breakers have never failed and so are closed.
    pub fn is_open(&self, name: &str) -> bool {
        self.breakers
            .get(name)
            .map(|b| b.is_open())
            .unwrap_or(false)
    }

    pub fn state(&self, name: &str) -> Option<CircuitState> {
        self.breakers.get(name).map(|b| b.snapshot())
    }

    pub fn states(&self) -> Vec<CircuitState> {
        let mut states: Vec<CircuitState> = self.breakers.iter().map(|b| b.snapshot()).collect();
        states.sort_by(|a, b| a.name.cmp(&b.name));
        states
    }

    /// Returns false when no breaker has that name.
    pub fn reset(&self, name: &str) -> bool {
        match self.breakers.get(name) {
            Some(breaker) => {
                breaker.reset();
                true
            }
            None => false,
        }
    }
}

impl Default for BreakerRegistry {
    fn default() -> Self {
        Self::new(BreakerConfig::default())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use tokio::sync::oneshot;
    use trading_core::Error;

    fn config() -> BreakerConfig {
        BreakerConfig {
            failure_threshold: 3,
            failure_window: Duration::from_secs(60),
            cool_off: Duration::from_secs(30),
            call_timeout: Duration::from_secs(5),
        }
    }

    async fn fail(breaker: &CircuitBreaker) -> Result<(), BreakerError<Error>> {
        breaker
            .call(async { Err::<(), _>(Error::Connection("reset by peer".into())) })
            .await
    }

    async fn open_breaker(breaker: &CircuitBreaker) {
        for _ in 0..breaker.config().failure_threshold {
            let _ = fail(breaker).await;
        }
        assert_eq!(breaker.snapshot().state, BreakerState::Open);
    }

    #[tokio::test(start_paused = true)]
    async fn test_opens_after_threshold_and_fails_fast() {
        let breaker = CircuitBreaker::new(EXCHANGE_API, config());
        let invoked = AtomicUsize::new(0);

        for _ in 0..2 {
            assert!(matches!(fail(&breaker).await, Err(BreakerError::Inner(_))));
        }
        assert_eq!(breaker.snapshot().state, BreakerState::Closed);

        let _ = fail(&breaker).await;
        assert!(breaker.is_open());

        let result: Result<(), BreakerError<Error>> = breaker
            .call(async {
                invoked.fetch_add(1, Ordering::SeqCst);
                Ok(())
            })
            .await;
        assert!(matches!(result, Err(BreakerError::Open { .. })));
        assert_eq!(invoked.load(Ordering::SeqCst), 0);

        let snapshot = breaker.snapshot();
        assert_eq!(snapshot.total_trips, 1);
        assert_eq!(snapshot.total_rejections, 1);
        assert!(snapshot.opened_at.is_some());
    }

    #[tokio::test(start_paused = true)]
    async fn test_validation_errors_do_not_trip() {
        let breaker = CircuitBreaker::new(EXCHANGE_API, config());

        for _ in 0..10 {
            let result = breaker
                .call(async { Err::<(), _>(Error::InvalidRequest("bad symbol".into())) })
                .await;
            assert!(matches!(result, Err(BreakerError::Inner(Error::InvalidRequest(_)))));
        }

        let snapshot = breaker.snapshot();
        assert_eq!(snapshot.state, BreakerState::Closed);
        assert_eq!(snapshot.failure_count, 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_success_breaks_failure_streak() {
        let breaker = CircuitBreaker::new(EXCHANGE_API, config());

        let _ = fail(&breaker).await;
        let _ = fail(&breaker).await;
        breaker.call(async { Ok::<_, Error>(()) }).await.unwrap();
        let _ = fail(&breaker).await;

        assert_eq!(breaker.snapshot().state, BreakerState::Closed);
        assert_eq!(breaker.snapshot().failure_count, 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_failures_outside_window_restart_count() {
        let breaker = CircuitBreaker::new(EXCHANGE_API, config());

        let _ = fail(&breaker).await;
        let _ = fail(&breaker).await;
        tokio::time::advance(Duration::from_secs(61)).await;
        let _ = fail(&breaker).await;

        let snapshot = breaker.snapshot();
        assert_eq!(snapshot.state, BreakerState::Closed);
        assert_eq!(snapshot.failure_count, 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_timeout_counts_as_failure() {
        let mut cfg = config();
        cfg.failure_threshold = 1;
        cfg.call_timeout = Duration::from_secs(1);
        let breaker = CircuitBreaker::new(EXCHANGE_API, cfg);

        let result = breaker
            .call(async {
                tokio::time::sleep(Duration::from_secs(10)).await;
                Ok::<_, Error>(())
            })
            .await;

        assert!(matches!(result, Err(BreakerError::Timeout { .. })));
        assert!(breaker.is_open());
    }

    #[tokio::test(start_paused = true)]
    async fn test_half_open_admits_exactly_one_trial() {
        let breaker = Arc::new(CircuitBreaker::new(EXCHANGE_API, config()));
        open_breaker(&breaker).await;

        tokio::time::advance(Duration::from_secs(31)).await;
        assert!(!breaker.is_open());

        let (started_tx, started_rx) = oneshot::channel();
        let (release_tx, release_rx) = oneshot::channel::<()>();
        let trial_breaker = breaker.clone();
        let trial = tokio::spawn(async move {
            trial_breaker
                .call(async move {
                    let _ = started_tx.send(());
                    let _ = release_rx.await;
                    Ok::<_, Error>(())
                })
                .await
        });

        started_rx.await.unwrap();
        assert_eq!(breaker.snapshot().state, BreakerState::HalfOpen);
        assert!(breaker.is_open());

        let invoked = AtomicUsize::new(0);
        let concurrent: Result<(), BreakerError<Error>> = breaker
            .call(async {
                invoked.fetch_add(1, Ordering::SeqCst);
                Ok(())
            })
            .await;
        assert!(matches!(concurrent, Err(BreakerError::Open { .. })));
        assert_eq!(invoked.load(Ordering::SeqCst), 0);

        release_tx.send(()).unwrap();
        trial.await.unwrap().unwrap();
        assert_eq!(breaker.snapshot().state, BreakerState::Closed);
    }

    #[tokio::test(start_paused = true)]
    async fn test_failed_trial_reopens() {
        let breaker = CircuitBreaker::new(EXCHANGE_API, config());
        open_breaker(&breaker).await;
        let first_opened = breaker.snapshot().opened_at;

        tokio::time::advance(Duration::from_secs(31)).await;
        let _ = fail(&breaker).await;

        let snapshot = breaker.snapshot();
        assert_eq!(snapshot.state, BreakerState::Open);
        assert_eq!(snapshot.total_trips, 2);
        assert!(snapshot.opened_at >= first_opened);
        assert!(breaker.is_open());
    }

    #[tokio::test(start_paused = true)]
    async fn test_cancelled_trial_frees_slot() {
        let breaker = CircuitBreaker::new(EXCHANGE_API, config());
        open_breaker(&breaker).await;
        tokio::time::advance(Duration::from_secs(31)).await;

        {
            let trial = breaker.call(std::future::pending::<Result<(), Error>>());
            tokio::pin!(trial);
            // Poll once so the trial is admitted, then drop it.
            assert!(poll_once(trial.as_mut()).await.is_none());
        }

        assert!(!breaker.is_open());
        breaker.call(async { Ok::<_, Error>(()) }).await.unwrap();
        assert_eq!(breaker.snapshot().state, BreakerState::Closed);
    }

    async fn poll_once<F: Future + Unpin>(fut: F) -> Option<F::Output> {
        tokio::select! {
            biased;
            out = fut => Some(out),
            _ = std::future::ready(()) => None,
        }
    }

    #[tokio::test(start_paused = true)]
    async fn test_registry_shares_breakers_by_name() {
        let registry = BreakerRegistry::new(config());

        for _ in 0..3 {
            let _ = registry
                .call(EXCHANGE_API, async {
                    Err::<(), _>(Error::Timeout(Duration::from_secs(1)))
                })
                .await;
        }

        assert!(registry.is_open(EXCHANGE_API));
        assert!(Arc::ptr_eq(&registry.get(EXCHANGE_API), &registry.get(EXCHANGE_API)));
        assert!(!registry.is_open("unknown"));
        assert!(registry.state("unknown").is_none());

        assert!(registry.reset(EXCHANGE_API));
        assert!(!registry.is_open(EXCHANGE_API));
        assert_eq!(registry.states().len(), 1);
    }
}
