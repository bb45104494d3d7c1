//! The periodic trading jobs: signal check and daily summary.

use anyhow::Context;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use risk_manager::{BreakerRegistry, CircuitState, RiskGate, RiskSnapshot, SyncReport, EXCHANGE_API};
use serde::Serialize;
use std::sync::{Arc, Mutex, PoisonError, Weak};
use tracing::{debug, info, warn};
use trading_core::{ExchangeClient, Position, Tick, TradeIntent};

use crate::executor::{ExecutionError, ExecutionMetrics, ExecutionOutcome, OrderExecutor};
use crate::feed_supervisor::{FeedHealth, FeedSupervisor};
use crate::scheduler::{Job, JobKind, ScheduledJob, Scheduler};

pub const SIGNAL_CHECK_JOB: &str = "signal-check";
pub const DAILY_SUMMARY_JOB: &str = "daily-summary";

/// Source of trade intents. Implementations live outside this crate.
#[async_trait]
pub trait Strategy: Send + Sync {
    fn id(&self) -> &str;

    /// Decide on `tick` given the open position for its symbol, if any.
    async fn evaluate(
        &self,
        tick: &Tick,
        position: Option<&Position>,
    ) -> anyhow::Result<Option<TradeIntent>>;
}

/// Strategy that never trades. Used when running the core on its own.
#[derive(Debug, Default)]
pub struct NoSignalStrategy;

#[async_trait]
impl Strategy for NoSignalStrategy {
    fn id(&self) -> &str {
        "no-signal"
    }

    async fn evaluate(
        &self,
        _tick: &Tick,
        _position: Option<&Position>,
    ) -> anyhow::Result<Option<TradeIntent>> {
        Ok(None)
    }
}

/// Reads a price per watched symbol, asks the strategy, executes the intent.
pub struct SignalCheckJob {
    symbols: Vec<String>,
    feed: Arc<FeedSupervisor>,
    strategy: Arc<dyn Strategy>,
    executor: Arc<OrderExecutor>,
    risk: Arc<RiskGate>,
}

impl SignalCheckJob {
    pub fn new(
        symbols: Vec<String>,
        feed: Arc<FeedSupervisor>,
        strategy: Arc<dyn Strategy>,
        executor: Arc<OrderExecutor>,
        risk: Arc<RiskGate>,
    ) -> Self {
        Self {
            symbols,
            feed,
            strategy,
            executor,
            risk,
        }
    }
}

#[async_trait]
impl Job for SignalCheckJob {
    fn id(&self) -> &str {
        SIGNAL_CHECK_JOB
    }

    fn kind(&self) -> JobKind {
        JobKind::SignalCheck
    }

    fn guarded_by(&self) -> Option<&str> {
        Some(EXCHANGE_API)
    }

    async fn run(&self) -> anyhow::Result<()> {
        let mut failed = 0usize;

        for symbol in &self.symbols {
            let tick = match self.feed.latest_price(symbol).await {
                Ok(tick) => tick,
                Err(e) => {
                    warn!(symbol = %symbol, error = %e, "No price available, symbol skipped");
                    failed += 1;
                    continue;
                }
            };

            let status = self.risk.status();
            let position = status
                .positions
                .iter()
                .find(|p| &p.symbol == symbol && !p.is_reserved());
            let intent = self
                .strategy
                .evaluate(&tick, position)
                .await
                .with_context(|| format!("strategy {} failed on {}", self.strategy.id(), symbol))?;
            let Some(intent) = intent else {
                continue;
            };

            match self.executor.execute(&intent, Some(tick.price)).await {
                Ok(ExecutionOutcome::Denied(decision)) => {
                    debug!(symbol = %symbol, reason = %decision.reason, "Signal denied by risk gate")
                }
                Ok(_) => {}
                Err(ExecutionError::Risk(e)) => {
                    return Err(e).with_context(|| format!("risk gate failed on {}", symbol));
                }
                Err(e) => {
                    warn!(symbol = %symbol, error = %e, "Signal execution failed");
                    failed += 1;
                }
            }
        }

        if failed > 0 {
            anyhow::bail!("{} of {} symbols failed this cycle", failed, self.symbols.len());
        }
        Ok(())
    }
}

/// End-of-day report.
#[derive(Debug, Clone, Serialize)]
pub struct DailySummary {
    pub generated_at: DateTime<Utc>,
    pub day_rolled: bool,
    pub risk: RiskSnapshot,
    /// `None` when the exchange could not be reached.
    pub sync: Option<SyncReport>,
    pub breakers: Vec<CircuitState>,
    pub feed: FeedHealth,
    pub execution: ExecutionMetrics,
    pub jobs: Vec<ScheduledJob>,
}

/// Rolls the trading day, reconciles positions and logs a summary.
pub struct DailySummaryJob {
    risk: Arc<RiskGate>,
    exchange: Arc<dyn ExchangeClient>,
    breakers: Arc<BreakerRegistry>,
    feed: Arc<FeedSupervisor>,
    executor: Arc<OrderExecutor>,
    scheduler: Weak<Scheduler>,
    last: Mutex<Option<DailySummary>>,
}

impl DailySummaryJob {
    pub fn new(
        risk: Arc<RiskGate>,
        exchange: Arc<dyn ExchangeClient>,
        breakers: Arc<BreakerRegistry>,
        feed: Arc<FeedSupervisor>,
        executor: Arc<OrderExecutor>,
        scheduler: Weak<Scheduler>,
    ) -> Self {
        Self {
            risk,
            exchange,
            breakers,
            feed,
            executor,
            scheduler,
            last: Mutex::new(None),
        }
    }

    /// The most recent summary, if the job has run.
    pub fn last_summary(&self) -> Option<DailySummary> {
        self.last
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }
}

#[async_trait]
impl Job for DailySummaryJob {
    fn id(&self) -> &str {
        DAILY_SUMMARY_JOB
    }

    fn kind(&self) -> JobKind {
        JobKind::DailySummary
    }

    async fn run(&self) -> anyhow::Result<()> {
        let day_rolled = self.risk.roll_trading_day().await;

        // Reconciliation is best effort; the summary is written regardless.
        let sync = match self
            .risk
            .sync_positions(self.exchange.as_ref(), &self.breakers)
            .await
        {
            Ok(report) => Some(report),
            Err(e) => {
                warn!(error = %e, "Position sync failed, summary uses local state");
                None
            }
        };

        let summary = DailySummary {
            generated_at: Utc::now(),
            day_rolled,
            risk: self.risk.status(),
            sync,
            breakers: self.breakers.states(),
            feed: self.feed.health(),
            execution: self.executor.metrics(),
            jobs: self
                .scheduler
                .upgrade()
                .map(|s| s.list_jobs())
                .unwrap_or_default(),
        };

        let json = serde_json::to_string(&summary).context("failed to serialize daily summary")?;
        info!(
            trading_day = %summary.risk.trading_day,
            daily_realized_pnl = %summary.risk.daily_realized_pnl,
            open_positions = summary.risk.open_positions(),
            kill_switch_active = summary.risk.kill_switch_active,
            summary = %json,
            "Daily summary"
        );

        *self.last.lock().unwrap_or_else(PoisonError::into_inner) = Some(summary);
        Ok(())
    }
}
