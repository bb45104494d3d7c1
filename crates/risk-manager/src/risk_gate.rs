//! Risk gate: the single point where trade intents are allowed or denied.
//!
//! All risk state lives behind one async mutex. Every decision is appended to
//! the audit ledger while that mutex is held, so ledger order equals decision
//! order and two concurrent BUYs can never both take the last position slot.
//! Monitoring reads go through a `watch` snapshot and never touch the mutex.

use audit_ledger::{AuditError, AuditEventKind, AuditRecord, AuditRecordBuilder, AuditStorage};
use chrono::{DateTime, Duration, NaiveDate, Utc};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashMap};
use std::fmt;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use thiserror::Error;
use tokio::sync::{watch, Mutex};
use tracing::{debug, error, info, warn};
use trading_core::config::RiskSettings;
use trading_core::{
    Clock, ExchangeClient, Position, PositionStatus, Side, SystemClock, TradeIntent,
};

use crate::circuit_breaker::{BreakerError, BreakerRegistry, EXCHANGE_API};
use crate::notifier::{LogNotifier, Notifier};

const DEFAULT_NOTIFY_TIMEOUT: std::time::Duration = std::time::Duration::from_secs(5);

#[derive(Debug, Error)]
pub enum RiskError {
    #[error("Invalid trade intent: {0}")]
    InvalidIntent(String),

    #[error("Invalid risk configuration: {0}")]
    InvalidConfig(String),

    #[error("Invalid argument: {0}")]
    InvalidArgument(String),

    #[error("No open position for {0}")]
    UnknownPosition(String),

    #[error("Audit ledger unavailable, decision not recorded: {0}")]
    Audit(#[from] AuditError),

    #[error("Exchange unavailable: {0}")]
    Exchange(#[from] BreakerError<trading_core::Error>),
}

/// Immutable risk limits, validated once at construction.
#[derive(Debug, Clone, PartialEq)]
pub struct RiskConfig {
    max_loss_per_trade: Decimal,
    max_daily_loss: Decimal,
    max_positions: usize,
    cool_down: Duration,
}

impl RiskConfig {
    pub fn new(
        max_loss_per_trade: Decimal,
        max_daily_loss: Decimal,
        max_positions: usize,
        cool_down: Duration,
    ) -> Result<Self, RiskError> {
        if max_loss_per_trade <= Decimal::ZERO {
            return Err(RiskError::InvalidConfig(format!(
                "max_loss_per_trade must be positive, got {}",
                max_loss_per_trade
            )));
        }
        if max_daily_loss <= Decimal::ZERO {
            return Err(RiskError::InvalidConfig(format!(
                "max_daily_loss must be positive, got {}",
                max_daily_loss
            )));
        }
        if max_positions == 0 {
            return Err(RiskError::InvalidConfig(
                "max_positions must be at least 1".to_string(),
            ));
        }
        if cool_down < Duration::zero() {
            return Err(RiskError::InvalidConfig(
                "cool_down must not be negative".to_string(),
            ));
        }
        Ok(Self {
            max_loss_per_trade,
            max_daily_loss,
            max_positions,
            cool_down,
        })
    }

    pub fn from_settings(settings: &RiskSettings) -> Result<Self, RiskError> {
        let cool_down_secs = i64::try_from(settings.cool_down_secs)
            .map_err(|_| RiskError::InvalidConfig("cool_down_secs out of range".to_string()))?;
        Self::new(
            settings.max_loss_per_trade,
            settings.max_daily_loss,
            settings.max_positions,
            Duration::seconds(cool_down_secs),
        )
    }

    pub fn max_loss_per_trade(&self) -> Decimal {
        self.max_loss_per_trade
    }

    pub fn max_daily_loss(&self) -> Decimal {
        self.max_daily_loss
    }

    pub fn max_positions(&self) -> usize {
        self.max_positions
    }

    pub fn cool_down(&self) -> Duration {
        self.cool_down
    }
}

/// Why an intent was allowed or denied.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum DecisionReason {
    Ok,
    KillSwitchActive,
    DailyLossLimit,
    PerTradeLimit,
    MaxPositions,
    DuplicatePosition,
    CoolDownActive,
}

impl DecisionReason {
    pub fn as_str(&self) -> &'static str {
        match self {
            DecisionReason::Ok => "OK",
            DecisionReason::KillSwitchActive => "KILL_SWITCH_ACTIVE",
            DecisionReason::DailyLossLimit => "DAILY_LOSS_LIMIT",
            DecisionReason::PerTradeLimit => "PER_TRADE_LIMIT",
            DecisionReason::MaxPositions => "MAX_POSITIONS",
            DecisionReason::DuplicatePosition => "DUPLICATE_POSITION",
            DecisionReason::CoolDownActive => "COOL_DOWN_ACTIVE",
        }
    }
}

impl fmt::Display for DecisionReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Point-in-time view of the risk state. Never torn.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct RiskSnapshot {
    pub kill_switch_active: bool,
    pub kill_switch_reason: Option<String>,
    /// UTC day the daily P&L belongs to.
    pub trading_day: NaiveDate,
    pub daily_realized_pnl: Decimal,
    /// Open and reserved positions, sorted by symbol.
    pub positions: Vec<Position>,
    pub max_positions: usize,
    pub last_loss_at: Option<DateTime<Utc>>,
    pub as_of: DateTime<Utc>,
}

impl RiskSnapshot {
    pub fn open_positions(&self) -> usize {
        self.positions.len()
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Decision {
    pub allowed: bool,
    pub reason: DecisionReason,
    pub snapshot: RiskSnapshot,
}

/// Outcome of reconciling positions with the exchange.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct SyncReport {
    /// Live positions the gate did not know about.
    pub adopted: Vec<String>,
    /// Reservations the exchange reports as filled.
    pub confirmed: Vec<String>,
    /// Known positions the exchange no longer reports.
    pub dropped: Vec<String>,
    /// Live positions left untracked because the book was full.
    pub over_limit: Vec<String>,
}

#[derive(Debug)]
struct RiskState {
    kill_switch_active: bool,
    kill_switch_reason: Option<String>,
    trading_day: NaiveDate,
    daily_realized_pnl: Decimal,
    positions: HashMap<String, Position>,
    last_loss_at: Option<DateTime<Utc>>,
}

impl RiskState {
    fn new(trading_day: NaiveDate) -> Self {
        Self {
            kill_switch_active: false,
            kill_switch_reason: None,
            trading_day,
            daily_realized_pnl: Decimal::ZERO,
            positions: HashMap::new(),
            last_loss_at: None,
        }
    }
}

/// Gatekeeper for every trade intent.
pub struct RiskGate {
    config: RiskConfig,
    state: Mutex<RiskState>,
    /// Fast path flag mirroring `RiskState::kill_switch_active`.
    kill_switch: AtomicBool,
    status_tx: watch::Sender<RiskSnapshot>,
    audit: Arc<dyn AuditStorage>,
    notifier: Arc<dyn Notifier>,
    clock: Arc<dyn Clock>,
    notify_timeout: std::time::Duration,
}

impl RiskGate {
    pub fn new(config: RiskConfig, audit: Arc<dyn AuditStorage>) -> Self {
        let clock: Arc<dyn Clock> = Arc::new(SystemClock);
        let now = clock.now();
        let state = RiskState::new(now.date_naive());
        let (status_tx, _) = watch::channel(snapshot_of(&config, &state, now));

        Self {
            config,
            state: Mutex::new(state),
            kill_switch: AtomicBool::new(false),
            status_tx,
            audit,
            notifier: Arc::new(LogNotifier),
            clock,
            notify_timeout: DEFAULT_NOTIFY_TIMEOUT,
        }
    }

    pub fn with_notifier(mut self, notifier: Arc<dyn Notifier>) -> Self {
        self.notifier = notifier;
        self
    }

    /// Replace the time source. The trading day restarts from the new clock.
    pub fn with_clock(mut self, clock: Arc<dyn Clock>) -> Self {
        let now = clock.now();
        let state = self.state.get_mut();
        state.trading_day = now.date_naive();
        self.status_tx
            .send_replace(snapshot_of(&self.config, state, now));
        self.clock = clock;
        self
    }

    pub fn with_notify_timeout(mut self, timeout: std::time::Duration) -> Self {
        self.notify_timeout = timeout;
        self
    }

    pub fn config(&self) -> &RiskConfig {
        &self.config
    }

    /// Decide whether `intent` may proceed.
    ///
    /// Exactly one decision record is written per call; a call that latches
    /// the daily-loss kill-switch also writes the activation record. An
    /// approved BUY reserves the symbol's position slot until
    /// [`record_trade_opened`](Self::record_trade_opened) or
    /// [`release_reservation`](Self::release_reservation).
    pub async fn authorize(&self, intent: &TradeIntent) -> Result<Decision, RiskError> {
        intent
            .validate()
            .map_err(|e| RiskError::InvalidIntent(e.to_string()))?;

        let mut state = self.state.lock().await;
        let now = self.clock.now();
        self.roll_day(&mut state, now);

        let mut audit_failure: Option<AuditError> = None;
        let latched = self.should_latch(&state);
        if latched {
            if let Err(e) = self.latch_daily_loss(&mut state, now).await {
                audit_failure = Some(e);
            }
        }

        let reason = self.evaluate(&state, intent, now, latched);
        let allowed = reason == DecisionReason::Ok;

        let record = self.decision_record(intent, reason, &state, now);
        if let Err(e) = self.audit.append(record).await {
            if audit_failure.is_none() {
                audit_failure = Some(e);
            }
        }

        if let Some(e) = audit_failure {
            if intent.side == Side::Buy {
                error!(
                    symbol = %intent.symbol,
                    error = %e,
                    "Decision could not be recorded, refusing BUY"
                );
                self.publish(&state, now);
                return Err(RiskError::Audit(e));
            }
            error!(
                symbol = %intent.symbol,
                error = %e,
                reason = %reason,
                "Decision could not be recorded, SELL proceeds on best effort"
            );
        }

        if allowed && intent.side == Side::Buy {
            state.positions.insert(
                intent.symbol.clone(),
                Position::reserved(intent.symbol.clone(), intent.notional, now),
            );
        }
        let snapshot = self.publish(&state, now);

        if allowed {
            info!(
                symbol = %intent.symbol,
                side = %intent.side,
                notional = %intent.notional,
                strategy = %intent.strategy_id,
                open_positions = snapshot.open_positions(),
                "Trade approved"
            );
        } else {
            info!(
                symbol = %intent.symbol,
                side = %intent.side,
                notional = %intent.notional,
                strategy = %intent.strategy_id,
                reason = %reason,
                "Trade denied"
            );
        }

        Ok(Decision {
            allowed,
            reason,
            snapshot,
        })
    }

    /// Clear the kill-switch. Returns false if it was not active.
    ///
    /// The deactivation is audited before it takes effect; if it cannot be
    /// recorded the switch stays on.
    pub async fn deactivate_kill_switch(&self, reason: &str) -> Result<bool, RiskError> {
        let reason = reason.trim();
        if reason.is_empty() {
            return Err(RiskError::InvalidArgument(
                "a reason is required to deactivate the kill-switch".to_string(),
            ));
        }

        let mut state = self.state.lock().await;
        let now = self.clock.now();
        self.roll_day(&mut state, now);
        if !state.kill_switch_active {
            info!("Kill-switch deactivation requested but it is not active");
            return Ok(false);
        }

        let previous = state.kill_switch_reason.clone().unwrap_or_default();
        let record = self
            .with_risk_fields(AuditRecord::builder(AuditEventKind::KillSwitchDeactivated), &state)
            .at(now)
            .field("reason", reason)
            .field("previous_reason", previous.clone())
            .build();
        self.audit.append(record).await?;

        state.kill_switch_active = false;
        state.kill_switch_reason = None;
        self.kill_switch.store(false, Ordering::SeqCst);
        self.publish(&state, now);

        warn!(
            reason = %reason,
            previous_reason = %previous,
            daily_realized_pnl = %state.daily_realized_pnl,
            "Kill-switch DEACTIVATED - trading resumed"
        );
        self.spawn_notify(format!("Kill-switch deactivated: {}", reason));
        Ok(true)
    }

    /// Halt trading immediately. Returns false if already active.
    pub async fn activate_kill_switch(&self, reason: &str) -> Result<bool, RiskError> {
        let reason = reason.trim();
        if reason.is_empty() {
            return Err(RiskError::InvalidArgument(
                "a reason is required to activate the kill-switch".to_string(),
            ));
        }

        let mut state = self.state.lock().await;
        let now = self.clock.now();
        if state.kill_switch_active {
            return Ok(false);
        }

        self.set_kill_switch(&mut state, reason.to_string());
        let record = self
            .with_risk_fields(AuditRecord::builder(AuditEventKind::KillSwitchActivated), &state)
            .at(now)
            .field("reason", reason)
            .build();
        if let Err(e) = self.audit.append(record).await {
            error!(error = %e, "Kill-switch activation could not be recorded");
        }
        self.publish(&state, now);

        error!(reason = %reason, "Kill-switch ACTIVATED manually - trading halted");
        self.spawn_notify(format!("Kill-switch activated: {}", reason));
        Ok(true)
    }

    /// Replace the reservation made by an approved BUY with the actual fill.
    pub async fn record_trade_opened(&self, position: Position) -> Result<(), RiskError> {
        if position.quantity <= Decimal::ZERO || position.entry_price <= Decimal::ZERO {
            return Err(RiskError::InvalidArgument(format!(
                "fill for {} must have positive price and quantity",
                position.symbol
            )));
        }

        let mut state = self.state.lock().await;
        match state.positions.get(&position.symbol) {
            Some(existing) if existing.is_reserved() => {}
            Some(_) => {
                return Err(RiskError::InvalidArgument(format!(
                    "position for {} is already open",
                    position.symbol
                )))
            }
            None => return Err(RiskError::UnknownPosition(position.symbol)),
        }

        let mut position = position;
        position.status = PositionStatus::Open;
        info!(
            symbol = %position.symbol,
            entry_price = %position.entry_price,
            quantity = %position.quantity,
            "Position opened"
        );
        state.positions.insert(position.symbol.clone(), position);
        self.publish(&state, self.clock.now());
        Ok(())
    }

    /// Free the slot reserved by an approved BUY whose order did not fill.
    pub async fn release_reservation(&self, symbol: &str) -> Result<(), RiskError> {
        let mut state = self.state.lock().await;
        match state.positions.get(symbol) {
            Some(existing) if existing.is_reserved() => {}
            Some(_) => {
                return Err(RiskError::InvalidArgument(format!(
                    "position for {} is filled, close it instead",
                    symbol
                )))
            }
            None => return Err(RiskError::UnknownPosition(symbol.to_string())),
        }

        state.positions.remove(symbol);
        debug!(symbol = %symbol, "Position reservation released");
        self.publish(&state, self.clock.now());
        Ok(())
    }

    /// Account for a closed position.
    ///
    /// Adds `realized_pnl` to the day's total and starts the cool-down on a
    /// loss. A breach of the daily limit latches the kill-switch on the next
    /// [`authorize`](Self::authorize) call.
    pub async fn record_trade_closed(
        &self,
        symbol: &str,
        realized_pnl: Decimal,
    ) -> Result<RiskSnapshot, RiskError> {
        let mut state = self.state.lock().await;
        let now = self.clock.now();
        self.roll_day(&mut state, now);

        if state.positions.remove(symbol).is_none() {
            return Err(RiskError::UnknownPosition(symbol.to_string()));
        }

        state.daily_realized_pnl += realized_pnl;
        if realized_pnl < Decimal::ZERO {
            state.last_loss_at = Some(now);
        }

        info!(
            symbol = %symbol,
            realized_pnl = %realized_pnl,
            daily_realized_pnl = %state.daily_realized_pnl,
            "Position closed"
        );
        if self.should_latch(&state) {
            warn!(
                daily_realized_pnl = %state.daily_realized_pnl,
                max_daily_loss = %self.config.max_daily_loss,
                "Daily loss limit reached"
            );
        }

        Ok(self.publish(&state, now))
    }

    /// Reconcile tracked positions with what the exchange reports.
    ///
    /// Reservations for orders still in flight are left alone.
    pub async fn sync_positions(
        &self,
        exchange: &dyn ExchangeClient,
        breakers: &BreakerRegistry,
    ) -> Result<SyncReport, RiskError> {
        let live = breakers
            .call(EXCHANGE_API, async { exchange.open_positions().await })
            .await?;
        let live: BTreeMap<String, Position> =
            live.into_iter().map(|p| (p.symbol.clone(), p)).collect();

        let mut state = self.state.lock().await;
        let now = self.clock.now();
        let mut report = SyncReport::default();

        let mut gone: Vec<String> = state
            .positions
            .iter()
            .filter(|(symbol, p)| !p.is_reserved() && !live.contains_key(*symbol))
            .map(|(symbol, _)| symbol.clone())
            .collect();
        gone.sort();
        for symbol in gone {
            state.positions.remove(&symbol);
            warn!(symbol = %symbol, "Position no longer reported by exchange, dropped");
            report.dropped.push(symbol);
        }

        for (symbol, mut position) in live {
            position.status = PositionStatus::Open;
            match state.positions.get(&symbol) {
                Some(existing) if !existing.is_reserved() => {}
                Some(_) => {
                    info!(symbol = %symbol, "Reserved position confirmed by exchange");
                    state.positions.insert(symbol.clone(), position);
                    report.confirmed.push(symbol);
                }
                None if state.positions.len() >= self.config.max_positions => {
                    error!(
                        symbol = %symbol,
                        max_positions = self.config.max_positions,
                        "Exchange reports a position beyond the position limit, not tracked"
                    );
                    report.over_limit.push(symbol);
                }
                None => {
                    warn!(symbol = %symbol, "Adopted position opened outside the risk gate");
                    state.positions.insert(symbol.clone(), position);
                    report.adopted.push(symbol);
                }
            }
        }

        self.publish(&state, now);
        Ok(report)
    }

    /// Start a new trading day if UTC midnight has passed. Returns true if
    /// the day rolled.
    pub async fn roll_trading_day(&self) -> bool {
        let mut state = self.state.lock().await;
        let now = self.clock.now();
        let rolled = self.roll_day(&mut state, now);
        if rolled {
            self.publish(&state, now);
        }
        rolled
    }

    /// Latest risk snapshot.
    pub fn status(&self) -> RiskSnapshot {
        self.status_tx.borrow().clone()
    }

    /// Receive a new snapshot after every state change.
    pub fn subscribe(&self) -> watch::Receiver<RiskSnapshot> {
        self.status_tx.subscribe()
    }

    pub fn is_kill_switch_active(&self) -> bool {
        self.kill_switch.load(Ordering::SeqCst)
    }

    // Private methods

    fn evaluate(
        &self,
        state: &RiskState,
        intent: &TradeIntent,
        now: DateTime<Utc>,
        latched_now: bool,
    ) -> DecisionReason {
        if intent.side.is_reducing() {
            // Limits and cool-down never apply to a SELL. A SELL on the call
            // that latched the switch was submitted before the halt.
            if state.kill_switch_active && !latched_now {
                return DecisionReason::KillSwitchActive;
            }
            return DecisionReason::Ok;
        }

        if state.kill_switch_active {
            return if latched_now {
                DecisionReason::DailyLossLimit
            } else {
                DecisionReason::KillSwitchActive
            };
        }
        // Unlevered spot BUY: the whole notional is at risk.
        if intent.notional > self.config.max_loss_per_trade {
            return DecisionReason::PerTradeLimit;
        }
        if state.positions.len() >= self.config.max_positions {
            return DecisionReason::MaxPositions;
        }
        if state.positions.contains_key(&intent.symbol) {
            return DecisionReason::DuplicatePosition;
        }
        if let Some(last_loss) = state.last_loss_at {
            if now - last_loss < self.config.cool_down {
                return DecisionReason::CoolDownActive;
            }
        }
        DecisionReason::Ok
    }

    fn should_latch(&self, state: &RiskState) -> bool {
        !state.kill_switch_active && state.daily_realized_pnl <= -self.config.max_daily_loss
    }

    async fn latch_daily_loss(
        &self,
        state: &mut RiskState,
        now: DateTime<Utc>,
    ) -> Result<(), AuditError> {
        let reason = DecisionReason::DailyLossLimit.as_str();
        self.set_kill_switch(state, reason.to_string());

        error!(
            daily_realized_pnl = %state.daily_realized_pnl,
            max_daily_loss = %self.config.max_daily_loss,
            "Kill-switch ACTIVATED - daily loss limit breached"
        );

        let record = self
            .with_risk_fields(AuditRecord::builder(AuditEventKind::KillSwitchActivated), state)
            .at(now)
            .field("reason", reason)
            .build();
        let result = self.audit.append(record).await.map(|_| ());

        self.spawn_notify(format!(
            "Kill-switch activated: daily realized P&L {} breached the -{} limit",
            state.daily_realized_pnl, self.config.max_daily_loss
        ));
        result
    }

    fn set_kill_switch(&self, state: &mut RiskState, reason: String) {
        state.kill_switch_active = true;
        state.kill_switch_reason = Some(reason);
        self.kill_switch.store(true, Ordering::SeqCst);
    }

    /// Reset daily P&L at UTC midnight. The kill-switch is untouched.
    fn roll_day(&self, state: &mut RiskState, now: DateTime<Utc>) -> bool {
        let today = now.date_naive();
        if today <= state.trading_day {
            return false;
        }

        info!(
            previous_day = %state.trading_day,
            today = %today,
            daily_realized_pnl = %state.daily_realized_pnl,
            kill_switch_active = state.kill_switch_active,
            "New trading day, daily P&L reset"
        );
        state.trading_day = today;
        state.daily_realized_pnl = Decimal::ZERO;
        true
    }

    fn decision_record(
        &self,
        intent: &TradeIntent,
        reason: DecisionReason,
        state: &RiskState,
        now: DateTime<Utc>,
    ) -> AuditRecord {
        let kind = if reason == DecisionReason::Ok {
            AuditEventKind::TradeApproved
        } else {
            AuditEventKind::TradeRejected
        };

        self.with_risk_fields(AuditRecord::builder(kind), state)
            .at(now)
            .field("symbol", intent.symbol.as_str())
            .field("side", intent.side.to_string())
            .field("notional", intent.notional.to_string())
            .field("strategy_id", intent.strategy_id.as_str())
            .field("reason", reason.as_str())
            .build()
    }

    fn with_risk_fields(&self, builder: AuditRecordBuilder, state: &RiskState) -> AuditRecordBuilder {
        builder
            .field("kill_switch_active", state.kill_switch_active)
            .field("daily_realized_pnl", state.daily_realized_pnl.to_string())
            .field("open_positions", state.positions.len() as u64)
            .field("max_positions", self.config.max_positions as u64)
    }

    fn publish(&self, state: &RiskState, now: DateTime<Utc>) -> RiskSnapshot {
        let snapshot = snapshot_of(&self.config, state, now);
        self.status_tx.send_replace(snapshot.clone());
        snapshot
    }

    /// Deliver on a separate task so a slow notifier never holds the gate.
    fn spawn_notify(&self, message: String) {
        let notifier = self.notifier.clone();
        let timeout = self.notify_timeout;
        tokio::spawn(async move {
            match tokio::time::timeout(timeout, notifier.notify(&message)).await {
                Ok(Ok(())) => debug!("Kill-switch notification delivered"),
                Ok(Err(e)) => warn!(error = %e, "Kill-switch notification failed"),
                Err(_) => warn!(
                    timeout_ms = timeout.as_millis() as u64,
                    "Kill-switch notification timed out"
                ),
            }
        });
    }
}

fn snapshot_of(config: &RiskConfig, state: &RiskState, now: DateTime<Utc>) -> RiskSnapshot {
    let mut positions: Vec<Position> = state.positions.values().cloned().collect();
    positions.sort_by(|a, b| a.symbol.cmp(&b.symbol));

    RiskSnapshot {
        kill_switch_active: state.kill_switch_active,
        kill_switch_reason: state.kill_switch_reason.clone(),
        trading_day: state.trading_day,
        daily_realized_pnl: state.daily_realized_pnl,
        positions,
        max_positions: config.max_positions,
        last_loss_at: state.last_loss_at,
        as_of: now,
    }
}
