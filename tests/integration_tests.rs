//! Integration tests for component interactions.
//!
//! These tests drive the risk gate, audit ledger, breakers, feed and
//! scheduler together the way the binary wires them.

use async_trait::async_trait;
use audit_ledger::{read_records, AuditEventKind, AuditFilter, AuditStorage, JsonlLedger, MemoryAuditStorage};
use chrono::{TimeZone, Utc};
use risk_manager::{BreakerRegistry, DecisionReason, RiskConfig, RiskError, RiskGate};
use rust_decimal::Decimal;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tokio::io::AsyncWriteExt;
use trading_core::{ManualClock, Position, Tick, TradeIntent};
use trading_engine::{
    FeedConfig, FeedSupervisor, OrderExecutor, PaperExchange, Schedule, Scheduler,
    SignalCheckJob, Strategy,
};

fn temp_ledger_path() -> PathBuf {
    std::env::temp_dir()
        .join("trade-guard-it")
        .join(format!("{}.jsonl", uuid::Uuid::new_v4()))
}

fn risk_config(max_daily_loss: i64, max_positions: usize) -> RiskConfig {
    RiskConfig::new(
        Decimal::new(100, 0),
        Decimal::new(max_daily_loss, 0),
        max_positions,
        chrono::Duration::minutes(15),
    )
    .unwrap()
}

fn buy(symbol: &str) -> TradeIntent {
    TradeIntent::buy(symbol, Decimal::new(50, 0), "it")
}

fn sell(symbol: &str) -> TradeIntent {
    TradeIntent::sell(symbol, Decimal::new(50, 0), "it")
}

async fn open(gate: &RiskGate, symbol: &str) {
    gate.record_trade_opened(Position::open(
        symbol,
        Decimal::new(10, 0),
        Decimal::new(5, 0),
        Utc::now(),
    ))
    .await
    .unwrap();
}

/// Test the end-to-end kill-switch scenario against a file-backed ledger.
#[tokio::test]
async fn test_daily_loss_scenario_is_audited() {
    let path = temp_ledger_path();
    let ledger = Arc::new(JsonlLedger::open(&path).await.unwrap());
    let gate = RiskGate::new(risk_config(20, 3), ledger.clone());

    for symbol in ["AAA-USDT", "BBB-USDT", "CCC-USDT"] {
        let decision = gate.authorize(&buy(symbol)).await.unwrap();
        assert!(decision.allowed, "{} should be approved", symbol);
        open(&gate, symbol).await;
    }

    let decision = gate.authorize(&buy("DDD-USDT")).await.unwrap();
    assert!(!decision.allowed);
    assert_eq!(decision.reason, DecisionReason::MaxPositions);

    let snapshot = gate
        .record_trade_closed("AAA-USDT", Decimal::new(-25, 0))
        .await
        .unwrap();
    assert_eq!(snapshot.daily_realized_pnl, Decimal::new(-25, 0));

    // Closing an existing position is still allowed; this call latches the switch.
    let decision = gate.authorize(&sell("BBB-USDT")).await.unwrap();
    assert!(decision.allowed);
    assert!(gate.is_kill_switch_active());

    let decision = gate.authorize(&buy("EEE-USDT")).await.unwrap();
    assert!(!decision.allowed);
    assert_eq!(decision.reason, DecisionReason::KillSwitchActive);

    let kinds: Vec<AuditEventKind> = read_records(&path)
        .await
        .unwrap()
        .into_iter()
        .map(|r| r.event_kind)
        .collect();
    assert_eq!(
        kinds,
        vec![
            AuditEventKind::TradeApproved,
            AuditEventKind::TradeApproved,
            AuditEventKind::TradeApproved,
            AuditEventKind::TradeRejected,
            AuditEventKind::KillSwitchActivated,
            AuditEventKind::TradeApproved,
            AuditEventKind::TradeRejected,
        ]
    );

    tokio::fs::remove_file(&path).await.ok();
}

/// Test that concurrent BUYs never exceed the position cap and each leaves one record.
#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_concurrent_authorize_respects_cap() {
    let path = temp_ledger_path();
    let ledger = Arc::new(JsonlLedger::open(&path).await.unwrap());
    let gate = Arc::new(RiskGate::new(risk_config(1_000, 3), ledger.clone()));

    let mut status = gate.subscribe();
    let watcher = tokio::spawn(async move {
        let mut max_seen = 0;
        while status.changed().await.is_ok() {
            max_seen = max_seen.max(status.borrow_and_update().open_positions());
        }
        max_seen
    });

    let handles: Vec<_> = (0..20)
        .map(|i| {
            let gate = gate.clone();
            tokio::spawn(async move { gate.authorize(&buy(&format!("SYM{}-USDT", i))).await })
        })
        .collect();

    let mut approved = 0;
    for handle in handles {
        if handle.await.unwrap().unwrap().allowed {
            approved += 1;
        }
    }
    assert_eq!(approved, 3);
    assert_eq!(gate.status().open_positions(), 3);

    let records = read_records(&path).await.unwrap();
    assert_eq!(records.len(), 20);
    let sequences: Vec<u64> = records.iter().map(|r| r.sequence).collect();
    assert_eq!(sequences, (1..=20).collect::<Vec<u64>>());
    assert_eq!(
        ledger
            .count(&AuditFilter::new().kind(AuditEventKind::TradeApproved))
            .await
            .unwrap(),
        3
    );

    drop(gate);
    assert!(watcher.await.unwrap() <= 3);
    tokio::fs::remove_file(&path).await.ok();
}

/// Test that an unwritable ledger blocks new exposure but not closes.
#[tokio::test]
async fn test_failing_ledger_blocks_buys_not_closes() {
    let storage = Arc::new(MemoryAuditStorage::new());
    let gate = RiskGate::new(risk_config(20, 3), storage.clone());

    assert!(gate.authorize(&buy("AAA-USDT")).await.unwrap().allowed);
    open(&gate, "AAA-USDT").await;

    storage.set_failing(true);
    let err = gate.authorize(&buy("BBB-USDT")).await.unwrap_err();
    assert!(matches!(err, RiskError::Audit(_)));
    assert_eq!(gate.status().open_positions(), 1);

    let decision = gate.authorize(&sell("AAA-USDT")).await.unwrap();
    assert!(decision.allowed);
}

/// Test ledger recovery after a crash mid-write.
#[tokio::test]
async fn test_torn_ledger_reopens_with_complete_records() {
    let path = temp_ledger_path();
    {
        let ledger = Arc::new(JsonlLedger::open(&path).await.unwrap());
        let gate = RiskGate::new(risk_config(20, 3), ledger);
        for symbol in ["AAA-USDT", "BBB-USDT", "CCC-USDT"] {
            gate.authorize(&buy(symbol)).await.unwrap();
        }
    }

    let mut file = tokio::fs::OpenOptions::new()
        .append(true)
        .open(&path)
        .await
        .unwrap();
    file.write_all(br#"{"sequence":4,"timestamp":"2024-03-01T12:"#)
        .await
        .unwrap();
    file.flush().await.unwrap();
    drop(file);

    let ledger = Arc::new(JsonlLedger::open(&path).await.unwrap());
    assert_eq!(ledger.query(&AuditFilter::new()).await.unwrap().len(), 3);

    let gate = RiskGate::new(risk_config(20, 3), ledger.clone());
    gate.authorize(&buy("DDD-USDT")).await.unwrap();

    let records = read_records(&path).await.unwrap();
    assert_eq!(records.len(), 4);
    assert_eq!(records[3].sequence, 4);
    assert_eq!(records[3].field_str("symbol"), Some("DDD-USDT"));

    tokio::fs::remove_file(&path).await.ok();
}

/// Test that the daily reset clears P&L but never the kill-switch.
#[tokio::test]
async fn test_kill_switch_survives_day_roll() {
    let clock = Arc::new(ManualClock::new(
        Utc.with_ymd_and_hms(2024, 3, 1, 22, 0, 0).unwrap(),
    ));
    let storage = Arc::new(MemoryAuditStorage::new());
    let gate = RiskGate::new(risk_config(20, 3), storage.clone()).with_clock(clock.clone());

    assert!(gate.authorize(&buy("AAA-USDT")).await.unwrap().allowed);
    open(&gate, "AAA-USDT").await;
    gate.record_trade_closed("AAA-USDT", Decimal::new(-30, 0))
        .await
        .unwrap();

    let decision = gate.authorize(&buy("BBB-USDT")).await.unwrap();
    assert_eq!(decision.reason, DecisionReason::DailyLossLimit);

    clock.advance(chrono::Duration::days(1));
    assert!(gate.roll_trading_day().await);
    assert_eq!(gate.status().daily_realized_pnl, Decimal::ZERO);

    let decision = gate.authorize(&buy("BBB-USDT")).await.unwrap();
    assert_eq!(decision.reason, DecisionReason::KillSwitchActive);

    assert!(gate.deactivate_kill_switch("reviewed by operator").await.unwrap());
    assert!(gate.authorize(&buy("BBB-USDT")).await.unwrap().allowed);

    let deactivations = storage
        .count(&AuditFilter::new().kind(AuditEventKind::KillSwitchDeactivated))
        .await
        .unwrap();
    assert_eq!(deactivations, 1);
}

/// Buys every symbol it is flat in.
struct BuyWhenFlat;

#[async_trait]
impl Strategy for BuyWhenFlat {
    fn id(&self) -> &str {
        "buy-when-flat"
    }

    async fn evaluate(
        &self,
        tick: &Tick,
        position: Option<&Position>,
    ) -> anyhow::Result<Option<TradeIntent>> {
        Ok(position
            .is_none()
            .then(|| TradeIntent::buy(&tick.symbol, Decimal::new(50, 0), self.id())))
    }
}

/// Test the paper pipeline: feed, scheduler, executor and risk gate together.
#[tokio::test(start_paused = true)]
async fn test_paper_pipeline_fills_up_to_cap() {
    let symbols: Vec<String> = ["BTC-USDT", "ETH-USDT", "SOL-USDT", "XRP-USDT", "ADA-USDT"]
        .iter()
        .map(|s| s.to_string())
        .collect();
    let exchange = Arc::new(PaperExchange::with_prices(
        symbols.iter().map(|s| (s.clone(), Decimal::new(100, 0))),
    ));
    let storage = Arc::new(MemoryAuditStorage::new());
    let risk = Arc::new(RiskGate::new(risk_config(20, 3), storage.clone()));
    let breakers = Arc::new(BreakerRegistry::default());

    let feed = Arc::new(FeedSupervisor::new(
        FeedConfig {
            symbols: symbols.clone(),
            ..FeedConfig::default()
        },
        exchange.clone(),
        breakers.clone(),
    ));
    feed.start();

    let executor = Arc::new(OrderExecutor::new(exchange.clone(), risk.clone(), breakers.clone()));
    let scheduler = Scheduler::new(breakers.clone());
    scheduler
        .schedule(
            Arc::new(SignalCheckJob::new(
                symbols.clone(),
                feed.clone(),
                Arc::new(BuyWhenFlat),
                executor.clone(),
                risk.clone(),
            )),
            Schedule::Every(Duration::from_secs(1)),
        )
        .unwrap();
    scheduler.start().unwrap();

    tokio::time::sleep(Duration::from_millis(3_500)).await;
    scheduler.stop(true).await;
    feed.stop().await;

    let status = risk.status();
    assert_eq!(status.open_positions(), 3);
    assert!(status.positions.iter().all(|p| !p.is_reserved()));
    assert_eq!(exchange.order_count(), 3);
    assert_eq!(executor.metrics().orders_filled, 3);

    let approved = storage
        .count(&AuditFilter::new().kind(AuditEventKind::TradeApproved))
        .await
        .unwrap();
    assert_eq!(approved, 3);
    let jobs = scheduler.list_jobs();
    assert_eq!(jobs[0].runs, 3);
    assert_eq!(jobs[0].failures, 0);
}
