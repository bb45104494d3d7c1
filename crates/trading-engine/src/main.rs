//! Trade Guard
//!
//! Runs the risk-gated trading core against the paper exchange.

use anyhow::{Context, Result};
use audit_ledger::JsonlLedger;
use risk_manager::{BreakerConfig, BreakerRegistry, LogNotifier, RiskConfig, RiskGate};
use rust_decimal::Decimal;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;
use tracing::info;
use tracing_subscriber::{fmt, layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};
use trading_core::config::Config;
use trading_engine::{
    DailySummaryJob, FeedConfig, FeedSupervisor, NoSignalStrategy, OrderExecutor, PaperExchange,
    Schedule, Scheduler, SignalCheckJob,
};

const PRICE_STEP: Duration = Duration::from_secs(1);

fn init_tracing() {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| {
        "trade_guard=info,trading_engine=info,risk_manager=info,audit_ledger=info".into()
    });
    let json = std::env::var("LOG_FORMAT")
        .map(|v| v.eq_ignore_ascii_case("json"))
        .unwrap_or(false);

    let registry = tracing_subscriber::registry().with(filter);
    if json {
        registry.with(fmt::layer().json()).init();
    } else {
        registry.with(fmt::layer()).init();
    }
}

/// Starting price for the paper book.
fn seed_price(symbol: &str) -> Decimal {
    match symbol.split(['-', '/']).next().unwrap_or_default() {
        "BTC" => Decimal::new(60_000, 0),
        "ETH" => Decimal::new(3_000, 0),
        "SOL" => Decimal::new(150, 0),
        _ => Decimal::new(100, 0),
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    init_tracing();

    let config_path = std::env::args().nth(1).map(PathBuf::from);
    let config = Config::load(config_path.as_deref()).context("failed to load configuration")?;
    info!(
        symbols = ?config.feed.symbols,
        audit_path = %config.audit.path.display(),
        "Starting trade-guard [PAPER]"
    );

    let ledger = JsonlLedger::open(&config.audit.path)
        .await
        .with_context(|| format!("failed to open audit ledger {}", config.audit.path.display()))?;
    let breakers = Arc::new(BreakerRegistry::new(BreakerConfig::from(&config.breaker)));
    let risk = Arc::new(
        RiskGate::new(RiskConfig::from_settings(&config.risk)?, Arc::new(ledger))
            .with_notifier(Arc::new(LogNotifier)),
    );

    let exchange = Arc::new(PaperExchange::with_prices(
        config
            .feed
            .symbols
            .iter()
            .map(|s| (s.clone(), seed_price(s))),
    ));
    let (sim_shutdown, sim_shutdown_rx) = watch::channel(false);
    let simulator = exchange.spawn_price_simulator(PRICE_STEP, sim_shutdown_rx);

    let feed = Arc::new(FeedSupervisor::new(
        FeedConfig::from(&config.feed),
        exchange.clone(),
        breakers.clone(),
    ));
    feed.start();

    let executor = Arc::new(OrderExecutor::new(
        exchange.clone(),
        risk.clone(),
        breakers.clone(),
    ));
    let scheduler = Arc::new(Scheduler::new(breakers.clone()));
    scheduler.schedule(
        Arc::new(SignalCheckJob::new(
            config.feed.symbols.clone(),
            feed.clone(),
            Arc::new(NoSignalStrategy),
            executor.clone(),
            risk.clone(),
        )),
        Schedule::Every(Duration::from_secs(
            config.scheduler.signal_check_interval_secs,
        )),
    )?;
    scheduler.schedule(
        Arc::new(DailySummaryJob::new(
            risk.clone(),
            exchange.clone(),
            breakers.clone(),
            feed.clone(),
            executor.clone(),
            Arc::downgrade(&scheduler),
        )),
        Schedule::DailyAt(config.scheduler.daily_summary_at),
    )?;
    scheduler.start()?;

    tokio::signal::ctrl_c()
        .await
        .context("failed to listen for shutdown signal")?;
    info!("Shutdown requested, waiting for running jobs");

    scheduler.stop(true).await;
    feed.stop().await;
    sim_shutdown.send_replace(true);
    let _ = simulator.await;

    let status = risk.status();
    info!(
        daily_realized_pnl = %status.daily_realized_pnl,
        open_positions = status.open_positions(),
        kill_switch_active = status.kill_switch_active,
        "trade-guard stopped"
    );
    Ok(())
}
