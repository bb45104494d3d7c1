//! Configuration management for the trade-guard core.
//!
//! Components take plain typed settings; this module is the one place that
//! knows about files and environment variables.

use crate::{Error, Result};
use chrono::NaiveTime;
use rust_decimal::Decimal;
use serde::Deserialize;
use std::env;
use std::path::{Path, PathBuf};
use std::str::FromStr;
use tracing::{info, warn};

/// Application configuration.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct Config {
    #[serde(default)]
    pub risk: RiskSettings,
    #[serde(default)]
    pub breaker: BreakerSettings,
    #[serde(default)]
    pub feed: FeedSettings,
    #[serde(default)]
    pub scheduler: SchedulerSettings,
    #[serde(default)]
    pub audit: AuditSettings,
}

/// Risk limits consumed by the risk gate.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct RiskSettings {
    /// Largest loss a single trade may expose (quote currency).
    pub max_loss_per_trade: Decimal,
    /// Realized daily loss that latches the kill-switch (positive number).
    pub max_daily_loss: Decimal,
    pub max_positions: usize,
    /// Minimum wait after a losing close before a new BUY.
    pub cool_down_secs: u64,
}

impl Default for RiskSettings {
    fn default() -> Self {
        Self {
            max_loss_per_trade: Decimal::new(100, 0),
            max_daily_loss: Decimal::new(500, 0),
            max_positions: 5,
            cool_down_secs: 900,
        }
    }
}

/// Thresholds shared by every named circuit breaker.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct BreakerSettings {
    /// Consecutive dependency failures that open the circuit.
    pub failure_threshold: u32,
    /// A failure streak older than this restarts the count.
    pub failure_window_secs: u64,
    /// Time spent open before a half-open trial is allowed.
    pub cool_off_secs: u64,
    /// Upper bound on any single guarded call.
    pub call_timeout_ms: u64,
}

impl Default for BreakerSettings {
    fn default() -> Self {
        Self {
            failure_threshold: 5,
            failure_window_secs: 60,
            cool_off_secs: 30,
            call_timeout_ms: 5_000,
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct FeedSettings {
    pub symbols: Vec<String>,
    /// No message for this long marks the connection stale.
    pub stale_timeout_secs: u64,
    pub watchdog_interval_ms: u64,
    pub initial_backoff_ms: u64,
    pub max_backoff_ms: u64,
    /// Attempts per reconnect episode before the feed is declared stale.
    pub max_reconnect_attempts: u32,
    /// Wait before starting a new episode once stale.
    pub stale_retry_secs: u64,
}

impl Default for FeedSettings {
    fn default() -> Self {
        Self {
            symbols: vec!["BTC-USDT".to_string(), "ETH-USDT".to_string()],
            stale_timeout_secs: 30,
            watchdog_interval_ms: 1_000,
            initial_backoff_ms: 500,
            max_backoff_ms: 30_000,
            max_reconnect_attempts: 8,
            stale_retry_secs: 60,
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct SchedulerSettings {
    pub signal_check_interval_secs: u64,
    /// UTC time of day for the summary job.
    pub daily_summary_at: NaiveTime,
}

impl Default for SchedulerSettings {
    fn default() -> Self {
        Self {
            signal_check_interval_secs: 60,
            daily_summary_at: NaiveTime::from_hms_opt(0, 5, 0).unwrap_or(NaiveTime::MIN),
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct AuditSettings {
    /// JSON-lines ledger file.
    pub path: PathBuf,
}

impl Default for AuditSettings {
    fn default() -> Self {
        Self {
            path: PathBuf::from("data/audit.jsonl"),
        }
    }
}

impl Config {
    /// Load configuration from an optional file layered under `GUARD__*`
    /// environment variables (`GUARD__RISK__MAX_POSITIONS=3`).
    pub fn load(path: Option<&Path>) -> Result<Self> {
        dotenvy::dotenv().ok();

        let mut builder = config::Config::builder();
        if let Some(path) = path {
            builder = builder.add_source(config::File::from(path).required(true));
        }
        let settings = builder
            .add_source(
                config::Environment::with_prefix("GUARD")
                    .prefix_separator("__")
                    .separator("__")
                    .try_parsing(true)
                    .list_separator(",")
                    .with_list_parse_key("feed.symbols"),
            )
            .build()?;

        let config: Config = settings.try_deserialize()?;
        config.validate()?;
        info!(
            file = ?path,
            max_daily_loss = %config.risk.max_daily_loss,
            max_positions = config.risk.max_positions,
            "Configuration loaded"
        );
        Ok(config)
    }

    /// Load configuration from flat environment variables with defaults.
    pub fn from_env() -> Result<Self> {
        dotenvy::dotenv().ok();

        let risk_defaults = RiskSettings::default();
        let breaker_defaults = BreakerSettings::default();
        let feed_defaults = FeedSettings::default();
        let scheduler_defaults = SchedulerSettings::default();

        let config = Self {
            risk: RiskSettings {
                max_loss_per_trade: env_or("MAX_LOSS_PER_TRADE", risk_defaults.max_loss_per_trade),
                max_daily_loss: env_or("MAX_DAILY_LOSS", risk_defaults.max_daily_loss),
                max_positions: env_or("MAX_POSITIONS", risk_defaults.max_positions),
                cool_down_secs: env_or("COOL_DOWN_SECS", risk_defaults.cool_down_secs),
            },
            breaker: BreakerSettings {
                failure_threshold: env_or("BREAKER_FAILURE_THRESHOLD", breaker_defaults.failure_threshold),
                failure_window_secs: env_or(
                    "BREAKER_FAILURE_WINDOW_SECS",
                    breaker_defaults.failure_window_secs,
                ),
                cool_off_secs: env_or("BREAKER_COOL_OFF_SECS", breaker_defaults.cool_off_secs),
                call_timeout_ms: env_or("BREAKER_CALL_TIMEOUT_MS", breaker_defaults.call_timeout_ms),
            },
            feed: FeedSettings {
                symbols: env::var("FEED_SYMBOLS")
                    .ok()
                    .map(|s| {
                        s.split(',')
                            .map(|sym| sym.trim().to_string())
                            .filter(|sym| !sym.is_empty())
                            .collect()
                    })
                    .unwrap_or(feed_defaults.symbols),
                stale_timeout_secs: env_or("FEED_STALE_TIMEOUT_SECS", feed_defaults.stale_timeout_secs),
                watchdog_interval_ms: env_or(
                    "FEED_WATCHDOG_INTERVAL_MS",
                    feed_defaults.watchdog_interval_ms,
                ),
                initial_backoff_ms: env_or("FEED_INITIAL_BACKOFF_MS", feed_defaults.initial_backoff_ms),
                max_backoff_ms: env_or("FEED_MAX_BACKOFF_MS", feed_defaults.max_backoff_ms),
                max_reconnect_attempts: env_or(
                    "FEED_MAX_RECONNECT_ATTEMPTS",
                    feed_defaults.max_reconnect_attempts,
                ),
                stale_retry_secs: env_or("FEED_STALE_RETRY_SECS", feed_defaults.stale_retry_secs),
            },
            scheduler: SchedulerSettings {
                signal_check_interval_secs: env_or(
                    "SIGNAL_CHECK_INTERVAL_SECS",
                    scheduler_defaults.signal_check_interval_secs,
                ),
                daily_summary_at: env_or("DAILY_SUMMARY_AT", scheduler_defaults.daily_summary_at),
            },
            audit: AuditSettings {
                path: env::var("AUDIT_LOG_PATH")
                    .map(PathBuf::from)
                    .unwrap_or_else(|_| AuditSettings::default().path),
            },
        };

        config.validate()?;
        Ok(config)
    }

    /// Reject settings that would make a component meaningless.
    pub fn validate(&self) -> Result<()> {
        if self.risk.max_positions == 0 {
            return Err(config_error("risk.max_positions must be at least 1"));
        }
        if self.risk.max_daily_loss <= Decimal::ZERO {
            return Err(config_error("risk.max_daily_loss must be positive"));
        }
        if self.risk.max_loss_per_trade <= Decimal::ZERO {
            return Err(config_error("risk.max_loss_per_trade must be positive"));
        }
        if self.breaker.failure_threshold == 0 {
            return Err(config_error("breaker.failure_threshold must be at least 1"));
        }
        if self.breaker.call_timeout_ms == 0 {
            return Err(config_error("breaker.call_timeout_ms must be positive"));
        }
        if self.feed.max_reconnect_attempts == 0 {
            return Err(config_error("feed.max_reconnect_attempts must be at least 1"));
        }
        if self.feed.watchdog_interval_ms == 0 || self.feed.stale_timeout_secs == 0 {
            return Err(config_error("feed watchdog interval and stale timeout must be positive"));
        }
        if self.scheduler.signal_check_interval_secs == 0 {
            return Err(config_error("scheduler.signal_check_interval_secs must be positive"));
        }
        Ok(())
    }
}

fn env_or<T: FromStr>(key: &str, default: T) -> T {
    match env::var(key) {
        Ok(raw) => match raw.trim().parse() {
            Ok(value) => value,
            Err(_) => {
                warn!(key, value = %raw, "Unparsable environment value, using default");
                default
            }
        },
        Err(_) => default,
    }
}

fn config_error(message: &str) -> Error {
    Error::Config {
        message: message.to_string(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults_are_valid() {
        let config = Config::default();
        assert!(config.validate().is_ok());
        assert_eq!(config.risk.max_positions, 5);
        assert_eq!(
            config.scheduler.daily_summary_at,
            NaiveTime::from_hms_opt(0, 5, 0).unwrap()
        );
    }

    #[test]
    fn test_validate_rejects_zero_positions() {
        let mut config = Config::default();
        config.risk.max_positions = 0;
        assert!(matches!(config.validate(), Err(Error::Config { .. })));
    }

    #[test]
    fn test_load_from_file_overrides_defaults() {
        let path = std::env::temp_dir().join(format!("guard-config-{}.toml", uuid::Uuid::new_v4()));
        std::fs::write(
            &path,
            r#"
[risk]
max_daily_loss = "20"
max_positions = 3

[feed]
symbols = ["SOL-USDT"]
stale_timeout_secs = 10

[scheduler]
daily_summary_at = "23:30:00"
"#,
        )
        .unwrap();

        let config = tokio_test::assert_ok!(Config::load(Some(&path)));
        std::fs::remove_file(&path).ok();

        assert_eq!(config.risk.max_daily_loss, Decimal::new(20, 0));
        assert_eq!(config.risk.max_positions, 3);
        // Untouched keys fall back to defaults.
        assert_eq!(config.risk.cool_down_secs, 900);
        assert_eq!(config.feed.symbols, vec!["SOL-USDT".to_string()]);
        assert_eq!(config.feed.stale_timeout_secs, 10);
        assert_eq!(
            config.scheduler.daily_summary_at,
            NaiveTime::from_hms_opt(23, 30, 0).unwrap()
        );
    }

    #[test]
    fn test_load_rejects_missing_file() {
        let path = std::env::temp_dir().join(format!("guard-missing-{}.toml", uuid::Uuid::new_v4()));
        tokio_test::assert_err!(Config::load(Some(&path)));
    }

    #[test]
    fn test_env_or_falls_back_on_unparsable_value() {
        let key = format!("GUARD_TEST_{}", uuid::Uuid::new_v4().simple());
        assert_eq!(env_or(&key, 7usize), 7);

        env::set_var(&key, "not-a-number");
        assert_eq!(env_or(&key, 7usize), 7);

        env::set_var(&key, " 12 ");
        assert_eq!(env_or(&key, 7usize), 12);
        env::remove_var(&key);
    }
}
