//! Trading Engine
//!
//! Market-data feed supervision, the cycle scheduler, order execution behind
//! the risk gate, and a paper exchange for running without a venue.

pub mod cycle;
pub mod executor;
pub mod feed_supervisor;
pub mod paper;
pub mod scheduler;

pub use cycle::{
    DailySummary, DailySummaryJob, NoSignalStrategy, SignalCheckJob, Strategy, DAILY_SUMMARY_JOB,
    SIGNAL_CHECK_JOB,
};
pub use executor::{ExecutionError, ExecutionMetrics, ExecutionOutcome, OrderExecutor};
pub use feed_supervisor::{FeedConfig, FeedHealth, FeedState, FeedSupervisor, ReconnectReason};
pub use paper::PaperExchange;
pub use scheduler::{Job, JobKind, Schedule, ScheduledJob, Scheduler, SchedulerError};
