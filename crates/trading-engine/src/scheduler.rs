//! Cycle scheduler for the periodic trading jobs.
//!
//! Each job gets a driver task that sleeps until the next firing. A firing
//! never queues: if the breaker guarding the job is open, or the previous run
//! is still in progress, the cycle is skipped and counted.

use async_trait::async_trait;
use chrono::{DateTime, NaiveTime, TimeZone, Utc};
use risk_manager::BreakerRegistry;
use serde::{Serialize, Serializer};
use std::fmt;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;
use thiserror::Error;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio::time::{Instant, MissedTickBehavior};
use tracing::{debug, error, info, warn};
use trading_core::{Clock, SystemClock};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum JobKind {
    SignalCheck,
    DailySummary,
}

/// When a job fires.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Schedule {
    /// Fixed interval, first firing one interval after start.
    Every(Duration),
    /// Once a day at a UTC time of day.
    DailyAt(NaiveTime),
}

impl Schedule {
    /// Next firing strictly after `now`.
    pub fn next_after(&self, now: DateTime<Utc>) -> DateTime<Utc> {
        match self {
            Schedule::Every(interval) => {
                now + chrono::Duration::from_std(*interval).unwrap_or_else(|_| chrono::Duration::zero())
            }
            Schedule::DailyAt(time) => {
                let today = Utc.from_utc_datetime(&now.date_naive().and_time(*time));
                if today > now {
                    today
                } else {
                    today + chrono::Duration::days(1)
                }
            }
        }
    }
}

impl fmt::Display for Schedule {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Schedule::Every(interval) => write!(f, "every {:?}", interval),
            Schedule::DailyAt(time) => write!(f, "daily at {} UTC", time),
        }
    }
}

impl Serialize for Schedule {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.collect_str(self)
    }
}

/// A unit of periodic work.
#[async_trait]
pub trait Job: Send + Sync {
    fn id(&self) -> &str;

    fn kind(&self) -> JobKind;

    /// Breaker whose open state skips the cycle.
    fn guarded_by(&self) -> Option<&str> {
        None
    }

    async fn run(&self) -> anyhow::Result<()>;
}

#[derive(Error, Debug, PartialEq, Eq)]
pub enum SchedulerError {
    #[error("Job already scheduled: {0}")]
    DuplicateJob(String),

    #[error("Scheduler already started")]
    AlreadyStarted,

    #[error("Job {0} has a zero interval")]
    ZeroInterval(String),
}

/// Read-only view of one scheduled job.
#[derive(Debug, Clone, Serialize)]
pub struct ScheduledJob {
    pub id: String,
    pub kind: JobKind,
    pub schedule: Schedule,
    pub next_run_at: Option<DateTime<Utc>>,
    pub running: bool,
    pub runs: u64,
    pub skipped_overlap: u64,
    pub skipped_breaker_open: u64,
    pub failures: u64,
    pub last_error: Option<String>,
    pub last_run_at: Option<DateTime<Utc>>,
}

#[derive(Debug, Default)]
struct JobStats {
    next_run_at: Option<DateTime<Utc>>,
    runs: u64,
    skipped_overlap: u64,
    skipped_breaker_open: u64,
    failures: u64,
    last_error: Option<String>,
    last_run_at: Option<DateTime<Utc>>,
}

struct JobEntry {
    job: Arc<dyn Job>,
    schedule: Schedule,
    running: AtomicBool,
    stats: Mutex<JobStats>,
    in_flight: Mutex<Option<JoinHandle<()>>>,
}

impl JobEntry {
    fn stats(&self) -> MutexGuard<'_, JobStats> {
        self.stats.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn view(&self) -> ScheduledJob {
        let stats = self.stats();
        ScheduledJob {
            id: self.job.id().to_string(),
            kind: self.job.kind(),
            schedule: self.schedule,
            next_run_at: stats.next_run_at,
            running: self.running.load(Ordering::SeqCst),
            runs: stats.runs,
            skipped_overlap: stats.skipped_overlap,
            skipped_breaker_open: stats.skipped_breaker_open,
            failures: stats.failures,
            last_error: stats.last_error.clone(),
            last_run_at: stats.last_run_at,
        }
    }
}

/// Clears the running flag when a job body finishes or unwinds.
struct RunningGuard<'a>(&'a AtomicBool);

impl Drop for RunningGuard<'_> {
    fn drop(&mut self) {
        self.0.store(false, Ordering::SeqCst);
    }
}

pub struct Scheduler {
    jobs: Mutex<Vec<Arc<JobEntry>>>,
    breakers: Arc<BreakerRegistry>,
    clock: Arc<dyn Clock>,
    started: AtomicBool,
    shutdown_tx: watch::Sender<bool>,
    drivers: Mutex<Vec<JoinHandle<()>>>,
}

impl Scheduler {
    pub fn new(breakers: Arc<BreakerRegistry>) -> Self {
        let (shutdown_tx, _) = watch::channel(false);
        Self {
            jobs: Mutex::new(Vec::new()),
            breakers,
            clock: Arc::new(SystemClock),
            started: AtomicBool::new(false),
            shutdown_tx,
            drivers: Mutex::new(Vec::new()),
        }
    }

    /// Wall clock used for daily firings and run timestamps.
    pub fn with_clock(mut self, clock: Arc<dyn Clock>) -> Self {
        self.clock = clock;
        self
    }

    fn jobs(&self) -> MutexGuard<'_, Vec<Arc<JobEntry>>> {
        self.jobs.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Register a job. Only allowed before [`start`](Self::start).
    pub fn schedule(&self, job: Arc<dyn Job>, schedule: Schedule) -> Result<(), SchedulerError> {
        if self.started.load(Ordering::SeqCst) {
            return Err(SchedulerError::AlreadyStarted);
        }
        let mut jobs = self.jobs();
        if jobs.iter().any(|e| e.job.id() == job.id()) {
            return Err(SchedulerError::DuplicateJob(job.id().to_string()));
        }
        if matches!(schedule, Schedule::Every(period) if period.is_zero()) {
            return Err(SchedulerError::ZeroInterval(job.id().to_string()));
        }

        info!(job_id = %job.id(), kind = ?job.kind(), schedule = %schedule, "Job scheduled");
        jobs.push(Arc::new(JobEntry {
            job,
            schedule,
            running: AtomicBool::new(false),
            stats: Mutex::new(JobStats::default()),
            in_flight: Mutex::new(None),
        }));
        Ok(())
    }

    /// Spawn one driver per job.
    pub fn start(&self) -> Result<(), SchedulerError> {
        if self.started.swap(true, Ordering::SeqCst) {
            return Err(SchedulerError::AlreadyStarted);
        }

        let jobs: Vec<Arc<JobEntry>> = self.jobs().clone();
        let mut drivers = self.drivers.lock().unwrap_or_else(PoisonError::into_inner);
        for entry in jobs {
            let driver = Driver {
                entry,
                breakers: self.breakers.clone(),
                clock: self.clock.clone(),
            };
            drivers.push(tokio::spawn(driver.run(self.shutdown_tx.subscribe())));
        }

        info!(jobs = drivers.len(), "Scheduler started");
        Ok(())
    }

    /// Stop all drivers. With `wait_for_running`, also wait for in-flight
    /// job bodies to finish; otherwise they are left to complete on their own.
    pub async fn stop(&self, wait_for_running: bool) {
        self.shutdown_tx.send_replace(true);

        if !wait_for_running {
            self.drivers
                .lock()
                .unwrap_or_else(PoisonError::into_inner)
                .clear();
            info!("Scheduler stopping, in-flight jobs not awaited");
            return;
        }

        let drivers: Vec<JoinHandle<()>> = std::mem::take(
            &mut *self.drivers.lock().unwrap_or_else(PoisonError::into_inner),
        );
        for driver in drivers {
            if let Err(e) = driver.await {
                warn!(error = %e, "Scheduler driver ended abnormally");
            }
        }

        let in_flight: Vec<(String, JoinHandle<()>)> = self
            .jobs()
            .iter()
            .filter_map(|entry| {
                let handle = entry
                    .in_flight
                    .lock()
                    .unwrap_or_else(PoisonError::into_inner)
                    .take()?;
                Some((entry.job.id().to_string(), handle))
            })
            .collect();
        for (job_id, handle) in in_flight {
            if !handle.is_finished() {
                info!(job_id = %job_id, "Waiting for running job to finish");
            }
            if let Err(e) = handle.await {
                error!(job_id = %job_id, error = %e, "Job run panicked");
            }
        }

        info!("Scheduler stopped");
    }

    /// Snapshot of every job in registration order.
    pub fn list_jobs(&self) -> Vec<ScheduledJob> {
        self.jobs().iter().map(|entry| entry.view()).collect()
    }
}

struct Driver {
    entry: Arc<JobEntry>,
    breakers: Arc<BreakerRegistry>,
    clock: Arc<dyn Clock>,
}

impl Driver {
    async fn run(self, mut shutdown: watch::Receiver<bool>) {
        match self.entry.schedule {
            Schedule::Every(interval) => {
                let mut ticker = tokio::time::interval_at(Instant::now() + interval, interval);
                ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);
                self.set_next_run(self.entry.schedule.next_after(self.clock.now()));

                loop {
                    if *shutdown.borrow() {
                        break;
                    }
                    tokio::select! {
                        biased;
                        _ = shutdown.changed() => break,
                        _ = ticker.tick() => {}
                    }
                    self.set_next_run(self.entry.schedule.next_after(self.clock.now()));
                    self.fire();
                }
            }
            Schedule::DailyAt(_) => {
                let mut next_at = self.entry.schedule.next_after(self.clock.now());

                loop {
                    if *shutdown.borrow() {
                        break;
                    }
                    self.set_next_run(next_at);
                    let wait = (next_at - self.clock.now())
                        .to_std()
                        .unwrap_or(Duration::ZERO);
                    tokio::select! {
                        biased;
                        _ = shutdown.changed() => break,
                        _ = tokio::time::sleep(wait) => {}
                    }
                    self.fire();

                    let now = self.clock.now();
                    next_at += chrono::Duration::days(1);
                    while next_at <= now {
                        next_at += chrono::Duration::days(1);
                    }
                }
            }
        }

        debug!(job_id = %self.entry.job.id(), "Job driver stopped");
    }

    fn set_next_run(&self, at: DateTime<Utc>) {
        self.entry.stats().next_run_at = Some(at);
    }

    fn fire(&self) {
        let job_id = self.entry.job.id();

        if let Some(breaker) = self.entry.job.guarded_by() {
            if self.breakers.is_open(breaker) {
                self.entry.stats().skipped_breaker_open += 1;
                warn!(job_id = %job_id, breaker = %breaker, "Breaker open, cycle skipped");
                return;
            }
        }

        if self
            .entry
            .running
            .compare_exchange(false, true, Ordering::SeqCst, Ordering::SeqCst)
            .is_err()
        {
            self.entry.stats().skipped_overlap += 1;
            warn!(job_id = %job_id, "Previous run still in progress, cycle skipped");
            return;
        }

        let entry = self.entry.clone();
        let clock = self.clock.clone();
        let handle = tokio::spawn(async move {
            let _running = RunningGuard(&entry.running);
            let started = Instant::now();
            let result = entry.job.run().await;

            let mut stats = entry.stats();
            stats.runs += 1;
            stats.last_run_at = Some(clock.now());
            match result {
                Ok(()) => debug!(
                    job_id = %entry.job.id(),
                    elapsed_ms = started.elapsed().as_millis() as u64,
                    "Job run completed"
                ),
                Err(e) => {
                    let message = format!("{:#}", e);
                    error!(job_id = %entry.job.id(), error = %message, "Job run failed");
                    stats.failures += 1;
                    stats.last_error = Some(message);
                }
            }
        });

        *self
            .entry
            .in_flight
            .lock()
            .unwrap_or_else(PoisonError::into_inner) = Some(handle);
    }
}
