//! Scheduler: holds `ScheduledJob`s and, on a fixed-resolution
//! ticker, instantiates due job templates into the job store for the
//! engine's worker pool to pick up.
//!
//! The scheduler never talks to the engine directly — it writes `pending`
//! rows to the same [`JobStore`] the engine polls, the way the cron-driven
//! half of a system hands work to its worker half through a shared queue
//! rather than a direct call.

use std::collections::HashMap;
use std::str::FromStr;
use std::sync::Mutex;
use std::time::Duration;

use chrono::{DateTime, Utc};
use cron::Schedule;
use vmforge_jobstore::JobStore;
use vmforge_types::{Job, ScheduledJob};

#[derive(Debug, thiserror::Error)]
pub enum SchedulerError {
    #[error("schedule {0} not found")]
    NotFound(String),
    #[error("invalid cron expression {expr:?}: {source}")]
    InvalidCron { expr: String, source: cron::error::Error },
    #[error("job store error: {0}")]
    Store(#[from] vmforge_jobstore::JobStoreError),
}

/// Parse and validate a cron expression without registering a schedule
/// (used by CLI/API validation paths before a schedule is created).
///
/// Schedules use the standard 5-field crontab form (`min hour dom month
/// dow`); the `cron` crate requires a leading seconds field. A bare
/// 5-field expression is normalized to 6 fields with `sec=0` before
/// parsing; 6- and 7-field (with year) expressions are passed through
/// unchanged.
pub fn parse_cron(expr: &str) -> Result<Schedule, SchedulerError> {
    let field_count = expr.split_whitespace().count();
    let normalized = if field_count == 5 {
        format!("0 {expr}")
    } else {
        expr.to_string()
    };
    Schedule::from_str(&normalized).map_err(|source| SchedulerError::InvalidCron { expr: expr.to_string(), source })
}

fn compute_next_run(expr: &str, after: DateTime<Utc>) -> Result<Option<DateTime<Utc>>, SchedulerError> {
    let schedule = parse_cron(expr)?;
    Ok(schedule.after(&after).next())
}

/// Owns the set of [`ScheduledJob`]s and drives them against a [`JobStore`].
pub struct Scheduler {
    store: std::sync::Arc<JobStore>,
    schedules: Mutex<HashMap<String, ScheduledJob>>,
}

impl Scheduler {
    pub fn new(store: std::sync::Arc<JobStore>) -> Self {
        Self { store, schedules: Mutex::new(HashMap::new()) }
    }

    /// Register a schedule, computing its first `next_run` if unset.
    pub fn add_schedule(&self, mut schedule: ScheduledJob) -> Result<(), SchedulerError> {
        if schedule.next_run.is_none() {
            schedule.next_run = compute_next_run(&schedule.cron_expression, Utc::now())?;
        }
        self.schedules.lock().unwrap().insert(schedule.id.clone(), schedule);
        Ok(())
    }

    pub fn remove_schedule(&self, id: &str) -> Result<ScheduledJob, SchedulerError> {
        self.schedules.lock().unwrap().remove(id).ok_or_else(|| SchedulerError::NotFound(id.to_string()))
    }

    pub fn get_schedule(&self, id: &str) -> Option<ScheduledJob> {
        self.schedules.lock().unwrap().get(id).cloned()
    }

    pub fn list_schedules(&self) -> Vec<ScheduledJob> {
        self.schedules.lock().unwrap().values().cloned().collect()
    }

    /// Disable a schedule: halts future dispatches but does not touch any
    /// job already enqueued or running (the contract's resolution to the
    /// schedule-disable-vs-in-flight-jobs ambiguity).
    pub fn disable(&self, id: &str) -> Result<(), SchedulerError> {
        let mut schedules = self.schedules.lock().unwrap();
        let schedule = schedules.get_mut(id).ok_or_else(|| SchedulerError::NotFound(id.to_string()))?;
        schedule.enabled = false;
        schedule.updated_at = Utc::now();
        Ok(())
    }

    pub fn enable(&self, id: &str) -> Result<(), SchedulerError> {
        let mut schedules = self.schedules.lock().unwrap();
        let schedule = schedules.get_mut(id).ok_or_else(|| SchedulerError::NotFound(id.to_string()))?;
        schedule.enabled = true;
        schedule.updated_at = Utc::now();
        if schedule.next_run.is_none() {
            schedule.next_run = compute_next_run(&schedule.cron_expression, Utc::now())?;
        }
        Ok(())
    }

    /// Force an immediate enqueue without advancing `next_run`.
    pub fn trigger_now(&self, id: &str) -> Result<Job, SchedulerError> {
        let mut schedules = self.schedules.lock().unwrap();
        let schedule = schedules.get_mut(id).ok_or_else(|| SchedulerError::NotFound(id.to_string()))?;
        let job = schedule.job_template.instantiate(uuid::Uuid::new_v4().to_string());
        schedule.run_count += 1;
        schedule.last_run = Some(Utc::now());
        self.store.save_job(&job)?;
        Ok(job)
    }

    /// One tick: advance and enqueue every enabled schedule whose
    /// `next_run <= now`.
    pub fn tick(&self) -> Result<Vec<Job>, SchedulerError> {
        let now = Utc::now();
        let mut due = Vec::new();
        let mut schedules = self.schedules.lock().unwrap();
        for schedule in schedules.values_mut() {
            if !schedule.enabled {
                continue;
            }
            let Some(next_run) = schedule.next_run else { continue };
            if next_run > now {
                continue;
            }

            schedule.next_run = compute_next_run(&schedule.cron_expression, now)?;
            schedule.run_count += 1;
            schedule.last_run = Some(now);
            let job = schedule.job_template.instantiate(uuid::Uuid::new_v4().to_string());
            due.push(job);
        }
        drop(schedules);

        for job in &due {
            self.store.save_job(job)?;
        }
        Ok(due)
    }

    /// Spawn a ticker that calls [`Scheduler::tick`] at `resolution`
    /// (fixed resolution, <= 1 second).
    pub fn spawn(self: std::sync::Arc<Self>, resolution: Duration, shutdown: tokio_util::sync::CancellationToken) -> tokio::task::JoinHandle<()> {
        tokio::spawn(async move {
            let mut interval = tokio::time::interval(resolution);
            loop {
                tokio::select! {
                    _ = interval.tick() => {
                        if let Err(e) = self.tick() {
                            tracing::error!(error = %e, "scheduler tick failed");
                        }
                    }
                    _ = shutdown.cancelled() => return,
                }
            }
        })
    }
}
