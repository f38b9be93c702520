//! In-process cron timer for deployments without an external scheduler.
//!
//! Each job gets its own ticker that sleeps until the next fire time and
//! calls the same [`JobService`] entry point the HTTP triggers use, so the
//! runner guard still prevents double runs when both are active.

use std::str::FromStr;
use std::sync::Arc;

use chrono::{DateTime, Utc};
use tokio::task::JoinHandle;
use tracing::{error, info, warn};

use crate::config::LocalTimerConfig;
use crate::error::{ConfigError, JobError};
use crate::jobs::service::{EXPIRY_JOB, JobService, REMINDER_JOB, SCHEDULE_JOB, STREAK_JOB};

/// Jobs the timer can fire.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TimerJob {
    Schedule,
    Streak,
    Expiry,
    Reminders,
}

impl TimerJob {
    pub fn name(&self) -> &'static str {
        match self {
            Self::Schedule => SCHEDULE_JOB,
            Self::Streak => STREAK_JOB,
            Self::Expiry => EXPIRY_JOB,
            Self::Reminders => REMINDER_JOB,
        }
    }

    async fn fire(&self, service: &JobService) -> Result<bool, JobError> {
        let skipped = match self {
            Self::Schedule => service.run_schedule_generation(None, false).await?.is_skipped(),
            Self::Streak => service.run_streak_pass().await?.is_skipped(),
            Self::Expiry => service.run_task_expiry().await?.is_skipped(),
            Self::Reminders => service.run_habit_reminders().await?.is_skipped(),
        };
        Ok(skipped)
    }
}

fn parse_schedule(key: &str, expr: &str) -> Result<cron::Schedule, ConfigError> {
    cron::Schedule::from_str(expr).map_err(|e| ConfigError::InvalidValue {
        key: key.to_string(),
        message: format!("invalid cron: {e}"),
    })
}

/// Next fire time of `expr` strictly after `after`.
pub fn next_fire(expr: &str, after: DateTime<Utc>) -> Result<Option<DateTime<Utc>>, ConfigError> {
    Ok(parse_schedule("cron", expr)?.after(&after).next())
}

/// Spawn one ticker per configured job. Returns no handles when the timer
/// is disabled.
///
/// All expressions are validated before anything is spawned.
pub fn spawn_local_timer(
    service: Arc<JobService>,
    config: &LocalTimerConfig,
) -> Result<Vec<JoinHandle<()>>, ConfigError> {
    if !config.enabled {
        return Ok(Vec::new());
    }

    let entries = [
        ("PRACTICE_SCHEDULE_CRON", &config.schedule_cron, TimerJob::Schedule),
        ("PRACTICE_STREAK_CRON", &config.streak_cron, TimerJob::Streak),
        ("PRACTICE_EXPIRY_CRON", &config.expiry_cron, TimerJob::Expiry),
        ("PRACTICE_REMINDER_CRON", &config.reminder_cron, TimerJob::Reminders),
    ];

    let mut schedules = Vec::with_capacity(entries.len());
    for (key, expr, job) in entries {
        schedules.push((parse_schedule(key, expr)?, job));
    }

    let handles = schedules
        .into_iter()
        .map(|(schedule, job)| {
            info!(job = job.name(), "Local timer armed");
            spawn_ticker(Arc::clone(&service), schedule, job)
        })
        .collect();
    Ok(handles)
}

fn spawn_ticker(service: Arc<JobService>, schedule: cron::Schedule, job: TimerJob) -> JoinHandle<()> {
    tokio::spawn(async move {
        loop {
            let Some(next) = schedule.upcoming(Utc).next() else {
                warn!(job = job.name(), "Cron expression has no future fire time");
                return;
            };
            let wait = (next - Utc::now()).to_std().unwrap_or_default();
            tokio::time::sleep(wait).await;

            match job.fire(&service).await {
                Ok(true) => info!(job = job.name(), "Timer fire skipped by guard"),
                Ok(false) => info!(job = job.name(), "Timer fire completed"),
                Err(e) => error!(job = job.name(), error = %e, "Timer fire failed"),
            }
        }
    })
}
