//! Named jobs wired to the runner guard.

use std::sync::Arc;

use chrono::Utc;
use serde::Serialize;

use crate::config::{JobConfig, ScheduleConfig};
use crate::error::{DatabaseError, JobError};
use crate::jobs::model::{JobRecord, JobRun};
use crate::jobs::runner::{JobOutcome, JobRunner};
use crate::schedule::{BatchScheduleReport, Scheduler, TaskLifecycle};
use crate::store::Database;
use crate::streaks::{ReminderReport, StreakEngine, StreakPassReport};

pub const SCHEDULE_JOB: &str = "generate_schedules";
pub const STREAK_JOB: &str = "streak_pass";
pub const EXPIRY_JOB: &str = "expire_tasks";
pub const REMINDER_JOB: &str = "habit_reminders";

/// Every job the service runs; the status endpoint rejects other names.
pub const JOB_NAMES: [&str; 4] = [SCHEDULE_JOB, STREAK_JOB, EXPIRY_JOB, REMINDER_JOB];

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ExpiryReport {
    pub expired: u64,
}

/// A job record with its recent history.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct JobStatusView {
    pub record: JobRecord,
    pub runs: Vec<JobRun>,
}

/// Entry points shared by the HTTP triggers and the local timer.
pub struct JobService {
    store: Arc<dyn Database>,
    runner: JobRunner,
    scheduler: Arc<Scheduler>,
    streaks: Arc<StreakEngine>,
    lifecycle: Arc<TaskLifecycle>,
    jobs: JobConfig,
    schedule: ScheduleConfig,
}

impl JobService {
    pub fn new(
        store: Arc<dyn Database>,
        scheduler: Arc<Scheduler>,
        streaks: Arc<StreakEngine>,
        lifecycle: Arc<TaskLifecycle>,
        jobs: JobConfig,
        schedule: ScheduleConfig,
    ) -> Self {
        Self {
            runner: JobRunner::new(Arc::clone(&store), jobs.stale_run_threshold),
            store,
            scheduler,
            streaks,
            lifecycle,
            jobs,
            schedule,
        }
    }

    /// Generate schedules for all active users.
    pub async fn run_schedule_generation(
        &self,
        days: Option<u32>,
        force: bool,
    ) -> Result<JobOutcome<BatchScheduleReport>, JobError> {
        let days = days.unwrap_or(self.schedule.batch_days);
        let scheduler = Arc::clone(&self.scheduler);
        self.runner
            .run(SCHEDULE_JOB, self.jobs.schedule_min_interval_hours, || async move {
                Ok::<_, anyhow::Error>(scheduler.generate_for_active_users(days, force).await?)
            })
            .await
    }

    pub async fn run_streak_pass(&self) -> Result<JobOutcome<StreakPassReport>, JobError> {
        let streaks = Arc::clone(&self.streaks);
        self.runner
            .run(STREAK_JOB, self.jobs.streak_min_interval_hours, || async move {
                Ok::<_, anyhow::Error>(streaks.run_streak_pass().await?)
            })
            .await
    }

    pub async fn run_task_expiry(&self) -> Result<JobOutcome<ExpiryReport>, JobError> {
        let lifecycle = Arc::clone(&self.lifecycle);
        let grace = self.schedule.expiry_grace;
        self.runner
            .run(EXPIRY_JOB, self.jobs.expiry_min_interval_hours, || async move {
                let expired = lifecycle.expire_overdue(Utc::now(), grace).await?;
                Ok::<_, anyhow::Error>(ExpiryReport { expired })
            })
            .await
    }

    pub async fn run_habit_reminders(&self) -> Result<JobOutcome<ReminderReport>, JobError> {
        let streaks = Arc::clone(&self.streaks);
        self.runner
            .run(REMINDER_JOB, self.jobs.reminder_min_interval_hours, || async move {
                Ok::<_, anyhow::Error>(streaks.send_reminders().await?)
            })
            .await
    }

    /// Record and recent runs for a job, `None` if it never ran.
    pub async fn job_status(&self, name: &str, limit: u32) -> Result<Option<JobStatusView>, DatabaseError> {
        let Some(record) = self.store.get_job_record(name).await? else {
            return Ok(None);
        };
        let runs = self.store.list_job_runs(name, limit).await?;
        Ok(Some(JobStatusView { record, runs }))
    }
}
