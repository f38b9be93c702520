//! Idempotent job runner.
//!
//! Guards named jobs against running twice within a minimum interval and
//! against concurrent execution across processes. The guard is a single
//! conditional update in the store, so whichever caller wins the claim is
//! the only one to invoke the work.

use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::Serialize;
use tracing::{error, info};
use uuid::Uuid;

use crate::error::JobError;
use crate::jobs::model::JobStatus;
use crate::store::Database;

/// Why a run was not executed.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum SkipReason {
    /// Completed within the minimum interval.
    RanRecently,
    /// Another run holds the job and is not stale yet.
    AlreadyRunning,
}

impl SkipReason {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::RanRecently => "ran_recently",
            Self::AlreadyRunning => "already_running",
        }
    }
}

/// Result of [`JobRunner::run`].
#[derive(Debug, Clone, PartialEq)]
pub enum JobOutcome<T> {
    Completed { run_id: Uuid, result: T },
    Skipped {
        reason: SkipReason,
        last_run_at: Option<DateTime<Utc>>,
    },
}

impl<T> JobOutcome<T> {
    pub fn is_skipped(&self) -> bool {
        matches!(self, Self::Skipped { .. })
    }
}

/// Runs content-agnostic work under a named, persisted guard.
#[derive(Clone)]
pub struct JobRunner {
    store: Arc<dyn Database>,
    stale_threshold: chrono::Duration,
}

impl JobRunner {
    pub fn new(store: Arc<dyn Database>, stale_threshold: Duration) -> Self {
        Self {
            store,
            stale_threshold: chrono::Duration::from_std(stale_threshold)
                .unwrap_or(chrono::Duration::hours(1)),
        }
    }

    /// Run `work` unless the job completed less than `min_interval_hours`
    /// ago or is running elsewhere.
    ///
    /// On failure the record is marked `failed` and the error is returned.
    pub async fn run<T, F, Fut>(
        &self,
        name: &str,
        min_interval_hours: u32,
        work: F,
    ) -> Result<JobOutcome<T>, JobError>
    where
        T: Serialize,
        F: FnOnce() -> Fut,
        Fut: Future<Output = anyhow::Result<T>>,
    {
        self.store.ensure_job_record(name).await?;

        let now = Utc::now();
        let recent_cutoff = now - chrono::Duration::hours(min_interval_hours as i64);
        let stale_cutoff = now - self.stale_threshold;
        let run_id = Uuid::new_v4();

        let claimed = self
            .store
            .try_claim_job(name, run_id, now, recent_cutoff, stale_cutoff)
            .await?;

        if !claimed {
            let record = self.store.get_job_record(name).await?;
            let (reason, last_run_at) = match record {
                Some(r) if r.status == JobStatus::Running => (SkipReason::AlreadyRunning, r.last_run_at),
                Some(r) => (SkipReason::RanRecently, r.last_run_at),
                None => (SkipReason::AlreadyRunning, None),
            };
            info!(job = %name, reason = reason.as_str(), "Job skipped");
            return Ok(JobOutcome::Skipped { reason, last_run_at });
        }

        info!(job = %name, run_id = %run_id, "Job started");
        let started = std::time::Instant::now();

        match work().await {
            Ok(result) => {
                let value = serde_json::to_value(&result).map_err(|e| JobError::Serialization {
                    name: name.to_string(),
                    reason: e.to_string(),
                });
                let value = match value {
                    Ok(v) => v,
                    Err(e) => {
                        self.store
                            .finish_job(name, run_id, JobStatus::Failed, None, Some(&e.to_string()), Utc::now())
                            .await?;
                        return Err(e);
                    }
                };
                let owned = self
                    .store
                    .finish_job(name, run_id, JobStatus::Completed, Some(&value), None, Utc::now())
                    .await?;
                if !owned {
                    tracing::warn!(job = %name, run_id = %run_id, "Run was taken over before it finished");
                }
                info!(
                    job = %name,
                    run_id = %run_id,
                    elapsed_ms = started.elapsed().as_millis() as u64,
                    "Job completed"
                );
                Ok(JobOutcome::Completed { run_id, result })
            }
            Err(e) => {
                let reason = format!("{e:#}");
                error!(job = %name, run_id = %run_id, error = %reason, "Job failed");
                self.store
                    .finish_job(name, run_id, JobStatus::Failed, None, Some(&reason), Utc::now())
                    .await?;
                Err(JobError::Failed {
                    name: name.to_string(),
                    reason,
                })
            }
        }
    }
}
