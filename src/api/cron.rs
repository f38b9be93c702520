//! Trigger endpoints called by the external timer service.

use std::time::Instant;

use axum::extract::{Path, Query, State};
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::Json;
use serde::{Deserialize, Serialize};
use serde_json::{Value, json};
use tracing::error;
use uuid::Uuid;

use super::{AppState, error_response};
use crate::error::JobError;
use crate::jobs::JobOutcome;
use crate::jobs::service::{EXPIRY_JOB, JOB_NAMES, REMINDER_JOB, SCHEDULE_JOB, STREAK_JOB};

/// Optional overrides for the schedule trigger.
#[derive(Debug, Default, Deserialize)]
pub struct ScheduleParams {
    pub days: Option<u32>,
    #[serde(default)]
    pub force: bool,
}

#[derive(Debug, Deserialize)]
pub struct StatusParams {
    pub limit: Option<u32>,
}

/// Map a guarded run to its HTTP response. `body` shapes the completed case.
fn job_response<T, F>(job: &str, outcome: Result<JobOutcome<T>, JobError>, body: F) -> Response
where
    F: FnOnce(Uuid, T) -> Value,
{
    match outcome {
        Ok(JobOutcome::Completed { run_id, result }) => {
            (StatusCode::OK, Json(body(run_id, result))).into_response()
        }
        Ok(JobOutcome::Skipped { reason, last_run_at }) => (
            StatusCode::OK,
            Json(json!({
                "success": true,
                "skipped": true,
                "reason": reason.as_str(),
                "lastRunAt": last_run_at,
            })),
        )
            .into_response(),
        Err(e) => {
            error!(job = %job, error = %e, "Trigger failed");
            error_response(StatusCode::INTERNAL_SERVER_ERROR, e.to_string())
        }
    }
}

fn with_result<T: Serialize>(run_id: Uuid, result: T) -> Value {
    json!({"success": true, "jobId": run_id, "result": result})
}

/// GET|POST /api/cron/schedule
pub async fn trigger_schedule(
    State(state): State<AppState>,
    Query(params): Query<ScheduleParams>,
) -> impl IntoResponse {
    let outcome = state.jobs.run_schedule_generation(params.days, params.force).await;
    job_response(SCHEDULE_JOB, outcome, with_result)
}

/// GET|POST /api/cron/streaks
pub async fn trigger_streaks(State(state): State<AppState>) -> impl IntoResponse {
    let started = Instant::now();
    let outcome = state.jobs.run_streak_pass().await;
    job_response(STREAK_JOB, outcome, |run_id, report| {
        json!({
            "success": true,
            "jobId": run_id,
            "processed": report.processed,
            "updated": report.updated,
            "brokenStreaks": report.broken_streaks,
            "placeholdersCreated": report.placeholders_created,
            "errors": report.errors,
            "duration": started.elapsed().as_millis() as u64,
        })
    })
}

/// GET|POST /api/cron/expire
pub async fn trigger_expiry(State(state): State<AppState>) -> impl IntoResponse {
    let outcome = state.jobs.run_task_expiry().await;
    job_response(EXPIRY_JOB, outcome, with_result)
}

/// GET|POST /api/cron/reminders
pub async fn trigger_reminders(State(state): State<AppState>) -> impl IntoResponse {
    let outcome = state.jobs.run_habit_reminders().await;
    job_response(REMINDER_JOB, outcome, with_result)
}

/// GET /api/jobs/{name}
///
/// The job record plus its most recent runs, newest first.
pub async fn job_status(
    State(state): State<AppState>,
    Path(name): Path<String>,
    Query(params): Query<StatusParams>,
) -> impl IntoResponse {
    if !JOB_NAMES.contains(&name.as_str()) {
        return error_response(StatusCode::NOT_FOUND, format!("Unknown job {name}"));
    }
    let limit = params.limit.unwrap_or(20).clamp(1, 100);
    match state.jobs.job_status(&name, limit).await {
        Ok(Some(view)) => (StatusCode::OK, Json(json!(view))).into_response(),
        Ok(None) => error_response(StatusCode::NOT_FOUND, format!("Job {name} has never run")),
        Err(e) => {
            error!(job = %name, error = %e, "Job status lookup failed");
            error_response(StatusCode::INTERNAL_SERVER_ERROR, e.to_string())
        }
    }
}
