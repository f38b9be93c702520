//! Interactive endpoints: per-user schedule generation, task actions and
//! the habit completion toggle.

use axum::extract::{Path, State};
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::Json;
use chrono::NaiveDate;
use serde::Deserialize;
use serde_json::json;
use tracing::error;
use uuid::Uuid;

use super::{AppState, error_response};
use crate::error::{ScheduleError, StreakError, TaskError};

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct GenerateRequest {
    pub start_date: NaiveDate,
    pub days: u32,
    #[serde(default)]
    pub force: bool,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CompletionRequest {
    /// Defaults to the habit owner's local today.
    pub date: Option<NaiveDate>,
    #[serde(default = "default_completed")]
    pub completed: bool,
    pub notes: Option<String>,
}

fn default_completed() -> bool {
    true
}

fn parse_id(raw: &str, what: &str) -> Result<Uuid, Response> {
    Uuid::parse_str(raw)
        .map_err(|_| error_response(StatusCode::BAD_REQUEST, format!("Invalid {what} ID")))
}

fn schedule_error_response(e: ScheduleError) -> Response {
    let status = match &e {
        ScheduleError::UserNotFound { .. } => StatusCode::NOT_FOUND,
        ScheduleError::InvalidRange(_) => StatusCode::BAD_REQUEST,
        ScheduleError::MissingAssignment { .. } => StatusCode::UNPROCESSABLE_ENTITY,
        e if e.is_configuration() => StatusCode::UNPROCESSABLE_ENTITY,
        _ => {
            error!(error = %e, "Schedule generation failed");
            StatusCode::INTERNAL_SERVER_ERROR
        }
    };
    error_response(status, e.to_string())
}

fn task_error_response(e: TaskError) -> Response {
    let status = match &e {
        TaskError::NotFound { .. } => StatusCode::NOT_FOUND,
        TaskError::InvalidTransition { .. } | TaskError::Conflict { .. } => StatusCode::CONFLICT,
        TaskError::Database(_) => {
            error!(error = %e, "Task action failed");
            StatusCode::INTERNAL_SERVER_ERROR
        }
    };
    error_response(status, e.to_string())
}

fn streak_error_response(e: StreakError) -> Response {
    let status = match &e {
        StreakError::HabitNotFound { .. } => StatusCode::NOT_FOUND,
        StreakError::Inactive { .. } => StatusCode::CONFLICT,
        StreakError::Database(_) => {
            error!(error = %e, "Habit completion failed");
            StatusCode::INTERNAL_SERVER_ERROR
        }
    };
    error_response(status, e.to_string())
}

/// POST /api/users/{id}/schedule
pub async fn generate_user_schedule(
    State(state): State<AppState>,
    Path(user_id): Path<String>,
    Json(body): Json<GenerateRequest>,
) -> Response {
    match state
        .scheduler
        .generate_schedule(&user_id, body.start_date, body.days, body.force)
        .await
    {
        Ok(report) => (StatusCode::OK, Json(json!({"success": true, "result": report}))).into_response(),
        Err(e) => schedule_error_response(e),
    }
}

/// POST /api/tasks/{id}/start
pub async fn start_task(State(state): State<AppState>, Path(id): Path<String>) -> Response {
    let id = match parse_id(&id, "task") {
        Ok(id) => id,
        Err(resp) => return resp,
    };
    match state.lifecycle.start_task(id).await {
        Ok(task) => (StatusCode::OK, Json(json!(task))).into_response(),
        Err(e) => task_error_response(e),
    }
}

/// POST /api/tasks/{id}/complete
pub async fn complete_task(State(state): State<AppState>, Path(id): Path<String>) -> Response {
    let id = match parse_id(&id, "task") {
        Ok(id) => id,
        Err(resp) => return resp,
    };
    match state.lifecycle.complete_task(id).await {
        Ok(task) => (StatusCode::OK, Json(json!(task))).into_response(),
        Err(e) => task_error_response(e),
    }
}

/// POST /api/habits/{id}/completion
pub async fn set_habit_completion(
    State(state): State<AppState>,
    Path(id): Path<String>,
    Json(body): Json<CompletionRequest>,
) -> Response {
    let id = match parse_id(&id, "habit") {
        Ok(id) => id,
        Err(resp) => return resp,
    };
    let date = match body.date {
        Some(date) => date,
        None => match state.tracker.habit_today(id).await {
            Ok(date) => date,
            Err(e) => return streak_error_response(e),
        },
    };
    match state
        .tracker
        .set_completion(id, date, body.completed, body.notes.as_deref())
        .await
    {
        Ok(update) => (StatusCode::OK, Json(json!(update))).into_response(),
        Err(e) => streak_error_response(e),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn schedule_errors_map_to_statuses() {
        let resp = schedule_error_response(ScheduleError::UserNotFound { user_id: "u".into() });
        assert_eq!(resp.status(), StatusCode::NOT_FOUND);
        let resp = schedule_error_response(ScheduleError::NoTemplateForArchetype { house: "X".into() });
        assert_eq!(resp.status(), StatusCode::UNPROCESSABLE_ENTITY);
        let resp = schedule_error_response(ScheduleError::InvalidRange("0".into()));
        assert_eq!(resp.status(), StatusCode::BAD_REQUEST);
    }

    #[test]
    fn task_errors_map_to_statuses() {
        let id = Uuid::new_v4();
        assert_eq!(task_error_response(TaskError::NotFound { id }).status(), StatusCode::NOT_FOUND);
        assert_eq!(task_error_response(TaskError::Conflict { id }).status(), StatusCode::CONFLICT);
    }

    #[test]
    fn completion_defaults_to_done() {
        let body: CompletionRequest = serde_json::from_str("{}").unwrap();
        assert!(body.completed);
        assert!(body.date.is_none());
    }
}
