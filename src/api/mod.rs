//! HTTP surface: health, bearer-guarded job triggers and task actions.

pub mod auth;
pub mod cron;
pub mod tasks;

use std::sync::Arc;

use axum::http::StatusCode;
use axum::middleware;
use axum::response::{IntoResponse, Response};
use axum::routing::{get, post};
use axum::{Json, Router};
use secrecy::SecretString;
use tower_http::trace::TraceLayer;

use crate::jobs::JobService;
use crate::schedule::{Scheduler, TaskLifecycle};
use crate::streaks::HabitTracker;

/// Shared state for every route.
#[derive(Clone)]
pub struct AppState {
    pub jobs: Arc<JobService>,
    pub scheduler: Arc<Scheduler>,
    pub lifecycle: Arc<TaskLifecycle>,
    pub tracker: Arc<HabitTracker>,
    pub cron_secret: SecretString,
}

pub(crate) fn error_response(status: StatusCode, message: impl Into<String>) -> Response {
    (
        status,
        Json(serde_json::json!({"success": false, "error": message.into()})),
    )
        .into_response()
}

async fn health() -> impl IntoResponse {
    Json(serde_json::json!({
        "status": "ok",
        "service": "practice-scheduler",
    }))
}

/// Build the router. Everything except `/health` requires the bearer token.
pub fn router(state: AppState) -> Router {
    let protected = Router::new()
        .route(
            "/api/cron/schedule",
            get(cron::trigger_schedule).post(cron::trigger_schedule),
        )
        .route(
            "/api/cron/streaks",
            get(cron::trigger_streaks).post(cron::trigger_streaks),
        )
        .route(
            "/api/cron/expire",
            get(cron::trigger_expiry).post(cron::trigger_expiry),
        )
        .route(
            "/api/cron/reminders",
            get(cron::trigger_reminders).post(cron::trigger_reminders),
        )
        .route("/api/jobs/{name}", get(cron::job_status))
        .route("/api/users/{id}/schedule", post(tasks::generate_user_schedule))
        .route("/api/tasks/{id}/start", post(tasks::start_task))
        .route("/api/tasks/{id}/complete", post(tasks::complete_task))
        .route("/api/habits/{id}/completion", post(tasks::set_habit_completion))
        .route_layer(middleware::from_fn_with_state(
            state.clone(),
            auth::require_bearer,
        ));

    Router::new()
        .route("/health", get(health))
        .merge(protected)
        .layer(TraceLayer::new_for_http())
        .with_state(state)
}
