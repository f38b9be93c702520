//! Bearer-token check for the trigger and task routes.

use axum::extract::{Request, State};
use axum::http::{HeaderMap, StatusCode, header};
use axum::middleware::Next;
use axum::response::{IntoResponse, Response};
use axum::Json;
use secrecy::ExposeSecret;
use tracing::warn;

use super::AppState;

fn ct_eq(a: &[u8], b: &[u8]) -> bool {
    if a.len() != b.len() {
        return false;
    }
    a.iter().zip(b).fold(0u8, |diff, (x, y)| diff | (x ^ y)) == 0
}

fn presented_token(headers: &HeaderMap) -> Option<&str> {
    headers
        .get(header::AUTHORIZATION)
        .and_then(|h| h.to_str().ok())
        .and_then(|v| v.strip_prefix("Bearer "))
        .map(str::trim)
}

/// Reject requests whose `Authorization: Bearer` token differs from the
/// configured cron secret.
pub async fn require_bearer(State(state): State<AppState>, req: Request, next: Next) -> Response {
    let authorized = presented_token(req.headers())
        .map(|token| ct_eq(token.as_bytes(), state.cron_secret.expose_secret().as_bytes()))
        .unwrap_or(false);

    if !authorized {
        warn!(path = %req.uri().path(), "Rejected unauthorized request");
        return (
            StatusCode::UNAUTHORIZED,
            Json(serde_json::json!({"success": false, "error": "Unauthorized"})),
        )
            .into_response();
    }
    next.run(req).await
}
