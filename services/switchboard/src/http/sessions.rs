//! Session CRUD endpoints.  All state changes go through the session cache,
//! which owns the persist-then-cache discipline.

use axum::extract::{Path, State};
use axum::http::{HeaderMap, StatusCode};
use axum::response::{IntoResponse, Response};
use axum::Json;
use serde::Deserialize;
use tracing::error;

use crate::http::response::error_response;
use crate::session_cache::SessionError;
use crate::state::AppState;

#[derive(Debug, Deserialize)]
pub struct CreateSessionBody {
    name: String,
    #[serde(default)]
    students: Vec<String>,
}

fn creator_from_headers(headers: &HeaderMap) -> Option<String> {
    headers
        .get("x-user-id")
        .and_then(|v| v.to_str().ok())
        .map(str::trim)
        .filter(|v| !v.is_empty())
        .map(ToOwned::to_owned)
}

pub async fn create_session(
    State(state): State<AppState>,
    headers: HeaderMap,
    Json(body): Json<CreateSessionBody>,
) -> Response {
    let Some(creator) = creator_from_headers(&headers) else {
        return error_response(
            StatusCode::BAD_REQUEST,
            "BAD_REQUEST",
            "X-User-ID header is required",
        );
    };
    match state.cache.create(&body.name, &creator, &body.students).await {
        Ok(record) => (StatusCode::CREATED, Json(record)).into_response(),
        Err(
            e @ (SessionError::InvalidName
            | SessionError::InvalidCreator
            | SessionError::EmptyEnrollment
            | SessionError::InvalidStudentId(_)),
        ) => error_response(StatusCode::BAD_REQUEST, "BAD_REQUEST", &e.to_string()),
        Err(e) => {
            error!(error = %e, "session create failed");
            error_response(
                StatusCode::INTERNAL_SERVER_ERROR,
                "INTERNAL_ERROR",
                "failed to create session",
            )
        }
    }
}

pub async fn list_sessions(State(state): State<AppState>) -> Response {
    let sessions = state.cache.list().await;
    (
        StatusCode::OK,
        Json(serde_json::json!({ "sessions": sessions })),
    )
        .into_response()
}

pub async fn get_session(
    State(state): State<AppState>,
    Path(id): Path<String>,
) -> Response {
    match state.cache.get(&id).await {
        Ok(Some(record)) => (StatusCode::OK, Json(record)).into_response(),
        Ok(None) => error_response(StatusCode::NOT_FOUND, "NOT_FOUND", "session not found"),
        Err(e) => {
            error!(session_id = %id, error = %e, "session lookup failed");
            error_response(
                StatusCode::INTERNAL_SERVER_ERROR,
                "INTERNAL_ERROR",
                "failed to load session",
            )
        }
    }
}

pub async fn terminate_session(
    State(state): State<AppState>,
    Path(id): Path<String>,
) -> Response {
    match state.cache.terminate(&id).await {
        Ok(record) => (StatusCode::OK, Json(record)).into_response(),
        Err(SessionError::NotFound(_)) => {
            error_response(StatusCode::NOT_FOUND, "NOT_FOUND", "session not found")
        }
        Err(e @ SessionError::AlreadyEnded(_)) => {
            error_response(StatusCode::BAD_REQUEST, "ALREADY_ENDED", &e.to_string())
        }
        Err(e) => {
            error!(session_id = %id, error = %e, "session terminate failed");
            error_response(
                StatusCode::INTERNAL_SERVER_ERROR,
                "INTERNAL_ERROR",
                "failed to terminate session",
            )
        }
    }
}
