use axum::extract::State;
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::Json;
use tracing::warn;

use crate::state::AppState;

/// Store reachability plus live counters.  503 when the store is down.
pub async fn health(State(state): State<AppState>) -> Response {
    if let Err(e) = state.store.ping().await {
        warn!(error = %e, "health probe failed");
        return (
            StatusCode::SERVICE_UNAVAILABLE,
            Json(serde_json::json!({ "status": "unavailable" })),
        )
            .into_response();
    }
    let stored_messages = state.store.count_messages().await.unwrap_or(-1);
    (
        StatusCode::OK,
        Json(serde_json::json!({
            "status": "ok",
            "active_sessions": state.cache.active_count().await,
            "connections": state.index.connection_count().await,
            "stored_messages": stored_messages,
        })),
    )
        .into_response()
}
