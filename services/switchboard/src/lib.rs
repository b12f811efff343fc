pub mod config;
pub mod http;
pub mod hub;
pub mod index;
pub mod rate_limit;
pub mod replay;
pub mod router;
pub mod session_cache;
pub mod socket;
pub mod state;
pub mod store;
pub mod ws;

pub use state::AppState;

use axum::routing::get;
use axum::Router;
use tower_http::timeout::{RequestBodyTimeoutLayer, TimeoutLayer};
use tower_http::trace::TraceLayer;

use crate::config::HttpConfig;

pub fn build_router(state: AppState, http_config: &HttpConfig) -> Router {
    // Request timeouts apply to the admin surface only; the WebSocket route
    // is long-lived and carries its own read deadline.
    let admin = Router::new()
        .route(
            "/api/sessions",
            get(http::sessions::list_sessions).post(http::sessions::create_session),
        )
        .route(
            "/api/sessions/{id}",
            get(http::sessions::get_session).delete(http::sessions::terminate_session),
        )
        .route("/health", get(http::health::health))
        .layer(TimeoutLayer::new(http_config.write_timeout))
        .layer(RequestBodyTimeoutLayer::new(http_config.read_timeout));

    Router::new()
        .route("/ws", get(ws::ws_handler))
        .merge(admin)
        .layer(TraceLayer::new_for_http())
        .with_state(state)
}
