pub mod notes;

use axum::{
    http::StatusCode,
    response::{IntoResponse, Response},
    routing::get,
    Json, Router,
};
use std::sync::Arc;

/// Shared state of the demo application.
pub struct AppState {
    /// Cloneable async Redis connection (auto-reconnects).
    pub redis: redis::aio::ConnectionManager,
}

/// The application being profiled.
pub fn router(state: Arc<AppState>) -> Router {
    Router::new()
        .route("/notes", axum::routing::post(notes::create_note))
        .route("/notes/latest", get(notes::latest_note))
        .route("/notes/:id", get(notes::get_note))
        .with_state(state)
}

// ─── Error type ──────────────────────────────────────────────────

#[derive(Debug)]
pub enum DemoError {
    NotFound(String),
    Redis(String),
}

impl From<redis::RedisError> for DemoError {
    fn from(err: redis::RedisError) -> Self {
        Self::Redis(err.to_string())
    }
}

impl IntoResponse for DemoError {
    fn into_response(self) -> Response {
        let (status, message) = match self {
            Self::NotFound(msg) => (StatusCode::NOT_FOUND, msg),
            Self::Redis(msg) => (StatusCode::INTERNAL_SERVER_ERROR, format!("Redis: {msg}")),
        };

        let body = serde_json::json!({
            "error":  message,
            "status": status.as_u16(),
        });

        (status, Json(body)).into_response()
    }
}
