use std::sync::Arc;

use axum::{
    extract::{Query, State},
    http::{header, StatusCode},
    middleware as axum_mw,
    response::{IntoResponse, Response},
    routing::get,
    Json, Router,
};
use serde::Deserialize;
use tower_http::services::ServeDir;

use crate::config::ROUTE_PREFIX;
use crate::cpuprofile::{self, ChromeProfile};
use crate::error::QueryError;
use crate::id::RequestId;
use crate::interceptor::{profile_middleware, Profiler};
use crate::query::{self, QueryEntry};

/// The profiler's own routes, all under `/mini_profiler`:
///
///   GET  /request?request_ids=a,b   records for a chain of ids
///   GET  /cpuprofile?request_id=a   sampled profile as a Chrome `.cpuprofile`
///   GET  /static/*                  popup assets
pub fn routes(profiler: Arc<Profiler>) -> Router {
    let assets = ServeDir::new(&profiler.config().assets_dir);
    Router::new()
        .route(&format!("{ROUTE_PREFIX}/request"), get(request_stats))
        .route(&format!("{ROUTE_PREFIX}/cpuprofile"), get(cpuprofile_stats))
        .nest_service(&format!("{ROUTE_PREFIX}/static"), assets)
        .with_state(profiler)
}

/// Mount the profiler routes on `app` and profile everything else.
pub fn install(app: Router, profiler: Arc<Profiler>) -> Router {
    app.merge(routes(profiler.clone()))
        .layer(axum_mw::from_fn_with_state(profiler, profile_middleware))
}

// ─── GET /mini_profiler/request ──────────────────────────────────

#[derive(Debug, Deserialize)]
pub struct RequestStatsParams {
    #[serde(default)]
    pub request_ids: String,
}

pub async fn request_stats(
    State(profiler): State<Arc<Profiler>>,
    Query(params): Query<RequestStatsParams>,
) -> Result<Json<Vec<QueryEntry>>, ApiError> {
    let tokens = query::parse_id_list(&params.request_ids);
    let entries = query::query_list(
        profiler.store().as_ref(),
        &tokens,
        profiler.config().query_timeout(),
    )
    .await?;
    Ok(Json(entries))
}

// ─── GET /mini_profiler/cpuprofile ───────────────────────────────

#[derive(Debug, Deserialize)]
pub struct CpuProfileParams {
    #[serde(default)]
    pub request_id: String,
}

pub async fn cpuprofile_stats(
    State(profiler): State<Arc<Profiler>>,
    Query(params): Query<CpuProfileParams>,
) -> Result<Response, ApiError> {
    let id = RequestId::parse(&params.request_id)
        .ok_or_else(|| ApiError::BadRequest("invalid request_id".into()))?;
    let entries = query::query(
        profiler.store().as_ref(),
        std::slice::from_ref(&id),
        profiler.config().query_timeout(),
    )
    .await?;

    let record = entries
        .first()
        .and_then(QueryEntry::profile)
        .ok_or_else(|| ApiError::NotFound("Profiler stats no longer exist for this request.".into()))?;
    let profile = ChromeProfile::from_record(record)
        .ok_or_else(|| ApiError::NotFound("No .cpuprofile available for this profile".into()))?;
    let body = serde_json::to_vec(&profile).map_err(|e| ApiError::Internal(e.to_string()))?;

    let disposition = format!("attachment; filename=\"{}\"", cpuprofile::file_name(record));
    Ok((
        [
            // application/json makes some browsers append a .json extension
            (header::CONTENT_TYPE, "application/octet-stream; charset=utf-8".to_owned()),
            (header::CONTENT_DISPOSITION, disposition),
        ],
        body,
    )
        .into_response())
}

// ─── Unified error type ──────────────────────────────────────────

#[derive(Debug)]
pub enum ApiError {
    NotFound(String),
    BadRequest(String),
    Unavailable(String),
    Timeout(String),
    Internal(String),
}

impl From<QueryError> for ApiError {
    fn from(err: QueryError) -> Self {
        tracing::warn!(?err, "profile query failed");
        match err {
            QueryError::Timeout(_) => Self::Timeout(err.to_string()),
            _ => Self::Unavailable(err.to_string()),
        }
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let (status, message) = match self {
            Self::NotFound(msg) => (StatusCode::NOT_FOUND, msg),
            Self::BadRequest(msg) => (StatusCode::BAD_REQUEST, msg),
            Self::Unavailable(msg) => (StatusCode::SERVICE_UNAVAILABLE, msg),
            Self::Timeout(msg) => (StatusCode::GATEWAY_TIMEOUT, msg),
            Self::Internal(msg) => (StatusCode::INTERNAL_SERVER_ERROR, msg),
        };

        let body = serde_json::json!({
            "error":  message,
            "status": status.as_u16(),
        });

        (status, Json(body)).into_response()
    }
}
