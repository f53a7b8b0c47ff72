//! Thin REST surface over the context pool.

use std::collections::BTreeSet;

use axum::extract::{Path, State};
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::routing::{get, post};
use axum::{Json, Router};
use serde::{Deserialize, Serialize};
use serde_json::json;
use uuid::Uuid;

use scraper_pool_common::{PoolError, ScrapeRequest};
use scraper_pool_core::ContextInfo;

use crate::state::AppState;

pub fn router(state: AppState) -> Router {
    Router::new()
        .route("/", get(root))
        .route("/healthz", get(healthz))
        .route("/metrics", get(metrics))
        .route("/scrape", post(scrape))
        .route("/contexts", post(create_context).get(list_contexts))
        .route("/contexts/{id}", get(get_context).delete(delete_context))
        .route("/contexts/{id}/tags", post(add_tags).delete(remove_tags))
        .route("/pool/status", get(pool_status))
        .route("/pool/restart", post(restart_browser))
        .with_state(state)
}

/// `PoolError` wrapper carrying the HTTP mapping of the error taxonomy.
pub struct ApiError(PoolError);

impl From<PoolError> for ApiError {
    fn from(err: PoolError) -> Self {
        Self(err)
    }
}

#[derive(Debug, Serialize)]
struct ErrorBody {
    error: &'static str,
    detail: String,
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let (status, kind) = match &self.0 {
            PoolError::PoolFull => (StatusCode::SERVICE_UNAVAILABLE, "pool_full"),
            PoolError::QueueTimeout(_) => (StatusCode::SERVICE_UNAVAILABLE, "queue_timeout"),
            PoolError::ScrapeTimeout(_) => (StatusCode::GATEWAY_TIMEOUT, "scrape_timeout"),
            PoolError::Driver(_) => (StatusCode::BAD_GATEWAY, "driver_error"),
            PoolError::TargetClosed(_) => (StatusCode::BAD_GATEWAY, "target_closed"),
            PoolError::BrowserRestarting => (StatusCode::SERVICE_UNAVAILABLE, "browser_restarting"),
            PoolError::BrowserUnavailable => {
                (StatusCode::SERVICE_UNAVAILABLE, "browser_unavailable")
            }
            PoolError::Shutdown => (StatusCode::SERVICE_UNAVAILABLE, "shutdown"),
            PoolError::ContextNotFound(_) => (StatusCode::NOT_FOUND, "context_not_found"),
            PoolError::ContextBusy => (StatusCode::CONFLICT, "context_busy"),
            PoolError::InvalidRequest(_) => (StatusCode::BAD_REQUEST, "invalid_request"),
        };

        let body = ErrorBody {
            error: kind,
            detail: self.0.to_string(),
        };
        (status, Json(body)).into_response()
    }
}

async fn root() -> impl IntoResponse {
    Json(json!({
        "service": "scraper-pool",
        "endpoints": ["/scrape", "/contexts", "/pool/status", "/healthz", "/metrics"],
    }))
}

async fn healthz(State(state): State<AppState>) -> impl IntoResponse {
    let status = state.pool.status().await;
    let healthy = !status.degraded;
    let code = if healthy {
        StatusCode::OK
    } else {
        StatusCode::SERVICE_UNAVAILABLE
    };
    (code, Json(json!({ "status": if healthy { "ok" } else { "degraded" } })))
}

async fn metrics(State(state): State<AppState>) -> impl IntoResponse {
    let status = state.pool.status().await;
    state.metrics.observe_pool(&status);
    state.metrics.encode().into_response()
}

async fn scrape(
    State(state): State<AppState>,
    Json(request): Json<ScrapeRequest>,
) -> Result<Json<scraper_pool_common::ScrapeResult>, ApiError> {
    state.metrics.requests_total.inc();

    match state.pool.scrape(request).await {
        Ok(result) => Ok(Json(result)),
        Err(e) => {
            state.metrics.requests_failed.inc();
            Err(e.into())
        }
    }
}

#[derive(Debug, Deserialize)]
struct CreateContextBody {
    #[serde(default)]
    proxy: Option<String>,
    #[serde(default)]
    persistent: bool,
    #[serde(default)]
    tags: BTreeSet<String>,
}

async fn create_context(
    State(state): State<AppState>,
    Json(body): Json<CreateContextBody>,
) -> Result<(StatusCode, Json<ContextInfo>), ApiError> {
    let info = state
        .pool
        .create_context(body.proxy, body.persistent, body.tags)
        .await?;
    Ok((StatusCode::CREATED, Json(info)))
}

#[derive(Debug, Serialize)]
struct ContextListBody {
    contexts: Vec<ContextInfo>,
    total: usize,
}

async fn list_contexts(State(state): State<AppState>) -> Json<ContextListBody> {
    let contexts = state.pool.list_contexts().await;
    let total = contexts.len();
    Json(ContextListBody { contexts, total })
}

async fn get_context(
    State(state): State<AppState>,
    Path(id): Path<Uuid>,
) -> Result<Json<ContextInfo>, ApiError> {
    state
        .pool
        .get_context(id)
        .await
        .map(Json)
        .ok_or_else(|| PoolError::ContextNotFound(id.to_string()).into())
}

async fn delete_context(
    State(state): State<AppState>,
    Path(id): Path<Uuid>,
) -> Result<Json<serde_json::Value>, ApiError> {
    let removed = state.pool.remove_context(id).await?;
    Ok(Json(json!({ "removed": removed })))
}

#[derive(Debug, Deserialize)]
struct TagsBody {
    tags: BTreeSet<String>,
}

async fn add_tags(
    State(state): State<AppState>,
    Path(id): Path<Uuid>,
    Json(body): Json<TagsBody>,
) -> Result<Json<ContextInfo>, ApiError> {
    Ok(Json(state.pool.add_tags(id, body.tags).await?))
}

async fn remove_tags(
    State(state): State<AppState>,
    Path(id): Path<Uuid>,
    Json(body): Json<TagsBody>,
) -> Result<Json<ContextInfo>, ApiError> {
    Ok(Json(state.pool.remove_tags(id, body.tags).await?))
}

async fn pool_status(State(state): State<AppState>) -> impl IntoResponse {
    Json(state.pool.status().await)
}

async fn restart_browser(State(state): State<AppState>) -> Result<Json<serde_json::Value>, ApiError> {
    state.pool.restart_browser().await?;
    let status = state.pool.status().await;
    Ok(Json(json!({ "restarted": true, "generation": status.generation })))
}
