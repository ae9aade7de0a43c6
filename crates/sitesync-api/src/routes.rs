use std::sync::Arc;

use axum::extract::{Query, State};
use axum::http::HeaderMap;
use axum::routing::{get, post};
use axum::{Json, Router};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sitesync_core::authority::AuthorityStore;
use sitesync_core::models::AppVersion;
use sitesync_core::sync::protocol::{BatchRequest, BatchResponse, RemoteChange};
use sitesync_core::sync::CLIENT_ID_HEADER;
use tower_http::cors::{Any, CorsLayer};
use tower_http::trace::TraceLayer;

use crate::config::AppConfig;
use crate::error::AppError;
use crate::rate_limit::{
    client_fingerprint, EndpointRateLimiter, RateLimitMetricsSnapshot, SyncEndpoint,
};

const ANONYMOUS_CLIENT: &str = "anonymous";

#[derive(Clone)]
pub struct AppState {
    pub config: Arc<AppConfig>,
    authority: AuthorityStore,
    endpoint_rate_limiter: Arc<EndpointRateLimiter>,
}

impl AppState {
    pub fn new(config: Arc<AppConfig>, authority: AuthorityStore) -> Self {
        Self {
            endpoint_rate_limiter: Arc::new(EndpointRateLimiter::from_config(config.as_ref())),
            authority,
            config,
        }
    }
}

pub fn app_router(state: AppState) -> Router {
    Router::new()
        .route("/healthz", get(healthz))
        .route("/version", get(version))
        .route("/sync/batch", post(sync_batch))
        .route("/sync/changes", get(sync_changes))
        .layer(TraceLayer::new_for_http())
        .layer(
            CorsLayer::new()
                .allow_origin(Any)
                .allow_headers(Any)
                .allow_methods(Any),
        )
        .with_state(state)
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
struct HealthResponse {
    status: &'static str,
    timestamp: i64,
    rate_limit: RateLimitMetricsSnapshot,
}

async fn healthz(State(state): State<AppState>) -> Json<HealthResponse> {
    Json(HealthResponse {
        status: "ok",
        timestamp: Utc::now().timestamp(),
        rate_limit: state.endpoint_rate_limiter.metrics_snapshot(),
    })
}

async fn version(State(state): State<AppState>) -> Json<AppVersion> {
    Json(state.authority.version())
}

async fn sync_batch(
    State(state): State<AppState>,
    headers: HeaderMap,
    Json(batch): Json<BatchRequest>,
) -> Result<Json<BatchResponse>, AppError> {
    let client_id = header_client_id(&headers).unwrap_or(batch.client_id.as_str());
    if client_id != batch.client_id {
        return Err(AppError::bad_request(format!(
            "{CLIENT_ID_HEADER} header does not match batch clientId"
        )));
    }
    if batch.client_id.trim().is_empty() {
        return Err(AppError::bad_request("clientId must not be empty"));
    }
    if batch.operations.len() > state.config.max_batch_operations {
        return Err(AppError::PayloadTooLarge(format!(
            "batch carries {} operations; the limit is {}",
            batch.operations.len(),
            state.config.max_batch_operations
        )));
    }

    state
        .endpoint_rate_limiter
        .check(SyncEndpoint::Batch, &batch.client_id)
        .await?;

    let response = state.authority.apply_batch(&batch).await?;
    tracing::info!(
        endpoint = "sync_batch",
        client = client_fingerprint(&batch.client_id),
        operations = batch.operations.len(),
        successful = response.successful.len(),
        conflicts = response.conflicts.len(),
        errors = response.errors.len(),
        retry_count = batch.retry_count,
        "Applied sync batch"
    );
    Ok(Json(response))
}

#[derive(Debug, Deserialize)]
struct ChangesQuery {
    since: Option<String>,
}

async fn sync_changes(
    State(state): State<AppState>,
    headers: HeaderMap,
    Query(query): Query<ChangesQuery>,
) -> Result<Json<Vec<RemoteChange>>, AppError> {
    let client_id = header_client_id(&headers).unwrap_or(ANONYMOUS_CLIENT);
    state
        .endpoint_rate_limiter
        .check(SyncEndpoint::Changes, client_id)
        .await?;

    let since = query.since.as_deref().map(parse_since).transpose()?;
    let changes = state.authority.changes_since(since).await?;
    tracing::debug!(
        endpoint = "sync_changes",
        client = client_fingerprint(client_id),
        full = since.is_none(),
        count = changes.len(),
        "Served change feed"
    );
    Ok(Json(changes))
}

fn header_client_id(headers: &HeaderMap) -> Option<&str> {
    headers
        .get(CLIENT_ID_HEADER)
        .and_then(|value| value.to_str().ok())
        .map(str::trim)
        .filter(|value| !value.is_empty())
}

fn parse_since(raw: &str) -> Result<DateTime<Utc>, AppError> {
    DateTime::parse_from_rfc3339(raw.trim())
        .map(|parsed| parsed.with_timezone(&Utc))
        .map_err(|_| AppError::bad_request("since must be an ISO-8601 timestamp"))
}
