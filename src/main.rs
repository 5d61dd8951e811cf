mod access;
mod audit;
mod cache;
mod config;
mod directory;
mod error;
mod http;
mod idempotency;
mod jobs;
mod media;
mod metrics;
mod models;
mod pipeline;
mod retry;
mod security;
mod service;
mod status;
mod storage;
mod store;
mod supabase;
mod sweep;
#[cfg(test)]
mod test_support;
mod validation;
mod views;

use access::OwnershipPolicy;
use audit::{Alerting, LogAlerting, TracingAuditLog, WebhookAlerting};
use axum::{
    Json, Router,
    body::Bytes,
    extract::{DefaultBodyLimit, Extension, Path, Query, State},
    http::{HeaderMap, StatusCode},
    middleware,
    response::{IntoResponse, Response},
    routing::{get, post, put},
};
use cache::{ListingCache, MemoryCache, RedisCache};
use config::ServiceConfig;
use directory::{OwnerDirectory, StaticOwnerDirectory};
use error::{ErrorKind, LifecycleError};
use jobs::{JobInfo, TaskQueue};
use metrics_exporter_prometheus::{PrometheusBuilder, PrometheusHandle};
use models::{
    Actor, ApiError, CreateListingRequest, Listing, ListingPage, ListingStatus, PageRequest,
    PublicListing, SortOrder, TemporaryUpload, UpdateListingRequest,
};
use once_cell::sync::Lazy;
use pipeline::FinalizeReport;
use security::{AuthState, optional_api_auth, require_api_auth};
use serde::Deserialize;
use serde_json::json;
use service::{Collaborators, CreateOutcome, ListingService, MediaUrls, NewUpload};
use std::{net::SocketAddr, sync::Arc, time::Instant};
use storage::{HttpObjectStore, MemoryObjectStore, ObjectStore};
use store::Database;
use supabase::SupabaseClient;
use sweep::{ORPHAN_JOB, RETRY_JOB, Sweeper};
use tower::ServiceBuilder;
use tower_http::{
    cors::{Any, CorsLayer},
    trace::TraceLayer,
};
use tracing::{error, info, warn};
use tracing_subscriber::{EnvFilter, fmt};

static STARTED: Lazy<Instant> = Lazy::new(Instant::now);

#[tokio::main]
async fn main() {
    if let Err(err) = run().await {
        error!(target = "listings.api", "server crashed: {err:?}");
    }
}

async fn run() -> eyre::Result<()> {
    dotenvy::dotenv().ok();
    init_tracing();
    Lazy::force(&STARTED);

    let config = ServiceConfig::from_env()?;
    let db = Database::new();
    let parts = collaborators(&config)?;
    let storage = parts.storage.clone();

    let (queue, receiver) = TaskQueue::channel(config.queue_capacity);
    let service = ListingService::new(db.clone(), parts, &config.policies, queue.clone());
    receiver.spawn(Arc::new(service.clone()), config.worker_concurrency);
    service.views().spawn_flusher(config.view_flush_interval);
    Sweeper::new(
        db,
        storage,
        queue.clone(),
        service.retry_executor().clone(),
        config.policies.uploads.clone(),
    )
    .spawn(config.sweep_interval);

    let prometheus_handle = PrometheusBuilder::new().install_recorder()?;
    let auth_state = AuthState::from_env();
    let state = AppState {
        service,
        queue,
        prometheus_handle,
    };

    let cors = CorsLayer::new()
        .allow_headers(Any)
        .allow_methods(Any)
        .allow_origin(Any);

    let protected = Router::new()
        .route("/listings", post(create_listing))
        .route(
            "/listings/{id}",
            put(update_listing).delete(delete_listing),
        )
        .route("/listings/{id}/status", put(update_status))
        .route("/listings/{id}/visibility", put(toggle_visibility))
        .route("/listings/{id}/media", post(upload_media))
        .route("/listings/{id}/media/finalize", post(finalize_media))
        .route(
            "/listings/{id}/images/{index}",
            put(replace_image).delete(delete_image),
        )
        .route("/listings/{id}/video", axum::routing::delete(delete_video))
        .route("/listings/{id}/banner", put(set_banner))
        .route("/uploads", post(register_upload))
        .route("/jobs/{id}", get(get_job_status))
        .route_layer(middleware::from_fn_with_state(
            auth_state.clone(),
            require_api_auth,
        ));

    let public = Router::new()
        .route("/public/listings", get(list_public))
        .route("/public/listings/{id}", get(get_public_listing))
        .route_layer(middleware::from_fn_with_state(auth_state, optional_api_auth));

    let app = Router::new()
        .route("/health", get(health))
        .route("/metrics", get(metrics_endpoint))
        .merge(protected)
        .merge(public)
        .with_state(state)
        .layer(
            ServiceBuilder::new()
                .layer(TraceLayer::new_for_http())
                .layer(cors)
                .layer(DefaultBodyLimit::max(body_limit_from_env())),
        );

    let addr: SocketAddr = ([0, 0, 0, 0], config.port).into();
    info!(target = "listings.api", "listening on {addr}");

    let listener = tokio::net::TcpListener::bind(addr).await?;
    axum::serve(listener, app.into_make_service()).await?;
    Ok(())
}

/// Picks real backends when configured, in-memory stand-ins otherwise.
fn collaborators(config: &ServiceConfig) -> eyre::Result<Collaborators> {
    let storage: Arc<dyn ObjectStore> = match &config.object_store_url {
        Some(url) => Arc::new(HttpObjectStore::new(url, config.object_store_token.clone())),
        None => {
            warn!(target = "listings.api", "OBJECT_STORE_URL not set; media kept in memory");
            Arc::new(MemoryObjectStore::new())
        }
    };
    let directory: Arc<dyn OwnerDirectory> = match SupabaseClient::from_env() {
        Some(client) => Arc::new(client),
        None => Arc::new(StaticOwnerDirectory::new(config.public_owner_ids.clone())),
    };
    let cache: Arc<dyn ListingCache> = match &config.redis_url {
        Some(url) => Arc::new(RedisCache::new(redis::Client::open(url.as_str())?)),
        None => Arc::new(MemoryCache::new()),
    };
    let alerting: Arc<dyn Alerting> = match &config.alert_webhook_url {
        Some(url) => Arc::new(WebhookAlerting::new(url.clone())),
        None => Arc::new(LogAlerting),
    };
    Ok(Collaborators {
        storage,
        directory,
        cache,
        audit: Arc::new(TracingAuditLog),
        alerting,
        access: Arc::new(OwnershipPolicy),
    })
}

#[derive(Clone)]
struct AppState {
    service: ListingService,
    queue: TaskQueue,
    prometheus_handle: PrometheusHandle,
}

fn init_tracing() {
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new("info,tower_http=debug"));
    let _ = fmt().with_env_filter(filter).try_init();
}

fn body_limit_from_env() -> usize {
    std::env::var("REQUEST_MAX_BYTES")
        .ok()
        .and_then(|v| v.parse::<usize>().ok())
        .filter(|v| *v > 0)
        .unwrap_or(64 * 1024 * 1024)
}

/// Health and readiness check.
///
/// - Method: `GET`
/// - Path: `/health`
/// - Auth: none
///
/// Includes when each maintenance sweep last succeeded.
async fn health(State(state): State<AppState>) -> Json<serde_json::Value> {
    let db = state.service.database();
    let last_retry = db.last_successful(RETRY_JOB).await.and_then(|j| j.end_time);
    let last_cleanup = db.last_successful(ORPHAN_JOB).await.and_then(|j| j.end_time);
    Json(json!({
        "status": "ok",
        "service": "listing-lifecycle",
        "uptime_secs": STARTED.elapsed().as_secs(),
        "last_upload_retry": last_retry,
        "last_orphan_cleanup": last_cleanup,
    }))
}

async fn metrics_endpoint(State(state): State<AppState>, headers: HeaderMap) -> Response {
    if let Ok(secret) = std::env::var("METRICS_KEY") {
        let presented = headers
            .get("X-Metrics-Key")
            .and_then(|v| v.to_str().ok())
            .unwrap_or("");
        if presented != secret {
            return (StatusCode::UNAUTHORIZED, "unauthorized").into_response();
        }
    }
    (
        [("Content-Type", "text/plain; version=0.0.4")],
        state.prometheus_handle.render(),
    )
        .into_response()
}

// -------- Listings --------

/// Create a listing.
///
/// - Method: `POST`
/// - Path: `/listings`
/// - Headers: optional `Idempotency-Key`
/// - Body: `CreateListingRequest`
/// - Response: `201` with `CreateOutcome`, `200` when the key replays an earlier create
async fn create_listing(
    State(state): State<AppState>,
    Extension(actor): Extension<Actor>,
    headers: HeaderMap,
    Json(payload): Json<CreateListingRequest>,
) -> Result<(StatusCode, Json<CreateOutcome>), AppError> {
    crate::metrics::inc_requests("/listings");
    let key = headers
        .get("Idempotency-Key")
        .and_then(|v| v.to_str().ok());
    let outcome = state.service.create_listing(actor, payload, key).await?;
    let status = if outcome.replayed {
        StatusCode::OK
    } else {
        StatusCode::CREATED
    };
    Ok((status, Json(outcome)))
}

/// Reads the expected version from `If-Match`, accepting `"3"`, `3` and `W/"3"`.
fn if_match_version(headers: &HeaderMap) -> Option<u64> {
    let raw = headers.get("If-Match")?.to_str().ok()?.trim();
    raw.trim_start_matches("W/").trim_matches('"').parse().ok()
}

async fn update_listing(
    State(state): State<AppState>,
    Extension(actor): Extension<Actor>,
    Path(id): Path<u64>,
    headers: HeaderMap,
    Json(mut payload): Json<UpdateListingRequest>,
) -> Result<Json<Listing>, AppError> {
    crate::metrics::inc_requests("/listings/{id}");
    payload.expected_version = payload.expected_version.or(if_match_version(&headers));
    Ok(Json(state.service.update_listing(actor, id, payload).await?))
}

#[derive(Debug, Deserialize)]
struct StatusRequest {
    status: String,
    #[serde(default)]
    expected_version: Option<u64>,
}

async fn update_status(
    State(state): State<AppState>,
    Extension(actor): Extension<Actor>,
    Path(id): Path<u64>,
    headers: HeaderMap,
    Json(payload): Json<StatusRequest>,
) -> Result<Json<Listing>, AppError> {
    crate::metrics::inc_requests("/listings/{id}/status");
    let Some(to) = ListingStatus::from_str(&payload.status) else {
        return Err(LifecycleError::validation(
            "update_status",
            format!("unknown status {}", payload.status),
        )
        .into());
    };
    let expected = payload.expected_version.or(if_match_version(&headers));
    Ok(Json(state.service.update_status(actor, id, to, expected).await?))
}

#[derive(Debug, Deserialize)]
struct VisibilityRequest {
    visible: bool,
    #[serde(default)]
    expected_version: Option<u64>,
}

async fn toggle_visibility(
    State(state): State<AppState>,
    Extension(actor): Extension<Actor>,
    Path(id): Path<u64>,
    headers: HeaderMap,
    Json(payload): Json<VisibilityRequest>,
) -> Result<Json<Listing>, AppError> {
    crate::metrics::inc_requests("/listings/{id}/visibility");
    let expected = payload.expected_version.or(if_match_version(&headers));
    Ok(Json(
        state
            .service
            .toggle_visibility(actor, id, payload.visible, expected)
            .await?,
    ))
}

#[derive(Debug, Default, Deserialize)]
struct DeleteQuery {
    #[serde(default)]
    hard: bool,
}

async fn delete_listing(
    State(state): State<AppState>,
    Extension(actor): Extension<Actor>,
    Path(id): Path<u64>,
    Query(query): Query<DeleteQuery>,
) -> Result<Json<Listing>, AppError> {
    crate::metrics::inc_requests("/listings/{id}");
    Ok(Json(state.service.delete_listing(actor, id, query.hard).await?))
}

// -------- Media --------

async fn upload_media(
    State(state): State<AppState>,
    Extension(actor): Extension<Actor>,
    Path(id): Path<u64>,
    Json(payload): Json<MediaUrls>,
) -> Result<Json<Listing>, AppError> {
    crate::metrics::inc_requests("/listings/{id}/media");
    Ok(Json(state.service.upload_media(actor, id, payload).await?))
}

#[derive(Debug, Deserialize)]
struct FinalizeRequest {
    upload_ids: Vec<u64>,
}

async fn finalize_media(
    State(state): State<AppState>,
    Extension(actor): Extension<Actor>,
    Path(id): Path<u64>,
    Json(payload): Json<FinalizeRequest>,
) -> Result<Json<FinalizeReport>, AppError> {
    crate::metrics::inc_requests("/listings/{id}/media/finalize");
    Ok(Json(
        state
            .service
            .finalize_media(actor, id, &payload.upload_ids)
            .await?,
    ))
}

async fn delete_image(
    State(state): State<AppState>,
    Extension(actor): Extension<Actor>,
    Path((id, index)): Path<(u64, usize)>,
) -> Result<Json<Listing>, AppError> {
    crate::metrics::inc_requests("/listings/{id}/images/{index}");
    Ok(Json(state.service.delete_image_at(actor, id, index).await?))
}

#[derive(Debug, Deserialize)]
struct ReplaceImageRequest {
    url: String,
}

async fn replace_image(
    State(state): State<AppState>,
    Extension(actor): Extension<Actor>,
    Path((id, index)): Path<(u64, usize)>,
    Json(payload): Json<ReplaceImageRequest>,
) -> Result<Json<Listing>, AppError> {
    crate::metrics::inc_requests("/listings/{id}/images/{index}");
    Ok(Json(
        state
            .service
            .replace_image_at(actor, id, index, &payload.url)
            .await?,
    ))
}

async fn delete_video(
    State(state): State<AppState>,
    Extension(actor): Extension<Actor>,
    Path(id): Path<u64>,
) -> Result<Json<Listing>, AppError> {
    crate::metrics::inc_requests("/listings/{id}/video");
    Ok(Json(state.service.delete_video(actor, id).await?))
}

#[derive(Debug, Deserialize)]
struct BannerRequest {
    index: usize,
}

async fn set_banner(
    State(state): State<AppState>,
    Extension(actor): Extension<Actor>,
    Path(id): Path<u64>,
    Json(payload): Json<BannerRequest>,
) -> Result<Json<Listing>, AppError> {
    crate::metrics::inc_requests("/listings/{id}/banner");
    Ok(Json(state.service.set_banner_at(actor, id, payload.index).await?))
}

/// Stage a file for a later create or finalize.
///
/// - Method: `POST`
/// - Path: `/uploads`
/// - Headers: `X-Filename` (required), `Content-Type`, optional `X-Content-Hash`
/// - Body: raw file bytes
/// - Response: `201` with the `TemporaryUpload` record
async fn register_upload(
    State(state): State<AppState>,
    Extension(actor): Extension<Actor>,
    headers: HeaderMap,
    body: Bytes,
) -> Result<(StatusCode, Json<TemporaryUpload>), AppError> {
    crate::metrics::inc_requests("/uploads");
    let header = |name: &str| {
        headers
            .get(name)
            .and_then(|v| v.to_str().ok())
            .map(|v| v.trim().to_string())
            .filter(|v| !v.is_empty())
    };
    let Some(filename) = header("X-Filename") else {
        return Err(LifecycleError::validation("register_upload", "X-Filename header is required").into());
    };
    let upload = NewUpload {
        filename,
        content_type: header("Content-Type"),
        bytes: body.to_vec(),
        content_hash: header("X-Content-Hash"),
    };
    let record = state.service.register_upload(actor, upload).await?;
    Ok((StatusCode::CREATED, Json(record)))
}

async fn get_job_status(
    State(state): State<AppState>,
    Path(id): Path<String>,
) -> Result<Json<JobInfo>, AppError> {
    let Ok(uuid) = uuid::Uuid::parse_str(&id) else {
        return Err(LifecycleError::validation("jobs", "invalid job id").into());
    };
    match state.queue.get(uuid).await {
        Some(info) => Ok(Json(info)),
        None => Err(LifecycleError::not_found("jobs", "job", uuid).into()),
    }
}

// -------- Public reads --------

#[derive(Debug, Deserialize)]
struct PageQuery {
    #[serde(default)]
    page: u32,
    #[serde(default = "default_page_size")]
    size: u32,
    #[serde(default)]
    sort: SortOrder,
}

fn default_page_size() -> u32 {
    20
}

async fn list_public(
    State(state): State<AppState>,
    Query(query): Query<PageQuery>,
) -> Result<Json<ListingPage>, AppError> {
    crate::metrics::inc_requests("/public/listings");
    let request = PageRequest {
        page: query.page,
        size: query.size,
        sort: query.sort,
    };
    Ok(Json(state.service.list_public(request).await?))
}

async fn get_public_listing(
    State(state): State<AppState>,
    viewer: Option<Extension<Actor>>,
    Path(id): Path<u64>,
) -> Result<Json<PublicListing>, AppError> {
    crate::metrics::inc_requests("/public/listings/{id}");
    let viewer_id = viewer.map(|Extension(actor)| actor.id);
    Ok(Json(state.service.get_public_listing(id, viewer_id).await?))
}

#[derive(Debug)]
struct AppError(LifecycleError);

impl From<LifecycleError> for AppError {
    fn from(value: LifecycleError) -> Self {
        Self(value)
    }
}

impl IntoResponse for AppError {
    fn into_response(self) -> Response {
        let err = self.0;
        let status = match err.kind() {
            ErrorKind::Validation => StatusCode::BAD_REQUEST,
            ErrorKind::Unauthorized | ErrorKind::Security => StatusCode::FORBIDDEN,
            ErrorKind::NotFound => StatusCode::NOT_FOUND,
            ErrorKind::InvalidTransition
            | ErrorKind::ConcurrencyConflict
            | ErrorKind::InvalidStateForMediaChange => StatusCode::CONFLICT,
            ErrorKind::MediaLimitExceeded => StatusCode::PAYLOAD_TOO_LARGE,
            ErrorKind::PriceChangeRejected => StatusCode::UNPROCESSABLE_ENTITY,
            ErrorKind::Storage | ErrorKind::StorageRejected => StatusCode::BAD_GATEWAY,
            ErrorKind::Internal => StatusCode::INTERNAL_SERVER_ERROR,
        };
        if status.is_server_error() {
            error!(target = "listings.api", operation = err.operation(), error = %err, "request failed");
        }
        let payload = ApiError {
            error: err.kind().code().to_string(),
            detail: Some(err.detail().to_string()),
        };
        (status, Json(payload)).into_response()
    }
}
