//! Rulebook Memory Server
//!
//! HTTP API for the memory system of one project.

use std::path::PathBuf;
use std::sync::Arc;

use axum::{
    extract::{Path, Query, State},
    http::{header, StatusCode},
    response::{IntoResponse, Response},
    routing::{get, post},
    Json, Router,
};
use serde::{Deserialize, Serialize};
use serde_json::json;
use tower_http::cors::{Any, CorsLayer};
use tower_http::trace::TraceLayer;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};
use uuid::Uuid;

use rulebook_memory::{
    Config, Error, ErrorKind, ExportFormat, MemoryManager, MemoryRecord, MemoryUpdate,
    NewMemory, SearchFilters, SearchMode, SearchRequest,
};

/// Application state shared across handlers; `None` when memory is disabled
struct AppState {
    manager: Option<Arc<MemoryManager>>,
}

type SharedState = Arc<AppState>;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Initialize logging
    tracing_subscriber::registry()
        .with(tracing_subscriber::EnvFilter::new(
            std::env::var("RUST_LOG").unwrap_or_else(|_| "info".into()),
        ))
        .with(tracing_subscriber::fmt::layer())
        .init();

    // Load configuration
    let root = match std::env::var_os("RULEBOOK_PROJECT_ROOT") {
        Some(root) => PathBuf::from(root),
        None => std::env::current_dir()?,
    };
    let config = Config::load(&root)?;
    let port = config.server_port;
    tracing::info!("Starting Rulebook Memory Server on port {}", port);
    tracing::info!("Data directory: {:?}", config.data_dir);

    let manager = match MemoryManager::open(config).await {
        Ok(manager) => Some(Arc::new(manager)),
        Err(Error::Disabled) => {
            tracing::warn!("Memory is not enabled for {:?}; serving 503 until it is", root);
            None
        }
        Err(e) => return Err(e.into()),
    };

    let state = Arc::new(AppState {
        manager: manager.clone(),
    });

    // Build router
    let app = Router::new()
        // Health check
        .route("/health", get(health))
        // Memory CRUD
        .route("/memories", get(list_memories).post(create_memory))
        .route("/memories/batch", post(get_memories))
        .route(
            "/memories/:id",
            get(get_memory).patch(update_memory).delete(delete_memory),
        )
        // Retrieval
        .route("/search", post(search))
        .route("/timeline/:id", get(timeline))
        // Sessions
        .route("/sessions", post(start_session))
        .route("/sessions/:id", get(get_session))
        .route("/sessions/:id/end", post(end_session))
        .route("/sessions/:id/tool-calls", post(record_tool_call))
        // Maintenance
        .route("/cleanup", post(cleanup))
        .route("/rebuild", post(rebuild))
        .route("/stats", get(stats))
        .route("/export", get(export))
        .layer(TraceLayer::new_for_http())
        .layer(CorsLayer::new().allow_origin(Any).allow_methods(Any).allow_headers(Any))
        .with_state(state);

    let listener = tokio::net::TcpListener::bind(format!("127.0.0.1:{}", port)).await?;
    tracing::info!("Server listening on http://127.0.0.1:{}", port);

    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal())
        .await?;

    if let Some(manager) = manager {
        manager.close().await?;
    }

    Ok(())
}

async fn shutdown_signal() {
    if let Err(e) = tokio::signal::ctrl_c().await {
        tracing::warn!("Failed to listen for shutdown signal: {}", e);
    }
    tracing::info!("Shutting down");
}

// === Errors ===

struct ApiError(Error);

impl From<Error> for ApiError {
    fn from(e: Error) -> Self {
        Self(e)
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let (status, kind) = match self.0.kind() {
            ErrorKind::Validation => (StatusCode::BAD_REQUEST, "validation"),
            ErrorKind::NotFound => (StatusCode::NOT_FOUND, "not_found"),
            ErrorKind::Disabled => (StatusCode::SERVICE_UNAVAILABLE, "disabled"),
            ErrorKind::ResourceExhausted => (StatusCode::INSUFFICIENT_STORAGE, "cannot_reclaim"),
            ErrorKind::Storage => (StatusCode::INTERNAL_SERVER_ERROR, "storage_unavailable"),
            ErrorKind::Config => (StatusCode::INTERNAL_SERVER_ERROR, "config"),
        };
        if status.is_server_error() {
            tracing::error!("{}", self.0);
        }
        (status, Json(json!({ "error": self.0.to_string(), "kind": kind }))).into_response()
    }
}

type ApiResult<T> = Result<T, ApiError>;

fn manager(state: &AppState) -> ApiResult<&MemoryManager> {
    state.manager.as_deref().ok_or(ApiError(Error::Disabled))
}

fn not_found(what: &str, id: Uuid) -> ApiError {
    ApiError(Error::not_found(format!("{} {}", what, id)))
}

// === Handlers ===

async fn health(State(state): State<SharedState>) -> Json<serde_json::Value> {
    Json(json!({ "status": "ok", "memoryEnabled": state.manager.is_some() }))
}

// --- Memory handlers ---

#[derive(Debug, Deserialize)]
struct ListMemoriesQuery {
    project: Option<String>,
    limit: Option<usize>,
    offset: Option<usize>,
}

async fn list_memories(
    State(state): State<SharedState>,
    Query(query): Query<ListMemoriesQuery>,
) -> ApiResult<impl IntoResponse> {
    let memories = manager(&state)?
        .list_recent(
            query.project.as_deref(),
            query.limit.unwrap_or(20),
            query.offset.unwrap_or(0),
        )
        .await?;
    Ok(Json(memories))
}

async fn create_memory(
    State(state): State<SharedState>,
    Json(req): Json<NewMemory>,
) -> ApiResult<impl IntoResponse> {
    let memory = manager(&state)?.save_memory(req).await?;
    Ok((StatusCode::CREATED, Json(memory)))
}

#[derive(Debug, Deserialize)]
struct BatchGetRequest {
    ids: Vec<Uuid>,
}

async fn get_memories(
    State(state): State<SharedState>,
    Json(req): Json<BatchGetRequest>,
) -> ApiResult<Json<Vec<MemoryRecord>>> {
    Ok(Json(manager(&state)?.get_memory(&req.ids).await?))
}

async fn get_memory(
    State(state): State<SharedState>,
    Path(id): Path<Uuid>,
) -> ApiResult<Json<MemoryRecord>> {
    manager(&state)?
        .get_memory(&[id])
        .await?
        .pop()
        .map(Json)
        .ok_or_else(|| not_found("memory", id))
}

async fn update_memory(
    State(state): State<SharedState>,
    Path(id): Path<Uuid>,
    Json(req): Json<MemoryUpdate>,
) -> ApiResult<Json<MemoryRecord>> {
    manager(&state)?
        .update_memory(id, req)
        .await?
        .map(Json)
        .ok_or_else(|| not_found("memory", id))
}

async fn delete_memory(
    State(state): State<SharedState>,
    Path(id): Path<Uuid>,
) -> ApiResult<StatusCode> {
    if manager(&state)?.delete_memory(id).await? {
        Ok(StatusCode::NO_CONTENT)
    } else {
        Err(not_found("memory", id))
    }
}

// --- Retrieval handlers ---

#[derive(Debug, Deserialize)]
struct SearchBody {
    query: String,
    mode: Option<String>,
    limit: Option<usize>,
    #[serde(default)]
    filters: SearchFilters,
}

async fn search(
    State(state): State<SharedState>,
    Json(body): Json<SearchBody>,
) -> ApiResult<impl IntoResponse> {
    let manager = manager(&state)?;
    let mut request = SearchRequest::new(body.query).with_filters(body.filters);
    if let Some(mode) = body.mode {
        request = request.with_mode(mode.parse::<SearchMode>()?);
    }
    if let Some(limit) = body.limit {
        request = request.with_limit(limit);
    }
    Ok(Json(manager.search_memories(&request).await?))
}

#[derive(Debug, Deserialize)]
struct TimelineQuery {
    window: Option<usize>,
}

async fn timeline(
    State(state): State<SharedState>,
    Path(id): Path<Uuid>,
    Query(query): Query<TimelineQuery>,
) -> ApiResult<impl IntoResponse> {
    manager(&state)?
        .get_timeline(id, query.window.unwrap_or(4))
        .await?
        .map(Json)
        .ok_or_else(|| not_found("memory", id))
}

// --- Session handlers ---

#[derive(Debug, Deserialize)]
struct StartSessionRequest {
    project: String,
}

async fn start_session(
    State(state): State<SharedState>,
    Json(req): Json<StartSessionRequest>,
) -> ApiResult<impl IntoResponse> {
    let session = manager(&state)?.start_session(&req.project).await?;
    Ok((StatusCode::CREATED, Json(session)))
}

async fn get_session(
    State(state): State<SharedState>,
    Path(id): Path<Uuid>,
) -> ApiResult<impl IntoResponse> {
    manager(&state)?
        .get_session(id)
        .await?
        .map(Json)
        .ok_or_else(|| not_found("session", id))
}

#[derive(Debug, Deserialize)]
struct EndSessionRequest {
    summary: Option<String>,
}

async fn end_session(
    State(state): State<SharedState>,
    Path(id): Path<Uuid>,
    body: Option<Json<EndSessionRequest>>,
) -> ApiResult<impl IntoResponse> {
    let summary = body.and_then(|Json(req)| req.summary);
    manager(&state)?
        .end_session(id, summary)
        .await?
        .map(Json)
        .ok_or_else(|| not_found("session", id))
}

async fn record_tool_call(
    State(state): State<SharedState>,
    Path(id): Path<Uuid>,
) -> ApiResult<impl IntoResponse> {
    manager(&state)?
        .record_tool_call(id)
        .await?
        .map(Json)
        .ok_or_else(|| not_found("session", id))
}

// --- Maintenance handlers ---

#[derive(Debug, Deserialize)]
struct CleanupQuery {
    force: Option<bool>,
}

async fn cleanup(
    State(state): State<SharedState>,
    Query(query): Query<CleanupQuery>,
) -> ApiResult<impl IntoResponse> {
    let report = manager(&state)?
        .cleanup(query.force.unwrap_or(false))
        .await?;
    Ok(Json(report))
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
struct RebuildResponse {
    indexed: usize,
}

async fn rebuild(State(state): State<SharedState>) -> ApiResult<impl IntoResponse> {
    let indexed = manager(&state)?.rebuild_index().await?;
    Ok(Json(RebuildResponse { indexed }))
}

async fn stats(State(state): State<SharedState>) -> ApiResult<impl IntoResponse> {
    Ok(Json(manager(&state)?.stats().await?))
}

#[derive(Debug, Deserialize)]
struct ExportQuery {
    format: Option<String>,
}

async fn export(
    State(state): State<SharedState>,
    Query(query): Query<ExportQuery>,
) -> ApiResult<Response> {
    let manager = manager(&state)?;
    let format = match query.format {
        Some(format) => format.parse::<ExportFormat>()?,
        None => ExportFormat::default(),
    };
    let body = manager.export_all(format).await?;
    Ok(([(header::CONTENT_TYPE, format.content_type())], body).into_response())
}
