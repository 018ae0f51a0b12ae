//! JSON HTTP API over the engine.
//!
//! # Endpoints
//!
//! | Method | Path | Description |
//! |--------|------|-------------|
//! | `GET`  | `/health` | Health check (returns version) |
//! | `GET`  | `/catalog` | Files, their columns, and discovery failures |
//! | `POST` | `/convert?force=` | Convert missing or stale files |
//! | `POST` | `/search` | Run a search, return the whole outcome |
//! | `POST` | `/search/stream` | Run a search, stream events as NDJSON |
//! | `POST` | `/page` | One page of a single file's matches |
//! | `POST` | `/export` | Run a search, download it as CSV, XLSX or JSON |
//! | `GET`  | `/stats` | Dataset statistics |
//! | `GET`  | `/history` | Recent searches |
//! | `GET`  | `/history/popular` | Most frequent searches |
//!
//! # Error Contract
//!
//! ```json
//! { "error": { "code": "bad_request", "message": "search term must not be empty" } }
//! ```
//!
//! Error codes: `bad_request` (400), `not_found` (404), `timeout` (408),
//! `unprocessable` (422), `internal` (500).
//!
//! Per-file failures are not errors: they travel inside the outcome's
//! `errors` list next to the other files' results.

use axum::{
    body::Body,
    extract::{Query, State},
    http::{header, StatusCode},
    response::{IntoResponse, Response},
    routing::{get, post},
    Json, Router,
};
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use std::time::Duration;
use tower_http::cors::{Any, CorsLayer};

use crate::cache::QueryCache;
use crate::engine::Engine;
use crate::error::{EngineError, ExportError, QueryError};
use crate::export::{self, ExportFormat, ExportScope};
use crate::history;
use crate::models::{ColumnCatalog, SearchOutcome, SearchRequest};
use crate::progress::NoProgress;
use crate::search::{Page, PageRequest};
use crate::stats::{self, DatasetStats};

#[derive(Clone)]
struct AppState {
    engine: Arc<Engine>,
}

pub fn router(engine: Arc<Engine>) -> Router {
    let cors = CorsLayer::new()
        .allow_origin(Any)
        .allow_methods(Any)
        .allow_headers(Any);

    Router::new()
        .route("/health", get(handle_health))
        .route("/catalog", get(handle_catalog))
        .route("/convert", post(handle_convert))
        .route("/search", post(handle_search))
        .route("/search/stream", post(handle_search_stream))
        .route("/page", post(handle_page))
        .route("/export", post(handle_export))
        .route("/stats", get(handle_stats))
        .route("/history", get(handle_history))
        .route("/history/popular", get(handle_popular))
        .layer(cors)
        .with_state(AppState { engine })
}

/// Binds to `[server].bind` and serves until the process is terminated.
pub async fn run_server(engine: Arc<Engine>) -> anyhow::Result<()> {
    let bind_addr = engine.config().server.bind.clone();
    spawn_cache_sweep(engine.cache().clone());
    let app = router(engine);

    let listener = tokio::net::TcpListener::bind(&bind_addr).await?;
    tracing::info!(addr = %bind_addr, "listening");
    println!("CSV search server listening on http://{}", bind_addr);
    axum::serve(listener, app).await?;

    Ok(())
}

/// Drop expired cache entries once per TTL so idle results do not hold
/// memory until the next lookup.
fn spawn_cache_sweep(cache: Arc<QueryCache>) {
    let period = cache.ttl().max(Duration::from_secs(1));
    tokio::spawn(async move {
        let mut ticker = tokio::time::interval(period);
        ticker.tick().await;
        loop {
            ticker.tick().await;
            let purged = cache.purge_expired();
            if purged > 0 {
                tracing::debug!(purged, "expired cache entries removed");
            }
        }
    });
}

// ============ Error response ============

#[derive(Serialize)]
struct ErrorBody {
    error: ErrorDetail,
}

#[derive(Serialize)]
struct ErrorDetail {
    code: &'static str,
    message: String,
}

struct AppError {
    status: StatusCode,
    code: &'static str,
    message: String,
}

impl IntoResponse for AppError {
    fn into_response(self) -> Response {
        if self.status.is_server_error() {
            tracing::error!(code = self.code, "{}", self.message);
        }
        let body = ErrorBody {
            error: ErrorDetail {
                code: self.code,
                message: self.message,
            },
        };
        (self.status, Json(body)).into_response()
    }
}

fn bad_request(message: impl Into<String>) -> AppError {
    AppError {
        status: StatusCode::BAD_REQUEST,
        code: "bad_request",
        message: message.into(),
    }
}

fn not_found(message: impl Into<String>) -> AppError {
    AppError {
        status: StatusCode::NOT_FOUND,
        code: "not_found",
        message: message.into(),
    }
}

fn internal(message: impl Into<String>) -> AppError {
    AppError {
        status: StatusCode::INTERNAL_SERVER_ERROR,
        code: "internal",
        message: message.into(),
    }
}

impl From<EngineError> for AppError {
    fn from(err: EngineError) -> Self {
        match err {
            EngineError::InvalidRequest(msg) if msg.starts_with("no such file") => not_found(msg),
            EngineError::InvalidRequest(msg) => bad_request(msg),
            EngineError::SourceRootMissing(_) | EngineError::Glob(_) => AppError {
                status: StatusCode::UNPROCESSABLE_ENTITY,
                code: "unprocessable",
                message: err.to_string(),
            },
            other => internal(other.to_string()),
        }
    }
}

impl From<QueryError> for AppError {
    fn from(err: QueryError) -> Self {
        match err {
            QueryError::ColumnMissing(_) | QueryError::InvalidPattern(_) => bad_request(err.to_string()),
            QueryError::TableMissing => not_found(err.to_string()),
            QueryError::Timeout(_) => AppError {
                status: StatusCode::REQUEST_TIMEOUT,
                code: "timeout",
                message: err.to_string(),
            },
            QueryError::Conversion(_) => AppError {
                status: StatusCode::UNPROCESSABLE_ENTITY,
                code: "unprocessable",
                message: err.to_string(),
            },
            other => internal(other.to_string()),
        }
    }
}

impl From<ExportError> for AppError {
    fn from(err: ExportError) -> Self {
        match err {
            ExportError::TooManyRows(_) => bad_request(err.to_string()),
            other => internal(other.to_string()),
        }
    }
}

// ============ GET /health ============

#[derive(Serialize)]
struct HealthResponse {
    status: &'static str,
    version: &'static str,
}

async fn handle_health() -> Json<HealthResponse> {
    Json(HealthResponse {
        status: "ok",
        version: env!("CARGO_PKG_VERSION"),
    })
}

// ============ GET /catalog ============

async fn handle_catalog(State(state): State<AppState>) -> Result<Json<Arc<ColumnCatalog>>, AppError> {
    Ok(Json(state.engine.get_catalog().await?))
}

// ============ POST /convert ============

#[derive(Deserialize)]
struct ConvertParams {
    #[serde(default)]
    force: bool,
}

#[derive(Serialize)]
struct ConvertResponse {
    converted: Vec<String>,
    up_to_date: usize,
    failed: Vec<ConvertFailure>,
}

#[derive(Serialize)]
struct ConvertFailure {
    path: String,
    error: String,
}

async fn handle_convert(
    State(state): State<AppState>,
    Query(params): Query<ConvertParams>,
) -> Result<Json<ConvertResponse>, AppError> {
    let report = state.engine.convert_pending(params.force, &NoProgress).await?;
    Ok(Json(ConvertResponse {
        converted: report.converted.iter().map(|t| t.file_name.clone()).collect(),
        up_to_date: report.up_to_date.len(),
        failed: report
            .failed
            .into_iter()
            .map(|(path, error)| ConvertFailure {
                path: path.display().to_string(),
                error,
            })
            .collect(),
    }))
}

// ============ POST /search ============

async fn handle_search(
    State(state): State<AppState>,
    Json(request): Json<SearchRequest>,
) -> Result<Json<Arc<SearchOutcome>>, AppError> {
    Ok(Json(state.engine.search_collect(request).await?))
}

/// One JSON event per line, as files finish. The last line is the
/// `completed` event carrying the full outcome.
async fn handle_search_stream(
    State(state): State<AppState>,
    Json(request): Json<SearchRequest>,
) -> Result<Response, AppError> {
    let stream = state.engine.search(request).await?;
    let lines = futures::stream::unfold(stream, |mut stream| async move {
        let event = stream.next().await?;
        let mut line = match serde_json::to_vec(&event) {
            Ok(line) => line,
            Err(e) => {
                tracing::warn!(error = %e, "dropping unserializable search event");
                Vec::new()
            }
        };
        line.push(b'\n');
        Some((Ok::<_, std::io::Error>(line), stream))
    });

    Ok((
        [(header::CONTENT_TYPE, "application/x-ndjson")],
        Body::from_stream(lines),
    )
        .into_response())
}

// ============ POST /page ============

async fn handle_page(
    State(state): State<AppState>,
    Json(request): Json<PageRequest>,
) -> Result<Json<Page>, AppError> {
    let page = state.engine.fetch_page(&request).await??;
    Ok(Json(page))
}

// ============ POST /export ============

#[derive(Deserialize)]
struct ExportRequest {
    #[serde(flatten)]
    search: SearchRequest,
    #[serde(default = "default_export_format")]
    format: String,
    /// File id or name; omit to export every file's results together.
    #[serde(default)]
    file: Option<String>,
}

fn default_export_format() -> String {
    "csv".to_string()
}

async fn handle_export(
    State(state): State<AppState>,
    Json(request): Json<ExportRequest>,
) -> Result<Response, AppError> {
    let format: ExportFormat = request.format.parse().map_err(bad_request)?;
    let outcome = state.engine.search_collect(request.search).await?;

    let scope = match request.file.as_deref() {
        Some(file) => ExportScope::File(
            outcome
                .result_for(file)
                .ok_or_else(|| not_found(format!("no results for file: {}", file)))?,
        ),
        None => ExportScope::Combined {
            results: &outcome.results,
            term: &outcome.request.term,
        },
    };
    let artifact = export::export(scope, format)?;

    let disposition = format!("attachment; filename=\"{}\"", artifact.filename);
    Ok((
        [
            (header::CONTENT_TYPE, artifact.content_type.to_string()),
            (header::CONTENT_DISPOSITION, disposition),
        ],
        artifact.bytes,
    )
        .into_response())
}

// ============ GET /stats ============

async fn handle_stats(State(state): State<AppState>) -> Result<Json<DatasetStats>, AppError> {
    Ok(Json(stats::collect(&state.engine).await?))
}

// ============ GET /history ============

#[derive(Deserialize)]
struct HistoryParams {
    user: Option<String>,
    #[serde(default = "default_history_limit")]
    limit: i64,
}

fn default_history_limit() -> i64 {
    50
}

async fn handle_history(
    State(state): State<AppState>,
    Query(params): Query<HistoryParams>,
) -> Result<Json<Vec<history::HistoryEntry>>, AppError> {
    let entries = history::history(state.engine.pool(), params.user.as_deref(), params.limit)
        .await
        .map_err(EngineError::from)?;
    Ok(Json(entries))
}

#[derive(Deserialize)]
struct PopularParams {
    #[serde(default = "default_popular_limit")]
    limit: i64,
    #[serde(default = "default_popular_days")]
    days: i64,
}

fn default_popular_limit() -> i64 {
    10
}

fn default_popular_days() -> i64 {
    7
}

async fn handle_popular(
    State(state): State<AppState>,
    Query(params): Query<PopularParams>,
) -> Result<Json<Vec<history::PopularSearch>>, AppError> {
    let entries = history::popular(state.engine.pool(), params.limit, params.days)
        .await
        .map_err(EngineError::from)?;
    Ok(Json(entries))
}
