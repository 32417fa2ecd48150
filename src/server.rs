//! HTTP server for the ingestion and query pipelines.
//!
//! # Endpoints
//!
//! | Method | Path | Description |
//! |--------|------|-------------|
//! | `POST` | `/file_events` | Enqueue a file change for ingestion (202) |
//! | `POST` | `/queries` | Answer a query as an NDJSON event stream |
//! | `POST` | `/queries/answer` | Answer a query as a single JSON object |
//! | `GET`  | `/health` | Health check (returns version) |
//!
//! # Error Contract
//!
//! Synchronous error responses use the body:
//!
//! ```json
//! { "error": { "code": "malformed_input", "message": "question is empty" } }
//! ```
//!
//! Once a query stream has started, failures are delivered in-band as a
//! terminal `error` event instead.
//!
//! # CORS
//!
//! All origins, methods, and headers are permitted to support browser-based
//! clients.

use axum::{
    body::Body,
    extract::{FromRequest, Request, State},
    http::{header, StatusCode},
    response::{IntoResponse, Response},
    routing::{get, post},
    Json, Router,
};
use futures_util::StreamExt;
use serde::Serialize;
use std::convert::Infallible;
use std::sync::Arc;
use tower_http::cors::{Any, CorsLayer};

use crate::config::Config;
use crate::context::ContextAssembler;
use crate::db;
use crate::embedding::{create_provider, Embedder};
use crate::error::PipelineError;
use crate::generate::create_generator;
use crate::ingest::IngestionCoordinator;
use crate::migrate;
use crate::models::{FileChangeEvent, QueryRequest};
use crate::query::QueryPipeline;
use crate::retrieve::Retriever;
use crate::store::VectorStore;

/// Shared application state passed to all route handlers.
#[derive(Clone)]
struct AppState {
    coordinator: Arc<IngestionCoordinator>,
    query: QueryPipeline,
}

/// Starts the HTTP server.
///
/// Builds the full pipeline stack (store, embedder, coordinator, query
/// pipeline) from configuration, runs migrations, and serves until the
/// process is terminated.
pub async fn run_server(config: &Config) -> anyhow::Result<()> {
    let pool = db::connect(&config.db).await?;
    migrate::run_migrations(&pool).await?;

    let provider = create_provider(&config.embedding)?;
    let embedder = Embedder::new(provider, &config.embedding);
    let store = VectorStore::new(pool, config.embedding.dims);

    let coordinator = Arc::new(IngestionCoordinator::new(
        store.clone(),
        embedder.clone(),
        config.chunking.clone(),
    ));

    let generator = create_generator(&config.generation)?;
    let retriever = Retriever::new(store, embedder, config.retrieval.clone());
    let assembler = ContextAssembler::new(config.context.clone(), config.chunking.clone());
    let query = QueryPipeline::new(retriever, assembler, generator);

    let app = router(AppState { coordinator, query });

    let bind_addr = &config.server.bind;
    tracing::info!(%bind_addr, "server listening");
    println!("note-rags server listening on http://{}", bind_addr);

    let listener = tokio::net::TcpListener::bind(bind_addr).await?;
    axum::serve(listener, app).await?;

    Ok(())
}

fn router(state: AppState) -> Router {
    let cors = CorsLayer::new()
        .allow_origin(Any)
        .allow_methods(Any)
        .allow_headers(Any);

    Router::new()
        .route("/file_events", post(handle_file_event))
        .route("/queries", post(handle_query_stream))
        .route("/queries/answer", post(handle_query_answer))
        .route("/health", get(handle_health))
        .layer(cors)
        .with_state(state)
}

// ============ Request extraction ============

/// JSON extractor that reports malformed payloads as a 400 with the
/// standard error body instead of axum's default rejection response.
struct AppJson<T>(T);

impl<S, T> FromRequest<S> for AppJson<T>
where
    T: serde::de::DeserializeOwned,
    S: Send + Sync,
{
    type Rejection = AppError;

    async fn from_request(req: Request, state: &S) -> Result<Self, Self::Rejection> {
        match Json::<T>::from_request(req, state).await {
            Ok(Json(value)) => Ok(AppJson(value)),
            Err(rejection) => Err(AppError {
                status: StatusCode::BAD_REQUEST,
                code: "malformed_input".to_string(),
                message: rejection.body_text(),
            }),
        }
    }
}

// ============ Error response ============

/// JSON error response body.
#[derive(Serialize)]
struct ErrorBody {
    error: ErrorDetail,
}

#[derive(Serialize)]
struct ErrorDetail {
    code: String,
    message: String,
}

struct AppError {
    status: StatusCode,
    code: String,
    message: String,
}

impl IntoResponse for AppError {
    fn into_response(self) -> Response {
        let body = ErrorBody {
            error: ErrorDetail {
                code: self.code,
                message: self.message,
            },
        };
        (self.status, Json(body)).into_response()
    }
}

impl From<PipelineError> for AppError {
    fn from(err: PipelineError) -> Self {
        let status = match &err {
            PipelineError::MalformedInput(_) => StatusCode::BAD_REQUEST,
            PipelineError::ConstraintViolation(_) => StatusCode::INTERNAL_SERVER_ERROR,
            PipelineError::StorageUnavailable(_) => StatusCode::SERVICE_UNAVAILABLE,
            PipelineError::TransientProvider(_) | PipelineError::PermanentProvider(_) => {
                StatusCode::BAD_GATEWAY
            }
        };
        AppError {
            status,
            code: err.kind().to_string(),
            message: err.to_string(),
        }
    }
}

// ============ GET /health ============

#[derive(Serialize)]
struct HealthResponse {
    status: String,
    version: String,
}

/// Handler for `GET /health`.
async fn handle_health() -> Json<HealthResponse> {
    Json(HealthResponse {
        status: "ok".to_string(),
        version: env!("CARGO_PKG_VERSION").to_string(),
    })
}

// ============ POST /file_events ============

#[derive(Serialize)]
struct FileEventResponse {
    status: String,
    file_path: String,
}

/// Handler for `POST /file_events`.
///
/// Validates the payload, enqueues the ingestion as a background task, and
/// returns 202. Ingestion for the same file path is serialized by the
/// coordinator; different paths run in parallel.
async fn handle_file_event(
    State(state): State<AppState>,
    AppJson(event): AppJson<FileChangeEvent>,
) -> Result<(StatusCode, Json<FileEventResponse>), AppError> {
    IngestionCoordinator::validate(&event)?;

    let coordinator = state.coordinator.clone();
    let file_path = event.file_path.clone();
    tokio::spawn(async move {
        let outcome = coordinator.process_event(&event).await;
        tracing::info!(
            file_path = %event.file_path,
            state = ?outcome.state,
            chunks = outcome.chunks_written,
            detail = %outcome.detail,
            "ingestion finished"
        );
    });

    Ok((
        StatusCode::ACCEPTED,
        Json(FileEventResponse {
            status: "accepted".to_string(),
            file_path,
        }),
    ))
}

// ============ POST /queries ============

/// Handler for `POST /queries`.
///
/// Streams the response as NDJSON: one JSON-encoded `StreamEvent` per line,
/// flushed as each event becomes available. The first line is the `context`
/// event; the last is `complete` or `error`.
async fn handle_query_stream(
    State(state): State<AppState>,
    AppJson(request): AppJson<QueryRequest>,
) -> Result<Response, AppError> {
    let events = state.query.stream(&request).await?;

    let body = Body::from_stream(events.map(|event| {
        let mut line = serde_json::to_string(&event).unwrap_or_else(|_| "{}".to_string());
        line.push('\n');
        Ok::<_, Infallible>(line)
    }));

    Ok((
        StatusCode::OK,
        [
            (header::CONTENT_TYPE, "application/x-ndjson"),
            (header::CACHE_CONTROL, "no-cache"),
        ],
        body,
    )
        .into_response())
}

// ============ POST /queries/answer ============

/// Handler for `POST /queries/answer` (non-streaming variant).
async fn handle_query_answer(
    State(state): State<AppState>,
    AppJson(request): AppJson<QueryRequest>,
) -> Result<Json<crate::models::QueryAnswer>, AppError> {
    let answer = state.query.answer(&request).await?;
    Ok(Json(answer))
}
