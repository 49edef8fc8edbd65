//! HTTP search API.
//!
//! Loads one index snapshot at startup and serves it until the process
//! exits. A swapped generation is picked up by restarting the server.
//!
//! # Endpoints
//!
//! | Method | Path | Description |
//! |--------|------|-------------|
//! | `POST` | `/search` | `{query, top_k}` → `{results, answer}` |
//! | `GET`  | `/health` | Status, version, and row count |
//!
//! # Error Contract
//!
//! ```json
//! { "error": { "code": "dimension_mismatch", "message": "..." } }
//! ```
//!
//! Error codes: `bad_request` (400), `dimension_mismatch` (400),
//! `collaborator_error` (502), `collaborator_unavailable` (503),
//! `internal` (500). A query with no matches is a `200` with empty
//! `results`.

use axum::{
    extract::{rejection::JsonRejection, State},
    http::StatusCode,
    response::{IntoResponse, Response},
    routing::{get, post},
    Json, Router,
};
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use tower_http::cors::{Any, CorsLayer};

use crate::config::Config;
use crate::error::Error;
use crate::models::SearchHit;
use crate::search::Searcher;

#[derive(Clone)]
struct AppState {
    searcher: Arc<Searcher>,
    default_top_k: usize,
}

/// Starts the HTTP server on `[server].bind`.
///
/// Refuses to start if the served generation fails its consistency checks.
pub async fn run_server(config: &Config) -> anyhow::Result<()> {
    let searcher = Arc::new(Searcher::from_config(config)?);
    let app = build_router(searcher, config.retrieval.top_k);

    let listener = tokio::net::TcpListener::bind(&config.server.bind).await?;
    tracing::info!(bind = %config.server.bind, "search server listening");
    println!("Search server listening on http://{}", config.server.bind);

    axum::serve(listener, app).await?;
    Ok(())
}

/// Router over a shared searcher. Exposed for embedding in other services.
pub fn build_router(searcher: Arc<Searcher>, default_top_k: usize) -> Router {
    let cors = CorsLayer::new()
        .allow_origin(Any)
        .allow_methods(Any)
        .allow_headers(Any);

    Router::new()
        .route("/search", post(handle_search))
        .route("/health", get(handle_health))
        .layer(cors)
        .with_state(AppState {
            searcher,
            default_top_k,
        })
}

// ============ Error response ============

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
    code: &'static str,
    message: String,
}

impl IntoResponse for AppError {
    fn into_response(self) -> Response {
        let body = ErrorBody {
            error: ErrorDetail {
                code: self.code.to_string(),
                message: self.message,
            },
        };
        (self.status, Json(body)).into_response()
    }
}

impl From<Error> for AppError {
    fn from(err: Error) -> Self {
        let (status, code) = match &err {
            Error::DimensionMismatch { .. } => (StatusCode::BAD_REQUEST, "dimension_mismatch"),
            Error::MalformedInput(_) => (StatusCode::BAD_REQUEST, "bad_request"),
            Error::CollaboratorTransient(_) => {
                (StatusCode::SERVICE_UNAVAILABLE, "collaborator_unavailable")
            }
            Error::CollaboratorPermanent(_) => (StatusCode::BAD_GATEWAY, "collaborator_error"),
            Error::Consistency(_) | Error::Io(_) | Error::Json(_) => {
                (StatusCode::INTERNAL_SERVER_ERROR, "internal")
            }
        };
        if status.is_server_error() {
            tracing::error!(error = %err, "search request failed");
        } else {
            tracing::debug!(error = %err, "search request rejected");
        }
        AppError {
            status,
            code,
            message: err.to_string(),
        }
    }
}

// ============ GET /health ============

#[derive(Serialize)]
struct HealthResponse {
    status: String,
    version: String,
    rows: usize,
}

async fn handle_health(State(state): State<AppState>) -> Json<HealthResponse> {
    Json(HealthResponse {
        status: "ok".to_string(),
        version: env!("CARGO_PKG_VERSION").to_string(),
        rows: state.searcher.index().len(),
    })
}

// ============ POST /search ============

#[derive(Deserialize)]
struct SearchRequest {
    query: String,
    #[serde(default)]
    top_k: Option<usize>,
}

#[derive(Serialize)]
struct SearchResponse {
    results: Vec<SearchHit>,
    answer: Option<String>,
}

async fn handle_search(
    State(state): State<AppState>,
    payload: Result<Json<SearchRequest>, JsonRejection>,
) -> Result<Json<SearchResponse>, AppError> {
    let Json(request) = payload.map_err(|e| AppError {
        status: StatusCode::BAD_REQUEST,
        code: "bad_request",
        message: e.body_text(),
    })?;
    let top_k = request.top_k.unwrap_or(state.default_top_k);
    tracing::info!(query = %request.query, top_k, "search");

    let results = state.searcher.search(&request.query, top_k).await?;
    let answer = if results.is_empty() {
        None
    } else {
        state.searcher.answer(&request.query, &results).await?
    };

    Ok(Json(SearchResponse { results, answer }))
}
