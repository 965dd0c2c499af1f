//! REST API for the RLM engine
//!
//! `POST /execute` streams the live execution event feed as NDJSON, one
//! event per line, ending after the terminal event. `POST /query` is the
//! blocking convenience wrapper that folds the same feed internally and
//! returns only the outcome.

use crate::executor::{ExecutionRequest, Executor};
use crate::tree::{CollectingSink, EventSink, TreeState};
use axum::{
    body::Body,
    extract::State,
    http::{header, StatusCode},
    response::{IntoResponse, Response},
    routing::{get, post},
    Json, Router,
};
use serde::Serialize;
use std::convert::Infallible;
use std::sync::Arc;
use tokio_stream::wrappers::UnboundedReceiverStream;
use tokio_stream::StreamExt;
use tokio_util::sync::CancellationToken;
use tower_http::cors::CorsLayer;
use tower_http::trace::TraceLayer;

/// API state
pub struct ApiState {
    pub executor: Arc<Executor>,
    pub model: String,
}

/// Health check response
#[derive(Debug, Serialize)]
pub struct HealthResponse {
    pub status: String,
    pub version: String,
    pub model: String,
}

/// Response from the blocking query endpoint
#[derive(Debug, Serialize)]
pub struct QueryResponse {
    pub success: bool,
    pub answer: Option<String>,
    pub error: Option<String>,
    /// Total nodes in the finished execution tree
    pub nodes: usize,
}

/// Create the API router
pub fn create_router(state: Arc<ApiState>) -> Router {
    Router::new()
        .route("/health", get(health_check))
        .route("/execute", post(execute_stream))
        .route("/query", post(process_query))
        .layer(CorsLayer::permissive())
        .layer(TraceLayer::new_for_http())
        .with_state(state)
}

async fn health_check(State(state): State<Arc<ApiState>>) -> Json<HealthResponse> {
    Json(HealthResponse {
        status: "healthy".to_string(),
        version: env!("CARGO_PKG_VERSION").to_string(),
        model: state.model.clone(),
    })
}

/// Stream execution events as NDJSON.
///
/// Dropping the response body (client disconnect) cancels the underlying
/// execution through the token guard captured by the stream.
async fn execute_stream(
    State(state): State<Arc<ApiState>>,
    Json(request): Json<ExecutionRequest>,
) -> Response {
    let cancel = CancellationToken::new();
    let guard = cancel.clone().drop_guard();

    let events = state.executor.execute_with_delegation(request, cancel);
    let stream = UnboundedReceiverStream::new(events).map(move |event| {
        let _hold = &guard;
        let mut line =
            serde_json::to_string(&event).unwrap_or_else(|_| "{}".to_string());
        line.push('\n');
        Ok::<_, Infallible>(line)
    });

    (
        [(header::CONTENT_TYPE, "application/x-ndjson")],
        Body::from_stream(stream),
    )
        .into_response()
}

/// Run a query to completion and return only the outcome.
async fn process_query(
    State(state): State<Arc<ApiState>>,
    Json(request): Json<ExecutionRequest>,
) -> Result<Json<QueryResponse>, (StatusCode, String)> {
    let sink = Arc::new(CollectingSink::new());
    let result = state
        .executor
        .execute(
            request,
            sink.clone() as Arc<dyn EventSink>,
            CancellationToken::new(),
        )
        .await;

    let tree = TreeState::fold(sink.events().iter());
    match result {
        Ok(answer) => Ok(Json(QueryResponse {
            success: true,
            answer: Some(answer),
            error: None,
            nodes: tree.nodes.len(),
        })),
        Err(e) => Ok(Json(QueryResponse {
            success: false,
            answer: None,
            error: Some(e.to_string()),
            nodes: tree.nodes.len(),
        })),
    }
}
