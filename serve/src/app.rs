//! Axum app: state, router, and the control-plane handlers.

use std::convert::Infallible;
use std::sync::Arc;

use axum::{
    extract::{Path, Query, State},
    http::StatusCode,
    response::sse::{Event, KeepAlive, Sse},
    response::{IntoResponse, Response},
    routing::{delete, get, post},
    Json, Router,
};
use futures::{Stream, StreamExt};
use serde::{Deserialize, Serialize};
use serde_json::json;

use conveyor::runner::{RunnerError, StartRequest};
use conveyor::settings::CheckpointerType;
use conveyor::{pipeline_diagram, Runner};

pub fn router(runner: Arc<Runner>) -> Router {
    Router::new()
        .route("/orchestrator/pipeline/start", post(start_pipeline))
        .route("/orchestrator/pipeline/status/:thread_id", get(get_status))
        .route(
            "/orchestrator/pipeline/history/:thread_id",
            get(get_history),
        )
        .route("/orchestrator/pipeline/resume", post(resume_pipeline))
        .route(
            "/orchestrator/pipeline/cancel/:thread_id",
            delete(cancel_pipeline),
        )
        .route(
            "/orchestrator/pipeline/stream/:connector_name",
            get(stream_pipeline),
        )
        .route("/orchestrator/pipeline/diagram", get(get_diagram))
        .route("/orchestrator/pipelines/active", get(list_active))
        .route("/orchestrator/health", get(health))
        .with_state(runner)
}

/// Maps runner errors onto conventional status codes.
struct ApiError(RunnerError);

impl From<RunnerError> for ApiError {
    fn from(e: RunnerError) -> Self {
        Self(e)
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let status = match &self.0 {
            RunnerError::Validation(_) => StatusCode::BAD_REQUEST,
            RunnerError::ResourceExhausted(_) => StatusCode::TOO_MANY_REQUESTS,
            RunnerError::UnknownThread(_) => StatusCode::NOT_FOUND,
            RunnerError::Internal(_) => StatusCode::INTERNAL_SERVER_ERROR,
        };
        (status, Json(json!({ "detail": self.0.to_string() }))).into_response()
    }
}

#[derive(Serialize)]
struct PipelineResponse {
    thread_id: String,
    status: String,
    message: String,
    poll_url: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    stream_url: Option<String>,
}

async fn start_pipeline(
    State(runner): State<Arc<Runner>>,
    Json(request): Json<StartRequest>,
) -> Result<Json<PipelineResponse>, ApiError> {
    let connector_name = request.connector_name.clone();
    let thread_id = runner.start(request)?;
    Ok(Json(PipelineResponse {
        poll_url: format!("/orchestrator/pipeline/status/{thread_id}"),
        stream_url: Some(format!("/orchestrator/pipeline/stream/{connector_name}")),
        message: format!("Pipeline started for {connector_name}"),
        status: "started".into(),
        thread_id,
    }))
}

async fn get_status(
    State(runner): State<Arc<Runner>>,
    Path(thread_id): Path<String>,
) -> Result<Response, ApiError> {
    let report = runner.status(&thread_id).await?;
    Ok(Json(report).into_response())
}

async fn get_history(
    State(runner): State<Arc<Runner>>,
    Path(thread_id): Path<String>,
) -> Result<Response, ApiError> {
    let report = runner.history(&thread_id).await?;
    Ok(Json(report).into_response())
}

#[derive(Deserialize)]
struct ResumeRequest {
    thread_id: String,
}

async fn resume_pipeline(
    State(runner): State<Arc<Runner>>,
    Json(request): Json<ResumeRequest>,
) -> Result<Json<PipelineResponse>, ApiError> {
    runner.resume(&request.thread_id).await?;
    Ok(Json(PipelineResponse {
        poll_url: format!("/orchestrator/pipeline/status/{}", request.thread_id),
        stream_url: None,
        message: "Resuming pipeline from checkpoint".into(),
        status: "resuming".into(),
        thread_id: request.thread_id,
    }))
}

async fn cancel_pipeline(
    State(runner): State<Arc<Runner>>,
    Path(thread_id): Path<String>,
) -> Result<Response, ApiError> {
    runner.cancel(&thread_id)?;
    Ok(Json(json!({
        "thread_id": thread_id,
        "status": "cancelled",
        "message": "Pipeline cancelled successfully",
    }))
    .into_response())
}

#[derive(Deserialize)]
struct StreamParams {
    #[serde(default)]
    connector_type: Option<String>,
    #[serde(default)]
    api_doc_url: Option<String>,
}

async fn stream_pipeline(
    State(runner): State<Arc<Runner>>,
    Path(connector_name): Path<String>,
    Query(params): Query<StreamParams>,
) -> Result<Sse<impl Stream<Item = Result<Event, Infallible>>>, ApiError> {
    let events = runner.stream_events(StartRequest {
        connector_name,
        connector_type: params.connector_type,
        api_doc_url: params.api_doc_url,
        original_request: None,
    })?;
    let stream = events.map(|event| {
        Ok(Event::default()
            .json_data(&event)
            .unwrap_or_else(|_| Event::default().data("serialization error")))
    });
    Ok(Sse::new(stream).keep_alive(KeepAlive::default()))
}

async fn get_diagram() -> Json<serde_json::Value> {
    Json(json!({
        "format": "mermaid",
        "diagram": pipeline_diagram(),
    }))
}

async fn list_active(State(runner): State<Arc<Runner>>) -> Json<serde_json::Value> {
    let runs = runner.active_runs();
    Json(json!({
        "count": runs.len(),
        "pipelines": runs,
    }))
}

async fn health(State(runner): State<Arc<Runner>>) -> Json<serde_json::Value> {
    let settings = runner.settings();
    let sqlite_path = match settings.checkpointer_type {
        CheckpointerType::Sqlite => Some(settings.sqlite_db_path.clone()),
        _ => None,
    };
    Json(json!({
        "status": "healthy",
        "timestamp": chrono::Utc::now().to_rfc3339(),
        "version": env!("CARGO_PKG_VERSION"),
        "checkpointer": {
            "type": settings.checkpointer_type.as_str(),
            "path": sqlite_path,
        },
        "limits": {
            "max_test_retries": settings.retry_limits.max_test_retries,
            "max_gen_fix_retries": settings.retry_limits.max_gen_fix_retries,
            "max_review_retries": settings.retry_limits.max_review_retries,
            "max_research_retries": settings.retry_limits.max_research_retries,
            "max_concurrent_pipelines": settings.max_concurrent_pipelines,
            "pipeline_timeout_seconds": settings.pipeline_timeout.as_secs(),
        },
        "active_pipelines": runner.active_pipelines(),
    }))
}
