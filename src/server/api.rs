//! Browser-facing facade and operational endpoints.

use std::sync::Arc;

use axum::{
    Json,
    extract::State,
    http::{StatusCode, header},
    response::{IntoResponse, Response},
};
use serde::Deserialize;
use serde_json::json;

use crate::error::ErrorKind;
use crate::pipeline::RunContext;
use crate::server::AppState;

#[derive(Debug, Deserialize)]
pub struct QueryRequest {
    pub question: String,
}

/// `POST /api/v1/queries`: run the natural-language pipeline and flatten the
/// response for browser clients.
pub async fn queries_handler(
    State(state): State<Arc<AppState>>,
    Json(request): Json<QueryRequest>,
) -> Response {
    if request.question.trim().is_empty() {
        return (
            StatusCode::BAD_REQUEST,
            Json(json!({ "success": false, "error": { "kind": "INVALID_REQUEST", "message": "question must not be empty" } })),
        )
            .into_response();
    }

    if let Err(e) = state.limiter.consume("api").await {
        state.observability.record_rate_limited();
        return (
            StatusCode::TOO_MANY_REQUESTS,
            Json(json!({ "success": false, "error": { "kind": "RATE_LIMITED", "message": e.to_string() } })),
        )
            .into_response();
    }

    let result = state
        .pipeline
        .run_question(&request.question, &RunContext::default())
        .await;

    if result.success {
        let body = json!({
            "success": true,
            "data": result.rows,
            "metadata": result.metadata,
            "explanation": result.explanation,
            "correlationId": result.correlation_id,
        });
        return (StatusCode::OK, Json(body)).into_response();
    }

    let status = match result.error.as_ref().map(|e| e.kind) {
        Some(ErrorKind::TranslationUnavailable) | Some(ErrorKind::ServiceUnavailable) => {
            StatusCode::SERVICE_UNAVAILABLE
        }
        Some(ErrorKind::RateLimited) => StatusCode::TOO_MANY_REQUESTS,
        Some(ErrorKind::Internal) => StatusCode::INTERNAL_SERVER_ERROR,
        // User-correctable outcomes flow back as 200 with success=false.
        _ => StatusCode::OK,
    };
    let suggested = result
        .error
        .as_ref()
        .and_then(|e| e.suggested_refinements.clone());
    let body = json!({
        "success": false,
        "error": result.error,
        "rejections": result.rejections,
        "suggestedRefinements": suggested,
        "correlationId": result.correlation_id,
    });
    (status, Json(body)).into_response()
}

/// `GET /health`: 200 while serving, 503 when the error rate is critical.
pub async fn health_handler(State(state): State<Arc<AppState>>) -> Response {
    let health = state.observability.health();
    let pool = state.pipeline.executor().pool().health();
    let sessions = state.sessions.stats();
    let breaker = state.llm_breaker.snapshot();

    let status = if health.status.is_serving() {
        StatusCode::OK
    } else {
        StatusCode::SERVICE_UNAVAILABLE
    };
    let body = json!({
        "status": health.status,
        "errorRate": health.error_rate,
        "sampledOperations": health.sampled_operations,
        "pool": pool,
        "sessions": sessions,
        "translator": breaker,
    });
    (status, Json(body)).into_response()
}

/// `GET /metrics`: prometheus text exposition.
pub async fn metrics_handler(State(state): State<Arc<AppState>>) -> Response {
    let body = state.observability.render_metrics();
    (
        StatusCode::OK,
        [(header::CONTENT_TYPE, "text/plain; version=0.0.4")],
        body,
    )
        .into_response()
}

/// `GET /api/v1/mcp/resources`: list UI resource bundles.
pub async fn resources_handler(State(state): State<Arc<AppState>>) -> Response {
    let resources: Vec<_> = state
        .resources
        .list()
        .iter()
        .map(|r| json!({ "uri": r.uri, "name": r.name, "html": r.html }))
        .collect();
    (StatusCode::OK, Json(json!({ "resources": resources }))).into_response()
}
