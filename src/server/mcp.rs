//! JSON-RPC 2.0 over HTTP: the MCP transport.
//!
//! `POST /mcp` carries requests; `initialize` mints a session whose id is
//! echoed in the `Session-Id` response header and required on every later
//! call. `GET /mcp` opens the server-initiated SSE channel (idle unless the
//! server has something to say). `DELETE /mcp` terminates the session.
//! Responses are streamed as SSE or returned as one JSON object according to
//! the `Accept` header.

use std::convert::Infallible;
use std::sync::Arc;

use axum::{
    Json,
    extract::State,
    http::{HeaderMap, StatusCode, header},
    response::{
        IntoResponse, Response,
        sse::{Event, KeepAlive, Sse},
    },
};
use serde::{Deserialize, Serialize};
use serde_json::{Value, json};

use crate::error::SessionError;
use crate::server::AppState;
use crate::server::tools;

pub const SESSION_HEADER: &str = "Session-Id";
const PROTOCOL_VERSION: &str = "2025-06-18";

/// JSON-RPC 2.0 request envelope.
#[derive(Debug, Clone, Deserialize)]
pub struct JsonRpcRequest {
    #[allow(dead_code)]
    pub jsonrpc: String,
    #[serde(default)]
    pub id: Option<Value>,
    pub method: String,
    #[serde(default)]
    pub params: Value,
}

/// JSON-RPC 2.0 response envelope.
#[derive(Debug, Clone, Serialize)]
pub struct JsonRpcResponse {
    pub jsonrpc: &'static str,
    pub id: Value,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub result: Option<Value>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<JsonRpcError>,
}

#[derive(Debug, Clone, Serialize)]
pub struct JsonRpcError {
    pub code: i64,
    pub message: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub data: Option<Value>,
}

pub mod error_codes {
    pub const PARSE_ERROR: i64 = -32700;
    pub const INVALID_REQUEST: i64 = -32600;
    pub const METHOD_NOT_FOUND: i64 = -32601;
    pub const INVALID_PARAMS: i64 = -32602;
    pub const SERVER_ERROR: i64 = -32000;
}

impl JsonRpcResponse {
    pub fn result(id: Value, result: Value) -> Self {
        Self {
            jsonrpc: "2.0",
            id,
            result: Some(result),
            error: None,
        }
    }

    pub fn error(id: Value, code: i64, message: impl Into<String>, data: Option<Value>) -> Self {
        Self {
            jsonrpc: "2.0",
            id,
            result: None,
            error: Some(JsonRpcError {
                code,
                message: message.into(),
                data,
            }),
        }
    }
}

fn session_id_from(headers: &HeaderMap) -> Option<String> {
    headers
        .get(SESSION_HEADER)
        .and_then(|v| v.to_str().ok())
        .map(|s| s.trim().to_string())
        .filter(|s| !s.is_empty())
}

/// True when the client only accepts `text/event-stream`.
fn wants_sse(headers: &HeaderMap) -> bool {
    let accept = headers
        .get(header::ACCEPT)
        .and_then(|v| v.to_str().ok())
        .unwrap_or("*/*");
    accept.contains("text/event-stream")
        && !accept.contains("application/json")
        && !accept.contains("*/*")
}

/// Render the response as SSE or plain JSON per the `Accept` header.
fn respond(
    response: JsonRpcResponse,
    headers: &HeaderMap,
    extra: Option<(&'static str, String)>,
) -> Response {
    if wants_sse(headers) {
        let payload = serde_json::to_string(&response).unwrap_or_default();
        let stream = tokio_stream::once(Ok::<_, Infallible>(
            Event::default().event("message").data(payload),
        ));
        let mut out = Sse::new(stream).into_response();
        if let Some((name, value)) = extra
            && let Ok(value) = value.parse::<axum::http::HeaderValue>()
        {
            out.headers_mut().insert(name, value);
        }
        out
    } else {
        let mut out = Json(response).into_response();
        if let Some((name, value)) = extra
            && let Ok(value) = value.parse::<axum::http::HeaderValue>()
        {
            out.headers_mut().insert(name, value);
        }
        out
    }
}

/// `POST /mcp`: the request path.
pub async fn mcp_post_handler(
    State(state): State<Arc<AppState>>,
    headers: HeaderMap,
    body: String,
) -> Response {
    let request: JsonRpcRequest = match serde_json::from_str(&body) {
        Ok(request) => request,
        Err(e) => {
            let response = JsonRpcResponse::error(
                Value::Null,
                error_codes::PARSE_ERROR,
                format!("invalid JSON-RPC request: {e}"),
                None,
            );
            return (StatusCode::BAD_REQUEST, Json(response)).into_response();
        }
    };
    let id = request.id.clone().unwrap_or(Value::Null);

    // `initialize` mints the session; everything else presents one.
    if request.method == "initialize" {
        return initialize(&state, &headers, request, id).await;
    }

    let Some(session_id) = session_id_from(&headers) else {
        let response = JsonRpcResponse::error(
            id,
            error_codes::INVALID_REQUEST,
            "Session-Id header required; call initialize first",
            None,
        );
        return (StatusCode::BAD_REQUEST, Json(response)).into_response();
    };

    let session = match state.sessions.get(&session_id) {
        Ok(session) => session,
        Err(err) => {
            let (status, message) = match err {
                SessionError::Expired(_) => (StatusCode::NOT_FOUND, "session expired"),
                _ => (StatusCode::NOT_FOUND, "unknown session"),
            };
            let response =
                JsonRpcResponse::error(id, error_codes::INVALID_REQUEST, message, None);
            return (status, Json(response)).into_response();
        }
    };

    // Quota, keyed by session identity.
    let rate_key = session
        .user_id
        .clone()
        .unwrap_or_else(|| session.session_id.clone());
    if let Err(e) = state.limiter.consume(&rate_key).await {
        state.observability.record_rate_limited();
        let response = JsonRpcResponse::error(
            id,
            error_codes::SERVER_ERROR,
            "rate limit exceeded",
            Some(json!({ "detail": e.to_string() })),
        );
        return (StatusCode::TOO_MANY_REQUESTS, Json(response)).into_response();
    }

    let response = match request.method.as_str() {
        "ping" => JsonRpcResponse::result(id, json!({})),
        "tools/list" => JsonRpcResponse::result(id, tools::list_tools()),
        "tools/call" => tools::call_tool(&state, &session, id, request.params).await,
        "resources/list" => JsonRpcResponse::result(
            id,
            json!({ "resources": state.resources.list() }),
        ),
        other => JsonRpcResponse::error(
            id,
            error_codes::METHOD_NOT_FOUND,
            format!("unknown method: {other}"),
            None,
        ),
    };

    if let Err(e) = state.sessions.touch(&session.session_id) {
        tracing::debug!("session touch failed: {e}");
    }
    respond(response, &headers, None)
}

async fn initialize(
    state: &Arc<AppState>,
    headers: &HeaderMap,
    request: JsonRpcRequest,
    id: Value,
) -> Response {
    let user_id = request
        .params
        .get("clientInfo")
        .and_then(|info| info.get("name"))
        .and_then(Value::as_str)
        .map(String::from);

    let session_id = state.sessions.create(user_id.as_deref());
    let result = json!({
        "protocolVersion": PROTOCOL_VERSION,
        "serverInfo": {
            "name": "censusgate",
            "version": env!("CARGO_PKG_VERSION"),
        },
        "capabilities": {
            "tools": {},
            "resources": {},
        },
        "sessionId": session_id,
    });
    respond(
        JsonRpcResponse::result(id, result),
        headers,
        Some((SESSION_HEADER, session_id)),
    )
}

/// `GET /mcp`: server-initiated SSE channel. Idle keepalive unless the
/// server has messages for the client.
pub async fn mcp_sse_handler(
    State(state): State<Arc<AppState>>,
    headers: HeaderMap,
) -> Response {
    let Some(session_id) = session_id_from(&headers) else {
        return (StatusCode::BAD_REQUEST, "Session-Id header required").into_response();
    };
    if state.sessions.get(&session_id).is_err() {
        return (StatusCode::NOT_FOUND, "unknown session").into_response();
    }

    let stream = tokio_stream::pending::<Result<Event, Infallible>>();
    Sse::new(stream)
        .keep_alive(KeepAlive::default())
        .into_response()
}

/// `DELETE /mcp`: explicit session termination.
pub async fn mcp_delete_handler(
    State(state): State<Arc<AppState>>,
    headers: HeaderMap,
) -> Response {
    let Some(session_id) = session_id_from(&headers) else {
        return (
            StatusCode::BAD_REQUEST,
            Json(json!({ "error": "Session-Id header required" })),
        )
            .into_response();
    };
    match state.sessions.terminate(&session_id) {
        Ok(()) => (StatusCode::OK, Json(json!({ "terminated": true }))).into_response(),
        Err(_) => (
            StatusCode::NOT_FOUND,
            Json(json!({ "error": "unknown session" })),
        )
            .into_response(),
    }
}
