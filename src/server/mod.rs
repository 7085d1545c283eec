//! The protocol server: JSON-RPC over HTTP for MCP-compatible clients, the
//! browser facade, and operational surfaces.

pub mod api;
pub mod mcp;
pub mod resources;
pub mod tools;

use std::net::SocketAddr;
use std::sync::Arc;

use axum::{
    Router,
    http::{HeaderValue, Method},
    routing::{get, post},
};
use tower_http::cors::{AllowHeaders, AllowOrigin, CorsLayer};
use tower_http::trace::TraceLayer;

use crate::breaker::CircuitBreaker;
use crate::catalog::SchemaCatalog;
use crate::config::ServerConfig;
use crate::db::FreshnessTracker;
use crate::error::ServerError;
use crate::observability::Observability;
use crate::pipeline::QueryPipeline;
use crate::ratelimit::RateLimiter;
use crate::session::SessionManager;
use resources::UiResources;

/// Shared state for all protocol handlers; the composition root builds one
/// and hands it to `start_server`.
pub struct AppState {
    pub pipeline: Arc<QueryPipeline>,
    pub catalog: Arc<SchemaCatalog>,
    pub sessions: Arc<SessionManager>,
    pub limiter: Arc<RateLimiter>,
    pub observability: Arc<Observability>,
    pub freshness: Arc<FreshnessTracker>,
    pub llm_breaker: Arc<CircuitBreaker>,
    pub resources: Arc<UiResources>,
}

/// Assemble the router over the shared state.
pub fn build_router(state: Arc<AppState>, config: &ServerConfig) -> Router {
    let router = Router::new()
        .route(
            "/mcp",
            post(mcp::mcp_post_handler)
                .get(mcp::mcp_sse_handler)
                .delete(mcp::mcp_delete_handler),
        )
        .route("/api/v1/queries", post(api::queries_handler))
        .route("/api/v1/mcp/resources", get(api::resources_handler))
        .route("/health", get(api::health_handler))
        .route("/metrics", get(api::metrics_handler))
        .layer(TraceLayer::new_for_http())
        .with_state(state);

    match cors_layer(config) {
        Some(cors) => router.layer(cors),
        None => router,
    }
}

fn cors_layer(config: &ServerConfig) -> Option<CorsLayer> {
    if config.cors_allow_origin.is_empty() {
        return None;
    }
    let origins: Vec<HeaderValue> = config
        .cors_allow_origin
        .iter()
        .filter_map(|origin| origin.parse().ok())
        .collect();
    Some(
        CorsLayer::new()
            .allow_origin(AllowOrigin::list(origins))
            .allow_methods([Method::GET, Method::POST, Method::DELETE])
            .allow_headers(AllowHeaders::mirror_request()),
    )
}

/// Bind and serve. Returns the bound address (useful with port 0) and the
/// join handle of the serving task.
pub async fn start_server(
    addr: SocketAddr,
    state: Arc<AppState>,
    config: &ServerConfig,
) -> Result<(SocketAddr, tokio::task::JoinHandle<()>), ServerError> {
    let listener =
        tokio::net::TcpListener::bind(addr)
            .await
            .map_err(|e| ServerError::BindFailed {
                addr: addr.to_string(),
                reason: e.to_string(),
            })?;
    let bound_addr = listener
        .local_addr()
        .map_err(|e| ServerError::BindFailed {
            addr: addr.to_string(),
            reason: format!("failed to read local addr: {e}"),
        })?;

    let router = build_router(state, config);
    let handle = tokio::spawn(async move {
        if let Err(e) = axum::serve(listener, router).await {
            tracing::error!("server exited with error: {e}");
        }
    });

    tracing::info!(%bound_addr, "protocol server listening");
    Ok((bound_addr, handle))
}
