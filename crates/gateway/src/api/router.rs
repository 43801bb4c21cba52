//! Axum router: `/health`, `/metrics`, and `POST /mcp` (one JSON-RPC
//! message per request body; SSE subscription streaming is the transport
//! layer's concern and rides on `AppState::resource_events`).

use std::sync::Arc;

use axum::extract::State;
use axum::http::{HeaderMap, StatusCode};
use axum::response::IntoResponse;
use axum::routing::{get, post};
use axum::Router;
use metrics_exporter_prometheus::PrometheusHandle;
use tower_http::trace::TraceLayer;

use crate::api::health::health;
use crate::mcp::catalog::{Identity, Role};
use crate::mcp::service::McpService;
use crate::state::AppState;

#[derive(Clone)]
pub struct HttpState {
    pub app: AppState,
    pub mcp: Arc<McpService>,
    pub metrics: PrometheusHandle,
}

pub fn build_router(state: HttpState) -> Router {
    Router::new()
        .route("/health", get(health_handler))
        .route("/metrics", get(metrics_handler))
        .route("/mcp", post(mcp_handler))
        .layer(TraceLayer::new_for_http())
        .with_state(state)
}

async fn health_handler(State(state): State<HttpState>) -> impl IntoResponse {
    health(State(state.app.clone())).await
}

async fn metrics_handler(State(state): State<HttpState>) -> impl IntoResponse {
    state.metrics.render()
}

/// Identity is injected by the fronting auth layer (OIDC verification is an
/// external collaborator); absent headers degrade to a read-only viewer.
fn identity_from_headers(headers: &HeaderMap) -> Identity {
    let subject = headers
        .get("x-fleetgate-subject")
        .and_then(|v| v.to_str().ok())
        .unwrap_or("anonymous")
        .to_string();
    let role = headers
        .get("x-fleetgate-role")
        .and_then(|v| v.to_str().ok())
        .and_then(Role::parse)
        .unwrap_or(Role::Viewer);
    Identity { subject, role }
}

async fn mcp_handler(
    State(state): State<HttpState>,
    headers: HeaderMap,
    body: String,
) -> impl IntoResponse {
    let identity = identity_from_headers(&headers);
    match state.mcp.handle_message(&body, identity).await {
        Some(response) => (
            StatusCode::OK,
            [("content-type", "application/json")],
            response,
        )
            .into_response(),
        // Notification: acknowledged with no body.
        None => StatusCode::ACCEPTED.into_response(),
    }
}
