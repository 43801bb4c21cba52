//! `GET /health` — liveness plus the state of the two startup-critical
//! dependencies: the state directory and the credential vault key.

use axum::extract::State;
use axum::http::StatusCode;
use axum::response::{IntoResponse, Json};
use serde_json::json;

use crate::state::AppState;

pub async fn health(State(state): State<AppState>) -> impl IntoResponse {
    let state_dir = std::path::Path::new(&state.config.state.dir);
    let state_dir_ok = state_dir.is_dir()
        && std::fs::metadata(state_dir)
            .map(|m| !m.permissions().readonly())
            .unwrap_or(false);
    let vault_ok = state.vault.is_unlocked();

    let healthy = state_dir_ok;
    let body = json!({
        "status": if healthy { "ok" } else { "unavailable" },
        "environment": state.config.environment,
        "state_dir": if state_dir_ok { "ok" } else { "unwritable" },
        "vault": if vault_ok { "unlocked" } else { "locked" },
    });

    if healthy {
        (StatusCode::OK, Json(body)).into_response()
    } else {
        (StatusCode::SERVICE_UNAVAILABLE, Json(body)).into_response()
    }
}
