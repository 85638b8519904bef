//! Liveness and readiness probes.

use std::sync::Arc;

use axum::Json;
use axum::extract::State;
use serde::Serialize;
use storage::Storage;

use crate::AppState;
use crate::error::ApiError;

#[derive(Serialize)]
pub struct HealthResponse {
    pub status: &'static str,
}

/// GET /healthz — the process is up.
pub async fn check() -> Json<HealthResponse> {
    Json(HealthResponse { status: "ok" })
}

/// GET /ready — storage answers and the lock backend is reachable.
pub async fn ready<S: Storage + Clone>(
    State(state): State<Arc<AppState<S>>>,
) -> Result<Json<HealthResponse>, ApiError> {
    state.orchestrator.storage().ping().await?;
    state.locks.check_health().await?;
    Ok(Json(HealthResponse { status: "ready" }))
}
