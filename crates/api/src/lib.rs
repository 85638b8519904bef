//! HTTP service hosting the inventory deduction orchestrator.
//!
//! Exposes the saga branch endpoints, liveness and readiness probes, and
//! Prometheus metrics, with request tracing through `tower-http`.

pub mod config;
pub mod error;
pub mod routes;

use std::sync::Arc;

use axum::Router;
use axum::routing::{get, post};
use inventory::{InventoryOrchestrator, RequestPool};
use lock::LockManager;
use metrics_exporter_prometheus::PrometheusHandle;
use storage::Storage;
use tower_http::cors::{Any, CorsLayer};
use tower_http::trace::TraceLayer;

/// Shared state behind every stateful route.
pub struct AppState<S> {
    pub orchestrator: Arc<InventoryOrchestrator<S>>,
    pub locks: Arc<dyn LockManager>,
    pub pool: Arc<RequestPool>,
}

impl<S> AppState<S> {
    pub fn new(
        orchestrator: Arc<InventoryOrchestrator<S>>,
        locks: Arc<dyn LockManager>,
        pool: Arc<RequestPool>,
    ) -> Arc<Self> {
        Arc::new(Self {
            orchestrator,
            locks,
            pool,
        })
    }
}

/// Creates the Axum application router with all routes and shared state.
pub fn create_app<S: Storage + Clone>(
    state: Arc<AppState<S>>,
    metrics_handle: PrometheusHandle,
) -> Router {
    Router::new()
        .route("/healthz", get(routes::health::check))
        .route("/ready", get(routes::health::ready::<S>))
        .route("/inventory/deduct", post(routes::inventory::deduct::<S>))
        .route(
            "/inventory/deduct/revert",
            post(routes::inventory::revert::<S>),
        )
        .with_state(state)
        .merge(routes::metrics::router(metrics_handle))
        .layer(
            CorsLayer::new()
                .allow_origin(Any)
                .allow_methods(Any)
                .allow_headers(Any),
        )
        .layer(TraceLayer::new_for_http())
}
