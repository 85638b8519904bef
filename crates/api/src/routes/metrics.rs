//! Scrape endpoint for the deduction and messaging counters.

use axum::Router;
use axum::extract::State;
use axum::http::header::CONTENT_TYPE;
use axum::response::IntoResponse;
use axum::routing::get;
use metrics_exporter_prometheus::PrometheusHandle;

const EXPOSITION_FORMAT: &str = "text/plain; version=0.0.4; charset=utf-8";

/// `/metrics`, carrying its own state so it merges into any app router.
pub fn router<S>(handle: PrometheusHandle) -> Router<S>
where
    S: Clone + Send + Sync + 'static,
{
    Router::new().route("/metrics", get(scrape)).with_state(handle)
}

/// The recorder is installed without an upkeep task, so histogram samples
/// are folded in here before rendering.
async fn scrape(State(handle): State<PrometheusHandle>) -> impl IntoResponse {
    handle.run_upkeep();
    ([(CONTENT_TYPE, EXPOSITION_FORMAT)], handle.render())
}
