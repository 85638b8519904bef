//! Saga branch endpoints for deducting and restoring order stock.
//!
//! The coordinator posts the same body to both endpoints and identifies the
//! branch through the `x-saga-gid` and `x-saga-branch-id` headers. Without
//! them the call runs outside the barrier, guarded only by the ledger.

use std::sync::Arc;

use axum::Json;
use axum::extract::State;
use axum::http::HeaderMap;
use common::{BranchOp, ErrorClassification, Metadata, OrderId, RequestContext, SagaBranch, headers};
use inventory::{DeductionOutcome, InventoryDeducted};
use serde::Serialize;
use storage::Storage;

use crate::AppState;
use crate::error::ApiError;

pub const SAGA_GID: &str = "x-saga-gid";
pub const SAGA_BRANCH_ID: &str = "x-saga-branch-id";

const FORWARDED: [&str; 3] = [headers::TRACE_ID, headers::TRACEPARENT, headers::EVENT_ID];

#[derive(Debug, Serialize)]
pub struct DeductionResponse {
    pub order_id: OrderId,
    pub outcome: &'static str,
}

/// POST /inventory/deduct — saga action.
pub async fn deduct<S: Storage + Clone>(
    State(state): State<Arc<AppState<S>>>,
    request_headers: HeaderMap,
    Json(body): Json<InventoryDeducted>,
) -> Result<Json<DeductionResponse>, ApiError> {
    let ctx = request_context(&request_headers, BranchOp::Action)?;
    let mut request = state.pool.acquire();
    request.fill_from_deducted(&body)?;
    let result = state.orchestrator.deduct_inventory(&ctx, &request).await;
    count_branch(BranchOp::Action, &result);
    Ok(respond(body.order_id, result?))
}

/// POST /inventory/deduct/revert — saga compensation.
pub async fn revert<S: Storage + Clone>(
    State(state): State<Arc<AppState<S>>>,
    request_headers: HeaderMap,
    Json(body): Json<InventoryDeducted>,
) -> Result<Json<DeductionResponse>, ApiError> {
    let ctx = request_context(&request_headers, BranchOp::Compensate)?;
    let mut request = state.pool.acquire();
    request.fill_from_deducted(&body)?;
    let result = state
        .orchestrator
        .deduct_inventory_revert(&ctx, &request)
        .await;
    count_branch(BranchOp::Compensate, &result);
    Ok(respond(body.order_id, result?))
}

fn count_branch<T, E: ErrorClassification>(op: BranchOp, result: &Result<T, E>) {
    let status = match result {
        Ok(_) => "ok",
        Err(err) if err.is_terminal() => "rejected",
        Err(_) => "failed",
    };
    metrics::counter!("inventory_branch_requests_total", "op" => op.as_str(), "status" => status)
        .increment(1);
}

fn respond(order_id: OrderId, outcome: DeductionOutcome) -> Json<DeductionResponse> {
    Json(DeductionResponse {
        order_id,
        outcome: outcome.as_str(),
    })
}

fn request_context(request_headers: &HeaderMap, op: BranchOp) -> Result<RequestContext, ApiError> {
    let metadata: Metadata = FORWARDED
        .iter()
        .filter_map(|name| header(request_headers, name).map(|value| (*name, value)))
        .collect();
    let ctx = RequestContext::from_metadata(metadata);

    match (
        header(request_headers, SAGA_GID),
        header(request_headers, SAGA_BRANCH_ID),
    ) {
        (Some(gid), Some(branch_id)) => Ok(ctx.with_saga_branch(SagaBranch::new(gid, branch_id, op))),
        (None, None) => Ok(ctx),
        _ => Err(ApiError::BadRequest(format!(
            "{SAGA_GID} and {SAGA_BRANCH_ID} must be sent together"
        ))),
    }
}

fn header<'a>(request_headers: &'a HeaderMap, name: &str) -> Option<&'a str> {
    request_headers
        .get(name)
        .and_then(|value| value.to_str().ok())
        .map(str::trim)
        .filter(|value| !value.is_empty())
}
