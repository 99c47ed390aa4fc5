//! Deployment query endpoints consumed by monitoring systems.

use axum::Json;
use axum::extract::{Path, State};
use serde::Deserialize;

use soma_lifecycle::{assemble_host_bundle, feedback, host_bundle, list_instances, pull};
use soma_state::FeedbackResult;

use crate::ApiState;
use crate::response::{ApiError, ApiResponse, ApiResult};

/// GET /deployments/id/{id}
pub async fn get_deployment(State(state): State<ApiState>, Path(id): Path<String>) -> ApiResult {
    Ok(ApiResponse::ok(pull(&state.store, &id)?))
}

/// PATCH /deployments/id/{id}/{result}
pub async fn update_deployment(
    State(state): State<ApiState>,
    Path((id, result)): Path<(String, String)>,
) -> ApiResult {
    let result: FeedbackResult = result.parse().map_err(ApiError::bad_request)?;
    Ok(ApiResponse::ok(feedback(&state.store, &id, result)?))
}

/// GET /deployments/monitoring/{id}
pub async fn list_pending(State(state): State<ApiState>, Path(id): Path<String>) -> ApiResult {
    Ok(ApiResponse::ok(list_instances(&state.store, &id, false)?))
}

/// GET /deployments/monitoring/{id}/all
pub async fn list_all(State(state): State<ApiState>, Path(id): Path<String>) -> ApiResult {
    Ok(ApiResponse::ok(list_instances(&state.store, &id, true)?))
}

fn parse_asset_id(raw: &str) -> Result<u64, ApiError> {
    raw.parse()
        .map_err(|_| ApiError::bad_request(format!("invalid asset id: {raw}")))
}

/// GET /deployments/host/{system}/{asset_id}
pub async fn get_host(
    State(state): State<ApiState>,
    Path((system, asset_id)): Path<(String, String)>,
) -> ApiResult {
    let asset_id = parse_asset_id(&asset_id)?;
    Ok(ApiResponse::ok(host_bundle(&state.store, &system, asset_id)?))
}

#[derive(Debug, Default, Deserialize)]
pub struct AssembleRequest {
    /// Instance ids the host currently has deployed.
    #[serde(default)]
    pub known: Vec<String>,
}

/// POST /deployments/host/{system}/{asset_id}
pub async fn assemble_host(
    State(state): State<ApiState>,
    Path((system, asset_id)): Path<(String, String)>,
    Json(req): Json<AssembleRequest>,
) -> ApiResult {
    let asset_id = parse_asset_id(&asset_id)?;
    Ok(ApiResponse::ok(assemble_host_bundle(
        &state.store,
        &system,
        asset_id,
        &req.known,
    )?))
}
