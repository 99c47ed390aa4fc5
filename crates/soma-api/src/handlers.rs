//! Handlers for repositories, request admission, the job ledger and the
//! external collaborators the lifecycle engine reads.

use axum::Json;
use axum::extract::{Path, Query, State};
use axum::http::StatusCode;
use serde::{Deserialize, Serialize};
use tracing::info;

use soma_guidepost::AdmissionRequest;
use soma_state::{Capability, Job, MonitoringSystem, Repository, epoch_secs};

use crate::ApiState;
use crate::response::{ApiError, ApiResponse, ApiResult};

fn new_id(id: Option<String>) -> String {
    id.filter(|id| !id.is_empty())
        .unwrap_or_else(|| uuid::Uuid::new_v4().to_string())
}

fn require_field(name: &str, value: &str) -> Result<(), ApiError> {
    if value.trim().is_empty() {
        return Err(ApiError::bad_request(format!("{name} must not be empty")));
    }
    Ok(())
}

// ── Repositories ───────────────────────────────────────────────

#[derive(Debug, Deserialize)]
pub struct CreateRepository {
    pub id: Option<String>,
    pub name: String,
    #[serde(default)]
    pub team_id: String,
}

/// POST /repositories
pub async fn create_repository(
    State(state): State<ApiState>,
    Json(req): Json<CreateRepository>,
) -> ApiResult {
    require_field("name", &req.name)?;
    let repository = Repository {
        id: new_id(req.id),
        name: req.name,
        team_id: req.team_id,
        created_at: epoch_secs(),
    };
    state.store.insert_repository(&repository)?;
    state.supervisor.register(&repository.id).await;
    info!(repository_id = %repository.id, name = %repository.name, "repository created");
    Ok(ApiResponse::with_status(StatusCode::CREATED, repository, None))
}

/// GET /repositories
pub async fn list_repositories(State(state): State<ApiState>) -> ApiResult {
    Ok(ApiResponse::ok(state.store.list::<Repository>()?))
}

/// GET /repositories/{id}/keeper
pub async fn keeper_status(State(state): State<ApiState>, Path(id): Path<String>) -> ApiResult {
    let handle = state
        .supervisor
        .handle(&id)
        .await
        .ok_or_else(|| ApiError::not_found(format!("no tree keeper for repository {id}")))?;
    Ok(ApiResponse::ok(handle.status()))
}

// ── Requests and jobs ──────────────────────────────────────────

#[derive(Debug, Default, Deserialize)]
pub struct AdmitQuery {
    /// Wait for the keeper to execute the job before answering.
    #[serde(default)]
    pub wait: bool,
}

#[derive(Debug, Serialize)]
struct Admitted {
    job_id: String,
    repository_id: String,
}

/// POST /requests
pub async fn submit_request(
    State(state): State<ApiState>,
    Query(query): Query<AdmitQuery>,
    Json(req): Json<AdmissionRequest>,
) -> ApiResult {
    let admission = state.guidepost.admit(req).await?;
    let job_id = admission.job_id.clone();

    if !query.wait {
        let admitted = Admitted {
            job_id: admission.job_id,
            repository_id: admission.repository_id,
        };
        return Ok(ApiResponse::with_status(
            StatusCode::ACCEPTED,
            admitted,
            Some(job_id),
        ));
    }

    match admission.completion.await {
        Ok(Ok(report)) => Ok(ApiResponse::with_status(StatusCode::OK, report, Some(job_id))),
        Ok(Err(e)) => Err(ApiError::from(e).with_job(&job_id)),
        Err(_) => Err(ApiError::new(
            StatusCode::INTERNAL_SERVER_ERROR,
            "tree keeper stopped before answering",
        )
        .with_job(&job_id)),
    }
}

/// GET /jobs/{id}
pub async fn get_job(State(state): State<ApiState>, Path(id): Path<String>) -> ApiResult {
    let job = state
        .store
        .get::<Job>(&id)?
        .ok_or_else(|| ApiError::not_found(format!("job {id}")))?;
    Ok(ApiResponse::with_status(StatusCode::OK, job, Some(id)))
}

// ── Monitoring systems and capabilities ────────────────────────

#[derive(Debug, Deserialize)]
pub struct CreateMonitoringSystem {
    pub id: Option<String>,
    pub name: String,
    #[serde(default)]
    pub mode: String,
    #[serde(default)]
    pub contact: String,
    #[serde(default)]
    pub team_id: String,
    pub callback: Option<String>,
}

/// POST /monitoring-systems
pub async fn create_monitoring_system(
    State(state): State<ApiState>,
    Json(req): Json<CreateMonitoringSystem>,
) -> ApiResult {
    require_field("name", &req.name)?;
    let system = MonitoringSystem {
        id: new_id(req.id),
        name: req.name,
        mode: req.mode,
        contact: req.contact,
        team_id: req.team_id,
        callback: req.callback.filter(|uri| !uri.trim().is_empty()),
    };
    if state.store.get::<MonitoringSystem>(&system.id)?.is_some() {
        return Err(ApiError::new(
            StatusCode::CONFLICT,
            format!("monitoring system {} already exists", system.id),
        ));
    }
    state.store.put(&system)?;
    info!(monitoring_id = %system.id, name = %system.name, "monitoring system registered");
    Ok(ApiResponse::with_status(StatusCode::CREATED, system, None))
}

#[derive(Debug, Deserialize)]
pub struct CreateCapability {
    pub id: Option<String>,
    pub monitoring_id: String,
    pub metric: String,
    #[serde(default)]
    pub view: String,
}

/// POST /capabilities
pub async fn create_capability(
    State(state): State<ApiState>,
    Json(req): Json<CreateCapability>,
) -> ApiResult {
    require_field("metric", &req.metric)?;
    if state.store.get::<MonitoringSystem>(&req.monitoring_id)?.is_none() {
        return Err(ApiError::not_found(format!(
            "monitoring system {}",
            req.monitoring_id
        )));
    }
    let capability = Capability {
        id: new_id(req.id),
        monitoring_id: req.monitoring_id,
        metric: req.metric,
        view: req.view,
    };
    state.store.put(&capability)?;
    info!(capability_id = %capability.id, monitoring_id = %capability.monitoring_id, "capability registered");
    Ok(ApiResponse::with_status(StatusCode::CREATED, capability, None))
}
