//! /jobs handlers: submit, list and cancel calculation jobs.

use axum::extract::{Path, State};
use axum::http::StatusCode;
use axum::Json;
use serde::Serialize;

use calcnode_core::job::CalculationJob;
use calcnode_core::result::CalculationJobResult;
use calcnode_services::NodeError;

use super::ApiState;

// ── /jobs (GET) ───────────────────────────────────────────────────────────────

#[derive(Serialize)]
pub struct RunningJobsResponse {
    pub jobs: Vec<u64>,
}

pub async fn handle_running_jobs(State(state): State<ApiState>) -> Json<RunningJobsResponse> {
    Json(RunningJobsResponse {
        jobs: state.pool.running_jobs(),
    })
}

// ── /jobs (POST) ──────────────────────────────────────────────────────────────

#[derive(Debug, Serialize)]
pub struct SubmitJobResponse {
    pub job_id: u64,
    pub cancelled: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub result: Option<CalculationJobResult>,
}

/// Runs the job to completion and returns its result.
pub async fn handle_submit_job(
    State(state): State<ApiState>,
    Json(job): Json<CalculationJob>,
) -> Result<Json<SubmitJobResponse>, (StatusCode, String)> {
    let job_id = job.specification.job_id;
    if state.pool.running_jobs().contains(&job_id) {
        return Err((StatusCode::CONFLICT, format!("job {job_id} is already running")));
    }

    match state.pool.submit(job).await {
        Ok(result) => Ok(Json(SubmitJobResponse {
            job_id,
            cancelled: result.is_none(),
            result,
        })),
        Err(e @ (NodeError::NoIdleNode | NodeError::Busy(_))) => {
            Err((StatusCode::SERVICE_UNAVAILABLE, e.to_string()))
        }
        Err(e @ NodeError::Identifiers(_)) => Err((StatusCode::BAD_REQUEST, e.to_string())),
        Err(e) => {
            tracing::error!(job_id, error = %e, "job submission failed");
            Err((StatusCode::INTERNAL_SERVER_ERROR, e.to_string()))
        }
    }
}

// ── /jobs/{id}/cancel (POST) ──────────────────────────────────────────────────

#[derive(Debug, Serialize)]
pub struct CancelJobResponse {
    pub job_id: u64,
    pub cancelled: bool,
}

pub async fn handle_cancel_job(
    State(state): State<ApiState>,
    Path(job_id): Path<u64>,
) -> Result<Json<CancelJobResponse>, (StatusCode, String)> {
    if !state.pool.cancel(job_id) {
        return Err((StatusCode::NOT_FOUND, format!("job {job_id} is not running")));
    }
    Ok(Json(CancelJobResponse {
        job_id,
        cancelled: true,
    }))
}
