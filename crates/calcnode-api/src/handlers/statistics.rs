//! /statistics handlers: per-function invocation statistics.

use axum::extract::State;
use axum::Json;
use serde::Serialize;

use calcnode_services::statistics::FunctionStatisticsSummary;

use super::ApiState;

#[derive(Serialize)]
pub struct StatisticsResponse {
    pub functions: Vec<FunctionStatisticsSummary>,
}

pub async fn handle_statistics(State(state): State<ApiState>) -> Json<StatisticsResponse> {
    Json(StatisticsResponse {
        functions: state.statistics.snapshot(),
    })
}

#[derive(Serialize)]
pub struct ResetResponse {
    pub cleared: usize,
}

pub async fn handle_statistics_reset(State(state): State<ApiState>) -> Json<ResetResponse> {
    let cleared = state.statistics.snapshot().len();
    state.statistics.reset();
    tracing::info!(cleared, "invocation statistics reset");
    Json(ResetResponse { cleared })
}
