//! /status, /functions, /daemon/shutdown handlers.

use axum::extract::State;
use axum::Json;
use serde::Serialize;

use calcnode_services::node::NodeStatus;
use calcnode_services::WriteStrategy;

use super::ApiState;

// ── /status ──────────────────────────────────────────────────────────────────

#[derive(Serialize)]
pub struct StatusResponse {
    pub nodes: Vec<NodeStatus>,
    pub idle_nodes: usize,
    pub running_jobs: Vec<u64>,
    pub cache: CacheInfo,
    pub blacklist_enabled: bool,
    pub uptime_secs: u64,
}

#[derive(Serialize)]
pub struct CacheInfo {
    pub write_behind_shared: bool,
    pub write_behind_private: bool,
    pub active_caches: usize,
}

pub async fn handle_status(State(state): State<ApiState>) -> Json<StatusResponse> {
    let nodes = state.pool.status();
    let idle_nodes = nodes.iter().filter(|n| !n.busy).count();

    let (write_behind_shared, write_behind_private) = match state.registry.strategy() {
        WriteStrategy::DirectWrite => (false, false),
        WriteStrategy::WriteBehind { shared, private } => (shared, private),
    };

    Json(StatusResponse {
        nodes,
        idle_nodes,
        running_jobs: state.pool.running_jobs(),
        cache: CacheInfo {
            write_behind_shared,
            write_behind_private,
            active_caches: state.registry.active_caches(),
        },
        blacklist_enabled: state.blacklist.is_some(),
        uptime_secs: state.started_at.elapsed().as_secs(),
    })
}

// ── /functions ────────────────────────────────────────────────────────────────

#[derive(Serialize)]
pub struct FunctionsResponse {
    pub functions: Vec<String>,
}

pub async fn handle_functions(State(state): State<ApiState>) -> Json<FunctionsResponse> {
    let mut functions = state.functions.function_ids();
    functions.sort();
    Json(FunctionsResponse { functions })
}

// ── /daemon/shutdown ──────────────────────────────────────────────────────────

#[derive(Serialize)]
pub struct ShutdownResponse {
    pub message: String,
}

pub async fn handle_shutdown() -> Json<ShutdownResponse> {
    tracing::info!("shutdown requested via API");

    tokio::spawn(async {
        tokio::time::sleep(tokio::time::Duration::from_millis(100)).await;
        std::process::exit(0);
    });

    Json(ShutdownResponse {
        message: "Shutdown initiated".to_string(),
    })
}
