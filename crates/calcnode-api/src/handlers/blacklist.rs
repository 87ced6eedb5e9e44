//! /blacklist handlers.

use std::time::{SystemTime, UNIX_EPOCH};

use axum::extract::State;
use axum::http::StatusCode;
use axum::Json;
use serde::Serialize;

use calcnode_services::blacklist::BlacklistRule;

use super::ApiState;

#[derive(Serialize)]
pub struct BlacklistResponse {
    pub enabled: bool,
    pub rules: Vec<BlacklistRuleJson>,
}

#[derive(Serialize)]
pub struct BlacklistRuleJson {
    pub rule: BlacklistRule,
    pub expires_in_secs: u64,
}

fn now_ms() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_millis() as u64)
        .unwrap_or(0)
}

pub async fn handle_blacklist(State(state): State<ApiState>) -> Json<BlacklistResponse> {
    let Some(blacklist) = &state.blacklist else {
        return Json(BlacklistResponse {
            enabled: false,
            rules: Vec::new(),
        });
    };

    let now = now_ms();
    let rules = blacklist
        .entries()
        .into_iter()
        .filter(|e| e.expires_at > now)
        .map(|e| BlacklistRuleJson {
            rule: e.rule,
            expires_in_secs: (e.expires_at - now) / 1000,
        })
        .collect();

    Json(BlacklistResponse {
        enabled: true,
        rules,
    })
}

#[derive(Serialize)]
pub struct PurgeResponse {
    pub purged: usize,
    pub remaining: usize,
}

pub async fn handle_blacklist_purge(
    State(state): State<ApiState>,
) -> Result<Json<PurgeResponse>, (StatusCode, String)> {
    let blacklist = state
        .blacklist
        .as_ref()
        .ok_or((StatusCode::NOT_FOUND, "blacklisting is disabled".to_string()))?;
    let purged = blacklist.purge_expired();
    Ok(Json(PurgeResponse {
        purged,
        remaining: blacklist.len(),
    }))
}
