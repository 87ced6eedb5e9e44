//! Daemon status, function list, shutdown commands.

use anyhow::Result;
use serde::Deserialize;

use super::http::{base_url, get_json, post_json};

// ── Response types ────────────────────────────────────────────────────────────

#[derive(Deserialize)]
struct StatusResponse {
    nodes: Vec<NodeStatus>,
    idle_nodes: usize,
    running_jobs: Vec<u64>,
    cache: CacheInfo,
    blacklist_enabled: bool,
    uptime_secs: u64,
}

#[derive(Deserialize)]
struct NodeStatus {
    id: String,
    busy: bool,
    jobs_completed: u64,
    jobs_cancelled: u64,
    jobs_failed: u64,
}

#[derive(Deserialize)]
struct CacheInfo {
    write_behind_shared: bool,
    write_behind_private: bool,
    active_caches: usize,
}

#[derive(Deserialize)]
struct FunctionsResponse {
    functions: Vec<String>,
}

#[derive(Deserialize)]
struct ShutdownResponse {
    message: String,
}

fn on_off(flag: bool) -> &'static str {
    if flag { "on" } else { "off" }
}

// ── Commands ──────────────────────────────────────────────────────────────────

pub async fn cmd_status(port: u16) -> Result<()> {
    let resp: StatusResponse = get_json(&format!("{}/status", base_url(port))).await?;

    println!("═══════════════════════════════════════");
    println!("  Calculation Node Status");
    println!("═══════════════════════════════════════");
    println!("  Uptime           : {}s", resp.uptime_secs);
    println!("  Nodes            : {} ({} idle)", resp.nodes.len(), resp.idle_nodes);
    println!("  Running jobs     : {}", resp.running_jobs.len());
    println!("  Write-behind     : shared {}, private {}",
        on_off(resp.cache.write_behind_shared),
        on_off(resp.cache.write_behind_private));
    println!("  Active caches    : {}", resp.cache.active_caches);
    println!("  Blacklisting     : {}", on_off(resp.blacklist_enabled));

    if !resp.nodes.is_empty() {
        println!("\n  Nodes:");
        for n in &resp.nodes {
            println!("  ┌─ {} ({})", n.id, if n.busy { "busy" } else { "idle" });
            println!("  │  completed : {}", n.jobs_completed);
            println!("  │  cancelled : {}", n.jobs_cancelled);
            println!("  └─ failed    : {}", n.jobs_failed);
        }
    }
    if !resp.running_jobs.is_empty() {
        let ids: Vec<String> = resp.running_jobs.iter().map(|id| id.to_string()).collect();
        println!("\n  Running: {}", ids.join(", "));
    }

    Ok(())
}

pub async fn cmd_functions(port: u16) -> Result<()> {
    let resp: FunctionsResponse = get_json(&format!("{}/functions", base_url(port))).await?;

    if resp.functions.is_empty() {
        println!("No functions registered.");
        return Ok(());
    }

    println!("═══════════════════════════════════════");
    println!("  Functions ({})", resp.functions.len());
    println!("═══════════════════════════════════════");
    for f in &resp.functions {
        println!("  {}", f);
    }

    Ok(())
}

pub async fn cmd_shutdown(port: u16) -> Result<()> {
    let resp: ShutdownResponse = post_json(&format!("{}/daemon/shutdown", base_url(port))).await?;
    println!("{}", resp.message);
    Ok(())
}
