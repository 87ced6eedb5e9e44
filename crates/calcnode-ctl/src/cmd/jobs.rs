//! Job commands: list, submit, run, cancel.

use anyhow::{Context, Result};
use serde::Deserialize;
use serde_json::{json, Value};

use super::http::{base_url, get_json, post_json, post_json_body};

#[derive(Deserialize)]
struct RunningJobsResponse {
    jobs: Vec<u64>,
}

#[derive(Deserialize)]
struct SubmitJobResponse {
    job_id: u64,
    cancelled: bool,
    result: Option<JobResult>,
}

#[derive(Deserialize)]
struct JobResult {
    duration_nanos: u64,
    items: Vec<ResultItem>,
    compute_node_id: String,
}

#[derive(Deserialize)]
struct ResultItem {
    status: String,
    execution_log: ExecutionLog,
    #[serde(default)]
    missing_inputs: Vec<Value>,
    #[serde(default)]
    missing_outputs: Vec<Value>,
}

#[derive(Deserialize)]
struct ExecutionLog {
    #[serde(default)]
    log_levels: Vec<String>,
    exception: Option<CapturedException>,
}

#[derive(Deserialize)]
struct CapturedException {
    class_name: String,
    message: Option<String>,
}

#[derive(Deserialize)]
struct CancelJobResponse {
    job_id: u64,
    cancelled: bool,
}

fn now_ms() -> u64 {
    std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .map(|d| d.as_millis() as u64)
        .unwrap_or(0)
}

fn print_result(resp: &SubmitJobResponse) {
    let Some(result) = resp.result.as_ref().filter(|_| !resp.cancelled) else {
        println!("Job {} was cancelled.", resp.job_id);
        return;
    };

    println!("═══════════════════════════════════════");
    println!("  Job {} on {}", resp.job_id, result.compute_node_id);
    println!("═══════════════════════════════════════");
    println!("  Duration : {:.3} ms", result.duration_nanos as f64 / 1_000_000.0);
    println!("  Items    : {}", result.items.len());

    for (i, item) in result.items.iter().enumerate() {
        println!("  ┌─ item {} : {}", i, item.status);
        if !item.execution_log.log_levels.is_empty() {
            println!("  │  log levels      : {}", item.execution_log.log_levels.join(", "));
        }
        if !item.missing_inputs.is_empty() {
            println!("  │  missing inputs  : {}", item.missing_inputs.len());
        }
        if !item.missing_outputs.is_empty() {
            println!("  │  missing outputs : {}", item.missing_outputs.len());
        }
        match &item.execution_log.exception {
            Some(e) => println!(
                "  └─ exception       : {}: {}",
                e.class_name,
                e.message.as_deref().unwrap_or("")
            ),
            None => println!("  └─"),
        }
    }
}

// ── Commands ──────────────────────────────────────────────────────────────────

pub async fn cmd_jobs(port: u16) -> Result<()> {
    let resp: RunningJobsResponse = get_json(&format!("{}/jobs", base_url(port))).await?;

    if resp.jobs.is_empty() {
        println!("No jobs running.");
        return Ok(());
    }
    println!("Running jobs:");
    for id in &resp.jobs {
        println!("  {}", id);
    }
    Ok(())
}

/// Submit a job read from a JSON file and wait for its result.
pub async fn cmd_submit(port: u16, path: &str) -> Result<()> {
    let text = std::fs::read_to_string(path).with_context(|| format!("failed to read {}", path))?;
    let job: Value = serde_json::from_str(&text).with_context(|| format!("{} is not valid JSON", path))?;

    let resp: SubmitJobResponse = post_json_body(&format!("{}/jobs", base_url(port)), &job).await?;
    print_result(&resp);
    Ok(())
}

/// Build and submit a one-item job for `function` against trade `target`.
/// A target of `-` runs the function without a target.
pub async fn cmd_run(port: u16, function: &str, target: &str, outputs: &[&str]) -> Result<()> {
    anyhow::ensure!(!outputs.is_empty(), "at least one output name is required");

    let target = if target == "-" {
        json!({ "target_type": "null", "unique_id": null })
    } else {
        json!({ "target_type": "trade", "unique_id": target })
    };
    let outputs: Vec<Value> = outputs
        .iter()
        .map(|name| json!({ "value_name": name, "target": target }))
        .collect();
    let job_id = now_ms();
    let job = json!({
        "specification": {
            "view_cycle_id": "ctl",
            "calc_config_name": "Default",
            "valuation_time": job_id,
            "job_id": job_id
        },
        "items": [{
            "function_unique_id": function,
            "target": target,
            "inputs": { "specifications": [] },
            "outputs": { "specifications": outputs },
            "log_mode": "full"
        }]
    });

    let resp: SubmitJobResponse = post_json_body(&format!("{}/jobs", base_url(port)), &job).await?;
    print_result(&resp);
    Ok(())
}

pub async fn cmd_cancel(port: u16, job_id: &str) -> Result<()> {
    let job_id: u64 = job_id.parse().context("job id must be a number")?;
    let resp: CancelJobResponse =
        post_json(&format!("{}/jobs/{}/cancel", base_url(port), job_id)).await?;

    if resp.cancelled {
        println!("Cancellation requested for job {}.", resp.job_id);
    } else {
        println!("Job {} was not cancelled.", resp.job_id);
    }
    Ok(())
}
