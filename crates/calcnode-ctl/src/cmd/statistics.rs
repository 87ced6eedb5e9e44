//! Invocation statistics commands.

use anyhow::Result;
use serde::Deserialize;

use super::http::{base_url, get_json, post_json};

#[derive(Deserialize)]
struct StatisticsResponse {
    functions: Vec<FunctionStatistics>,
}

#[derive(Deserialize)]
struct FunctionStatistics {
    configuration: String,
    function_id: String,
    invocations: u64,
    mean_invocation_nanos: f64,
    mean_data_input_bytes: Option<f64>,
    mean_data_output_bytes: Option<f64>,
}

#[derive(Deserialize)]
struct ResetResponse {
    cleared: usize,
}

fn bytes(mean: Option<f64>) -> String {
    mean.map(|b| format!("{:.1} B", b)).unwrap_or_else(|| "-".to_string())
}

pub async fn cmd_statistics(port: u16) -> Result<()> {
    let resp: StatisticsResponse = get_json(&format!("{}/statistics", base_url(port))).await?;

    if resp.functions.is_empty() {
        println!("No invocations recorded.");
        return Ok(());
    }

    println!("═══════════════════════════════════════");
    println!("  Invocation Statistics");
    println!("═══════════════════════════════════════");
    for f in &resp.functions {
        println!("  ┌─ {} [{}]", f.function_id, f.configuration);
        println!("  │  invocations : {}", f.invocations);
        println!("  │  mean time   : {:.3} ms", f.mean_invocation_nanos / 1_000_000.0);
        println!("  │  mean input  : {}", bytes(f.mean_data_input_bytes));
        println!("  └─ mean output : {}", bytes(f.mean_data_output_bytes));
    }

    Ok(())
}

pub async fn cmd_statistics_reset(port: u16) -> Result<()> {
    let resp: ResetResponse = post_json(&format!("{}/statistics/reset", base_url(port))).await?;
    println!("Cleared statistics for {} function(s).", resp.cleared);
    Ok(())
}
