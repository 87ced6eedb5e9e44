//! Blacklist commands.

use anyhow::Result;
use serde::Deserialize;
use serde_json::Value;

use super::http::{base_url, get_json, post_json};

#[derive(Deserialize)]
struct BlacklistResponse {
    enabled: bool,
    rules: Vec<BlacklistRule>,
}

#[derive(Deserialize)]
struct BlacklistRule {
    rule: Value,
    expires_in_secs: u64,
}

#[derive(Deserialize)]
struct PurgeResponse {
    purged: usize,
    remaining: usize,
}

pub async fn cmd_blacklist(port: u16) -> Result<()> {
    let resp: BlacklistResponse = get_json(&format!("{}/blacklist", base_url(port))).await?;

    if !resp.enabled {
        println!("Blacklisting is disabled.");
        return Ok(());
    }
    if resp.rules.is_empty() {
        println!("No active blacklist rules.");
        return Ok(());
    }

    println!("═══════════════════════════════════════");
    println!("  Blacklist Rules ({})", resp.rules.len());
    println!("═══════════════════════════════════════");
    for r in &resp.rules {
        let function = r.rule.get("function_id").and_then(Value::as_str).unwrap_or("*");
        println!("  ┌─ {}", function);
        println!("  │  rule    : {}", r.rule);
        println!("  └─ expires : in {}s", r.expires_in_secs);
    }

    Ok(())
}

pub async fn cmd_blacklist_purge(port: u16) -> Result<()> {
    let resp: PurgeResponse = post_json(&format!("{}/blacklist/purge", base_url(port))).await?;
    println!("Purged {} expired rule(s), {} remaining.", resp.purged, resp.remaining);
    Ok(())
}
