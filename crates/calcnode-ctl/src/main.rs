//! calcnode-ctl: command-line interface for the calcnoded daemon.

use anyhow::{Context, Result};

mod cmd;

use cmd::blacklist::{cmd_blacklist, cmd_blacklist_purge};
use cmd::jobs::{cmd_cancel, cmd_jobs, cmd_run, cmd_submit};
use cmd::statistics::{cmd_statistics, cmd_statistics_reset};
use cmd::status::{cmd_functions, cmd_shutdown, cmd_status};

const DEFAULT_PORT: u16 = 9101;

fn print_usage() {
    println!("Usage: calcnode-ctl [--port <port>] <command>");
    println!();
    println!("Commands:");
    println!("  status                            Show nodes, running jobs and cache settings");
    println!("  functions                         List registered functions");
    println!("  jobs                              List running jobs");
    println!("  submit <file>                     Submit a job from a JSON file and wait for it");
    println!("  run <function> <trade|-> <out>..  Run one function against a trade");
    println!("  cancel <job-id>                   Cancel a running job");
    println!("  statistics                        Show per-function invocation statistics");
    println!("  statistics reset                  Clear invocation statistics");
    println!("  blacklist                         Show active blacklist rules");
    println!("  blacklist purge                   Drop expired blacklist rules");
    println!("  shutdown                          Stop the daemon");
    println!();
    println!("Options:");
    println!("  --port <port>   API port (default: {})", DEFAULT_PORT);
}

// ── Entry point ───────────────────────────────────────────────────────────────

#[tokio::main]
async fn main() -> Result<()> {
    let args: Vec<String> = std::env::args().skip(1).collect();

    // Parse --port option
    let mut port = DEFAULT_PORT;
    let mut remaining: Vec<&str> = Vec::new();
    let mut i = 0;
    while i < args.len() {
        if args[i] == "--port" {
            i += 1;
            port = args.get(i)
            .context("--port requires a value")?
            .parse()
            .context("--port must be a number")?;
        } else {
            remaining.push(&args[i]);
        }
        i += 1;
    }

    match remaining.as_slice() {
        ["status"] | []                    => cmd_status(port).await,
        ["functions"]                      => cmd_functions(port).await,
        ["jobs"]                           => cmd_jobs(port).await,
        ["submit", path]                   => cmd_submit(port, path).await,
        ["run", function, target, outputs @ ..] if !outputs.is_empty()
                                           => cmd_run(port, function, target, outputs).await,
        ["cancel", job_id]                 => cmd_cancel(port, job_id).await,
        ["statistics"]                     => cmd_statistics(port).await,
        ["statistics", "reset"]            => cmd_statistics_reset(port).await,
        ["blacklist"]                      => cmd_blacklist(port).await,
        ["blacklist", "purge"]             => cmd_blacklist_purge(port).await,
        ["shutdown"]                       => cmd_shutdown(port).await,
        ["help"] | ["--help"] | ["-h"]     => { print_usage(); Ok(()) }
        other => {
            eprintln!("Unknown command: {}", other.join(" "));
            eprintln!();
            print_usage();
            std::process::exit(1);
        }
    }
}
