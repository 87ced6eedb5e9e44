//! calcnoded: hosts calculation nodes and serves their HTTP API.

use std::sync::Arc;
use std::time::{Duration, Instant};

use anyhow::{Context, Result};

use calcnode_core::config::CalcNodeConfig;
use calcnode_services::blacklist::{self, BlacklistQuery};
use calcnode_services::function::{InMemoryFunctionRepository, InMemoryTargetResolver};
use calcnode_services::statistics::InvocationStatisticsAggregator;
use calcnode_services::value_cache::InMemoryViewComputationCacheSource;
use calcnode_services::watchdog::{ExecutionWatchdog, LoggingWatchdogAction};
use calcnode_services::{
    CalculationNode, DeferredCacheRegistry, NodePool, NodeServices, WorkerPool, WriteStrategy,
};

mod builtins;

/// How often expired blacklist rules are dropped.
const BLACKLIST_PURGE_PERIOD: Duration = Duration::from_secs(60);

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .init();

    // Load config
    if let Err(e) = CalcNodeConfig::write_default_if_missing() {
        tracing::warn!(error = %e, "failed to write default config");
    }
    let config = CalcNodeConfig::load().unwrap_or_else(|e| {
        tracing::warn!(error = %e, "failed to load config, using defaults");
        CalcNodeConfig::default()
    });

    let node_count = config.effective_node_count();
    let prefix = if config.node.node_id_prefix.is_empty() {
        "calcnode".to_string()
    } else {
        config.node.node_id_prefix.clone()
    };
    tracing::info!(nodes = node_count, prefix = %prefix, "calcnoded starting");

    // Worker pool
    let worker_pool = WorkerPool::current(config.cache.worker_threads as usize);
    tracing::info!(
        worker_threads = worker_pool.as_ref().map(|p| p.size()).unwrap_or(0),
        "worker pool ready"
    );

    // Value cache
    let strategy = WriteStrategy::from_flags(
        config.cache.write_behind_shared,
        config.cache.write_behind_private,
    );
    let registry = DeferredCacheRegistry::new(strategy, worker_pool.clone())
        .context("invalid cache configuration")?;
    let cache_source = InMemoryViewComputationCacheSource::new();
    tracing::info!(?strategy, "value cache initialized");

    // Functions and targets
    let functions = InMemoryFunctionRepository::new();
    builtins::register(&functions);
    let targets = InMemoryTargetResolver::new();
    builtins::demo_targets(&targets);

    // Blacklist
    let (blacklist_query, blacklist_maintainer) = blacklist::from_config(&config.blacklist, &prefix);
    let blacklist = match &blacklist_query {
        BlacklistQuery::Enforcing(list) => Some(list.clone()),
        BlacklistQuery::Disabled => None,
    };
    if blacklist.is_some() {
        tracing::info!(policy = config.blacklist.policy.len(), "blacklisting enabled");
    }

    let statistics = InvocationStatisticsAggregator::new();

    let mut services = NodeServices::new(
        Arc::new(cache_source),
        Arc::new(functions.clone()),
        Arc::new(targets),
    )
    .with_cache_registry(registry.clone())
    .with_statistics(Arc::new(statistics.clone()))
    .with_blacklist(blacklist_query, blacklist_maintainer)
    .with_async_target_resolve(config.execution.async_target_resolve);
    if let Some(pool) = &worker_pool {
        services = services.with_worker_pool(pool.clone());
    }

    // Watchdog
    let watchdog = (config.execution.max_job_item_execution_ms > 0).then(|| {
        ExecutionWatchdog::new(
            Duration::from_millis(config.execution.max_job_item_execution_ms),
            Arc::new(LoggingWatchdogAction),
        )
    });
    let watchdog_task = watchdog.as_ref().map(|w| {
        tracing::info!(max_ms = config.execution.max_job_item_execution_ms, "execution watchdog armed");
        w.spawn_monitor(Duration::from_millis(config.execution.watchdog_period_ms.max(1)))
    });
    if let Some(watchdog) = watchdog {
        services = services.with_watchdog(watchdog);
    }

    // Nodes
    let nodes = (0..node_count)
        .map(|i| CalculationNode::new(format!("{prefix}-{i}"), services.clone()))
        .collect::<Result<Vec<_>, _>>()
        .context("failed to create calculation nodes")?;
    let pool = NodePool::new(nodes);

    // ── Shutdown channel ─────────────────────────────────────────────────────
    let (shutdown_tx, _) = tokio::sync::broadcast::channel::<()>(1);

    {
        let shutdown = shutdown_tx.clone();
        tokio::spawn(async move {
            tokio::signal::ctrl_c().await.ok();
            tracing::info!("shutdown signal received");
            let _ = shutdown.send(());
        });
    }

    // ── Spawn tasks ──────────────────────────────────────────────────────────

    let purge_task = {
        let blacklist = blacklist.clone();
        tokio::spawn(async move {
            let Some(blacklist) = blacklist else {
                return std::future::pending::<()>().await;
            };
            let mut interval = tokio::time::interval(BLACKLIST_PURGE_PERIOD);
            loop {
                interval.tick().await;
                let purged = blacklist.purge_expired();
                if purged > 0 {
                    tracing::info!(purged, remaining = blacklist.len(), "expired blacklist rules purged");
                }
            }
        })
    };

    let status_printer = {
        let pool = pool.clone();
        let registry = registry.clone();
        tokio::spawn(async move {
            let mut interval = tokio::time::interval(Duration::from_secs(30));
            loop {
                interval.tick().await;
                let nodes = pool.status();
                tracing::info!(
                    busy = nodes.iter().filter(|n| n.busy).count(),
                    idle = nodes.iter().filter(|n| !n.busy).count(),
                    active_caches = registry.active_caches(),
                    "node pool snapshot"
                );
            }
        })
    };

    let api_port = config.api.port;
    let api_task = {
        let state = calcnode_api::ApiState {
            pool,
            registry,
            functions,
            statistics,
            blacklist,
            started_at: Instant::now(),
        };
        tokio::spawn(async move {
            if let Err(e) = calcnode_api::serve(state, api_port).await {
                tracing::error!(error = %e, "API server failed");
            }
        })
    };

    // ── Wait for exit ────────────────────────────────────────────────────────

    let mut shutdown_rx = shutdown_tx.subscribe();

    tokio::select! {
        _ = shutdown_rx.recv() => tracing::info!("shutting down"),
        r = api_task           => tracing::error!("API task exited: {:?}", r),
        r = purge_task         => tracing::error!("blacklist purge task exited: {:?}", r),
        r = status_printer     => tracing::error!("status printer exited: {:?}", r),
    }

    if let Some(task) = watchdog_task {
        task.abort();
    }
    Ok(())
}
