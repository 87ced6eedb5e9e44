//! Execution watchdog: flags job items that run past a time limit.
//!
//! The node arms the watchdog when an invocation starts; the returned guard
//! disarms it when dropped, however the invocation ends. A monitor task
//! checks periodically and reports each overrun once to a `WatchdogAction`.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use dashmap::DashMap;
use tokio::task::JoinHandle;

use calcnode_core::job::CalculationJobItem;

#[derive(Debug, Clone)]
pub struct OverrunItem {
    pub node_id: String,
    pub function_id: String,
    pub item: String,
    pub elapsed: Duration,
}

pub trait WatchdogAction: Send + Sync {
    fn on_timeout(&self, overrun: &OverrunItem);
}

#[derive(Debug, Clone, Copy, Default)]
pub struct LoggingWatchdogAction;

impl WatchdogAction for LoggingWatchdogAction {
    fn on_timeout(&self, overrun: &OverrunItem) {
        tracing::warn!(
            node = %overrun.node_id,
            function = %overrun.function_id,
            item = %overrun.item,
            elapsed_ms = overrun.elapsed.as_millis() as u64,
            "job item exceeded its execution limit"
        );
    }
}

struct ArmedItem {
    node_id: String,
    function_id: String,
    item: String,
    started: Instant,
    reported: bool,
}

struct WatchdogInner {
    max_duration: Duration,
    action: Arc<dyn WatchdogAction>,
    armed: DashMap<u64, ArmedItem>,
    next_token: AtomicU64,
}

#[derive(Clone)]
pub struct ExecutionWatchdog {
    inner: Arc<WatchdogInner>,
}

impl ExecutionWatchdog {
    pub fn new(max_duration: Duration, action: Arc<dyn WatchdogAction>) -> Self {
        Self {
            inner: Arc::new(WatchdogInner {
                max_duration,
                action,
                armed: DashMap::new(),
                next_token: AtomicU64::new(1),
            }),
        }
    }

    pub fn max_duration(&self) -> Duration {
        self.inner.max_duration
    }

    pub fn arm(&self, node_id: &str, item: &CalculationJobItem) -> WatchdogGuard {
        let token = self.inner.next_token.fetch_add(1, Ordering::Relaxed);
        self.inner.armed.insert(
            token,
            ArmedItem {
                node_id: node_id.to_string(),
                function_id: item.function_unique_id.clone(),
                item: item.to_string(),
                started: Instant::now(),
                reported: false,
            },
        );
        WatchdogGuard {
            watchdog: self.clone(),
            token,
        }
    }

    pub fn armed_count(&self) -> usize {
        self.inner.armed.len()
    }

    /// Report overruns not reported before. Returns how many were reported.
    pub fn check(&self) -> usize {
        let mut overruns = Vec::new();
        for mut entry in self.inner.armed.iter_mut() {
            let elapsed = entry.started.elapsed();
            if entry.reported || elapsed <= self.inner.max_duration {
                continue;
            }
            entry.reported = true;
            overruns.push(OverrunItem {
                node_id: entry.node_id.clone(),
                function_id: entry.function_id.clone(),
                item: entry.item.clone(),
                elapsed,
            });
        }
        for overrun in &overruns {
            self.inner.action.on_timeout(overrun);
        }
        overruns.len()
    }

    /// Run `check` every `period` until the task is aborted.
    pub fn spawn_monitor(&self, period: Duration) -> JoinHandle<()> {
        let watchdog = self.clone();
        tokio::spawn(async move {
            let mut interval = tokio::time::interval(period);
            loop {
                interval.tick().await;
                watchdog.check();
            }
        })
    }
}

/// Disarms on drop.
pub struct WatchdogGuard {
    watchdog: ExecutionWatchdog,
    token: u64,
}

impl Drop for WatchdogGuard {
    fn drop(&mut self) {
        self.watchdog.inner.armed.remove(&self.token);
    }
}
