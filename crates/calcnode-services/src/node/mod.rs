//! Calculation node: executes the items of one job at a time, in order.
//!
//! `execute_job` runs items on the calling thread until one suspends (an
//! asynchronous invocation, a target still resolving, or a write-behind
//! flush). It then hands back a `JobHandle` future that resumes the job
//! where it stopped.

mod job_run;
mod pool;

use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;

use serde::Serialize;

use calcnode_core::identifier::IdentifierMap;
use calcnode_core::job::{CalculationJob, CalculationJobSpecification, UnresolvedIdentifiers};
use calcnode_core::result::CalculationJobResult;

use crate::blacklist::{BlacklistMaintainer, BlacklistQuery};
use crate::cache_registry::{DeferredCacheLease, DeferredCacheRegistry};
use crate::execution_log::{LogSink, TracingLogSink};
use crate::function::{ComputationTargetResolver, DependentValueSpecificationQuery, FunctionRepository};
use crate::statistics::{DiscardingStatisticsSink, FunctionInvocationStatisticsSink};
use crate::value_cache::{CacheError, ViewComputationCacheSource};
use crate::watchdog::ExecutionWatchdog;
use crate::worker_pool::WorkerPool;

pub use job_run::JobHandle;
pub use pool::NodePool;

#[derive(Debug, thiserror::Error)]
pub enum NodeError {
    #[error("node {0} is already executing a job")]
    Busy(String),
    #[error("no idle calculation node")]
    NoIdleNode,
    #[error("cache failure: {0}")]
    Cache(#[from] CacheError),
    #[error("invalid node configuration: {0}")]
    Config(String),
    #[error("job rejected: {0}")]
    Identifiers(#[from] UnresolvedIdentifiers),
    #[error("job run resumed out of order ({0})")]
    InvalidState(&'static str),
}

/// What `execute_job` returned.
pub enum JobExecution {
    Completed(CalculationJobResult),
    /// Cancelled before finishing. No result is produced.
    Cancelled,
    /// Drive the handle to completion to get the outcome.
    Suspended(JobHandle),
}

// ── Services ──────────────────────────────────────────────────────────────────

/// Collaborators shared by the nodes of a process.
#[derive(Clone)]
pub struct NodeServices {
    pub cache_source: Arc<dyn ViewComputationCacheSource>,
    pub cache_registry: DeferredCacheRegistry,
    pub functions: Arc<dyn FunctionRepository>,
    pub targets: Arc<dyn ComputationTargetResolver>,
    pub statistics: Arc<dyn FunctionInvocationStatisticsSink>,
    pub log_sink: Arc<dyn LogSink>,
    pub blacklist_query: BlacklistQuery,
    pub blacklist_maintainer: BlacklistMaintainer,
    pub watchdog: Option<ExecutionWatchdog>,
    pub dependent_query: Option<Arc<dyn DependentValueSpecificationQuery>>,
    pub identifier_map: Option<Arc<dyn IdentifierMap>>,
    pub worker_pool: Option<WorkerPool>,
    /// Resolve targets on the worker pool while inputs are fetched.
    pub async_target_resolve: bool,
}

impl NodeServices {
    /// Direct-write caching, no blacklist, no watchdog, statistics discarded
    /// and function logs sent to `tracing`.
    pub fn new(
        cache_source: Arc<dyn ViewComputationCacheSource>,
        functions: Arc<dyn FunctionRepository>,
        targets: Arc<dyn ComputationTargetResolver>,
    ) -> Self {
        Self {
            cache_source,
            cache_registry: DeferredCacheRegistry::direct_write(),
            functions,
            targets,
            statistics: Arc::new(DiscardingStatisticsSink),
            log_sink: Arc::new(TracingLogSink),
            blacklist_query: BlacklistQuery::Disabled,
            blacklist_maintainer: BlacklistMaintainer::Disabled,
            watchdog: None,
            dependent_query: None,
            identifier_map: None,
            worker_pool: None,
            async_target_resolve: false,
        }
    }

    pub fn with_cache_registry(mut self, registry: DeferredCacheRegistry) -> Self {
        self.cache_registry = registry;
        self
    }

    pub fn with_statistics(mut self, sink: Arc<dyn FunctionInvocationStatisticsSink>) -> Self {
        self.statistics = sink;
        self
    }

    pub fn with_log_sink(mut self, sink: Arc<dyn LogSink>) -> Self {
        self.log_sink = sink;
        self
    }

    pub fn with_blacklist(mut self, query: BlacklistQuery, maintainer: BlacklistMaintainer) -> Self {
        self.blacklist_query = query;
        self.blacklist_maintainer = maintainer;
        self
    }

    pub fn with_watchdog(mut self, watchdog: ExecutionWatchdog) -> Self {
        self.watchdog = Some(watchdog);
        self
    }

    pub fn with_dependent_query(mut self, query: Arc<dyn DependentValueSpecificationQuery>) -> Self {
        self.dependent_query = Some(query);
        self
    }

    pub fn with_identifier_map(mut self, map: Arc<dyn IdentifierMap>) -> Self {
        self.identifier_map = Some(map);
        self
    }

    pub fn with_worker_pool(mut self, pool: WorkerPool) -> Self {
        self.worker_pool = Some(pool);
        self
    }

    pub fn with_async_target_resolve(mut self, enabled: bool) -> Self {
        self.async_target_resolve = enabled;
        self
    }
}

// ── Node ──────────────────────────────────────────────────────────────────────

struct NodeInner {
    id: String,
    services: NodeServices,
    busy: AtomicBool,
    jobs_completed: AtomicU64,
    jobs_cancelled: AtomicU64,
    jobs_failed: AtomicU64,
    correlation: Arc<AtomicU64>,
}

#[derive(Debug, Clone, Serialize)]
pub struct NodeStatus {
    pub id: String,
    pub busy: bool,
    pub jobs_completed: u64,
    pub jobs_cancelled: u64,
    pub jobs_failed: u64,
}

#[derive(Clone)]
pub struct CalculationNode {
    inner: Arc<NodeInner>,
}

impl CalculationNode {
    pub fn new(id: impl Into<String>, services: NodeServices) -> Result<Self, NodeError> {
        if services.async_target_resolve && services.worker_pool.is_none() {
            return Err(NodeError::Config(
                "asynchronous target resolution requires a worker pool".into(),
            ));
        }
        Ok(Self {
            inner: Arc::new(NodeInner {
                id: id.into(),
                services,
                busy: AtomicBool::new(false),
                jobs_completed: AtomicU64::new(0),
                jobs_cancelled: AtomicU64::new(0),
                jobs_failed: AtomicU64::new(0),
                correlation: Arc::new(AtomicU64::new(1)),
            }),
        })
    }

    pub fn id(&self) -> &str {
        &self.inner.id
    }

    pub fn services(&self) -> &NodeServices {
        &self.inner.services
    }

    pub fn is_busy(&self) -> bool {
        self.inner.busy.load(Ordering::Acquire)
    }

    pub fn status(&self) -> NodeStatus {
        NodeStatus {
            id: self.inner.id.clone(),
            busy: self.is_busy(),
            jobs_completed: self.inner.jobs_completed.load(Ordering::Relaxed),
            jobs_cancelled: self.inner.jobs_cancelled.load(Ordering::Relaxed),
            jobs_failed: self.inner.jobs_failed.load(Ordering::Relaxed),
        }
    }

    fn correlation(&self) -> Arc<AtomicU64> {
        self.inner.correlation.clone()
    }

    /// The deferred cache for a job, shared with every other lease on the
    /// same underlying store.
    pub fn get_cache(&self, specification: &CalculationJobSpecification) -> Result<DeferredCacheLease, NodeError> {
        let services = &self.inner.services;
        let store = services
            .cache_source
            .get_cache(&specification.view_cycle_id, &specification.calc_config_name);
        Ok(services.cache_registry.acquire(store)?)
    }

    /// Start executing `job`. Rejected with `Busy` while another job runs.
    pub fn execute_job(&self, mut job: CalculationJob) -> Result<JobExecution, NodeError> {
        let busy = BusyGuard::acquire(&self.inner)?;

        if let Some(map) = &self.inner.services.identifier_map {
            if job.items.iter().any(|item| !item.has_specifications()) {
                if let Err(e) = job.convert_identifiers(map.as_ref()) {
                    tracing::warn!(node = %self.inner.id, job = %job.specification, error = %e, "job rejected");
                    return Err(e.into());
                }
            }
        }
        let cache = self.get_cache(&job.specification)?;

        tracing::info!(
            node = %self.inner.id,
            job = %job.specification,
            items = job.items.len(),
            "job started"
        );
        job_run::JobRun::new(self.clone(), job, cache, busy).start()
    }

    /// Execute `job` and drive it to completion. `None` means cancelled.
    pub async fn run_job(&self, job: CalculationJob) -> Result<Option<CalculationJobResult>, NodeError> {
        match self.execute_job(job)? {
            JobExecution::Completed(result) => Ok(Some(result)),
            JobExecution::Cancelled => Ok(None),
            JobExecution::Suspended(handle) => handle.await,
        }
    }

    fn record_outcome(&self, outcome: &Result<Option<CalculationJobResult>, NodeError>) {
        let counter = match outcome {
            Ok(Some(_)) => &self.inner.jobs_completed,
            Ok(None) => &self.inner.jobs_cancelled,
            Err(_) => &self.inner.jobs_failed,
        };
        counter.fetch_add(1, Ordering::Relaxed);
    }
}

/// Marks the node busy for as long as it lives.
struct BusyGuard(Arc<NodeInner>);

impl BusyGuard {
    fn acquire(inner: &Arc<NodeInner>) -> Result<Self, NodeError> {
        inner
            .busy
            .compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
            .map_err(|_| NodeError::Busy(inner.id.clone()))?;
        Ok(Self(inner.clone()))
    }
}

impl Drop for BusyGuard {
    fn drop(&mut self) {
        self.0.busy.store(false, Ordering::Release);
    }
}
