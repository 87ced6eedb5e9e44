//! HTTP API handlers: exposes node state and job submission as JSON.

pub mod blacklist;
pub mod jobs;
pub mod statistics;
pub mod status;

use std::sync::Arc;
use std::time::Instant;

use calcnode_services::blacklist::FunctionBlacklist;
use calcnode_services::function::InMemoryFunctionRepository;
use calcnode_services::statistics::InvocationStatisticsAggregator;
use calcnode_services::{DeferredCacheRegistry, NodePool};

#[derive(Clone)]
pub struct ApiState {
    pub pool: NodePool,
    pub registry: DeferredCacheRegistry,
    pub functions: InMemoryFunctionRepository,
    pub statistics: InvocationStatisticsAggregator,
    /// Present only when blacklisting is enabled.
    pub blacklist: Option<Arc<FunctionBlacklist>>,
    pub started_at: Instant,
}

// Re-export handler functions for use in router setup.
pub use blacklist::{handle_blacklist, handle_blacklist_purge};
pub use jobs::{handle_cancel_job, handle_running_jobs, handle_submit_job};
pub use statistics::{handle_statistics, handle_statistics_reset};
pub use status::{handle_functions, handle_shutdown, handle_status};
