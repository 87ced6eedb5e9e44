//! calcnode-services: the execution engine of a calculation node.

pub mod blacklist;
pub mod cache_registry;
pub mod deferred_cache;
pub mod execution_log;
pub mod function;
pub mod node;
pub mod statistics;
pub mod value_cache;
pub mod watchdog;
pub mod worker_pool;

pub use cache_registry::{DeferredCacheLease, DeferredCacheRegistry};
pub use deferred_cache::{DeferredViewComputationCache, Flush, WriteStrategy};
pub use function::{
    ClosureInvoker, FunctionInputs, FunctionInvoker, Invocation, InvocationContext, InvocationError,
    PendingInvocation,
};
pub use node::{CalculationNode, JobExecution, JobHandle, NodeError, NodePool, NodeServices, NodeStatus};
pub use value_cache::{CacheError, CacheSection, ViewComputationCache, ViewComputationCacheSource};
pub use worker_pool::WorkerPool;
