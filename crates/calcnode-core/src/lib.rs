//! calcnode-core: job model, values, results and configuration.
//! All other calcnode crates depend on this one.

pub mod config;
pub mod identifier;
pub mod job;
pub mod log;
pub mod result;
pub mod value;

pub use identifier::{IdentifierMap, InMemoryIdentifierMap};
pub use job::{
    CalculationJob, CalculationJobItem, CalculationJobSpecification, CancellationFlag,
    ValueSpecificationSet,
};
pub use log::{CapturedException, ExecutionLog, ExecutionLogMode, LogEvent, LogLevel};
pub use result::{CalculationJobResult, CalculationJobResultItem, InvocationResult, ResultItemBuilder};
pub use value::{
    CacheSelectHint, CacheValue, ComputationTarget, ComputationTargetSpecification,
    ComputationTargetType, ComputedValue, FunctionParameters, NotCalculatedSentinel,
    ValueSpecification,
};
