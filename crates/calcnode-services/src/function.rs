//! Collaborators the node calls out to: function invokers and their
//! repository, target resolution, and the dependent value specification
//! query back to the coordinator.

use std::any::Any;
use std::collections::{BTreeMap, BTreeSet};
use std::future::Future;
use std::pin::Pin;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::task::{Context, Poll};

use dashmap::DashMap;

use calcnode_core::job::CalculationJobSpecification;
use calcnode_core::value::{
    ComputationTarget, ComputationTargetSpecification, ComputationTargetType, ComputedValue,
    FunctionParameters, ValueSpecification,
};

use crate::execution_log::ExecutionLogCollector;

// ── Errors ────────────────────────────────────────────────────────────────────

#[derive(Debug, Clone, thiserror::Error)]
pub enum InvocationError {
    #[error("{class_name}: {message}")]
    Failed {
        class_name: String,
        message: String,
        stack_trace: Option<String>,
    },
    /// The function found itself blacklisted while running.
    #[error("function blacklisted during invocation")]
    Blacklisted,
    #[error("invoker returned no result")]
    NoResult,
    #[error("dependent value query failed: {0}")]
    DependentQuery(String),
}

impl InvocationError {
    pub fn failed(class_name: impl Into<String>, message: impl Into<String>) -> Self {
        InvocationError::Failed {
            class_name: class_name.into(),
            message: message.into(),
            stack_trace: None,
        }
    }

    /// A panic caught while invoking a function.
    pub fn from_panic(payload: Box<dyn Any + Send>) -> Self {
        let message = payload
            .downcast_ref::<&str>()
            .map(|s| s.to_string())
            .or_else(|| payload.downcast_ref::<String>().cloned())
            .unwrap_or_else(|| "function panicked".to_string());
        InvocationError::failed("Panic", message)
    }

    /// Class name recorded in the execution log.
    pub fn class_name(&self) -> &str {
        match self {
            InvocationError::Failed { class_name, .. } => class_name,
            InvocationError::Blacklisted => "BlacklistedException",
            InvocationError::NoResult => "InvalidInvocationException",
            InvocationError::DependentQuery(_) => "DependentValueQueryException",
        }
    }

    pub fn message(&self) -> String {
        match self {
            InvocationError::Failed { message, .. } => message.clone(),
            other => other.to_string(),
        }
    }

    pub fn stack_trace(&self) -> Option<String> {
        match self {
            InvocationError::Failed { stack_trace, .. } => stack_trace.clone(),
            _ => None,
        }
    }
}

// ── Invocation ────────────────────────────────────────────────────────────────

pub type InvocationOutcome = Result<Vec<ComputedValue>, InvocationError>;

/// An invocation that will complete later.
pub struct PendingInvocation(Pin<Box<dyn Future<Output = InvocationOutcome> + Send>>);

impl PendingInvocation {
    pub fn new(future: impl Future<Output = InvocationOutcome> + Send + 'static) -> Self {
        Self(Box::pin(future))
    }
}

impl Future for PendingInvocation {
    type Output = InvocationOutcome;

    fn poll(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Self::Output> {
        self.0.as_mut().poll(cx)
    }
}

pub enum Invocation {
    Complete(InvocationOutcome),
    Suspended(PendingInvocation),
}

/// Inputs gathered from the cache for one item.
#[derive(Debug, Clone, Default)]
pub struct FunctionInputs {
    values: BTreeMap<ValueSpecification, serde_json::Value>,
    missing: BTreeSet<ValueSpecification>,
}

impl FunctionInputs {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert(&mut self, spec: ValueSpecification, value: serde_json::Value) {
        self.values.insert(spec, value);
    }

    pub fn mark_missing(&mut self, spec: ValueSpecification) {
        self.missing.insert(spec);
    }

    pub fn get(&self, spec: &ValueSpecification) -> Option<&serde_json::Value> {
        self.values.get(spec)
    }

    /// First input with the given value name.
    pub fn get_by_name(&self, value_name: &str) -> Option<&serde_json::Value> {
        self.values
            .iter()
            .find(|(spec, _)| spec.value_name == value_name)
            .map(|(_, v)| v)
    }

    pub fn values(&self) -> impl Iterator<Item = (&ValueSpecification, &serde_json::Value)> {
        self.values.iter()
    }

    pub fn missing(&self) -> &BTreeSet<ValueSpecification> {
        &self.missing
    }

    pub fn len(&self) -> usize {
        self.values.len()
    }

    pub fn is_empty(&self) -> bool {
        self.values.is_empty()
    }
}

/// Everything an invoker may use besides its inputs. Cheap to clone, so
/// asynchronous invokers can move it into their future.
#[derive(Clone)]
pub struct InvocationContext {
    job: CalculationJobSpecification,
    function_id: String,
    parameters: FunctionParameters,
    log: ExecutionLogCollector,
    dependent_query: Option<Arc<dyn DependentValueSpecificationQuery>>,
    correlation: Arc<AtomicU64>,
}

impl InvocationContext {
    pub fn new(
        job: CalculationJobSpecification,
        function_id: impl Into<String>,
        parameters: FunctionParameters,
        log: ExecutionLogCollector,
        dependent_query: Option<Arc<dyn DependentValueSpecificationQuery>>,
        correlation: Arc<AtomicU64>,
    ) -> Self {
        Self {
            job,
            function_id: function_id.into(),
            parameters,
            log,
            dependent_query,
            correlation,
        }
    }

    pub fn job(&self) -> &CalculationJobSpecification {
        &self.job
    }

    pub fn function_id(&self) -> &str {
        &self.function_id
    }

    pub fn parameters(&self) -> &FunctionParameters {
        &self.parameters
    }

    pub fn log(&self) -> &ExecutionLogCollector {
        &self.log
    }

    /// Ask the coordinator for every value specification in this job's
    /// dependency context.
    pub fn dependent_value_specifications(&self) -> Result<BTreeSet<ValueSpecification>, InvocationError> {
        let query = self
            .dependent_query
            .as_ref()
            .ok_or_else(|| InvocationError::DependentQuery("no coordinator query available".into()))?;
        let correlation_id = self.correlation.fetch_add(1, Ordering::Relaxed);
        let reply = query.query(DependentValueSpecificationRequest {
            job: self.job.clone(),
            correlation_id,
        })?;
        if reply.correlation_id != correlation_id {
            return Err(InvocationError::DependentQuery(format!(
                "expected reply to request {}, got {}",
                correlation_id, reply.correlation_id
            )));
        }
        Ok(reply.specifications)
    }
}

/// Executes one function on a target.
pub trait FunctionInvoker: Send + Sync {
    fn execute(
        &self,
        context: &InvocationContext,
        target: Option<&ComputationTarget>,
        inputs: &FunctionInputs,
        desired_outputs: &BTreeSet<ValueSpecification>,
    ) -> Invocation;

    /// Whether the function may run with some inputs missing.
    fn can_handle_missing_inputs(&self) -> bool {
        false
    }
}

type InvokeFn = dyn Fn(&InvocationContext, Option<&ComputationTarget>, &FunctionInputs, &BTreeSet<ValueSpecification>) -> InvocationOutcome
    + Send
    + Sync;

/// Synchronous invoker from a closure.
pub struct ClosureInvoker {
    f: Box<InvokeFn>,
    tolerates_missing: bool,
}

impl ClosureInvoker {
    pub fn new<F>(f: F) -> Self
    where
        F: Fn(&InvocationContext, Option<&ComputationTarget>, &FunctionInputs, &BTreeSet<ValueSpecification>) -> InvocationOutcome
            + Send
            + Sync
            + 'static,
    {
        Self {
            f: Box::new(f),
            tolerates_missing: false,
        }
    }

    pub fn tolerating_missing_inputs(mut self) -> Self {
        self.tolerates_missing = true;
        self
    }
}

impl FunctionInvoker for ClosureInvoker {
    fn execute(
        &self,
        context: &InvocationContext,
        target: Option<&ComputationTarget>,
        inputs: &FunctionInputs,
        desired_outputs: &BTreeSet<ValueSpecification>,
    ) -> Invocation {
        Invocation::Complete((self.f)(context, target, inputs, desired_outputs))
    }

    fn can_handle_missing_inputs(&self) -> bool {
        self.tolerates_missing
    }
}

// ── Function repository ───────────────────────────────────────────────────────

pub trait FunctionRepository: Send + Sync {
    fn invoker(&self, function_id: &str) -> Option<Arc<dyn FunctionInvoker>>;
}

#[derive(Clone, Default)]
pub struct InMemoryFunctionRepository {
    invokers: Arc<DashMap<String, Arc<dyn FunctionInvoker>>>,
}

impl InMemoryFunctionRepository {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(&self, function_id: impl Into<String>, invoker: Arc<dyn FunctionInvoker>) {
        self.invokers.insert(function_id.into(), invoker);
    }

    pub fn function_ids(&self) -> Vec<String> {
        let mut ids: Vec<String> = self.invokers.iter().map(|e| e.key().clone()).collect();
        ids.sort();
        ids
    }
}

impl FunctionRepository for InMemoryFunctionRepository {
    fn invoker(&self, function_id: &str) -> Option<Arc<dyn FunctionInvoker>> {
        self.invokers.get(function_id).map(|e| e.value().clone())
    }
}

// ── Target resolution ─────────────────────────────────────────────────────────

pub trait ComputationTargetResolver: Send + Sync {
    fn resolve(&self, specification: &ComputationTargetSpecification) -> Option<ComputationTarget>;
}

/// Resolves from a fixed map. The null target always resolves.
#[derive(Clone, Default)]
pub struct InMemoryTargetResolver {
    targets: Arc<DashMap<ComputationTargetSpecification, ComputationTarget>>,
}

impl InMemoryTargetResolver {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert(&self, target: ComputationTarget) {
        self.targets.insert(target.specification.clone(), target);
    }

    pub fn len(&self) -> usize {
        self.targets.len()
    }

    pub fn is_empty(&self) -> bool {
        self.targets.is_empty()
    }
}

impl ComputationTargetResolver for InMemoryTargetResolver {
    fn resolve(&self, specification: &ComputationTargetSpecification) -> Option<ComputationTarget> {
        if specification.target_type == ComputationTargetType::Null {
            return Some(ComputationTarget {
                specification: specification.clone(),
                value: serde_json::Value::Null,
            });
        }
        self.targets.get(specification).map(|t| t.clone())
    }
}

// ── Dependent value specifications ────────────────────────────────────────────

#[derive(Debug, Clone, PartialEq)]
pub struct DependentValueSpecificationRequest {
    pub job: CalculationJobSpecification,
    pub correlation_id: u64,
}

#[derive(Debug, Clone, PartialEq)]
pub struct DependentValueSpecificationReply {
    pub correlation_id: u64,
    pub specifications: BTreeSet<ValueSpecification>,
}

/// Synchronous request/reply to the coordinator.
pub trait DependentValueSpecificationQuery: Send + Sync {
    fn query(
        &self,
        request: DependentValueSpecificationRequest,
    ) -> Result<DependentValueSpecificationReply, InvocationError>;
}
