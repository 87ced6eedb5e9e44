//! Per-job state machine.
//!
//! `JobRun::advance` runs synchronously until the job finishes or has to
//! wait on a future. The waiting future is handed out as a `Wait`; once it
//! resolves the driver feeds the value back through `resume` and calls
//! `advance` again. The driver is a plain loop, so a job with any number of
//! suspensions never nests calls.

use std::collections::{BTreeMap, BTreeSet};
use std::future::Future;
use std::panic::{self, AssertUnwindSafe};
use std::pin::Pin;
use std::sync::Arc;
use std::task::{Context, Poll};
use std::time::Instant;

use futures::FutureExt;
use tokio::task::JoinHandle;

use calcnode_core::job::{CalculationJob, CalculationJobItem, CalculationJobSpecification};
use calcnode_core::result::{CalculationJobResult, CalculationJobResultItem, ResultItemBuilder};
use calcnode_core::value::{
    CacheValue, ComputationTarget, ComputedValue, NotCalculatedSentinel, ValueSpecification,
};

use super::{BusyGuard, CalculationNode, JobExecution, NodeError};
use crate::cache_registry::DeferredCacheLease;
use crate::deferred_cache::Flush;
use crate::execution_log::ExecutionLogCollector;
use crate::function::{
    FunctionInputs, FunctionInvoker, Invocation, InvocationContext, InvocationError,
    InvocationOutcome, PendingInvocation,
};
use crate::statistics::DeferredInvocationStatistics;
use crate::value_cache::CacheError;

type JobOutcome = Result<Option<CalculationJobResult>, NodeError>;
type FlushFuture = Pin<Box<dyn Future<Output = Result<(), CacheError>> + Send>>;
type TargetTask = JoinHandle<Option<Option<ComputationTarget>>>;

// ── State ─────────────────────────────────────────────────────────────────────

/// One item in flight.
struct ItemExecution {
    item: CalculationJobItem,
    outputs: BTreeSet<ValueSpecification>,
    builder: ResultItemBuilder,
    log: ExecutionLogCollector,
    statistics: DeferredInvocationStatistics,
    invoker: Option<Arc<dyn FunctionInvoker>>,
    inputs: FunctionInputs,
    target: Option<ComputationTarget>,
}

enum Phase {
    NextItem,
    AwaitingTarget(ItemExecution),
    TargetResolved(ItemExecution, Option<ComputationTarget>),
    Invoke(ItemExecution),
    AwaitingInvocation(ItemExecution),
    InvocationComplete(ItemExecution, InvocationOutcome),
    Flush,
    AwaitingFlush,
    Flushed(Result<(), CacheError>),
    Finished,
}

pub(super) enum Wait {
    Target(TargetTask),
    Invocation(PendingInvocation),
    Flush(FlushFuture),
}

enum Resumed {
    Target(Option<ComputationTarget>),
    Invocation(InvocationOutcome),
    Flush(Result<(), CacheError>),
}

enum Step {
    Done(JobOutcome),
    Wait(Wait),
}

enum ItemProgress {
    Finished(CalculationJobResultItem),
    AwaitTarget(ItemExecution, TargetTask),
    Invoke(ItemExecution),
}

enum InvokeProgress {
    Finished(CalculationJobResultItem),
    Suspended(ItemExecution, PendingInvocation),
}

enum TargetLookup {
    Resolved(Option<ComputationTarget>),
    Pending(TargetTask),
}

pub(super) struct JobRun {
    node: CalculationNode,
    job: CalculationJob,
    cache: DeferredCacheLease,
    started: Instant,
    next_item: usize,
    results: Vec<CalculationJobResultItem>,
    phase: Phase,
    _busy: BusyGuard,
}

impl JobRun {
    pub(super) fn new(
        node: CalculationNode,
        job: CalculationJob,
        cache: DeferredCacheLease,
        busy: BusyGuard,
    ) -> Self {
        let capacity = job.items.len();
        Self {
            node,
            job,
            cache,
            started: Instant::now(),
            next_item: 0,
            results: Vec::with_capacity(capacity),
            phase: Phase::NextItem,
            _busy: busy,
        }
    }

    pub(super) fn start(mut self) -> Result<JobExecution, NodeError> {
        match self.advance() {
            Step::Done(outcome) => match self.finish(outcome)? {
                Some(result) => Ok(JobExecution::Completed(result)),
                None => Ok(JobExecution::Cancelled),
            },
            Step::Wait(wait) => Ok(JobExecution::Suspended(JobHandle::new(self, wait))),
        }
    }

    async fn drive(mut self, mut wait: Wait) -> JobOutcome {
        loop {
            let resumed = match wait {
                Wait::Target(task) => Resumed::Target(task.await.ok().flatten().flatten()),
                Wait::Invocation(pending) => Resumed::Invocation(
                    AssertUnwindSafe(pending)
                        .catch_unwind()
                        .await
                        .unwrap_or_else(|payload| Err(InvocationError::from_panic(payload))),
                ),
                Wait::Flush(flush) => Resumed::Flush(flush.await),
            };
            self.resume(resumed);
            match self.advance() {
                Step::Done(outcome) => return self.finish(outcome),
                Step::Wait(next) => wait = next,
            }
        }
    }

    fn finish(&self, outcome: JobOutcome) -> JobOutcome {
        self.node.record_outcome(&outcome);
        match &outcome {
            Ok(Some(result)) => tracing::info!(
                node = self.node.id(),
                job = %self.job.specification,
                items = result.items.len(),
                duration_ms = result.duration().as_millis() as u64,
                "job completed"
            ),
            Ok(None) => tracing::info!(
                node = self.node.id(),
                job = %self.job.specification,
                started_items = self.next_item,
                "job cancelled"
            ),
            Err(e) => tracing::error!(
                node = self.node.id(),
                job = %self.job.specification,
                error = %e,
                "job failed"
            ),
        }
        outcome
    }

    fn resume(&mut self, resumed: Resumed) {
        self.phase = match (std::mem::replace(&mut self.phase, Phase::Finished), resumed) {
            (Phase::AwaitingTarget(exec), Resumed::Target(target)) => Phase::TargetResolved(exec, target),
            (Phase::AwaitingInvocation(exec), Resumed::Invocation(outcome)) => {
                Phase::InvocationComplete(exec, outcome)
            }
            (Phase::AwaitingFlush, Resumed::Flush(result)) => Phase::Flushed(result),
            _ => Phase::Finished,
        };
    }

    fn advance(&mut self) -> Step {
        loop {
            match std::mem::replace(&mut self.phase, Phase::Finished) {
                Phase::NextItem => {
                    if self.next_item == self.job.items.len() {
                        self.phase = Phase::Flush;
                        continue;
                    }
                    if self.job.is_cancelled() {
                        return Step::Done(Ok(None));
                    }
                    let index = self.next_item;
                    self.next_item += 1;
                    match self.start_item(index) {
                        ItemProgress::Finished(result) => {
                            self.results.push(result);
                            self.phase = Phase::NextItem;
                        }
                        ItemProgress::Invoke(exec) => self.phase = Phase::Invoke(exec),
                        ItemProgress::AwaitTarget(exec, task) => {
                            self.phase = Phase::AwaitingTarget(exec);
                            return Step::Wait(Wait::Target(task));
                        }
                    }
                }
                Phase::TargetResolved(mut exec, target) => {
                    if accept_target(&mut exec, target) {
                        self.phase = Phase::Invoke(exec);
                    } else {
                        let result = self.fail_unresolved_target(exec);
                        self.results.push(result);
                        self.phase = Phase::NextItem;
                    }
                }
                Phase::Invoke(exec) => match self.invoke(exec) {
                    InvokeProgress::Finished(result) => {
                        self.results.push(result);
                        self.phase = Phase::NextItem;
                    }
                    InvokeProgress::Suspended(exec, pending) => {
                        self.phase = Phase::AwaitingInvocation(exec);
                        return Step::Wait(Wait::Invocation(pending));
                    }
                },
                Phase::InvocationComplete(exec, outcome) => {
                    let result = self.complete_invocation(exec, outcome);
                    self.results.push(result);
                    self.phase = Phase::NextItem;
                }
                Phase::Flush => match self.cache.flush() {
                    Flush::Done(result) => self.phase = Phase::Flushed(result),
                    Flush::Pending(mut pending) => match (&mut pending).now_or_never() {
                        Some(result) => self.phase = Phase::Flushed(result),
                        None => {
                            self.phase = Phase::AwaitingFlush;
                            return Step::Wait(Wait::Flush(pending));
                        }
                    },
                },
                Phase::Flushed(result) => {
                    return Step::Done(match result {
                        Ok(()) => Ok(Some(self.build_result())),
                        Err(e) => Err(NodeError::Cache(e)),
                    });
                }
                Phase::AwaitingTarget(_) | Phase::AwaitingInvocation(_) | Phase::AwaitingFlush => {
                    return Step::Done(Err(NodeError::InvalidState("still awaiting")));
                }
                Phase::Finished => return Step::Done(Err(NodeError::InvalidState("finished"))),
            }
        }
    }

    fn build_result(&mut self) -> CalculationJobResult {
        CalculationJobResult::new(
            self.job.specification.clone(),
            self.started.elapsed(),
            std::mem::take(&mut self.results),
            self.node.id(),
        )
    }

    // ── Items ─────────────────────────────────────────────────────────────────

    fn start_item(&self, index: usize) -> ItemProgress {
        let services = self.node.services();
        let item = self.job.items[index].clone();
        let mut exec = ItemExecution {
            outputs: item.output_specifications().into_iter().collect(),
            builder: ResultItemBuilder::new(),
            log: ExecutionLogCollector::new(&item.function_unique_id, item.log_mode, services.log_sink.clone()),
            statistics: DeferredInvocationStatistics::new(
                &self.job.specification.calc_config_name,
                &item.function_unique_id,
                services.statistics.clone(),
            ),
            invoker: None,
            inputs: FunctionInputs::new(),
            target: None,
            item,
        };
        tracing::debug!(node = self.node.id(), job_id = self.job.specification.job_id, index, item = %exec.item, "item started");

        if services.blacklist_query.is_blacklisted(&exec.item) {
            return ItemProgress::Finished(self.suppress(exec));
        }

        let lookup = match (&services.worker_pool, services.async_target_resolve) {
            (Some(pool), true) => {
                let resolver = services.targets.clone();
                let target = exec.item.target.clone();
                TargetLookup::Pending(pool.spawn_blocking(move || resolver.resolve(&target)))
            }
            _ => TargetLookup::Resolved(services.targets.resolve(&exec.item.target)),
        };

        exec.invoker = services.functions.invoker(&exec.item.function_unique_id);

        let mut pending = match lookup {
            TargetLookup::Resolved(target) => {
                if !accept_target(&mut exec, target) {
                    return ItemProgress::Finished(self.fail_unresolved_target(exec));
                }
                None
            }
            TargetLookup::Pending(task) => Some(task),
        };

        let Some(invoker) = exec.invoker.clone() else {
            abort_target(pending.take());
            let message = format!("no invoker for function {}", exec.item.function_unique_id);
            return ItemProgress::Finished(self.fail_item(exec, "InvalidFunctionException", message));
        };

        self.gather_inputs(&mut exec);
        if !exec.inputs.missing().is_empty() && !invoker.can_handle_missing_inputs() {
            abort_target(pending.take());
            return ItemProgress::Finished(self.missing_inputs(exec));
        }

        match pending {
            None => ItemProgress::Invoke(exec),
            Some(mut task) => match (&mut task).now_or_never() {
                Some(joined) => {
                    if accept_target(&mut exec, joined.ok().flatten().flatten()) {
                        ItemProgress::Invoke(exec)
                    } else {
                        ItemProgress::Finished(self.fail_unresolved_target(exec))
                    }
                }
                None => ItemProgress::AwaitTarget(exec, task),
            },
        }
    }

    fn gather_inputs(&self, exec: &mut ItemExecution) {
        let specs = exec.item.input_specifications();
        let mut bytes = 0u64;
        let mut samples = 0usize;
        for (spec, value) in self.cache.get_values(&specs, &self.job.cache_select_hint) {
            match value {
                Some(value) if !value.is_missing() => {
                    bytes += self.cache.estimate_value_size(&value) as u64;
                    samples += 1;
                    if let CacheValue::Value(v) = value {
                        exec.inputs.insert(spec, v);
                    }
                }
                _ => exec.inputs.mark_missing(spec),
            }
        }
        exec.statistics.set_data_input_bytes(bytes, samples);
    }

    fn invoke(&self, mut exec: ItemExecution) -> InvokeProgress {
        let services = self.node.services();
        let Some(invoker) = exec.invoker.clone() else {
            let message = format!("no invoker for function {}", exec.item.function_unique_id);
            return InvokeProgress::Finished(self.fail_item(exec, "InvalidFunctionException", message));
        };
        if !exec.inputs.missing().is_empty() {
            let missing: Vec<ValueSpecification> = exec.inputs.missing().iter().cloned().collect();
            exec.builder.with_partial_inputs(missing);
        }

        let context = InvocationContext::new(
            self.job.specification.clone(),
            exec.item.function_unique_id.clone(),
            exec.item.function_parameters.clone(),
            exec.log.clone(),
            services.dependent_query.clone(),
            self.node.correlation(),
        );
        let invocation = {
            let _attached = exec.log.attach();
            let _armed = services.watchdog.as_ref().map(|w| w.arm(self.node.id(), &exec.item));
            exec.statistics.begin_invocation();
            panic::catch_unwind(AssertUnwindSafe(|| {
                invoker.execute(&context, exec.target.as_ref(), &exec.inputs, &exec.outputs)
            }))
            .unwrap_or_else(|payload| Invocation::Complete(Err(InvocationError::from_panic(payload))))
        };

        match invocation {
            Invocation::Complete(outcome) => InvokeProgress::Finished(self.complete_invocation(exec, outcome)),
            Invocation::Suspended(pending) => {
                tracing::debug!(node = self.node.id(), item = %exec.item, "invocation suspended");
                InvokeProgress::Suspended(exec, pending)
            }
        }
    }

    fn complete_invocation(&self, exec: ItemExecution, outcome: InvocationOutcome) -> CalculationJobResultItem {
        let ItemExecution {
            item,
            outputs,
            mut builder,
            log,
            statistics,
            ..
        } = exec;
        let attached = log.attach();

        // Only a produced result set is recorded in the statistics.
        let (values, statistics) = match outcome {
            Ok(values) => {
                statistics.end_invocation();
                let values = reconcile_outputs(&item, &outputs, values, &mut builder, &log);
                statistics.set_expected_data_output_samples(values.len());
                (values, Some(statistics))
            }
            Err(InvocationError::Blacklisted) => {
                log.info("function blacklisted during invocation");
                builder.with_suppression();
                (sentinels(&outputs, NotCalculatedSentinel::Suppressed), None)
            }
            Err(error) => {
                tracing::warn!(node = self.node.id(), item = %item, error = %error, "invocation failed");
                log.set_exception(error.class_name(), Some(error.message()), error.stack_trace());
                builder.with_exception();
                if !matches!(error, InvocationError::NoResult) {
                    self.node.services().blacklist_maintainer.failed(&item);
                }
                (sentinels(&outputs, NotCalculatedSentinel::EvaluationError), None)
            }
        };

        self.cache.put_values(values, &self.job.cache_select_hint, statistics);
        drop(attached);
        builder.build(log.finish())
    }

    // ── Items that never invoke ───────────────────────────────────────────────

    fn suppress(&self, mut exec: ItemExecution) -> CalculationJobResultItem {
        tracing::debug!(node = self.node.id(), item = %exec.item, "item suppressed by blacklist");
        exec.builder.with_suppression();
        self.write_sentinels(&exec.outputs, NotCalculatedSentinel::Suppressed);
        exec.builder.build(exec.log.finish())
    }

    fn missing_inputs(&self, mut exec: ItemExecution) -> CalculationJobResultItem {
        let missing: Vec<ValueSpecification> = exec.inputs.missing().iter().cloned().collect();
        tracing::debug!(node = self.node.id(), item = %exec.item, missing = missing.len(), "inputs missing, not invoking");
        exec.builder.with_missing_inputs(missing);
        self.write_sentinels(&exec.outputs, NotCalculatedSentinel::MissingInputs);
        exec.builder.build(exec.log.finish())
    }

    fn fail_unresolved_target(&self, exec: ItemExecution) -> CalculationJobResultItem {
        let message = format!("unable to resolve target {}", exec.item.target);
        self.fail_item(exec, "InvalidTargetException", message)
    }

    fn fail_item(&self, mut exec: ItemExecution, class_name: &str, message: String) -> CalculationJobResultItem {
        tracing::warn!(node = self.node.id(), item = %exec.item, class_name, "{message}");
        exec.log.set_exception(class_name, Some(message), None);
        exec.builder.with_exception();
        self.write_sentinels(&exec.outputs, NotCalculatedSentinel::EvaluationError);
        exec.builder.build(exec.log.finish())
    }

    fn write_sentinels(&self, outputs: &BTreeSet<ValueSpecification>, sentinel: NotCalculatedSentinel) {
        if !outputs.is_empty() {
            self.cache
                .put_values(sentinels(outputs, sentinel), &self.job.cache_select_hint, None);
        }
    }
}

/// Record the resolved target. A missing target is a missing input when the
/// invoker tolerates those; otherwise the item can't proceed.
fn accept_target(exec: &mut ItemExecution, target: Option<ComputationTarget>) -> bool {
    match target {
        Some(target) => {
            exec.target = Some(target);
            true
        }
        None => match &exec.invoker {
            Some(invoker) if invoker.can_handle_missing_inputs() => {
                exec.inputs
                    .mark_missing(ValueSpecification::target_sourcing(&exec.item.target));
                true
            }
            _ => false,
        },
    }
}

fn abort_target(task: Option<TargetTask>) {
    if let Some(task) = task {
        task.abort();
    }
}

fn sentinels(outputs: &BTreeSet<ValueSpecification>, sentinel: NotCalculatedSentinel) -> Vec<ComputedValue> {
    outputs
        .iter()
        .map(|spec| ComputedValue::new(spec.clone(), sentinel))
        .collect()
}

/// Keep declared outputs, drop the rest, and backfill anything declared but
/// not produced with an evaluation error.
fn reconcile_outputs(
    item: &CalculationJobItem,
    outputs: &BTreeSet<ValueSpecification>,
    values: Vec<ComputedValue>,
    builder: &mut ResultItemBuilder,
    log: &ExecutionLogCollector,
) -> Vec<ComputedValue> {
    let mut produced: BTreeMap<ValueSpecification, CacheValue> = BTreeMap::new();
    for value in values {
        if outputs.contains(&value.specification) {
            produced.insert(value.specification, value.value);
        } else {
            tracing::debug!(item = %item, value = %value.specification, "dropping undeclared output");
        }
    }

    let missing: Vec<ValueSpecification> = outputs
        .iter()
        .filter(|spec| !produced.contains_key(*spec))
        .cloned()
        .collect();
    if !missing.is_empty() {
        log.warn(format!("{} declared output(s) not produced", missing.len()));
        tracing::debug!(item = %item, missing = missing.len(), "declared outputs not produced");
        for spec in &missing {
            produced.insert(
                spec.clone(),
                CacheValue::NotCalculated(NotCalculatedSentinel::EvaluationError),
            );
        }
        builder.with_missing_outputs(missing);
    }

    produced
        .into_iter()
        .map(|(specification, value)| ComputedValue { specification, value })
        .collect()
}

// ── Handle ────────────────────────────────────────────────────────────────────

/// A suspended job. Resolves to the job result, or `None` if cancelled.
pub struct JobHandle {
    specification: CalculationJobSpecification,
    future: Pin<Box<dyn Future<Output = JobOutcome> + Send>>,
}

impl JobHandle {
    fn new(run: JobRun, wait: Wait) -> Self {
        Self {
            specification: run.job.specification.clone(),
            future: Box::pin(run.drive(wait)),
        }
    }

    pub fn specification(&self) -> &CalculationJobSpecification {
        &self.specification
    }
}

impl Future for JobHandle {
    type Output = JobOutcome;

    fn poll(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Self::Output> {
        self.future.as_mut().poll(cx)
    }
}
