//! Built-in functions and targets the daemon registers at startup.
//!
//! Enough to drive the node end to end from `calcnode-ctl` without a
//! coordinator: plain arithmetic, a target-dependent pricer, a function that
//! runs asynchronously, and one that always fails.

use std::collections::BTreeSet;
use std::sync::Arc;
use std::time::Duration;

use serde_json::{json, Value};

use calcnode_core::value::{
    ComputationTarget, ComputationTargetSpecification, ComputationTargetType, ComputedValue,
    ValueSpecification,
};
use calcnode_services::function::{
    InMemoryFunctionRepository, InMemoryTargetResolver, InvocationOutcome,
};
use calcnode_services::{
    ClosureInvoker, FunctionInputs, FunctionInvoker, Invocation, InvocationContext,
    InvocationError, PendingInvocation,
};

pub const SUM: &str = "Sum";
pub const SPREAD: &str = "Spread";
pub const PRESENT_VALUE: &str = "PresentValue";
pub const DELAYED_SUM: &str = "DelayedSum";
pub const FAIL: &str = "Fail";

/// Register every built-in function.
pub fn register(functions: &InMemoryFunctionRepository) {
    functions.register(
        SUM,
        Arc::new(ClosureInvoker::new(|_, _, inputs, desired| {
            Ok(fill(desired, json!(sum(inputs))))
        })),
    );
    functions.register(
        SPREAD,
        Arc::new(
            ClosureInvoker::new(|ctx, _, inputs, desired| {
                if !inputs.missing().is_empty() {
                    ctx.log()
                        .warn(format!("{} input(s) missing, treated as zero", inputs.missing().len()));
                }
                let mut values = inputs.values().map(|(_, v)| v.as_f64().unwrap_or(0.0));
                let first = values.next().unwrap_or(0.0);
                let rest: f64 = values.sum();
                Ok(fill(desired, json!(first - rest)))
            })
            .tolerating_missing_inputs(),
        ),
    );
    functions.register(PRESENT_VALUE, Arc::new(ClosureInvoker::new(present_value)));
    functions.register(DELAYED_SUM, Arc::new(DelayedSum));
    functions.register(
        FAIL,
        Arc::new(ClosureInvoker::new(|ctx, _, _, _| {
            ctx.log().error("refusing to compute");
            Err(InvocationError::failed("IllegalStateException", "this function always fails"))
        })),
    );
    tracing::info!(count = functions.function_ids().len(), "built-in functions registered");
}

/// A few trades for `PresentValue` to price.
pub fn demo_targets(targets: &InMemoryTargetResolver) {
    for (id, notional, rate, years) in [
        ("T~1", 1_000_000.0, 0.05, 1.0),
        ("T~2", 250_000.0, 0.03, 5.0),
        ("T~3", 5_000_000.0, 0.045, 10.0),
    ] {
        targets.insert(ComputationTarget {
            specification: ComputationTargetSpecification::new(ComputationTargetType::Trade, id),
            value: json!({ "notional": notional, "rate": rate, "years": years }),
        });
    }
}

// ── Functions ─────────────────────────────────────────────────────────────────

fn sum(inputs: &FunctionInputs) -> f64 {
    inputs.values().filter_map(|(_, v)| v.as_f64()).sum()
}

fn fill(desired: &BTreeSet<ValueSpecification>, value: Value) -> Vec<ComputedValue> {
    desired
        .iter()
        .map(|spec| ComputedValue::new(spec.clone(), value.clone()))
        .collect()
}

/// Discounts the trade's notional: `notional / (1 + rate)^years`.
fn present_value(
    _context: &InvocationContext,
    target: Option<&ComputationTarget>,
    _inputs: &FunctionInputs,
    desired: &BTreeSet<ValueSpecification>,
) -> InvocationOutcome {
    let target = target.ok_or_else(|| InvocationError::failed("InvalidTargetException", "no target"))?;
    let field = |name: &str| {
        target.value.get(name).and_then(Value::as_f64).ok_or_else(|| {
            InvocationError::failed(
                "IllegalArgumentException",
                format!("target {} has no numeric {name}", target.specification),
            )
        })
    };
    let notional = field("notional")?;
    let rate = field("rate")?;
    let years = field("years")?;
    Ok(fill(desired, json!(notional / (1.0 + rate).powf(years))))
}

/// Sums its inputs after `delay_ms` (function parameter, default 10).
struct DelayedSum;

impl FunctionInvoker for DelayedSum {
    fn execute(
        &self,
        context: &InvocationContext,
        _target: Option<&ComputationTarget>,
        inputs: &FunctionInputs,
        desired_outputs: &BTreeSet<ValueSpecification>,
    ) -> Invocation {
        let delay_ms = context
            .parameters()
            .as_json()
            .and_then(|p| p.get("delay_ms").and_then(Value::as_u64))
            .unwrap_or(10);
        let values = fill(desired_outputs, json!(sum(inputs)));
        Invocation::Suspended(PendingInvocation::new(async move {
            tokio::time::sleep(Duration::from_millis(delay_ms)).await;
            Ok(values)
        }))
    }
}
