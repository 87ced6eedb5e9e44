//! Job results: one result item per job item, in job order.

use std::collections::BTreeSet;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::job::CalculationJobSpecification;
use crate::log::ExecutionLog;
use crate::value::ValueSpecification;

/// Outcome of a single job item.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum InvocationResult {
    Success,
    /// Ran with some inputs missing; the function tolerates that.
    PartialInputs,
    /// Didn't run; required inputs were missing.
    MissingInputs,
    /// Skipped by a blacklist.
    Suppressed,
    /// Target, function lookup or the function itself failed.
    Exception,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CalculationJobResultItem {
    pub status: InvocationResult,
    pub execution_log: ExecutionLog,
    #[serde(default, skip_serializing_if = "BTreeSet::is_empty")]
    pub missing_inputs: BTreeSet<ValueSpecification>,
    #[serde(default, skip_serializing_if = "BTreeSet::is_empty")]
    pub missing_outputs: BTreeSet<ValueSpecification>,
}

impl CalculationJobResultItem {
    pub fn is_failed(&self) -> bool {
        matches!(self.status, InvocationResult::Exception)
    }
}

/// Accumulates the outcome of an item as execution proceeds.
#[derive(Debug, Default)]
pub struct ResultItemBuilder {
    suppressed: bool,
    exception: bool,
    missing_inputs_fatal: bool,
    missing_inputs: BTreeSet<ValueSpecification>,
    missing_outputs: BTreeSet<ValueSpecification>,
}

impl ResultItemBuilder {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_suppression(&mut self) -> &mut Self {
        self.suppressed = true;
        self
    }

    /// Mark the item failed. The exception detail itself lives in the
    /// execution log.
    pub fn with_exception(&mut self) -> &mut Self {
        self.exception = true;
        self
    }

    /// Inputs were missing and the function did not run.
    pub fn with_missing_inputs(
        &mut self,
        missing: impl IntoIterator<Item = ValueSpecification>,
    ) -> &mut Self {
        self.missing_inputs_fatal = true;
        self.missing_inputs.extend(missing);
        self
    }

    /// Inputs were missing but the function ran anyway.
    pub fn with_partial_inputs(
        &mut self,
        missing: impl IntoIterator<Item = ValueSpecification>,
    ) -> &mut Self {
        self.missing_inputs.extend(missing);
        self
    }

    pub fn with_missing_outputs(
        &mut self,
        missing: impl IntoIterator<Item = ValueSpecification>,
    ) -> &mut Self {
        self.missing_outputs.extend(missing);
        self
    }

    /// Status precedence: exception, suppression, missing inputs, partial
    /// inputs, success.
    pub fn status(&self) -> InvocationResult {
        if self.exception {
            InvocationResult::Exception
        } else if self.suppressed {
            InvocationResult::Suppressed
        } else if self.missing_inputs_fatal {
            InvocationResult::MissingInputs
        } else if !self.missing_inputs.is_empty() {
            InvocationResult::PartialInputs
        } else {
            InvocationResult::Success
        }
    }

    pub fn build(self, execution_log: ExecutionLog) -> CalculationJobResultItem {
        CalculationJobResultItem {
            status: self.status(),
            execution_log,
            missing_inputs: self.missing_inputs,
            missing_outputs: self.missing_outputs,
        }
    }
}

/// Result of a whole job, returned to the coordinator.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CalculationJobResult {
    pub specification: CalculationJobSpecification,
    /// Wall-clock nanoseconds from job start to result assembly.
    pub duration_nanos: u64,
    pub items: Vec<CalculationJobResultItem>,
    pub compute_node_id: String,
}

impl CalculationJobResult {
    pub fn new(
        specification: CalculationJobSpecification,
        duration: Duration,
        items: Vec<CalculationJobResultItem>,
        compute_node_id: impl Into<String>,
    ) -> Self {
        Self {
            specification,
            duration_nanos: u64::try_from(duration.as_nanos()).unwrap_or(u64::MAX),
            items,
            compute_node_id: compute_node_id.into(),
        }
    }

    pub fn duration(&self) -> Duration {
        Duration::from_nanos(self.duration_nanos)
    }
}
