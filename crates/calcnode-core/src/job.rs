//! Job model: the unit of work shipped from a coordinator to a node.
//!
//! A `CalculationJob` is an ordered batch of `CalculationJobItem`s executed
//! sequentially on one node. Items reference their inputs and outputs either
//! by value specification or by dense identifier; see [`crate::identifier`].

use std::collections::{BTreeSet, HashMap, HashSet};
use std::fmt;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use serde::{Deserialize, Serialize};

use crate::identifier::IdentifierMap;
use crate::log::ExecutionLogMode;
use crate::value::{
    CacheSelectHint, ComputationTargetSpecification, FunctionParameters, ValueSpecification,
};

// ── Specification ─────────────────────────────────────────────────────────────

/// Identifies a job within a view cycle.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct CalculationJobSpecification {
    /// View cycle the job belongs to. Together with `calc_config_name` it
    /// selects the value cache.
    pub view_cycle_id: String,
    pub calc_config_name: String,
    /// Unix ms.
    pub valuation_time: u64,
    /// Coordinator-assigned, unique within the cycle.
    pub job_id: u64,
}

impl fmt::Display for CalculationJobSpecification {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "job {} ({}/{} @ {})",
            self.job_id, self.view_cycle_id, self.calc_config_name, self.valuation_time
        )
    }
}

// ── Value spec references ─────────────────────────────────────────────────────

/// Inputs or outputs of an item, carried as specs, identifiers, or both once
/// converted.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(from = "RawValueSpecificationSet")]
pub struct ValueSpecificationSet {
    #[serde(skip_serializing_if = "Option::is_none")]
    specifications: Option<BTreeSet<ValueSpecification>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    identifiers: Option<Vec<i64>>,
}

/// Wire shape; identifiers are normalized on the way in.
#[derive(Deserialize)]
struct RawValueSpecificationSet {
    #[serde(default)]
    specifications: Option<BTreeSet<ValueSpecification>>,
    #[serde(default)]
    identifiers: Option<Vec<i64>>,
}

impl From<RawValueSpecificationSet> for ValueSpecificationSet {
    fn from(raw: RawValueSpecificationSet) -> Self {
        let identifiers = raw.identifiers.map(|mut ids| {
            ids.sort_unstable();
            ids.dedup();
            ids
        });
        Self {
            specifications: raw.specifications,
            identifiers,
        }
    }
}

impl ValueSpecificationSet {
    pub fn from_specifications(specs: impl IntoIterator<Item = ValueSpecification>) -> Self {
        Self {
            specifications: Some(specs.into_iter().collect()),
            identifiers: None,
        }
    }

    pub fn from_identifiers(identifiers: impl IntoIterator<Item = i64>) -> Self {
        let mut ids: Vec<i64> = identifiers.into_iter().collect();
        ids.sort_unstable();
        ids.dedup();
        Self {
            specifications: None,
            identifiers: Some(ids),
        }
    }

    pub fn specifications(&self) -> Option<&BTreeSet<ValueSpecification>> {
        self.specifications.as_ref()
    }

    pub fn identifiers(&self) -> Option<&[i64]> {
        self.identifiers.as_deref()
    }

    /// Populate specs from identifiers. No-op if specs are already known.
    /// Ids missing from `specs` go to `unresolved` and leave the set
    /// unconverted.
    fn convert_identifiers(
        &mut self,
        specs: &HashMap<i64, ValueSpecification>,
        unresolved: &mut BTreeSet<i64>,
    ) {
        if self.specifications.is_some() {
            return;
        }
        let Some(ids) = &self.identifiers else {
            return;
        };
        let mut converted = BTreeSet::new();
        let mut complete = true;
        for id in ids {
            match specs.get(id) {
                Some(spec) => {
                    converted.insert(spec.clone());
                }
                None => {
                    unresolved.insert(*id);
                    complete = false;
                }
            }
        }
        if complete {
            self.specifications = Some(converted);
        }
    }

    /// Populate identifiers from specs. No-op if identifiers are already known.
    fn convert_value_specifications(&mut self, identifiers: &HashMap<ValueSpecification, i64>) {
        if self.identifiers.is_some() {
            return;
        }
        if let Some(specs) = &self.specifications {
            let mut ids: Vec<i64> = specs
                .iter()
                .filter_map(|spec| identifiers.get(spec).copied())
                .collect();
            ids.sort_unstable();
            self.identifiers = Some(ids);
        }
    }

    fn same_values(&self, other: &Self) -> bool {
        match (&self.specifications, &other.specifications) {
            (Some(a), Some(b)) => a == b,
            _ => self.identifiers == other.identifiers,
        }
    }
}

// ── Items ─────────────────────────────────────────────────────────────────────

/// One calculation step: a function applied to a target.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CalculationJobItem {
    pub function_unique_id: String,
    #[serde(default)]
    pub function_parameters: FunctionParameters,
    pub target: ComputationTargetSpecification,
    pub inputs: ValueSpecificationSet,
    pub outputs: ValueSpecificationSet,
    #[serde(default)]
    pub log_mode: ExecutionLogMode,
}

impl CalculationJobItem {
    pub fn new(
        function_unique_id: impl Into<String>,
        function_parameters: FunctionParameters,
        target: ComputationTargetSpecification,
        inputs: impl IntoIterator<Item = ValueSpecification>,
        outputs: impl IntoIterator<Item = ValueSpecification>,
        log_mode: ExecutionLogMode,
    ) -> Self {
        Self {
            function_unique_id: function_unique_id.into(),
            function_parameters,
            target,
            inputs: ValueSpecificationSet::from_specifications(inputs),
            outputs: ValueSpecificationSet::from_specifications(outputs),
            log_mode,
        }
    }

    /// Item carrying identifiers only; specs are filled in by
    /// [`CalculationJob::convert_identifiers`].
    pub fn with_identifiers(
        function_unique_id: impl Into<String>,
        function_parameters: FunctionParameters,
        target: ComputationTargetSpecification,
        input_identifiers: impl IntoIterator<Item = i64>,
        output_identifiers: impl IntoIterator<Item = i64>,
        log_mode: ExecutionLogMode,
    ) -> Self {
        Self {
            function_unique_id: function_unique_id.into(),
            function_parameters,
            target,
            inputs: ValueSpecificationSet::from_identifiers(input_identifiers),
            outputs: ValueSpecificationSet::from_identifiers(output_identifiers),
            log_mode,
        }
    }

    /// Input specs. Empty until identifiers are converted.
    pub fn input_specifications(&self) -> Vec<ValueSpecification> {
        self.inputs
            .specifications()
            .map(|s| s.iter().cloned().collect())
            .unwrap_or_default()
    }

    /// Output specs. Empty until identifiers are converted.
    pub fn output_specifications(&self) -> Vec<ValueSpecification> {
        self.outputs
            .specifications()
            .map(|s| s.iter().cloned().collect())
            .unwrap_or_default()
    }

    /// True when both inputs and outputs are known as specs.
    pub fn has_specifications(&self) -> bool {
        self.inputs.specifications().is_some() && self.outputs.specifications().is_some()
    }
}

impl PartialEq for CalculationJobItem {
    fn eq(&self, other: &Self) -> bool {
        self.function_unique_id == other.function_unique_id
            && self.target == other.target
            && self.inputs.same_values(&other.inputs)
            && self.outputs.same_values(&other.outputs)
    }
}

impl fmt::Display for CalculationJobItem {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} on {}", self.function_unique_id, self.target)
    }
}

// ── Cancellation ──────────────────────────────────────────────────────────────

/// Shared cancellation flag. Clones observe the same flag.
#[derive(Debug, Clone, Default)]
pub struct CancellationFlag(Arc<AtomicBool>);

impl CancellationFlag {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn cancel(&self) {
        self.0.store(true, Ordering::Release);
    }

    pub fn is_cancelled(&self) -> bool {
        self.0.load(Ordering::Acquire)
    }
}

/// Identifiers a job references that the identifier map can't resolve.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("unknown value identifiers {0:?}")]
pub struct UnresolvedIdentifiers(pub Vec<i64>);

// ── Job ───────────────────────────────────────────────────────────────────────

/// A batch of items executed in order on one node.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CalculationJob {
    pub specification: CalculationJobSpecification,
    pub items: Vec<CalculationJobItem>,
    #[serde(default)]
    pub cache_select_hint: CacheSelectHint,
    #[serde(skip)]
    cancellation: CancellationFlag,
}

impl CalculationJob {
    pub fn new(
        specification: CalculationJobSpecification,
        items: Vec<CalculationJobItem>,
        cache_select_hint: CacheSelectHint,
    ) -> Self {
        Self {
            specification,
            items,
            cache_select_hint,
            cancellation: CancellationFlag::new(),
        }
    }

    /// Handle the coordinator keeps to cancel the job from another thread.
    pub fn cancellation(&self) -> CancellationFlag {
        self.cancellation.clone()
    }

    pub fn cancel(&self) {
        self.cancellation.cancel();
    }

    pub fn is_cancelled(&self) -> bool {
        self.cancellation.is_cancelled()
    }

    /// Every identifier referenced by any item.
    pub fn collect_identifiers(&self) -> HashSet<i64> {
        let mut ids = HashSet::new();
        for item in &self.items {
            for set in [&item.inputs, &item.outputs] {
                if let Some(item_ids) = set.identifiers() {
                    ids.extend(item_ids.iter().copied());
                }
            }
        }
        ids
    }

    /// Every value specification referenced by any item.
    pub fn collect_value_specifications(&self) -> HashSet<ValueSpecification> {
        let mut specs = HashSet::new();
        for item in &self.items {
            for set in [&item.inputs, &item.outputs] {
                if let Some(item_specs) = set.specifications() {
                    specs.extend(item_specs.iter().cloned());
                }
            }
        }
        specs
    }

    /// Fill in specs on every item from its identifiers. Items that already
    /// know their specs are left alone, so repeated calls are no-ops.
    ///
    /// Fails with every id the map doesn't know. Sets holding such an id
    /// stay unconverted.
    pub fn convert_identifiers(&mut self, map: &dyn IdentifierMap) -> Result<(), UnresolvedIdentifiers> {
        let ids: Vec<i64> = self.collect_identifiers().into_iter().collect();
        let specs = if ids.is_empty() {
            HashMap::new()
        } else {
            map.get_value_specifications(&ids)
        };
        let mut unresolved = BTreeSet::new();
        for item in &mut self.items {
            item.inputs.convert_identifiers(&specs, &mut unresolved);
            item.outputs.convert_identifiers(&specs, &mut unresolved);
        }
        if unresolved.is_empty() {
            Ok(())
        } else {
            Err(UnresolvedIdentifiers(unresolved.into_iter().collect()))
        }
    }

    /// Fill in identifiers on every item from its specs.
    pub fn convert_value_specifications(&mut self, map: &dyn IdentifierMap) {
        let specs: Vec<ValueSpecification> = self.collect_value_specifications().into_iter().collect();
        let ids = if specs.is_empty() {
            HashMap::new()
        } else {
            map.get_identifiers(&specs)
        };
        for item in &mut self.items {
            item.inputs.convert_value_specifications(&ids);
            item.outputs.convert_value_specifications(&ids);
        }
    }
}

impl fmt::Display for CalculationJob {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} [{} items]", self.specification, self.items.len())
    }
}
