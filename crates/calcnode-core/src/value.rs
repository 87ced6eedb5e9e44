//! Value types: what a calculation step consumes and produces.
//!
//! A `ValueSpecification` names one value in the cache: a value name, the
//! target it was computed for, and a property bag. Specifications are the
//! cache keys, so they are totally ordered and hashable.

use std::collections::{BTreeMap, BTreeSet};
use std::fmt;

use bytes::Bytes;
use serde::{Deserialize, Serialize};

// ── Targets ───────────────────────────────────────────────────────────────────

/// Kind of object a calculation runs against.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ComputationTargetType {
    /// No target; the function is target-less.
    Null,
    Portfolio,
    Position,
    Trade,
    Security,
    /// A primitive identifier (currency, curve name, ...).
    Primitive,
}

/// Reference to a computation target, resolved on the node.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct ComputationTargetSpecification {
    pub target_type: ComputationTargetType,
    /// Unique id of the target. `None` only for `Null` targets.
    pub unique_id: Option<String>,
}

impl ComputationTargetSpecification {
    pub fn new(target_type: ComputationTargetType, unique_id: impl Into<String>) -> Self {
        Self {
            target_type,
            unique_id: Some(unique_id.into()),
        }
    }

    /// The empty target.
    pub fn null() -> Self {
        Self {
            target_type: ComputationTargetType::Null,
            unique_id: None,
        }
    }
}

impl fmt::Display for ComputationTargetSpecification {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match &self.unique_id {
            Some(id) => write!(f, "{:?}~{}", self.target_type, id),
            None => write!(f, "{:?}", self.target_type),
        }
    }
}

/// A resolved target, as handed to a function invoker.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ComputationTarget {
    pub specification: ComputationTargetSpecification,
    /// Resolved object. Its shape is defined by whoever owns the target master.
    pub value: serde_json::Value,
}

// ── Value specifications ──────────────────────────────────────────────────────

/// Value name used when a missing target is reported as a missing input.
pub const TARGET_VALUE_NAME: &str = "Target";

/// Fully qualified name of a single value in the cache.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct ValueSpecification {
    pub value_name: String,
    pub target: ComputationTargetSpecification,
    #[serde(default)]
    pub properties: BTreeMap<String, String>,
}

impl ValueSpecification {
    pub fn new(value_name: impl Into<String>, target: ComputationTargetSpecification) -> Self {
        Self {
            value_name: value_name.into(),
            target,
            properties: BTreeMap::new(),
        }
    }

    /// Builder-style property setter.
    pub fn with_property(mut self, name: impl Into<String>, value: impl Into<String>) -> Self {
        self.properties.insert(name.into(), value.into());
        self
    }

    /// The pseudo-input standing for the target itself. Reported as missing
    /// when the target can't be resolved but the function tolerates it.
    pub fn target_sourcing(target: &ComputationTargetSpecification) -> Self {
        Self::new(TARGET_VALUE_NAME, target.clone()).with_property("Function", "TargetSourcingFunction")
    }
}

impl fmt::Display for ValueSpecification {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}[{}]", self.value_name, self.target)?;
        if !self.properties.is_empty() {
            let props: Vec<String> = self
                .properties
                .iter()
                .map(|(k, v)| format!("{k}={v}"))
                .collect();
            write!(f, "{{{}}}", props.join(","))?;
        }
        Ok(())
    }
}

// ── Values ────────────────────────────────────────────────────────────────────

/// Why a value could not be produced. Written to the cache in place of the
/// value so consumers can tell "not computed yet" from "could not compute".
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum NotCalculatedSentinel {
    /// Required inputs were missing and the function can't run without them.
    MissingInputs,
    /// The function failed, or didn't produce this output.
    EvaluationError,
    /// The function was skipped by a blacklist.
    Suppressed,
}

/// Content of a cache slot.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", content = "data", rename_all = "snake_case")]
pub enum CacheValue {
    Value(serde_json::Value),
    NotCalculated(NotCalculatedSentinel),
}

impl CacheValue {
    /// True for sentinels. Callers treat these exactly like an absent value.
    pub fn is_missing(&self) -> bool {
        matches!(self, CacheValue::NotCalculated(_))
    }

    pub fn as_value(&self) -> Option<&serde_json::Value> {
        match self {
            CacheValue::Value(v) => Some(v),
            CacheValue::NotCalculated(_) => None,
        }
    }
}

impl From<serde_json::Value> for CacheValue {
    fn from(value: serde_json::Value) -> Self {
        CacheValue::Value(value)
    }
}

impl From<NotCalculatedSentinel> for CacheValue {
    fn from(sentinel: NotCalculatedSentinel) -> Self {
        CacheValue::NotCalculated(sentinel)
    }
}

/// A value paired with its specification.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ComputedValue {
    pub specification: ValueSpecification,
    pub value: CacheValue,
}

impl ComputedValue {
    pub fn new(specification: ValueSpecification, value: impl Into<CacheValue>) -> Self {
        Self {
            specification,
            value: value.into(),
        }
    }
}

// ── Function parameters ───────────────────────────────────────────────────────

/// Opaque, function-defined parameter blob shipped with each job item.
#[derive(Debug, Clone, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct FunctionParameters(pub Bytes);

impl FunctionParameters {
    pub fn empty() -> Self {
        Self(Bytes::new())
    }

    pub fn from_json(value: &serde_json::Value) -> Self {
        // Serializing a `Value` can't fail.
        Self(Bytes::from(serde_json::to_vec(value).unwrap_or_default()))
    }

    /// Decode the blob as JSON, if it is JSON.
    pub fn as_json(&self) -> Option<serde_json::Value> {
        if self.0.is_empty() {
            return None;
        }
        serde_json::from_slice(&self.0).ok()
    }

    /// Stable BLAKE3 fingerprint, hex-encoded. Used as a compact rule key.
    pub fn fingerprint(&self) -> String {
        hex::encode(blake3::hash(&self.0).as_bytes())
    }
}

// ── Cache selection ───────────────────────────────────────────────────────────

/// Routes each value to the shared or private section of a value cache.
///
/// Private values are only consumed on the node that produced them, so a
/// coordinator marks them to keep them off the shared store.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CacheSelectHint {
    /// The listed specs are the *private* ones when true, the *shared* ones
    /// when false.
    private_listed: bool,
    values: BTreeSet<ValueSpecification>,
}

impl Default for CacheSelectHint {
    fn default() -> Self {
        Self::all_shared()
    }
}

impl CacheSelectHint {
    pub fn all_shared() -> Self {
        Self {
            private_listed: true,
            values: BTreeSet::new(),
        }
    }

    pub fn all_private() -> Self {
        Self {
            private_listed: false,
            values: BTreeSet::new(),
        }
    }

    pub fn private_values(values: impl IntoIterator<Item = ValueSpecification>) -> Self {
        Self {
            private_listed: true,
            values: values.into_iter().collect(),
        }
    }

    pub fn shared_values(values: impl IntoIterator<Item = ValueSpecification>) -> Self {
        Self {
            private_listed: false,
            values: values.into_iter().collect(),
        }
    }

    pub fn is_private(&self, spec: &ValueSpecification) -> bool {
        self.values.contains(spec) == self.private_listed
    }
}
