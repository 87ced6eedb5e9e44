//! Dense integer identifiers for value specifications.
//!
//! Coordinators ship value specs as `i64` ids to keep job messages small.
//! Both ends resolve them against the same batch-scoped table.

use std::collections::HashMap;
use std::sync::atomic::{AtomicI64, Ordering};
use std::sync::Arc;

use dashmap::DashMap;

use crate::value::ValueSpecification;

/// Bidirectional id ↔ spec table.
pub trait IdentifierMap: Send + Sync {
    /// Ids for the given specs, allocating new ones where needed.
    fn get_identifiers(&self, specs: &[ValueSpecification]) -> HashMap<ValueSpecification, i64>;

    /// Specs for the given ids. Unknown ids are absent from the result.
    fn get_value_specifications(&self, identifiers: &[i64]) -> HashMap<i64, ValueSpecification>;
}

/// In-process table. Ids are allocated densely from 1.
#[derive(Clone, Default)]
pub struct InMemoryIdentifierMap {
    by_spec: Arc<DashMap<ValueSpecification, i64>>,
    by_id: Arc<DashMap<i64, ValueSpecification>>,
    next: Arc<AtomicI64>,
}

impl InMemoryIdentifierMap {
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of allocated identifiers.
    pub fn len(&self) -> usize {
        self.by_id.len()
    }

    pub fn is_empty(&self) -> bool {
        self.by_id.is_empty()
    }

    fn identifier(&self, spec: &ValueSpecification) -> i64 {
        if let Some(id) = self.by_spec.get(spec) {
            return *id;
        }
        // entry() holds the shard lock, so two racing callers agree on one id.
        let id = *self
            .by_spec
            .entry(spec.clone())
            .or_insert_with(|| self.next.fetch_add(1, Ordering::Relaxed) + 1);
        self.by_id.entry(id).or_insert_with(|| spec.clone());
        id
    }
}

impl IdentifierMap for InMemoryIdentifierMap {
    fn get_identifiers(&self, specs: &[ValueSpecification]) -> HashMap<ValueSpecification, i64> {
        specs
            .iter()
            .map(|spec| (spec.clone(), self.identifier(spec)))
            .collect()
    }

    fn get_value_specifications(&self, identifiers: &[i64]) -> HashMap<i64, ValueSpecification> {
        identifiers
            .iter()
            .filter_map(|id| self.by_id.get(id).map(|spec| (*id, spec.clone())))
            .collect()
    }
}
