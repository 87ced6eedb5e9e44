//! View computation caches: the key/value stores jobs read inputs from and
//! write outputs to.
//!
//! A cache is addressed by (view-cycle id, calc-config name) and holds two
//! sections: *shared* values visible to every node, and *private* values
//! only consumed where they were produced. The job's `CacheSelectHint`
//! decides which section a value lives in.

use std::sync::Arc;

use dashmap::DashMap;

use calcnode_core::value::{CacheSelectHint, CacheValue, ComputedValue, ValueSpecification};

/// Section of a view computation cache.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum CacheSection {
    Shared,
    Private,
}

impl CacheSection {
    pub fn for_value(hint: &CacheSelectHint, spec: &ValueSpecification) -> Self {
        if hint.is_private(spec) {
            CacheSection::Private
        } else {
            CacheSection::Shared
        }
    }
}

#[derive(Debug, Clone, thiserror::Error)]
pub enum CacheError {
    #[error("cache write failed: {0}")]
    WriteFailed(String),
    #[error("write-behind requires a worker pool")]
    NoWorkerPool,
    #[error("write-behind writer stopped")]
    WriterStopped,
    #[error("{count} cache write(s) failed, first: {first}")]
    FlushFailed { count: usize, first: String },
}

/// Underlying store for one (view cycle, calc config) pair.
pub trait ViewComputationCache: Send + Sync {
    fn get(&self, section: CacheSection, spec: &ValueSpecification) -> Option<CacheValue>;

    fn put(&self, section: CacheSection, values: &[ComputedValue]) -> Result<(), CacheError>;

    /// Estimated serialized size of a value, in bytes.
    fn estimate_value_size(&self, value: &CacheValue) -> usize {
        serde_json::to_vec(value).map(|v| v.len()).unwrap_or(0)
    }

    /// Look up each spec in the section the hint selects. Order follows `specs`.
    fn get_values(
        &self,
        specs: &[ValueSpecification],
        hint: &CacheSelectHint,
    ) -> Vec<(ValueSpecification, Option<CacheValue>)> {
        specs
            .iter()
            .map(|spec| {
                let section = CacheSection::for_value(hint, spec);
                (spec.clone(), self.get(section, spec))
            })
            .collect()
    }

    /// Write values, each to the section the hint selects.
    fn put_values(&self, values: &[ComputedValue], hint: &CacheSelectHint) -> Result<(), CacheError> {
        let (private, shared) = split_by_section(values.to_vec(), hint);
        if !shared.is_empty() {
            self.put(CacheSection::Shared, &shared)?;
        }
        if !private.is_empty() {
            self.put(CacheSection::Private, &private)?;
        }
        Ok(())
    }
}

/// Partition values into (private, shared).
pub fn split_by_section(
    values: Vec<ComputedValue>,
    hint: &CacheSelectHint,
) -> (Vec<ComputedValue>, Vec<ComputedValue>) {
    values
        .into_iter()
        .partition(|v| hint.is_private(&v.specification))
}

// ── In-memory store ───────────────────────────────────────────────────────────

#[derive(Default)]
pub struct InMemoryViewComputationCache {
    shared: DashMap<ValueSpecification, CacheValue>,
    private: DashMap<ValueSpecification, CacheValue>,
}

impl InMemoryViewComputationCache {
    pub fn new() -> Self {
        Self::default()
    }

    fn section(&self, section: CacheSection) -> &DashMap<ValueSpecification, CacheValue> {
        match section {
            CacheSection::Shared => &self.shared,
            CacheSection::Private => &self.private,
        }
    }

    /// Number of values held across both sections.
    pub fn len(&self) -> usize {
        self.shared.len() + self.private.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl ViewComputationCache for InMemoryViewComputationCache {
    fn get(&self, section: CacheSection, spec: &ValueSpecification) -> Option<CacheValue> {
        self.section(section).get(spec).map(|v| v.clone())
    }

    fn put(&self, section: CacheSection, values: &[ComputedValue]) -> Result<(), CacheError> {
        let map = self.section(section);
        for value in values {
            map.insert(value.specification.clone(), value.value.clone());
        }
        Ok(())
    }
}

// ── Cache source ──────────────────────────────────────────────────────────────

/// Hands out the store for a (view cycle, calc config) pair.
///
/// Repeated calls for the same pair return the same instance; deferred
/// wrappers are shared by that identity.
pub trait ViewComputationCacheSource: Send + Sync {
    fn get_cache(&self, view_cycle_id: &str, calc_config_name: &str) -> Arc<dyn ViewComputationCache>;
}

#[derive(Clone, Default)]
pub struct InMemoryViewComputationCacheSource {
    /// (view cycle id, calc config) → store
    caches: Arc<DashMap<(String, String), Arc<InMemoryViewComputationCache>>>,
}

impl InMemoryViewComputationCacheSource {
    pub fn new() -> Self {
        Self::default()
    }

    /// Typed access to a store, for inspection.
    pub fn in_memory_cache(
        &self,
        view_cycle_id: &str,
        calc_config_name: &str,
    ) -> Arc<InMemoryViewComputationCache> {
        self.caches
            .entry((view_cycle_id.to_string(), calc_config_name.to_string()))
            .or_default()
            .clone()
    }

    /// Drop every store belonging to a finished view cycle.
    pub fn release_caches(&self, view_cycle_id: &str) -> usize {
        let before = self.caches.len();
        self.caches.retain(|(cycle, _), _| cycle != view_cycle_id);
        let released = before - self.caches.len();
        tracing::debug!(view_cycle_id, released, "released view computation caches");
        released
    }

    pub fn cache_count(&self) -> usize {
        self.caches.len()
    }
}

impl ViewComputationCacheSource for InMemoryViewComputationCacheSource {
    fn get_cache(&self, view_cycle_id: &str, calc_config_name: &str) -> Arc<dyn ViewComputationCache> {
        self.in_memory_cache(view_cycle_id, calc_config_name)
    }
}
