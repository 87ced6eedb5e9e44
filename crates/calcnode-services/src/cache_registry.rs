//! One deferred cache per underlying store.
//!
//! Nodes targeting the same store share one wrapper, so there is a single
//! writer and a single flush barrier per destination. Entries are keyed by
//! the store's `Arc` identity and reference counted by lease; when the last
//! lease goes the wrapper is torn down and its writer exits.

use std::collections::HashMap;
use std::ops::Deref;
use std::sync::{Arc, Mutex, PoisonError};

use crate::deferred_cache::{DeferredViewComputationCache, WriteStrategy};
use crate::value_cache::{CacheError, ViewComputationCache};
use crate::worker_pool::WorkerPool;

struct RegistryEntry {
    cache: DeferredViewComputationCache,
    leases: usize,
}

struct RegistryInner {
    strategy: WriteStrategy,
    pool: Option<WorkerPool>,
    entries: Mutex<HashMap<usize, RegistryEntry>>,
}

#[derive(Clone)]
pub struct DeferredCacheRegistry {
    inner: Arc<RegistryInner>,
}

fn store_key(store: &Arc<dyn ViewComputationCache>) -> usize {
    Arc::as_ptr(store) as *const () as usize
}

impl DeferredCacheRegistry {
    /// Registry handing out wrappers with `strategy`. Write-behind without a
    /// pool is rejected here, before any job runs.
    pub fn new(strategy: WriteStrategy, pool: Option<WorkerPool>) -> Result<Self, CacheError> {
        if strategy.needs_pool() && pool.is_none() {
            return Err(CacheError::NoWorkerPool);
        }
        Ok(Self {
            inner: Arc::new(RegistryInner {
                strategy,
                pool,
                entries: Mutex::new(HashMap::new()),
            }),
        })
    }

    pub fn direct_write() -> Self {
        Self {
            inner: Arc::new(RegistryInner {
                strategy: WriteStrategy::DirectWrite,
                pool: None,
                entries: Mutex::new(HashMap::new()),
            }),
        }
    }

    pub fn strategy(&self) -> WriteStrategy {
        self.inner.strategy
    }

    /// Lease the wrapper for `store`, creating it on first use.
    pub fn acquire(&self, store: Arc<dyn ViewComputationCache>) -> Result<DeferredCacheLease, CacheError> {
        let key = store_key(&store);
        let mut entries = self.inner.entries.lock().unwrap_or_else(PoisonError::into_inner);
        let cache = match entries.get_mut(&key) {
            Some(entry) => {
                entry.leases += 1;
                entry.cache.clone()
            }
            None => {
                let cache = DeferredViewComputationCache::new(
                    store,
                    self.inner.strategy,
                    self.inner.pool.as_ref(),
                )?;
                entries.insert(
                    key,
                    RegistryEntry {
                        cache: cache.clone(),
                        leases: 1,
                    },
                );
                tracing::debug!(key, strategy = ?self.inner.strategy, "deferred cache created");
                cache
            }
        };
        Ok(DeferredCacheLease {
            registry: self.clone(),
            key,
            cache,
        })
    }

    fn release(&self, key: usize) {
        let mut entries = self.inner.entries.lock().unwrap_or_else(PoisonError::into_inner);
        let remove = match entries.get_mut(&key) {
            Some(entry) => {
                entry.leases = entry.leases.saturating_sub(1);
                entry.leases == 0
            }
            None => false,
        };
        if remove {
            entries.remove(&key);
            tracing::debug!(key, "deferred cache torn down");
        }
    }

    /// Wrappers currently alive.
    pub fn active_caches(&self) -> usize {
        self.inner.entries.lock().unwrap_or_else(PoisonError::into_inner).len()
    }

    /// Outstanding leases on the wrapper for `store`.
    pub fn lease_count(&self, store: &Arc<dyn ViewComputationCache>) -> usize {
        self.inner
            .entries
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .get(&store_key(store))
            .map(|e| e.leases)
            .unwrap_or(0)
    }
}

/// A counted reference to a registry wrapper. Dropping it releases.
pub struct DeferredCacheLease {
    registry: DeferredCacheRegistry,
    key: usize,
    cache: DeferredViewComputationCache,
}

impl DeferredCacheLease {
    pub fn cache(&self) -> &DeferredViewComputationCache {
        &self.cache
    }

    pub fn release(self) {}
}

impl Deref for DeferredCacheLease {
    type Target = DeferredViewComputationCache;

    fn deref(&self) -> &Self::Target {
        &self.cache
    }
}

impl Drop for DeferredCacheLease {
    fn drop(&mut self) {
        self.registry.release(self.key);
    }
}
