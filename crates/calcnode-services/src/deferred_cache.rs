//! Deferred value cache: direct-write or write-behind over a view cache.
//!
//! With write-behind, `put_values` queues the batch for a single writer
//! task per wrapper and returns. Queued values are served to readers of the
//! same wrapper until they land, so later items in a job see earlier items'
//! outputs. `flush` resolves once every batch queued before it has been
//! written, and reports any write that failed since the previous flush.

use std::future::Future;
use std::pin::Pin;
use std::sync::{Arc, Mutex, PoisonError};

use dashmap::DashMap;
use tokio::sync::{mpsc, oneshot};

use calcnode_core::value::{CacheSelectHint, CacheValue, ComputedValue, ValueSpecification};

use crate::statistics::DeferredInvocationStatistics;
use crate::value_cache::{split_by_section, CacheError, CacheSection, ViewComputationCache};
use crate::worker_pool::WorkerPool;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WriteStrategy {
    DirectWrite,
    /// Write-behind per section; a section without it is written directly.
    WriteBehind { shared: bool, private: bool },
}

impl WriteStrategy {
    pub fn from_flags(shared: bool, private: bool) -> Self {
        if shared || private {
            WriteStrategy::WriteBehind { shared, private }
        } else {
            WriteStrategy::DirectWrite
        }
    }

    pub fn is_write_behind(&self, section: CacheSection) -> bool {
        match (self, section) {
            (WriteStrategy::DirectWrite, _) => false,
            (WriteStrategy::WriteBehind { shared, .. }, CacheSection::Shared) => *shared,
            (WriteStrategy::WriteBehind { private, .. }, CacheSection::Private) => *private,
        }
    }

    pub fn needs_pool(&self) -> bool {
        matches!(self, WriteStrategy::WriteBehind { .. })
    }
}

/// Outcome of [`DeferredViewComputationCache::flush`].
pub enum Flush {
    Done(Result<(), CacheError>),
    Pending(Pin<Box<dyn Future<Output = Result<(), CacheError>> + Send>>),
}

impl Flush {
    pub async fn wait(self) -> Result<(), CacheError> {
        match self {
            Flush::Done(result) => result,
            Flush::Pending(pending) => pending.await,
        }
    }
}

enum WriteCommand {
    Write {
        section: CacheSection,
        values: Vec<ComputedValue>,
        statistics: Option<DeferredInvocationStatistics>,
    },
    Flush(oneshot::Sender<()>),
}

type PendingValues = DashMap<(CacheSection, ValueSpecification), CacheValue>;

struct DeferredInner {
    underlying: Arc<dyn ViewComputationCache>,
    strategy: WriteStrategy,
    pending: Arc<PendingValues>,
    failures: Arc<Mutex<Vec<CacheError>>>,
    writer: Option<mpsc::UnboundedSender<WriteCommand>>,
}

impl Drop for DeferredInner {
    fn drop(&mut self) {
        if self.writer.is_some() {
            tracing::debug!("deferred cache released, writer stopping");
        }
    }
}

#[derive(Clone)]
pub struct DeferredViewComputationCache {
    inner: Arc<DeferredInner>,
}

impl DeferredViewComputationCache {
    /// Wrap a store. Write-behind without a pool is rejected.
    pub fn new(
        underlying: Arc<dyn ViewComputationCache>,
        strategy: WriteStrategy,
        pool: Option<&WorkerPool>,
    ) -> Result<Self, CacheError> {
        let pending: Arc<PendingValues> = Arc::new(DashMap::new());
        let failures = Arc::new(Mutex::new(Vec::new()));

        let writer = if strategy.needs_pool() {
            let pool = pool.ok_or(CacheError::NoWorkerPool)?;
            let (tx, rx) = mpsc::unbounded_channel();
            pool.spawn(run_writer(
                underlying.clone(),
                pool.clone(),
                rx,
                pending.clone(),
                failures.clone(),
            ));
            Some(tx)
        } else {
            None
        };

        Ok(Self {
            inner: Arc::new(DeferredInner {
                underlying,
                strategy,
                pending,
                failures,
                writer,
            }),
        })
    }

    pub fn strategy(&self) -> WriteStrategy {
        self.inner.strategy
    }

    pub fn underlying(&self) -> &Arc<dyn ViewComputationCache> {
        &self.inner.underlying
    }

    /// True if both handles wrap the same writer.
    pub fn same_cache(&self, other: &Self) -> bool {
        Arc::ptr_eq(&self.inner, &other.inner)
    }

    /// Values queued but not yet written.
    pub fn pending_count(&self) -> usize {
        self.inner.pending.len()
    }

    pub fn estimate_value_size(&self, value: &CacheValue) -> usize {
        self.inner.underlying.estimate_value_size(value)
    }

    /// Look up each spec, preferring values still queued for writing.
    pub fn get_values(
        &self,
        specs: &[ValueSpecification],
        hint: &CacheSelectHint,
    ) -> Vec<(ValueSpecification, Option<CacheValue>)> {
        specs
            .iter()
            .map(|spec| {
                let section = CacheSection::for_value(hint, spec);
                let queued = self
                    .inner
                    .pending
                    .get(&(section, spec.clone()))
                    .map(|v| v.clone());
                let value = queued.or_else(|| self.inner.underlying.get(section, spec));
                (spec.clone(), value)
            })
            .collect()
    }

    /// Write values. Each written value's size is reported to `statistics`.
    /// Failures surface at the next `flush`.
    pub fn put_values(
        &self,
        values: Vec<ComputedValue>,
        hint: &CacheSelectHint,
        statistics: Option<DeferredInvocationStatistics>,
    ) {
        let (private, shared) = split_by_section(values, hint);
        for (section, batch) in [(CacheSection::Shared, shared), (CacheSection::Private, private)] {
            if batch.is_empty() {
                continue;
            }
            if self.inner.strategy.is_write_behind(section) {
                self.enqueue(section, batch, statistics.clone());
            } else {
                let result = self.inner.underlying.put(section, &batch);
                if let Err(e) = result {
                    tracing::warn!(error = %e, ?section, "direct cache write failed");
                    self.record_failure(e);
                }
                report_sizes(self.inner.underlying.as_ref(), &batch, statistics.as_ref());
            }
        }
    }

    fn enqueue(
        &self,
        section: CacheSection,
        values: Vec<ComputedValue>,
        statistics: Option<DeferredInvocationStatistics>,
    ) {
        for value in &values {
            self.inner
                .pending
                .insert((section, value.specification.clone()), value.value.clone());
        }
        let sent = match &self.inner.writer {
            Some(tx) => tx
                .send(WriteCommand::Write {
                    section,
                    values,
                    statistics,
                })
                .map_err(|e| e.0),
            None => Err(WriteCommand::Write {
                section,
                values,
                statistics,
            }),
        };
        if let Err(WriteCommand::Write { section, values, .. }) = sent {
            // Writer is gone; the queued values will never land.
            for value in &values {
                self.inner.pending.remove(&(section, value.specification.clone()));
            }
            self.record_failure(CacheError::WriterStopped);
        }
    }

    fn record_failure(&self, error: CacheError) {
        self.inner
            .failures
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .push(error);
    }

    /// Barrier for every write queued so far.
    pub fn flush(&self) -> Flush {
        let Some(tx) = &self.inner.writer else {
            return Flush::Done(take_failures(&self.inner.failures));
        };
        let (done_tx, done_rx) = oneshot::channel();
        if tx.send(WriteCommand::Flush(done_tx)).is_err() {
            self.record_failure(CacheError::WriterStopped);
            return Flush::Done(take_failures(&self.inner.failures));
        }
        let failures = self.inner.failures.clone();
        Flush::Pending(Box::pin(async move {
            if done_rx.await.is_err() {
                return Err(CacheError::WriterStopped);
            }
            take_failures(&failures)
        }))
    }
}

fn take_failures(failures: &Mutex<Vec<CacheError>>) -> Result<(), CacheError> {
    let drained: Vec<CacheError> =
        std::mem::take(&mut *failures.lock().unwrap_or_else(PoisonError::into_inner));
    match drained.first() {
        None => Ok(()),
        Some(first) => Err(CacheError::FlushFailed {
            count: drained.len(),
            first: first.to_string(),
        }),
    }
}

fn report_sizes(
    cache: &dyn ViewComputationCache,
    values: &[ComputedValue],
    statistics: Option<&DeferredInvocationStatistics>,
) {
    if let Some(statistics) = statistics {
        for value in values {
            statistics.add_data_output_bytes(cache.estimate_value_size(&value.value) as u64);
        }
    }
}

// ── Writer ────────────────────────────────────────────────────────────────────

async fn run_writer(
    underlying: Arc<dyn ViewComputationCache>,
    pool: WorkerPool,
    mut rx: mpsc::UnboundedReceiver<WriteCommand>,
    pending: Arc<PendingValues>,
    failures: Arc<Mutex<Vec<CacheError>>>,
) {
    tracing::debug!("write-behind writer started");
    while let Some(command) = rx.recv().await {
        match command {
            WriteCommand::Write {
                section,
                values,
                statistics,
            } => {
                let store = underlying.clone();
                let batch = values.clone();
                let outcome = pool.spawn_blocking(move || store.put(section, &batch)).await;
                let error = match outcome {
                    Ok(Some(Ok(()))) => None,
                    Ok(Some(Err(e))) => Some(e),
                    Ok(None) => Some(CacheError::WriteFailed("writer task panicked".into())),
                    Err(e) => Some(CacheError::WriteFailed(e.to_string())),
                };
                if let Some(e) = error {
                    tracing::warn!(error = %e, ?section, count = values.len(), "write-behind batch failed");
                    failures
                        .lock()
                        .unwrap_or_else(PoisonError::into_inner)
                        .push(e);
                }
                for value in &values {
                    // A newer value for the same spec may have been queued meanwhile.
                    pending.remove_if(&(section, value.specification.clone()), |_, queued| {
                        queued == &value.value
                    });
                }
                report_sizes(underlying.as_ref(), &values, statistics.as_ref());
            }
            WriteCommand::Flush(done) => {
                let _ = done.send(());
            }
        }
    }
    tracing::debug!("write-behind writer stopped");
}
