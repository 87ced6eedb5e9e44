//! Bounded worker pool for background cache writes and target resolution.
//!
//! Work runs on the tokio blocking pool; a semaphore caps how much of it is
//! in flight at once.

use std::future::Future;
use std::sync::Arc;

use tokio::runtime::Handle;
use tokio::sync::Semaphore;
use tokio::task::JoinHandle;

#[derive(Clone)]
pub struct WorkerPool {
    handle: Handle,
    permits: Arc<Semaphore>,
    size: usize,
}

impl WorkerPool {
    pub fn new(handle: Handle, size: usize) -> Self {
        let size = size.max(1);
        Self {
            handle,
            permits: Arc::new(Semaphore::new(size)),
            size,
        }
    }

    /// Pool on the current runtime. `None` outside a runtime or if `size` is 0.
    pub fn current(size: usize) -> Option<Self> {
        if size == 0 {
            return None;
        }
        Handle::try_current().ok().map(|h| Self::new(h, size))
    }

    pub fn size(&self) -> usize {
        self.size
    }

    /// Permits not currently held by running work.
    pub fn available(&self) -> usize {
        self.permits.available_permits()
    }

    /// Run a blocking closure once a permit is free. Resolves to `None` if the
    /// closure panicked.
    pub fn spawn_blocking<F, R>(&self, f: F) -> JoinHandle<Option<R>>
    where
        F: FnOnce() -> R + Send + 'static,
        R: Send + 'static,
    {
        let permits = self.permits.clone();
        self.handle.spawn(async move {
            // The semaphore is never closed; a missing permit just means unbounded.
            let _permit = permits.acquire_owned().await.ok();
            match tokio::task::spawn_blocking(f).await {
                Ok(r) => Some(r),
                Err(e) => {
                    tracing::warn!(error = %e, "worker task failed");
                    None
                }
            }
        })
    }

    /// Spawn an async task on the pool's runtime. Does not take a permit.
    pub fn spawn<F>(&self, future: F) -> JoinHandle<F::Output>
    where
        F: Future + Send + 'static,
        F::Output: Send + 'static,
    {
        self.handle.spawn(future)
    }
}

impl std::fmt::Debug for WorkerPool {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("WorkerPool")
            .field("size", &self.size)
            .field("available", &self.available())
            .finish()
    }
}
