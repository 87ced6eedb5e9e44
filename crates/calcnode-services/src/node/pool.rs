//! The nodes hosted by one process.
//!
//! Jobs go to the next idle node, round robin. Running jobs are tracked by
//! job id so they can be cancelled from outside.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

use dashmap::DashMap;

use calcnode_core::job::{CalculationJob, CancellationFlag};
use calcnode_core::result::CalculationJobResult;

use super::{CalculationNode, NodeError, NodeStatus};

#[derive(Clone)]
pub struct NodePool {
    nodes: Arc<Vec<CalculationNode>>,
    /// job id → cancellation flag
    running: Arc<DashMap<u64, CancellationFlag>>,
    next: Arc<AtomicUsize>,
}

/// Removes a job from the running set when dropped.
struct RunningJob {
    running: Arc<DashMap<u64, CancellationFlag>>,
    job_id: u64,
}

impl Drop for RunningJob {
    fn drop(&mut self) {
        self.running.remove(&self.job_id);
    }
}

impl NodePool {
    pub fn new(nodes: Vec<CalculationNode>) -> Self {
        Self {
            nodes: Arc::new(nodes),
            running: Arc::new(DashMap::new()),
            next: Arc::new(AtomicUsize::new(0)),
        }
    }

    pub fn nodes(&self) -> &[CalculationNode] {
        &self.nodes
    }

    pub fn status(&self) -> Vec<NodeStatus> {
        self.nodes.iter().map(|n| n.status()).collect()
    }

    pub fn running_jobs(&self) -> Vec<u64> {
        let mut ids: Vec<u64> = self.running.iter().map(|e| *e.key()).collect();
        ids.sort_unstable();
        ids
    }

    fn idle_node(&self) -> Option<&CalculationNode> {
        let len = self.nodes.len();
        if len == 0 {
            return None;
        }
        let start = self.next.fetch_add(1, Ordering::Relaxed) % len;
        (0..len)
            .map(|offset| &self.nodes[(start + offset) % len])
            .find(|node| !node.is_busy())
    }

    /// Run `job` on an idle node. `None` means it was cancelled.
    pub async fn submit(&self, job: CalculationJob) -> Result<Option<CalculationJobResult>, NodeError> {
        let node = self.idle_node().ok_or(NodeError::NoIdleNode)?.clone();
        let job_id = job.specification.job_id;
        self.running.insert(job_id, job.cancellation());
        let _running = RunningJob {
            running: self.running.clone(),
            job_id,
        };
        node.run_job(job).await
    }

    /// Cancel a running job. Returns false if no such job is running.
    pub fn cancel(&self, job_id: u64) -> bool {
        match self.running.get(&job_id) {
            Some(flag) => {
                flag.cancel();
                tracing::info!(job_id, "job cancellation requested");
                true
            }
            None => false,
        }
    }
}
