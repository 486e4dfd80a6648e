//! Task scheduling
//!
//! `SchedulerOps` provides the CAS-backed state transitions every scheduler
//! shares. `DynamicScheduler` runs an arbitrary DAG with bounded
//! parallelism; `SerialChainExecutor` runs a linear chain inside one shared
//! worktree.

mod dynamic;
mod ops;
mod serial;

use std::collections::HashSet;

pub use dynamic::{DynamicScheduler, SchedulerReport};
pub use ops::SchedulerOps;
pub use serial::{ChainReport, SerialChainExecutor};

/// Capacity accounting for the scheduler loop. Only the loop mutates this;
/// workers report back over a channel.
#[derive(Debug, Clone)]
pub struct SchedulerState {
    running: HashSet<String>,
    max_workers: usize,
}

impl SchedulerState {
    pub fn new(max_workers: usize) -> Self {
        Self {
            running: HashSet::new(),
            max_workers,
        }
    }

    pub fn has_capacity(&self) -> bool {
        self.running.len() < self.max_workers
    }

    pub fn slots_free(&self) -> usize {
        self.max_workers.saturating_sub(self.running.len())
    }

    pub fn running_count(&self) -> usize {
        self.running.len()
    }

    pub fn is_running(&self, worker_id: &str) -> bool {
        self.running.contains(worker_id)
    }

    pub(crate) fn add_worker(&mut self, worker_id: impl Into<String>) {
        self.running.insert(worker_id.into());
        debug_assert!(self.running.len() <= self.max_workers);
    }

    pub(crate) fn remove_worker(&mut self, worker_id: &str) {
        self.running.remove(worker_id);
    }
}
