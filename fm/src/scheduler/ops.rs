//! CAS-backed task state transitions
//!
//! Every mutation of a task flows through these helpers so the state machine
//! lives in one place. A lost CAS surfaces as `ConcurrentModification`; the
//! dynamic scheduler treats that as "claim lost" and moves on, other callers
//! propagate it.

use tracing::{debug, info};

use super::SchedulerState;
use crate::domain::{BlockReason, Store, Task, TaskState};
use crate::error::{OrchestrateError, Result};

/// State-transition helpers over the task store
#[derive(Clone)]
pub struct SchedulerOps {
    store: Store,
}

impl SchedulerOps {
    pub fn new(store: Store) -> Self {
        Self { store }
    }

    pub fn store(&self) -> &Store {
        &self.store
    }

    /// All tasks currently claimable
    pub async fn ready_tasks(&self) -> Result<Vec<Task>> {
        let tasks: Vec<Task> = self.store.list().await?;
        Ok(tasks.into_iter().filter(|t| t.state == TaskState::Ready).collect())
    }

    /// Claim a Ready task for a worker. Enforces capacity, transitions
    /// Ready -> Running, and registers the worker in the scheduler state.
    pub async fn claim(&self, state: &mut SchedulerState, task_id: &str, worker_id: &str) -> Result<Task> {
        debug!(%task_id, %worker_id, "SchedulerOps::claim: called");
        if !state.has_capacity() {
            return Err(OrchestrateError::WorkerCapacityExceeded);
        }

        let current: Task = self.store.read(task_id).await?;
        if current.state != TaskState::Ready {
            return Err(OrchestrateError::Validation(format!(
                "cannot claim task {} in state {}",
                task_id, current.state
            )));
        }

        let owner = worker_id.to_string();
        let claimed = self
            .store
            .update_cas::<Task, _>(task_id, current.version, move |t| {
                t.state = TaskState::Running;
                t.owner = Some(owner);
            })
            .await?;

        state.add_worker(worker_id);
        info!(%task_id, %worker_id, "Claimed task");
        Ok(claimed)
    }

    /// Transition to Done and clear the owner
    pub async fn complete(&self, task_id: &str) -> Result<Task> {
        debug!(%task_id, "SchedulerOps::complete: called");
        let current: Task = self.store.read(task_id).await?;
        let task = self
            .store
            .update_cas::<Task, _>(task_id, current.version, |t| {
                t.state = TaskState::Done;
                t.owner = None;
            })
            .await?;
        info!(%task_id, "Task completed");
        Ok(task)
    }

    /// Transition to Blocked with a reason and clear the owner
    pub async fn block(&self, task_id: &str, reason: BlockReason, message: Option<String>) -> Result<Task> {
        debug!(%task_id, %reason, "SchedulerOps::block: called");
        let current: Task = self.store.read(task_id).await?;
        let task = self
            .store
            .update_cas::<Task, _>(task_id, current.version, move |t| {
                t.state = TaskState::Blocked;
                t.owner = None;
                t.block_reason = Some(reason);
                t.block_message = message;
            })
            .await?;
        info!(%task_id, %reason, "Task blocked");
        Ok(task)
    }

    /// Re-admit a task: Blocked/Cancelled/NeedsContinuation -> Ready
    pub async fn reset_to_ready(&self, task_id: &str) -> Result<Task> {
        debug!(%task_id, "SchedulerOps::reset_to_ready: called");
        let current: Task = self.store.read(task_id).await?;
        if !matches!(
            current.state,
            TaskState::Blocked | TaskState::Cancelled | TaskState::NeedsContinuation
        ) {
            return Err(OrchestrateError::Validation(format!(
                "cannot reset task {} from state {}",
                task_id, current.state
            )));
        }

        let task = self
            .store
            .update_cas::<Task, _>(task_id, current.version, |t| {
                t.state = TaskState::Ready;
                t.owner = None;
                t.block_reason = None;
                t.block_message = None;
            })
            .await?;
        Ok(task)
    }

    /// Release a worker slot after its task finished
    pub fn release(&self, state: &mut SchedulerState, worker_id: &str) {
        state.remove_worker(worker_id);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    async fn store_with(tasks: &[Task]) -> (tempfile::TempDir, Store) {
        let dir = tempdir().unwrap();
        let store = Store::open(dir.path()).unwrap();
        for task in tasks {
            store.create(task).await.unwrap();
        }
        (dir, store)
    }

    fn task(id: &str) -> Task {
        Task::new(id, "/repo", format!("feature/{}", id))
    }

    #[tokio::test]
    async fn test_claim_transitions_and_registers() {
        let (_dir, store) = store_with(&[task("t1")]).await;
        let ops = SchedulerOps::new(store);
        let mut state = SchedulerState::new(2);

        let claimed = ops.claim(&mut state, "t1", "worker-1").await.unwrap();
        assert_eq!(claimed.state, TaskState::Running);
        assert_eq!(claimed.owner.as_deref(), Some("worker-1"));
        assert_eq!(state.running_count(), 1);
    }

    #[tokio::test]
    async fn test_claim_requires_capacity() {
        let (_dir, store) = store_with(&[task("t1"), task("t2")]).await;
        let ops = SchedulerOps::new(store);
        let mut state = SchedulerState::new(1);

        ops.claim(&mut state, "t1", "worker-1").await.unwrap();
        let result = ops.claim(&mut state, "t2", "worker-2").await;
        assert!(matches!(result, Err(OrchestrateError::WorkerCapacityExceeded)));
    }

    #[tokio::test]
    async fn test_claim_requires_ready_state() {
        let (_dir, store) = store_with(&[task("t1")]).await;
        let ops = SchedulerOps::new(store.clone());
        let mut state = SchedulerState::new(2);

        ops.claim(&mut state, "t1", "worker-1").await.unwrap();
        // Already Running
        let result = ops.claim(&mut state, "t1", "worker-2").await;
        assert!(matches!(result, Err(OrchestrateError::Validation(_))));
    }

    #[tokio::test]
    async fn test_complete_clears_owner() {
        let (_dir, store) = store_with(&[task("t1")]).await;
        let ops = SchedulerOps::new(store);
        let mut state = SchedulerState::new(2);

        ops.claim(&mut state, "t1", "worker-1").await.unwrap();
        let done = ops.complete("t1").await.unwrap();
        assert_eq!(done.state, TaskState::Done);
        assert!(done.owner.is_none());
    }

    #[tokio::test]
    async fn test_block_records_reason() {
        let (_dir, store) = store_with(&[task("t1")]).await;
        let ops = SchedulerOps::new(store);

        let blocked = ops
            .block("t1", BlockReason::DependencyFailed, Some("upstream died".to_string()))
            .await
            .unwrap();
        assert_eq!(blocked.state, TaskState::Blocked);
        assert_eq!(blocked.block_reason, Some(BlockReason::DependencyFailed));
        assert_eq!(blocked.block_message.as_deref(), Some("upstream died"));
    }

    #[tokio::test]
    async fn test_reset_to_ready_only_from_resettable_states() {
        let (_dir, store) = store_with(&[task("t1")]).await;
        let ops = SchedulerOps::new(store);

        // Ready -> reset is invalid
        let result = ops.reset_to_ready("t1").await;
        assert!(matches!(result, Err(OrchestrateError::Validation(_))));

        ops.block("t1", BlockReason::MaxRetries, None).await.unwrap();
        let reset = ops.reset_to_ready("t1").await.unwrap();
        assert_eq!(reset.state, TaskState::Ready);
        assert!(reset.block_reason.is_none());
    }

    #[tokio::test]
    async fn test_ready_tasks_filters() {
        let (_dir, store) = store_with(&[task("t1"), task("t2")]).await;
        let ops = SchedulerOps::new(store);
        let mut state = SchedulerState::new(2);

        ops.claim(&mut state, "t1", "worker-1").await.unwrap();
        let ready = ops.ready_tasks().await.unwrap();
        assert_eq!(ready.len(), 1);
        assert_eq!(ready[0].task_id, "t2");
    }
}
