//! Parallel DAG execution
//!
//! One loop owns the scheduler state. Workers run as tokio tasks and report
//! back over an mpsc channel; they never mutate shared state. Per task the
//! phase order is fixed: claim, setup, agent, commit, push, judge, state
//! transition, cleanup. Across tasks only the DAG constraint holds.

use std::collections::{HashMap, HashSet};
use std::time::Duration;

use tokio::sync::{mpsc, watch};
use tracing::{debug, info, warn};

use super::{SchedulerOps, SchedulerState};
use crate::domain::{BlockReason, Task, TaskState};
use crate::error::{OrchestrateError, Result};
use crate::graph::DependencyGraph;
use crate::judge::{JudgeDecision, JudgeOps};
use crate::resolver::resolve_base_branch;
use crate::worker::WorkerOps;

/// How long to wait for a worker result before re-checking the queue
const POLL_INTERVAL: Duration = Duration::from_millis(100);

/// Final accounting for one scheduling round. Under normal termination every
/// input task id lands in exactly one bucket; `skipped` is only populated
/// when the round was cancelled before those tasks started.
#[derive(Debug, Default)]
pub struct SchedulerReport {
    pub completed: Vec<String>,
    pub failed: Vec<String>,
    pub blocked: Vec<String>,
    pub skipped: Vec<String>,
}

/// Message a worker sends back when its task finishes
#[derive(Debug)]
struct WorkerDone {
    task_id: String,
    worker_id: String,
    outcome: WorkerOutcome,
}

#[derive(Debug)]
enum WorkerOutcome {
    Completed,
    Continuation,
    Failed { reason: BlockReason },
    /// Multi-dependency setup hit a conflict; a resolution task was spawned
    /// and the parent was parked for the next iteration
    Deferred { resolution_task_id: String },
}

/// Mutable bookkeeping for one scheduling round
#[derive(Default)]
struct RoundState {
    pending: HashSet<String>,
    completed: HashSet<String>,
    failed: HashSet<String>,
    blocked: HashSet<String>,
    continuation: HashSet<String>,
    skipped: HashSet<String>,
    /// parent id -> resolution task ids spawned for it mid-round
    extra_deps: HashMap<String, Vec<String>>,
}

impl RoundState {
    /// All dependencies of `id` satisfied?
    fn deps_satisfied(&self, id: &str, graph: &DependencyGraph) -> bool {
        let graph_deps_done = graph.dependencies_of(id).iter().all(|d| self.completed.contains(d));
        let extra_done = self
            .extra_deps
            .get(id)
            .map(|deps| deps.iter().all(|d| self.completed.contains(d)))
            .unwrap_or(true);
        graph_deps_done && extra_done
    }

    /// Pending ids whose extra deps include `failed_id`
    fn dependents_via_extra(&self, failed_id: &str) -> Vec<String> {
        self.extra_deps
            .iter()
            .filter(|(_, deps)| deps.iter().any(|d| d == failed_id))
            .map(|(parent, _)| parent.clone())
            .collect()
    }
}

/// Dependency-aware parallel scheduler
pub struct DynamicScheduler {
    ops: SchedulerOps,
    worker: WorkerOps,
    judge: JudgeOps,
    max_workers: usize,
    /// Base branch for tasks without dependencies (the integration branch on
    /// re-planning rounds); None means HEAD
    default_base: Option<String>,
    cancel: watch::Receiver<bool>,
}

impl DynamicScheduler {
    pub fn new(
        ops: SchedulerOps,
        worker: WorkerOps,
        judge: JudgeOps,
        max_workers: usize,
        default_base: Option<String>,
        cancel: watch::Receiver<bool>,
    ) -> Self {
        Self {
            ops,
            worker,
            judge,
            max_workers,
            default_base,
            cancel,
        }
    }

    /// Execute the given tasks respecting the graph. Cycle members are
    /// blocked before anything runs; a round with no executable and no
    /// running task but a non-empty queue is declared deadlocked and drained.
    pub async fn run(&self, tasks: Vec<Task>, graph: &DependencyGraph) -> Result<SchedulerReport> {
        info!(task_count = tasks.len(), max_workers = self.max_workers, "DynamicScheduler starting");

        let mut round = RoundState {
            pending: tasks
                .iter()
                .filter(|t| t.state != TaskState::NeedsContinuation)
                .map(|t| t.task_id.clone())
                .collect(),
            // Tasks already waiting on a continuation re-enter through the
            // drain step so they are reset to Ready before claiming
            continuation: tasks
                .iter()
                .filter(|t| t.state == TaskState::NeedsContinuation)
                .map(|t| t.task_id.clone())
                .collect(),
            ..Default::default()
        };
        let mut state = SchedulerState::new(self.max_workers);
        let (result_tx, mut result_rx) = mpsc::channel::<WorkerDone>(self.max_workers.max(1) * 2);

        self.block_cyclic(graph, &mut round).await?;

        loop {
            // Cooperative cancellation: stop admitting, let in-flight finish
            if *self.cancel.borrow() {
                warn!("DynamicScheduler cancelled; draining running tasks");
                while state.running_count() > 0 {
                    match result_rx.recv().await {
                        Some(done) => self.collect(done, graph, &mut round, &mut state).await,
                        None => break,
                    }
                }
                let leftover: Vec<String> = round.pending.drain().chain(round.continuation.drain()).collect();
                round.skipped.extend(leftover);
                break;
            }

            // 1. Re-admit continuations
            for id in std::mem::take(&mut round.continuation) {
                self.ops.reset_to_ready(&id).await?;
                round.pending.insert(id);
            }

            // 2. Executable = pending tasks whose every dependency is done
            let mut executable: Vec<String> = round
                .pending
                .iter()
                .filter(|id| round.deps_satisfied(id, graph))
                .cloned()
                .collect();
            executable.sort();

            // 4. Deadlock / termination
            if executable.is_empty() && state.running_count() == 0 {
                if round.pending.is_empty() {
                    break;
                }
                warn!(remaining = round.pending.len(), "Scheduler deadlock; blocking remaining tasks");
                for id in std::mem::take(&mut round.pending) {
                    self.ops
                        .block(&id, BlockReason::Unschedulable, Some("no executable path to this task".into()))
                        .await?;
                    round.blocked.insert(id);
                }
                break;
            }

            // 3 + 6. Claim up to the free slots and dispatch
            for id in executable.into_iter().take(state.slots_free()) {
                let worker_id = format!("worker-{}", id);

                // A parent whose conflict-resolution task completed restarts
                // from the resolution branch instead of re-merging
                let override_base = match round.extra_deps.get(&id).and_then(|deps| deps.last()) {
                    Some(resolution_id) => self
                        .ops
                        .store()
                        .read::<Task>(resolution_id)
                        .await
                        .ok()
                        .map(|t| t.branch),
                    None => None,
                };

                match self.ops.claim(&mut state, &id, &worker_id).await {
                    Ok(claimed) => {
                        round.pending.remove(&id);
                        self.spawn_execution(claimed, worker_id, override_base, result_tx.clone());
                    }
                    Err(OrchestrateError::ConcurrentModification { .. }) => {
                        // Claim lost to a concurrent writer; try again later
                        debug!(task_id = %id, "Claim lost, skipping candidate");
                    }
                    Err(e) => return Err(e),
                }
            }

            // 5 + 7. Collect results (bounded poll while workers run)
            if state.running_count() > 0 {
                match tokio::time::timeout(POLL_INTERVAL, result_rx.recv()).await {
                    Ok(Some(done)) => {
                        self.collect(done, graph, &mut round, &mut state).await;
                        while let Ok(done) = result_rx.try_recv() {
                            self.collect(done, graph, &mut round, &mut state).await;
                        }
                    }
                    Ok(None) => break,
                    Err(_) => {} // poll timeout; loop
                }
            }
        }

        info!(
            completed = round.completed.len(),
            failed = round.failed.len(),
            blocked = round.blocked.len(),
            "DynamicScheduler finished"
        );

        let mut report = SchedulerReport {
            completed: round.completed.into_iter().collect(),
            failed: round.failed.into_iter().collect(),
            blocked: round.blocked.into_iter().collect(),
            skipped: round.skipped.into_iter().collect(),
        };
        report.completed.sort();
        report.failed.sort();
        report.blocked.sort();
        report.skipped.sort();
        Ok(report)
    }

    /// Cycle members are blocked before any execution starts, and their
    /// transitive dependents with them.
    async fn block_cyclic(&self, graph: &DependencyGraph, round: &mut RoundState) -> Result<()> {
        if graph.cyclic.is_empty() {
            return Ok(());
        }

        for id in &graph.cyclic {
            if round.pending.remove(id) {
                self.ops
                    .block(id, BlockReason::CyclicDependency, Some("task participates in a dependency cycle".into()))
                    .await?;
                round.blocked.insert(id.clone());
            }
        }

        let cyclic: Vec<String> = graph.cyclic.iter().cloned().collect();
        for id in graph.blocked_by_failure(&cyclic) {
            if round.pending.remove(&id) {
                self.ops
                    .block(&id, BlockReason::DependencyFailed, Some("depends on a dependency cycle".into()))
                    .await?;
                round.blocked.insert(id);
            }
        }
        Ok(())
    }

    /// Spawn one task execution as a tokio task
    fn spawn_execution(
        &self,
        task: Task,
        worker_id: String,
        override_base: Option<String>,
        result_tx: mpsc::Sender<WorkerDone>,
    ) {
        let ops = self.ops.clone();
        let worker = self.worker.clone();
        let judge = self.judge.clone();
        let default_base = self.default_base.clone();

        tokio::spawn(async move {
            let task_id = task.task_id.clone();
            let outcome = execute_one(&ops, &worker, &judge, task, override_base, default_base).await;
            let _ = result_tx
                .send(WorkerDone {
                    task_id,
                    worker_id,
                    outcome,
                })
                .await;
        });
    }

    /// Fold a worker result into the round state and propagate failures
    async fn collect(&self, done: WorkerDone, graph: &DependencyGraph, round: &mut RoundState, state: &mut SchedulerState) {
        self.ops.release(state, &done.worker_id);
        debug!(task_id = %done.task_id, outcome = ?done.outcome, "DynamicScheduler::collect: worker finished");

        match done.outcome {
            WorkerOutcome::Completed => {
                round.completed.insert(done.task_id);
            }
            WorkerOutcome::Continuation => {
                round.continuation.insert(done.task_id);
            }
            WorkerOutcome::Deferred { resolution_task_id } => {
                round
                    .extra_deps
                    .entry(done.task_id.clone())
                    .or_default()
                    .push(resolution_task_id.clone());
                round.pending.insert(resolution_task_id);
                // The parent sits in NeedsContinuation; the drain step resets
                // it to Ready and it becomes executable once the resolution
                // task completes
                round.continuation.insert(done.task_id);
            }
            WorkerOutcome::Failed { reason } => {
                round.failed.insert(done.task_id.clone());

                // Block everything that can no longer make progress
                let mut to_block: Vec<String> = graph
                    .blocked_by_failure(std::slice::from_ref(&done.task_id))
                    .into_iter()
                    .collect();
                to_block.extend(round.dependents_via_extra(&done.task_id));
                to_block.sort();
                to_block.dedup();

                for dependent in to_block {
                    let was_pending = round.pending.remove(&dependent);
                    let was_continuation = round.continuation.remove(&dependent);
                    if was_pending || was_continuation {
                        if let Err(e) = self
                            .ops
                            .block(
                                &dependent,
                                BlockReason::DependencyFailed,
                                Some(format!("dependency {} failed ({})", done.task_id, reason)),
                            )
                            .await
                        {
                            warn!(task_id = %dependent, error = %e, "Failed to block dependent");
                        }
                        round.blocked.insert(dependent);
                    }
                }
            }
        }
    }
}

/// Run one claimed task to a terminal outcome. Always cleans up the
/// worktree, whatever happened before. `override_base` replaces the
/// resolved base outright (conflict-resolution retry); `default_base` only
/// substitutes for HEAD on dependency-free tasks.
async fn execute_one(
    ops: &SchedulerOps,
    worker: &WorkerOps,
    judge: &JudgeOps,
    task: Task,
    override_base: Option<String>,
    default_base: Option<String>,
) -> WorkerOutcome {
    let resolution = match resolve_base_branch(&task, ops.store()).await {
        Ok(_) if override_base.is_some() => crate::resolver::BaseBranchResolution::Single {
            base_branch: override_base.expect("checked above"),
        },
        Ok(crate::resolver::BaseBranchResolution::None) => match default_base {
            Some(base) => crate::resolver::BaseBranchResolution::Single { base_branch: base },
            None => crate::resolver::BaseBranchResolution::None,
        },
        Ok(resolution) => resolution,
        Err(e) => {
            warn!(task_id = %task.task_id, error = %e, "Base branch resolution failed");
            let _ = ops
                .block(&task.task_id, BlockReason::SystemErrorTransient, Some(e.to_string()))
                .await;
            return WorkerOutcome::Failed {
                reason: BlockReason::SystemErrorTransient,
            };
        }
    };

    let execution = if task.judgement_feedback.is_some() {
        worker.continue_task(&task, &resolution).await
    } else {
        worker.execute_task_with_worktree(&task, &resolution).await
    };

    let outcome = match execution {
        Ok(exec) if exec.success => match judge.judge_task(&task.task_id, &exec.run_id).await {
            Ok(judgement) => match judge.apply(&task.task_id, &judgement).await {
                Ok(JudgeDecision::Completed) => WorkerOutcome::Completed,
                Ok(JudgeDecision::Continuation) => WorkerOutcome::Continuation,
                Ok(JudgeDecision::Blocked(reason)) => WorkerOutcome::Failed { reason },
                Err(e) => {
                    warn!(task_id = %task.task_id, error = %e, "Applying judgement failed");
                    let _ = ops
                        .block(&task.task_id, BlockReason::JudgeFailed, Some(e.to_string()))
                        .await;
                    WorkerOutcome::Failed {
                        reason: BlockReason::JudgeFailed,
                    }
                }
            },
            Err(e) => {
                warn!(task_id = %task.task_id, error = %e, "Judge invocation failed");
                let _ = ops
                    .block(&task.task_id, BlockReason::SystemErrorTransient, Some(e.to_string()))
                    .await;
                WorkerOutcome::Failed {
                    reason: BlockReason::SystemErrorTransient,
                }
            }
        },
        Ok(exec) => {
            let _ = ops
                .block(&task.task_id, BlockReason::SystemErrorTransient, exec.error.clone())
                .await;
            WorkerOutcome::Failed {
                reason: BlockReason::SystemErrorTransient,
            }
        }
        Err(OrchestrateError::ConflictResolutionRequired {
            resolution_task_id, ..
        }) => {
            // Non-terminal: park the parent without consuming an iteration
            if let Ok(current) = ops.store().read::<Task>(&task.task_id).await {
                let _ = ops
                    .store()
                    .update_cas::<Task, _>(&task.task_id, current.version, |t| {
                        t.state = TaskState::NeedsContinuation;
                        t.owner = None;
                    })
                    .await;
            }
            WorkerOutcome::Deferred { resolution_task_id }
        }
        Err(e) => {
            warn!(task_id = %task.task_id, error = %e, "Task execution errored");
            let _ = ops
                .block(&task.task_id, BlockReason::SystemErrorTransient, Some(e.to_string()))
                .await;
            WorkerOutcome::Failed {
                reason: BlockReason::SystemErrorTransient,
            }
        }
    };

    worker.cleanup_worktree(&task).await;
    outcome
}
