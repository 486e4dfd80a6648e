//! Serial-chain execution
//!
//! A linear chain runs inside one shared worktree so changes accumulate
//! step to step. Each step checks out its own branch before executing, so
//! every task still commits and pushes on its own branch. Step retries
//! happen in place and are budgeted separately from the judgement-feedback
//! iterations the dynamic scheduler uses.

use std::sync::Arc;

use tracing::{debug, info, warn};

use super::{SchedulerOps, SchedulerState};
use crate::domain::{BlockReason, Task};
use crate::error::Result;
use crate::git::GitEffects;
use crate::judge::JudgeOps;
use crate::worker::WorkerOps;

/// Outcome of one chain
#[derive(Debug, Default)]
pub struct ChainReport {
    pub completed: Vec<String>,
    pub blocked: Vec<String>,
}

/// Executes linear chains detected by the dependency graph
pub struct SerialChainExecutor {
    ops: SchedulerOps,
    worker: WorkerOps,
    judge: JudgeOps,
    git: Arc<dyn GitEffects>,
    /// In-place retries per step
    task_retries: u32,
}

impl SerialChainExecutor {
    pub fn new(
        ops: SchedulerOps,
        worker: WorkerOps,
        judge: JudgeOps,
        git: Arc<dyn GitEffects>,
        task_retries: u32,
    ) -> Self {
        Self {
            ops,
            worker,
            judge,
            git,
            task_retries,
        }
    }

    /// Run a chain to completion or first terminal failure. On failure the
    /// remaining members are blocked as failed dependencies. The shared
    /// worktree is removed whatever happens.
    pub async fn run_chain(&self, chain: &[Task]) -> Result<ChainReport> {
        let Some(head) = chain.first() else {
            return Ok(ChainReport::default());
        };
        info!(len = chain.len(), head = %head.task_id, "SerialChainExecutor starting chain");

        let worktree = self.worker.setup_worktree(head, None).await?;
        let result = self.run_steps(chain, &worktree).await;

        self.worker.cleanup_worktree(head).await;
        result
    }

    async fn run_steps(&self, chain: &[Task], worktree: &std::path::Path) -> Result<ChainReport> {
        let mut report = ChainReport::default();
        let mut previous_feedback: Option<String> = None;
        let mut state = SchedulerState::new(1);

        for (index, task) in chain.iter().enumerate() {
            // Each step gets its own branch, switched inside the shared
            // worktree so earlier steps' changes carry forward
            if index > 0 {
                if !self.git.branch_exists(worktree, &task.branch).await? {
                    self.git.create_branch(worktree, &task.branch, None).await?;
                }
                self.git.switch_branch(worktree, &task.branch).await?;
            }

            let worker_id = format!("worker-chain-{}", task.task_id);
            let claimed = self.ops.claim(&mut state, &task.task_id, &worker_id).await?;

            match self.run_step(&claimed, worktree, &mut previous_feedback).await? {
                StepOutcome::Completed => {
                    self.ops.complete(&task.task_id).await?;
                    self.ops.release(&mut state, &worker_id);
                    report.completed.push(task.task_id.clone());
                }
                StepOutcome::Failed { reason, message } => {
                    warn!(task_id = %task.task_id, %reason, "Chain step failed terminally");
                    self.ops.block(&task.task_id, reason, Some(message)).await?;
                    self.ops.release(&mut state, &worker_id);
                    report.blocked.push(task.task_id.clone());

                    // The rest of the chain can no longer run
                    for remaining in &chain[index + 1..] {
                        self.ops
                            .block(
                                &remaining.task_id,
                                BlockReason::DependencyFailed,
                                Some(format!("chain predecessor {} failed", task.task_id)),
                            )
                            .await?;
                        report.blocked.push(remaining.task_id.clone());
                    }
                    return Ok(report);
                }
            }
        }

        Ok(report)
    }

    /// One step with in-place retries
    async fn run_step(
        &self,
        task: &Task,
        worktree: &std::path::Path,
        previous_feedback: &mut Option<String>,
    ) -> Result<StepOutcome> {
        let mut attempt = 0u32;

        loop {
            debug!(task_id = %task.task_id, attempt, "SerialChainExecutor::run_step: executing");
            let exec = self
                .worker
                .execute_task_in_existing_worktree(task, worktree, previous_feedback.clone())
                .await?;

            if !exec.success {
                return Ok(StepOutcome::Failed {
                    reason: BlockReason::SystemErrorTransient,
                    message: exec.error.unwrap_or_else(|| "agent execution failed".to_string()),
                });
            }

            let judgement = self.judge.judge_task(&task.task_id, &exec.run_id).await?;

            if judgement.success || judgement.already_satisfied {
                *previous_feedback = Some(format!(
                    "Previous chain step {} completed: {}",
                    task.task_id, judgement.reason
                ));
                return Ok(StepOutcome::Completed);
            }

            if judgement.should_continue && attempt < self.task_retries {
                attempt += 1;
                debug!(task_id = %task.task_id, attempt, "Retrying chain step in place");
                *previous_feedback = Some(format!(
                    "Previous attempt was judged insufficient: {}\nMissing: {}",
                    judgement.reason,
                    judgement.missing_requirements.join("; ")
                ));
                continue;
            }

            let reason = if judgement.should_continue {
                BlockReason::MaxRetries
            } else {
                BlockReason::JudgeFailed
            };
            return Ok(StepOutcome::Failed {
                reason,
                message: judgement.reason,
            });
        }
    }
}

enum StepOutcome {
    Completed,
    Failed { reason: BlockReason, message: String },
}
