//! Top-level orchestration state machine
//!
//! Wires Planner -> DependencyGraph -> SerialChainExecutor ->
//! DynamicScheduler -> final-completion judge, looping through re-planning
//! while the iteration budget lasts. Between rounds the integration branch
//! accumulates the merges of every Done task's branch; retried and new tasks
//! start from it.

use std::collections::HashSet;
use std::sync::Arc;

use tokio::sync::watch;
use tracing::{info, warn};

use crate::agent::AgentRunner;
use crate::config::Config;
use crate::domain::id::session_short;
use crate::domain::{BlockReason, Store, Task, TaskState};
use crate::error::Result;
use crate::git::{GitEffects, MergeOutcome};
use crate::graph::DependencyGraph;
use crate::judge::JudgeOps;
use crate::planner::{CompletionReport, PlannerOps};
use crate::runlog::RunLog;
use crate::scheduler::{DynamicScheduler, SchedulerOps, SerialChainExecutor};
use crate::worker::WorkerOps;

/// Where the orchestration currently is
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Phase {
    Idle,
    Planning,
    Executing,
    FinalJudging,
    Replanning,
    Done,
    Terminated,
}

impl std::fmt::Display for Phase {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Idle => write!(f, "idle"),
            Self::Planning => write!(f, "planning"),
            Self::Executing => write!(f, "executing"),
            Self::FinalJudging => write!(f, "final_judging"),
            Self::Replanning => write!(f, "replanning"),
            Self::Done => write!(f, "done"),
            Self::Terminated => write!(f, "terminated"),
        }
    }
}

/// Final result of one orchestration
#[derive(Debug)]
pub struct OrchestrationOutcome {
    /// Did the final-completion judge accept the work
    pub complete: bool,
    /// Execution rounds consumed (1 = no re-planning)
    pub rounds: u32,
    /// Branch accumulating all Done tasks' merges
    pub integration_branch: String,
    /// The last completion verdict
    pub report: CompletionReport,
}

/// Top-level orchestrator
pub struct Orchestrator {
    config: Config,
    store: Store,
    git: Arc<dyn GitEffects>,
    agent: Arc<dyn AgentRunner>,
    runlog: RunLog,
    cancel: watch::Receiver<bool>,
}

impl Orchestrator {
    pub fn new(
        config: Config,
        store: Store,
        git: Arc<dyn GitEffects>,
        agent: Arc<dyn AgentRunner>,
        runlog: RunLog,
        cancel: watch::Receiver<bool>,
    ) -> Self {
        Self {
            config,
            store,
            git,
            agent,
            runlog,
            cancel,
        }
    }

    /// Drive an instruction to completion or budget exhaustion
    pub async fn run(&self, instruction: &str) -> Result<OrchestrationOutcome> {
        let mut phase = Phase::Planning;
        info!(%phase, "Orchestration starting");

        let planner = self.planner();
        let (mut session, tasks) = planner.plan_tasks(instruction).await?;
        let short = session_short(&session.root_session_id).to_string();
        let integration_branch = format!("foreman/integration-{}", short);

        let mut rounds = 1u32;
        let mut round_tasks = tasks;
        let mut first_round = true;

        loop {
            phase = Phase::Executing;
            info!(%phase, round = rounds, tasks = round_tasks.len(), "Executing round");
            self.execute_round(&round_tasks, first_round, rounds > 1).await?;
            first_round = false;

            self.update_integration_branch(&integration_branch).await?;

            phase = Phase::FinalJudging;
            info!(%phase, "Judging completion");
            let report = self.final_judgement(&planner, instruction, &integration_branch).await?;

            if report.is_complete {
                phase = Phase::Done;
                info!(%phase, score = report.completion_score, "Instruction satisfied");
                return Ok(OrchestrationOutcome {
                    complete: true,
                    rounds,
                    integration_branch,
                    report,
                });
            }

            if rounds > self.config.iterations.max_replanning_rounds || *self.cancel.borrow() {
                phase = Phase::Terminated;
                warn!(%phase, rounds, "Budget exhausted with work remaining");
                return Ok(OrchestrationOutcome {
                    complete: false,
                    rounds,
                    integration_branch,
                    report,
                });
            }

            phase = Phase::Replanning;
            info!(%phase, missing = report.missing_aspects.len(), "Planning additional work");
            let plan = planner.plan_additional_tasks(&session, &report.missing_aspects).await?;
            session = plan.session;

            let mut next: Vec<Task> = plan.new_tasks;
            for id in &plan.retry_task_ids {
                next.push(self.store.read(id).await?);
            }
            if next.is_empty() {
                phase = Phase::Terminated;
                warn!(%phase, "Planner found nothing actionable for the missing aspects");
                return Ok(OrchestrationOutcome {
                    complete: false,
                    rounds,
                    integration_branch,
                    report,
                });
            }

            round_tasks = next;
            rounds += 1;
        }
    }

    /// One execution round: serial chains first, then the remaining DAG
    async fn execute_round(&self, tasks: &[Task], run_chains: bool, from_integration: bool) -> Result<()> {
        let ops = SchedulerOps::new(self.store.clone());
        let worker = self.worker_ops();
        let judge = self.judge_ops();

        let full_graph = DependencyGraph::build(tasks, None);
        let mut chain_member_ids: HashSet<String> = HashSet::new();
        let mut chain_failed_ids: Vec<String> = Vec::new();

        if run_chains {
            let executor = SerialChainExecutor::new(
                ops.clone(),
                worker.clone(),
                judge.clone(),
                self.git.clone(),
                self.config.iterations.serial_chain_task_retries,
            );

            for chain_ids in full_graph.serial_chains() {
                let chain: Vec<Task> = {
                    let mut members = Vec::with_capacity(chain_ids.len());
                    for id in &chain_ids {
                        members.push(self.store.read(id).await?);
                    }
                    members
                };
                chain_member_ids.extend(chain_ids.iter().cloned());

                let report = executor.run_chain(&chain).await?;
                chain_failed_ids.extend(report.blocked);
            }

            // Anything downstream of a failed chain member cannot run
            for id in full_graph.blocked_by_failure(&chain_failed_ids) {
                if !chain_member_ids.contains(&id) {
                    let task: Task = self.store.read(&id).await?;
                    if task.state == TaskState::Ready {
                        ops.block(
                            &id,
                            BlockReason::DependencyFailed,
                            Some("serial-chain dependency failed".to_string()),
                        )
                        .await?;
                    }
                }
            }
        }

        // The rest of the DAG runs in parallel; chain members completed
        // above count as external (already satisfied) dependencies
        let remaining: Vec<Task> = {
            let mut rest = Vec::new();
            for task in tasks {
                if chain_member_ids.contains(&task.task_id) {
                    continue;
                }
                let fresh: Task = self.store.read(&task.task_id).await?;
                if fresh.state == TaskState::Ready || fresh.state == TaskState::NeedsContinuation {
                    rest.push(fresh);
                }
            }
            rest
        };

        if remaining.is_empty() {
            return Ok(());
        }

        let global_ids: HashSet<String> = tasks.iter().map(|t| t.task_id.clone()).collect();
        let sub_graph = DependencyGraph::build(&remaining, Some(&global_ids));

        let default_base = if from_integration {
            let short = session_short(&remaining[0].root_session_id).to_string();
            Some(format!("foreman/integration-{}", short))
        } else {
            None
        };

        let scheduler = DynamicScheduler::new(
            ops,
            worker,
            judge,
            self.config.workers.max_workers,
            default_base,
            self.cancel.clone(),
        );
        scheduler.run(remaining, &sub_graph).await?;
        Ok(())
    }

    /// Merge every Done task's branch into the integration branch. This is
    /// the only phase allowed to create state outside task worktrees, and it
    /// runs alone between scheduling rounds.
    async fn update_integration_branch(&self, integration_branch: &str) -> Result<()> {
        let repo = self.config.git.repo_root.as_path();

        if !self.git.branch_exists(repo, integration_branch).await? {
            self.git.create_branch(repo, integration_branch, None).await?;
        }

        let worktree = repo.join(".git").join("foreman-worktrees").join("integration");
        if !worktree.exists() {
            self.git.add_worktree(repo, &worktree, integration_branch, None).await?;
        }

        let tasks: Vec<Task> = self.store.list().await?;
        for task in tasks.iter().filter(|t| t.state == TaskState::Done) {
            if !self.git.branch_exists(repo, &task.branch).await? {
                continue;
            }
            let message = format!("Integrate {} ({})", task.task_id, task.branch);
            match self.git.merge(&worktree, &task.branch, &message).await {
                Ok(MergeOutcome::Clean) => {}
                Ok(MergeOutcome::Conflict { .. }) => {
                    warn!(task_id = %task.task_id, "Integration merge conflict, skipping branch");
                    self.git.abort_merge(&worktree).await?;
                }
                Err(e) => {
                    warn!(task_id = %task.task_id, error = %e, "Integration merge failed");
                }
            }
        }

        if let Err(e) = self.git.remove_worktree(repo, &worktree).await {
            warn!(error = %e, "Failed to remove integration worktree");
        }
        Ok(())
    }

    /// Build the final-completion judgement inputs and ask the Planner's
    /// judge for a verdict.
    async fn final_judgement(
        &self,
        planner: &PlannerOps,
        instruction: &str,
        integration_branch: &str,
    ) -> Result<CompletionReport> {
        let repo = self.config.git.repo_root.as_path();
        let tasks: Vec<Task> = self.store.list().await?;

        let completed: Vec<String> = tasks
            .iter()
            .filter(|t| t.state == TaskState::Done)
            .map(describe)
            .collect();
        let failed: Vec<String> = tasks
            .iter()
            .filter(|t| t.state == TaskState::Blocked || t.state == TaskState::Cancelled)
            .map(describe)
            .collect();

        let runs = self.runlog.list_runs().await.unwrap_or_default();
        let run_summaries: String = runs
            .iter()
            .take(20)
            .map(|r| format!("{} [{}] {}\n", r.run_id, r.status, r.error_message.as_deref().unwrap_or("ok")))
            .collect();

        let base = self.git.current_branch(repo).await.unwrap_or_else(|_| "HEAD".to_string());
        let diff_stat = self
            .git
            .diff_stat(repo, &base, integration_branch)
            .await
            .unwrap_or_default();

        planner
            .judge_final_completion(instruction, &completed, &failed, &run_summaries, &diff_stat)
            .await
    }

    fn planner(&self) -> PlannerOps {
        PlannerOps::new(
            self.store.clone(),
            self.agent.clone(),
            self.config.git.repo_root.display().to_string(),
            self.config.planner_config(),
        )
    }

    fn judge_ops(&self) -> JudgeOps {
        JudgeOps::new(
            self.store.clone(),
            self.runlog.clone(),
            self.agent.clone(),
            self.config.judge_config(),
        )
    }

    fn worker_ops(&self) -> WorkerOps {
        WorkerOps::new(
            self.store.clone(),
            self.git.clone(),
            self.agent.clone(),
            self.runlog.clone(),
            self.config.worker_config(),
            self.cancel.clone(),
        )
    }
}

fn describe(task: &Task) -> String {
    format!(
        "{}: {}",
        task.task_id,
        task.summary.clone().unwrap_or_else(|| task.acceptance.clone())
    )
}
