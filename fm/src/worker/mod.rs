//! Worker operations: worktree lifecycle and agent execution
//!
//! A worker owns one task execution end to end: worktree setup (including
//! multi-dependency merges), the agent run, commit, push, and cleanup.
//! Worktrees live under the repository's private git metadata area so the
//! main working tree is never touched.

use std::path::{Path, PathBuf};
use std::sync::Arc;

use tokio::sync::watch;
use tracing::{debug, info, warn};

use crate::agent::{AgentRequest, AgentRunner, RetryPolicy, response_mentions_rate_limit, run_agent_with_retry};
use crate::domain::{RunRecord, RunStatus, Store, Task, TaskType};
use crate::error::{OrchestrateError, Result};
use crate::git::{ConflictContent, GitEffects, MergeOutcome};
use crate::prompts;
use crate::resolver::BaseBranchResolution;
use crate::runlog::{RunLog, truncate_middle};
use workstore::now_ms;

/// Directory under `.git` that holds task worktrees
const WORKTREE_AREA: &str = "foreman-worktrees";

/// Byte budget when prior logs are folded into a continuation prompt
const FEEDBACK_BUDGET: usize = 16 * 1024;

/// Result of one execution attempt. Setup failures (including conflict
/// deferral) surface as errors before a run exists; once a run is allocated,
/// failures are reported here with the run id attached.
#[derive(Debug, Clone)]
pub struct ExecutionOutcome {
    pub run_id: String,
    pub success: bool,
    pub error: Option<String>,
}

/// Configuration for worker execution
#[derive(Debug, Clone)]
pub struct WorkerConfig {
    /// Model passed to the agent
    pub model: String,

    /// Rate-limit retry policy
    pub retry: RetryPolicy,

    /// Append a signature line to commit messages
    pub auto_signature: bool,
}

impl Default for WorkerConfig {
    fn default() -> Self {
        Self {
            model: "claude-sonnet-4-20250514".to_string(),
            retry: RetryPolicy::default(),
            auto_signature: false,
        }
    }
}

/// Worker operations over one store/git/agent stack
#[derive(Clone)]
pub struct WorkerOps {
    store: Store,
    git: Arc<dyn GitEffects>,
    agent: Arc<dyn AgentRunner>,
    runlog: RunLog,
    config: WorkerConfig,
    cancel: watch::Receiver<bool>,
}

impl WorkerOps {
    pub fn new(
        store: Store,
        git: Arc<dyn GitEffects>,
        agent: Arc<dyn AgentRunner>,
        runlog: RunLog,
        config: WorkerConfig,
        cancel: watch::Receiver<bool>,
    ) -> Self {
        Self {
            store,
            git,
            agent,
            runlog,
            config,
            cancel,
        }
    }

    /// Predictable worktree location for a task
    pub fn worktree_path(repo_path: &Path, task_id: &str) -> PathBuf {
        repo_path.join(".git").join(WORKTREE_AREA).join(task_id)
    }

    /// Create (or reuse) the task's branch and worktree. A missing branch is
    /// created from `base_branch`, or from HEAD when none is given.
    pub async fn setup_worktree(&self, task: &Task, base_branch: Option<&str>) -> Result<PathBuf> {
        let repo = Path::new(&task.repo_path);
        let path = Self::worktree_path(repo, &task.task_id);
        debug!(task_id = %task.task_id, path = %path.display(), "WorkerOps::setup_worktree: called");

        if path.exists() {
            debug!(task_id = %task.task_id, "WorkerOps::setup_worktree: reusing existing worktree");
            return Ok(path);
        }

        if self.git.branch_exists(repo, &task.branch).await? {
            self.git.add_worktree(repo, &path, &task.branch, None).await?;
        } else {
            let base = base_branch.unwrap_or("HEAD");
            self.git.add_worktree(repo, &path, &task.branch, Some(base)).await?;
        }

        info!(task_id = %task.task_id, branch = %task.branch, "Created worktree");
        Ok(path)
    }

    /// Set up from the first dependency branch, then merge the remaining
    /// dependency branches inside the worktree. The first conflicted merge
    /// spawns a conflict-resolution task and fails with
    /// `ConflictResolutionRequired`.
    pub async fn setup_worktree_with_merge(&self, task: &Task, dependency_branches: &[String]) -> Result<PathBuf> {
        debug!(task_id = %task.task_id, branches = dependency_branches.len(), "WorkerOps::setup_worktree_with_merge: called");
        let (first, rest) = dependency_branches
            .split_first()
            .ok_or_else(|| OrchestrateError::Validation("multi-dependency setup requires branches".to_string()))?;

        let path = self.setup_worktree(task, Some(first)).await?;

        for branch in rest {
            let message = format!("Merge {} into {}", branch, task.branch);
            match self.git.merge(&path, branch, &message).await? {
                MergeOutcome::Clean => {
                    debug!(task_id = %task.task_id, %branch, "WorkerOps::setup_worktree_with_merge: merged cleanly");
                }
                MergeOutcome::Conflict { message } => {
                    warn!(task_id = %task.task_id, %branch, "Dependency merge conflict");

                    // Read all three sides while the index still has them
                    let files = self.git.conflicted_files(&path).await?;
                    let mut contents: Vec<ConflictContent> = Vec::with_capacity(files.len());
                    for file in &files {
                        contents.push(self.git.conflict_content(&path, file, branch).await?);
                    }

                    self.git.abort_merge(&path).await?;

                    let resolution = self
                        .spawn_conflict_resolution_task(task, dependency_branches, &files, &contents)
                        .await?;
                    debug!(task_id = %task.task_id, resolution = %resolution, %message, "Spawned conflict-resolution task");

                    // Drop the half-built branch so the retry can start
                    // cleanly from the resolution task's branch
                    let repo = Path::new(&task.repo_path);
                    if let Err(e) = self.git.remove_worktree(repo, &path).await {
                        warn!(task_id = %task.task_id, error = %e, "Failed to remove conflicted worktree");
                    }
                    if let Err(e) = self.git.delete_branch(repo, &task.branch).await {
                        warn!(task_id = %task.task_id, error = %e, "Failed to drop conflicted branch");
                    }

                    return Err(OrchestrateError::ConflictResolutionRequired {
                        parent_task_id: task.task_id.clone(),
                        resolution_task_id: resolution,
                        temp_branch: task.branch.clone(),
                    });
                }
            }
        }

        Ok(path)
    }

    /// Persist a Ready integration task scoped to the conflicted files. The
    /// resolution task starts from the first dependency branch and its agent
    /// is instructed to redo the remaining merges, resolving as it goes.
    async fn spawn_conflict_resolution_task(
        &self,
        parent: &Task,
        dependency_branches: &[String],
        files: &[String],
        contents: &[ConflictContent],
    ) -> Result<String> {
        let resolution_id = format!("{}-merge-{}", parent.task_id, now_ms());
        let branch = format!("{}-resolve-{}", parent.branch, now_ms());

        let mut resolution = Task::new(&resolution_id, &parent.repo_path, branch)
            .with_type(TaskType::Integration)
            .with_acceptance("all listed files resolved and the project builds")
            .with_scope_paths(files.to_vec())
            .with_context(prompts::conflict_resolution_context(
                &parent.task_id,
                &parent.branch,
                dependency_branches,
                contents,
            ))
            .with_session(parent.session_id.clone(), parent.root_session_id.clone())
            .with_dependencies(parent.dependencies.first().cloned().into_iter().collect());
        resolution.summary = Some(format!("resolve merge conflicts for {}", parent.task_id));

        self.store.create(&resolution).await?;
        Ok(resolution_id)
    }

    /// Full execution: setup per the resolution, then run/commit/push
    pub async fn execute_task_with_worktree(
        &self,
        task: &Task,
        resolution: &BaseBranchResolution,
    ) -> Result<ExecutionOutcome> {
        debug!(task_id = %task.task_id, ?resolution, "WorkerOps::execute_task_with_worktree: called");
        let path = match resolution {
            BaseBranchResolution::None => self.setup_worktree(task, None).await?,
            BaseBranchResolution::Single { base_branch } => self.setup_worktree(task, Some(base_branch)).await?,
            BaseBranchResolution::Multi { dependency_branches } => {
                self.setup_worktree_with_merge(task, dependency_branches).await?
            }
        };

        self.run_agent_and_commit(task, &path, None).await
    }

    /// Execution inside an already-prepared worktree (serial chains)
    pub async fn execute_task_in_existing_worktree(
        &self,
        task: &Task,
        worktree_path: &Path,
        previous_feedback: Option<String>,
    ) -> Result<ExecutionOutcome> {
        debug!(task_id = %task.task_id, path = %worktree_path.display(), "WorkerOps::execute_task_in_existing_worktree: called");
        self.run_agent_and_commit(task, worktree_path, previous_feedback).await
    }

    /// Continuation: reuse the task's worktree when it still exists,
    /// otherwise fall back to a fresh execution.
    pub async fn continue_task(&self, task: &Task, resolution: &BaseBranchResolution) -> Result<ExecutionOutcome> {
        debug!(task_id = %task.task_id, "WorkerOps::continue_task: called");
        let repo = Path::new(&task.repo_path);

        let existing = self
            .git
            .list_worktrees(repo)
            .await?
            .into_iter()
            .find(|p| p.ends_with(&task.task_id));

        match existing {
            Some(path) => {
                let previous_feedback = match &task.latest_run_id {
                    Some(run_id) => self
                        .runlog
                        .read_log(run_id)
                        .await
                        .ok()
                        .map(|log| truncate_middle(&log, FEEDBACK_BUDGET)),
                    None => None,
                };
                self.run_agent_and_commit(task, &path, previous_feedback).await
            }
            None => {
                debug!(task_id = %task.task_id, "WorkerOps::continue_task: worktree gone, executing fresh");
                self.execute_task_with_worktree(task, resolution).await
            }
        }
    }

    /// Remove the task's worktree. Best effort: failures are logged, never
    /// propagated, so cleanup can sit on every exit path.
    pub async fn cleanup_worktree(&self, task: &Task) {
        let repo = Path::new(&task.repo_path);
        let path = Self::worktree_path(repo, &task.task_id);
        debug!(task_id = %task.task_id, "WorkerOps::cleanup_worktree: called");

        if let Err(e) = self.git.remove_worktree(repo, &path).await {
            warn!(task_id = %task.task_id, error = %e, "Failed to remove worktree");
        }
        if let Err(e) = self.git.prune_worktrees(repo).await {
            warn!(task_id = %task.task_id, error = %e, "Failed to prune worktrees");
        }
    }

    /// The shared tail of every execution path: run the agent with the run
    /// log attached, then stage, commit, and push the worktree's branch.
    async fn run_agent_and_commit(
        &self,
        task: &Task,
        worktree_path: &Path,
        previous_feedback: Option<String>,
    ) -> Result<ExecutionOutcome> {
        let mut run = RunRecord::allocate(&task.task_id, "executor");
        self.runlog
            .initialize_log(&mut run)
            .await
            .map_err(|e| OrchestrateError::AgentExecution(e.to_string()))?;
        self.runlog
            .save_metadata(&run)
            .await
            .map_err(|e| OrchestrateError::AgentExecution(e.to_string()))?;

        let mut prompt = prompts::executor_prompt(task);
        if let Some(feedback) = previous_feedback {
            prompt.push_str("\n\n## Previous step output\n\n");
            prompt.push_str(&feedback);
        }

        let request = AgentRequest::new(prompt, worktree_path, &self.config.model).with_run_id(&run.run_id);

        let outcome = run_agent_with_retry(self.agent.as_ref(), request, &self.config.retry, &self.cancel).await;

        let agent_outcome = match outcome {
            Ok(outcome) => outcome,
            Err(e) => {
                let status = match &e {
                    crate::agent::AgentError::Timeout(_) => RunStatus::Timeout,
                    _ => RunStatus::Failure,
                };
                return self.fail_run(task, run, status, e.to_string()).await;
            }
        };

        let _ = self
            .runlog
            .append(&run.run_id, &format!("\n\n=== final response ===\n{}\n", agent_outcome.final_response))
            .await;

        // A rate limit buried in the final text is still a failed run
        if response_mentions_rate_limit(&agent_outcome.final_response) {
            return self
                .fail_run(task, run, RunStatus::Failure, "agent reported rate limit in final response".to_string())
                .await;
        }

        if let Err(e) = self.commit_and_push(task, worktree_path).await {
            return self.fail_run(task, run, RunStatus::Failure, e.to_string()).await;
        }

        run.finish(RunStatus::Success, None);
        self.runlog
            .save_metadata(&run)
            .await
            .map_err(|e| OrchestrateError::AgentExecution(e.to_string()))?;
        self.record_latest_run(task, &run.run_id).await;

        info!(task_id = %task.task_id, run_id = %run.run_id, "Task execution succeeded");
        Ok(ExecutionOutcome {
            run_id: run.run_id,
            success: true,
            error: None,
        })
    }

    async fn commit_and_push(&self, task: &Task, worktree_path: &Path) -> Result<()> {
        self.git.stage_all(worktree_path).await?;

        // The branch name is read from the worktree, not assumed: serial
        // chains switch branches under the same path.
        let branch = self.git.current_branch(worktree_path).await?;

        let mut message = format!("{}: automated changes on {}", task.task_id, branch);
        if self.config.auto_signature {
            message.push_str("\n\nCommitted-by: foreman");
        }

        self.git.commit(worktree_path, &message).await?;

        if let Err(e) = self.git.push(worktree_path, &branch).await {
            // A repo without a remote is common in local runs
            warn!(task_id = %task.task_id, error = %e, "Push failed");
        }
        Ok(())
    }

    async fn fail_run(
        &self,
        task: &Task,
        mut run: RunRecord,
        status: RunStatus,
        error: String,
    ) -> Result<ExecutionOutcome> {
        warn!(task_id = %task.task_id, run_id = %run.run_id, %error, "Task execution failed");
        run.finish(status, Some(error.clone()));
        if let Err(e) = self.runlog.save_metadata(&run).await {
            warn!(run_id = %run.run_id, error = %e, "Failed to save run metadata");
        }
        self.record_latest_run(task, &run.run_id).await;

        Ok(ExecutionOutcome {
            run_id: run.run_id,
            success: false,
            error: Some(error),
        })
    }

    /// Point the task at its newest run. The task is owned by this worker
    /// while it runs, so a single CAS attempt from a fresh read suffices.
    async fn record_latest_run(&self, task: &Task, run_id: &str) {
        let fresh: std::result::Result<Task, _> = self.store.read(&task.task_id).await;
        if let Ok(fresh) = fresh {
            let run_id = run_id.to_string();
            if let Err(e) = self
                .store
                .update_cas::<Task, _>(&task.task_id, fresh.version, move |t| t.latest_run_id = Some(run_id))
                .await
            {
                warn!(task_id = %task.task_id, error = %e, "Failed to record latest run id");
            }
        }
    }
}
