//! Judge operations: evaluate a completed run against acceptance criteria
//!
//! The Judge is another LLM call. Its verdict must arrive as a JSON object;
//! extraction tolerates fenced code blocks and leading prose, and any
//! parse or validation failure collapses to a fail-closed verdict
//! (`success=false, shouldContinue=false`) so a babbling judge can never
//! loop a task forever.

mod extract;

use std::sync::Arc;

use serde::Deserialize;
use tracing::{debug, info, warn};

pub use extract::extract_json;

use crate::agent::{AgentRequest, AgentRunner};
use crate::domain::{BlockReason, Judgement, JudgementFeedback, Store, Task, TaskState};
use crate::error::{OrchestrateError, Result};
use crate::prompts;
use crate::runlog::{RunLog, truncate_middle};
use crate::scheduler::SchedulerOps;

/// Default byte budget for the log excerpt handed to the Judge
const LOG_BUDGET: usize = 150 * 1024;

/// What the judge decided to do with the task
#[derive(Debug, Clone, PartialEq)]
pub enum JudgeDecision {
    Completed,
    Continuation,
    Blocked(BlockReason),
}

/// Wire shape of the Judge's verdict (camelCase on the wire)
#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct JudgementWire {
    success: bool,
    should_continue: bool,
    should_replan: bool,
    #[serde(default)]
    already_satisfied: bool,
    reason: String,
    #[serde(default)]
    missing_requirements: Vec<String>,
}

impl From<JudgementWire> for Judgement {
    fn from(w: JudgementWire) -> Self {
        Judgement {
            success: w.success,
            should_continue: w.should_continue,
            should_replan: w.should_replan,
            already_satisfied: w.already_satisfied,
            reason: w.reason,
            missing_requirements: w.missing_requirements,
        }
    }
}

/// Judge configuration
#[derive(Debug, Clone)]
pub struct JudgeConfig {
    pub model: String,
    /// Continuation budget applied the first time a task needs one
    pub max_iterations: u32,
    pub log_budget: usize,
}

impl Default for JudgeConfig {
    fn default() -> Self {
        Self {
            model: "claude-sonnet-4-20250514".to_string(),
            max_iterations: 3,
            log_budget: LOG_BUDGET,
        }
    }
}

/// Judge operations over the store and run log
#[derive(Clone)]
pub struct JudgeOps {
    ops: SchedulerOps,
    runlog: RunLog,
    agent: Arc<dyn AgentRunner>,
    config: JudgeConfig,
}

impl JudgeOps {
    pub fn new(store: Store, runlog: RunLog, agent: Arc<dyn AgentRunner>, config: JudgeConfig) -> Self {
        Self {
            ops: SchedulerOps::new(store),
            runlog,
            agent,
            config,
        }
    }

    /// Evaluate a run. Loads the task, the run's final response, and a
    /// truncated log excerpt, then asks the Judge.
    pub async fn judge_task(&self, task_id: &str, run_id: &str) -> Result<Judgement> {
        debug!(%task_id, %run_id, "JudgeOps::judge_task: called");
        let task: Task = self.ops.store().read(task_id).await?;

        let log = self
            .runlog
            .read_log(run_id)
            .await
            .map_err(|_| OrchestrateError::RunNotFound(run_id.to_string()))?;
        let final_response = final_response_of(&log);
        let excerpt = truncate_middle(&log, self.config.log_budget);

        let prompt = prompts::judge_prompt(&task, final_response, &excerpt);
        let request = AgentRequest::new(prompt, &task.repo_path, &self.config.model);

        let outcome = match self.agent.run(request).await {
            Ok(outcome) => outcome,
            Err(e) => {
                warn!(%task_id, error = %e, "Judge agent failed");
                return Ok(Judgement::rejected(format!("judge agent failed: {}", e)));
            }
        };

        Ok(parse_judgement(&outcome.final_response))
    }

    /// Apply a verdict to the task's state
    pub async fn apply(&self, task_id: &str, judgement: &Judgement) -> Result<JudgeDecision> {
        debug!(%task_id, success = judgement.success, "JudgeOps::apply: called");

        if judgement.success || judgement.already_satisfied {
            self.mark_task_as_completed(task_id).await?;
            return Ok(JudgeDecision::Completed);
        }

        if judgement.should_continue {
            match self.mark_task_for_continuation(task_id, judgement.clone()).await {
                Ok(()) => return Ok(JudgeDecision::Continuation),
                Err(OrchestrateError::MaxIterationsExceeded { .. }) => {
                    info!(%task_id, "Continuation budget exhausted");
                    self.mark_task_as_blocked(task_id, BlockReason::MaxRetries, Some(judgement.reason.clone()))
                        .await?;
                    return Ok(JudgeDecision::Blocked(BlockReason::MaxRetries));
                }
                Err(e) => return Err(e),
            }
        }

        self.mark_task_as_blocked(task_id, BlockReason::JudgeFailed, Some(judgement.reason.clone()))
            .await?;
        Ok(JudgeDecision::Blocked(BlockReason::JudgeFailed))
    }

    pub async fn mark_task_as_completed(&self, task_id: &str) -> Result<()> {
        self.ops.complete(task_id).await?;
        Ok(())
    }

    pub async fn mark_task_as_blocked(
        &self,
        task_id: &str,
        reason: BlockReason,
        message: Option<String>,
    ) -> Result<()> {
        self.ops.block(task_id, reason, message).await?;
        Ok(())
    }

    /// CAS update: bump the iteration counter, store the verdict, and set
    /// `NeedsContinuation`. When the bump would exceed the budget the task
    /// is left untouched and `MaxIterationsExceeded` is returned so the
    /// caller can block it.
    pub async fn mark_task_for_continuation(&self, task_id: &str, judgement: Judgement) -> Result<()> {
        let current: Task = self.ops.store().read(task_id).await?;

        let (iteration, max_iterations) = match &current.judgement_feedback {
            Some(feedback) => (feedback.iteration, feedback.max_iterations),
            None => (0, self.config.max_iterations),
        };

        if iteration + 1 > max_iterations {
            return Err(OrchestrateError::MaxIterationsExceeded {
                task_id: task_id.to_string(),
                iteration,
                max_iterations,
            });
        }

        self.ops
            .store()
            .update_cas::<Task, _>(task_id, current.version, move |t| {
                t.state = TaskState::NeedsContinuation;
                t.owner = None;
                t.judgement_feedback = Some(JudgementFeedback {
                    judgement,
                    iteration: iteration + 1,
                    max_iterations,
                });
            })
            .await?;
        Ok(())
    }
}

/// The executor appends the agent's final response under this marker
fn final_response_of(log: &str) -> &str {
    log.rsplit_once("=== final response ===")
        .map(|(_, tail)| tail.trim())
        .unwrap_or("")
}

/// Extract and validate a judgement; any failure is a fail-closed rejection
pub fn parse_judgement(text: &str) -> Judgement {
    let Some(json) = extract_json(text) else {
        return Judgement::rejected("judge response contained no JSON object");
    };

    match serde_json::from_value::<JudgementWire>(json) {
        Ok(wire) => wire.into(),
        Err(e) => Judgement::rejected(format!("judge response failed validation: {}", e)),
    }
}
