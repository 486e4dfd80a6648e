//! Planner operations
//!
//! The planner decomposes a user instruction into validated task
//! breakdowns, guarded by two loops: JSON-syntax failures are retried on
//! their own small budget, everything else (schema violations, quality-judge
//! rejections) accumulates as feedback and consumes the quality budget.
//! Continuation planning adds tasks for missing aspects, elects failed tasks
//! for retry, and refuses near-duplicates of completed work.

mod schema;
mod similarity;

use std::collections::HashMap;
use std::sync::Arc;

use serde::Deserialize;
use tracing::{debug, info, warn};

pub use schema::{BreakdownLimits, TaskBreakdown, validate_breakdowns};
pub use similarity::{DUPLICATE_THRESHOLD, acceptance_similarity, is_duplicate};

use crate::agent::{AgentRequest, AgentRunner};
use crate::domain::id::{breakdown_ordinal, compose_branch, compose_task_id, session_short};
use crate::domain::{ConversationTurn, PlannerSession, Store, Task, TaskState};
use crate::error::{OrchestrateError, Result};
use crate::judge::extract_json;
use crate::prompts;

/// Planner configuration (defaults per the engine's documented knobs)
#[derive(Debug, Clone)]
pub struct PlannerConfig {
    pub model: String,
    pub max_tasks: u32,
    pub max_task_duration: f64,
    pub strict_context_validation: bool,
    /// Quality-budget retries for schema/quality failures
    pub quality_retries: u32,
    /// Accept when the quality judge scores at least this
    pub quality_threshold: u32,
    /// Tasks elected for retry per re-planning round
    pub max_retry_tasks: usize,
    /// Validation retries for continuation planning
    pub max_validation_retries: u32,
    /// Consecutive unparseable responses tolerated
    pub max_consecutive_json_errors: u32,
}

impl Default for PlannerConfig {
    fn default() -> Self {
        Self {
            model: "claude-sonnet-4-20250514".to_string(),
            max_tasks: 5,
            max_task_duration: 4.0,
            strict_context_validation: false,
            quality_retries: 5,
            quality_threshold: 60,
            max_retry_tasks: 5,
            max_validation_retries: 3,
            max_consecutive_json_errors: 3,
        }
    }
}

/// Verdict of the final-completion judge
#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CompletionReport {
    pub is_complete: bool,
    #[serde(default)]
    pub missing_aspects: Vec<String>,
    #[serde(default)]
    pub additional_task_suggestions: Vec<String>,
    #[serde(default)]
    pub completion_score: u32,
    #[serde(default)]
    pub code_change_analysis: Option<String>,
}

impl CompletionReport {
    /// The fail-open default: an unparseable verdict must never loop
    /// re-planning forever
    fn assume_complete(reason: &str) -> Self {
        warn!(%reason, "Final-completion verdict unusable, assuming complete");
        Self {
            is_complete: true,
            missing_aspects: Vec::new(),
            additional_task_suggestions: Vec::new(),
            completion_score: 0,
            code_change_analysis: None,
        }
    }
}

/// Quality-judge wire shape
#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct QualityVerdict {
    is_acceptable: bool,
    score: u32,
    #[serde(default)]
    issues: Vec<String>,
    #[serde(default)]
    suggestions: Vec<String>,
}

/// Result of continuation planning
#[derive(Debug)]
pub struct ContinuationPlan {
    pub session: PlannerSession,
    pub new_tasks: Vec<Task>,
    pub retry_task_ids: Vec<String>,
}

/// Planner operations
#[derive(Clone)]
pub struct PlannerOps {
    store: Store,
    agent: Arc<dyn AgentRunner>,
    repo_path: String,
    config: PlannerConfig,
}

impl PlannerOps {
    pub fn new(store: Store, agent: Arc<dyn AgentRunner>, repo_path: impl Into<String>, config: PlannerConfig) -> Self {
        Self {
            store,
            agent,
            repo_path: repo_path.into(),
            config,
        }
    }

    /// Decompose an instruction into persisted, globally-identified tasks
    pub async fn plan_tasks(&self, instruction: &str) -> Result<(PlannerSession, Vec<Task>)> {
        info!("PlannerOps::plan_tasks: planning");
        let mut session = PlannerSession::new(instruction);

        let limits = self.limits(false);
        let breakdowns = self.plan_with_retries(&mut session, instruction, &limits).await?;

        let tasks = self.materialize(&mut session, &breakdowns)?;
        for task in &tasks {
            self.store.create(task).await?;
        }

        session.generated_task_ids = tasks.iter().map(|t| t.task_id.clone()).collect();
        session.complete();
        self.store.create(&session).await?;

        info!(session_id = %session.session_id, count = tasks.len(), "Planned tasks");
        Ok((session, tasks))
    }

    /// One final-completion judgement over the whole orchestration
    pub async fn judge_final_completion(
        &self,
        instruction: &str,
        completed_descriptions: &[String],
        failed_descriptions: &[String],
        run_summaries: &str,
        code_diff_stat: &str,
    ) -> Result<CompletionReport> {
        debug!("PlannerOps::judge_final_completion: called");
        let prompt = prompts::final_completion_prompt(
            instruction,
            completed_descriptions,
            failed_descriptions,
            run_summaries,
            code_diff_stat,
        );

        let response = match self.call_agent(&prompt).await {
            Ok(response) => response,
            Err(e) => return Ok(CompletionReport::assume_complete(&e.to_string())),
        };

        let Some(value) = extract_json(&response) else {
            return Ok(CompletionReport::assume_complete("no JSON in verdict"));
        };
        match serde_json::from_value::<CompletionReport>(value) {
            Ok(report) => Ok(report),
            Err(e) => Ok(CompletionReport::assume_complete(&e.to_string())),
        }
    }

    /// Plan additional tasks for missing aspects and elect failed tasks for
    /// retry from the integration branch.
    pub async fn plan_additional_tasks(
        &self,
        parent_session: &PlannerSession,
        missing_aspects: &[String],
    ) -> Result<ContinuationPlan> {
        info!(aspects = missing_aspects.len(), "PlannerOps::plan_additional_tasks: planning continuation");

        let all_tasks: Vec<Task> = self.store.list().await?;
        let completed: Vec<&Task> = all_tasks.iter().filter(|t| t.state == TaskState::Done).collect();

        let retry_task_ids = self.elect_and_reset_retries(&all_tasks).await?;

        let mut session = PlannerSession::continuation(parent_session, parent_session.instruction.clone());
        session.conversation = parent_session.conversation.clone();

        let completed_summaries: Vec<String> = completed
            .iter()
            .map(|t| {
                format!(
                    "{}: {}",
                    t.task_id,
                    t.summary.clone().unwrap_or_else(|| t.acceptance.clone())
                )
            })
            .collect();

        let base_prompt = prompts::continuation_planner_prompt(
            &parent_session.instruction,
            &completed_summaries,
            &retry_task_ids,
            missing_aspects,
            self.config.max_tasks,
            self.config.max_task_duration,
        );

        let limits = self.limits(true);
        let completed_acceptance: Vec<&str> = completed.iter().map(|t| t.acceptance.as_str()).collect();

        let mut feedback: Vec<String> = Vec::new();
        let mut attempts = 0u32;

        let breakdowns = loop {
            let mut prompt = base_prompt.clone();
            if !feedback.is_empty() {
                prompt.push_str("\n\n# Problems with your previous answer\n");
                for issue in &feedback {
                    prompt.push_str(&format!("- {}\n", issue));
                }
            }

            session.record_turn(ConversationTurn::user(prompt.clone()));
            let response = self.call_agent(&prompt).await?;
            session.record_turn(ConversationTurn::assistant(response.clone()));

            let mut errors: Vec<String> = Vec::new();
            let parsed: Option<Vec<TaskBreakdown>> = match extract_json(&response) {
                Some(value) => match serde_json::from_value(value) {
                    Ok(parsed) => Some(parsed),
                    Err(e) => {
                        errors.push(format!("response did not match the task schema: {}", e));
                        None
                    }
                },
                None => {
                    errors.push("response contained no JSON array".to_string());
                    None
                }
            };

            if let Some(parsed) = parsed {
                // An empty array is a valid "no additional work" answer
                if parsed.is_empty() {
                    break parsed;
                }

                if let Err(validation_errors) = validate_breakdowns(&parsed, &limits) {
                    errors.extend(validation_errors);
                }
                for b in &parsed {
                    for acceptance in &completed_acceptance {
                        if is_duplicate(&b.acceptance, acceptance) {
                            errors.push(format!("{}: duplicates already-completed work ('{}')", b.id, acceptance));
                        }
                    }
                }

                if errors.is_empty() {
                    break parsed;
                }
            }

            attempts += 1;
            if attempts >= self.config.max_validation_retries {
                return Err(OrchestrateError::Validation(format!(
                    "continuation planning failed after {} attempts: {}",
                    attempts,
                    errors.join("; ")
                )));
            }
            feedback = errors;
        };

        let new_tasks = self.materialize(&mut session, &breakdowns)?;
        for task in &new_tasks {
            self.store.create(task).await?;
        }

        session.generated_task_ids = new_tasks.iter().map(|t| t.task_id.clone()).collect();
        session.complete();
        self.store.create(&session).await?;

        info!(
            new = new_tasks.len(),
            retries = retry_task_ids.len(),
            "Continuation plan ready"
        );
        Ok(ContinuationPlan {
            session,
            new_tasks,
            retry_task_ids,
        })
    }

    /// The quality-retry planning loop shared by fresh planning
    async fn plan_with_retries(
        &self,
        session: &mut PlannerSession,
        instruction: &str,
        limits: &BreakdownLimits,
    ) -> Result<Vec<TaskBreakdown>> {
        let mut feedback: Vec<String> = Vec::new();
        let mut previous_output: Option<String> = None;
        let mut quality_attempts = 0u32;
        let mut consecutive_json_errors = 0u32;

        loop {
            let mut prompt = prompts::planner_prompt(instruction, self.config.max_tasks, self.config.max_task_duration);
            if let Some(previous) = &previous_output {
                prompt.push_str("\n\n# Your previous attempt\n\n");
                prompt.push_str(previous);
            }
            if !feedback.is_empty() {
                prompt.push_str("\n\n# Problems to fix\n");
                for issue in &feedback {
                    prompt.push_str(&format!("- {}\n", issue));
                }
            }

            session.record_turn(ConversationTurn::user(prompt.clone()));
            let response = self.call_agent(&prompt).await?;
            session.record_turn(ConversationTurn::assistant(response.clone()));
            previous_output = Some(response.clone());

            // JSON-syntax failures have their own small budget and do not
            // consume quality retries
            let Some(value) = extract_json(&response) else {
                consecutive_json_errors += 1;
                debug!(consecutive_json_errors, "Planner response had no JSON");
                if consecutive_json_errors >= self.config.max_consecutive_json_errors {
                    return Err(OrchestrateError::Validation(format!(
                        "planner produced no parseable JSON in {} consecutive attempts",
                        consecutive_json_errors
                    )));
                }
                continue;
            };
            consecutive_json_errors = 0;

            let parsed: Vec<TaskBreakdown> = match serde_json::from_value(value) {
                Ok(parsed) => parsed,
                Err(e) => {
                    quality_attempts += 1;
                    if quality_attempts >= self.config.quality_retries {
                        return Err(OrchestrateError::Validation(format!(
                            "planner output failed schema validation after {} attempts: {}",
                            quality_attempts, e
                        )));
                    }
                    feedback = vec![format!("response did not match the task schema: {}", e)];
                    continue;
                }
            };

            if parsed.is_empty() {
                quality_attempts += 1;
                if quality_attempts >= self.config.quality_retries {
                    return Err(OrchestrateError::Validation(
                        "planner produced zero tasks".to_string(),
                    ));
                }
                feedback = vec!["at least one task is required".to_string()];
                continue;
            }

            if let Err(errors) = validate_breakdowns(&parsed, limits) {
                quality_attempts += 1;
                if quality_attempts >= self.config.quality_retries {
                    return Err(OrchestrateError::Validation(format!(
                        "planner output invalid after {} attempts: {}",
                        quality_attempts,
                        errors.join("; ")
                    )));
                }
                feedback = errors;
                continue;
            }

            match self.quality_check(instruction, &parsed).await {
                QualityOutcome::Accepted => return Ok(parsed),
                QualityOutcome::Rejected(issues) => {
                    quality_attempts += 1;
                    if quality_attempts >= self.config.quality_retries {
                        return Err(OrchestrateError::Validation(format!(
                            "task set rejected by quality judge after {} attempts: {}",
                            quality_attempts,
                            issues.join("; ")
                        )));
                    }
                    feedback = issues;
                }
            }
        }
    }

    /// Second-LLM scoring of the proposed task set
    async fn quality_check(&self, instruction: &str, breakdowns: &[TaskBreakdown]) -> QualityOutcome {
        let tasks_json = serde_json::to_string_pretty(breakdowns).unwrap_or_default();
        let prompt = prompts::quality_judge_prompt(instruction, &tasks_json);

        let response = match self.call_agent(&prompt).await {
            Ok(response) => response,
            Err(e) => {
                warn!(error = %e, "Quality judge unavailable, accepting task set");
                return QualityOutcome::Accepted;
            }
        };

        let Some(value) = extract_json(&response) else {
            warn!("Quality judge produced no JSON, accepting task set");
            return QualityOutcome::Accepted;
        };
        let verdict: QualityVerdict = match serde_json::from_value(value) {
            Ok(verdict) => verdict,
            Err(e) => {
                warn!(error = %e, "Quality verdict unparseable, accepting task set");
                return QualityOutcome::Accepted;
            }
        };

        debug!(score = verdict.score, acceptable = verdict.is_acceptable, "Quality verdict");
        if verdict.is_acceptable || verdict.score >= self.config.quality_threshold {
            QualityOutcome::Accepted
        } else {
            let mut issues = verdict.issues;
            issues.extend(verdict.suggestions);
            if issues.is_empty() {
                issues.push(format!("quality score {} below threshold", verdict.score));
            }
            QualityOutcome::Rejected(issues)
        }
    }

    /// Turn validated breakdowns into Task records: splice the session short
    /// into ids, suffix branches with the task id, remap dependencies.
    fn materialize(&self, session: &mut PlannerSession, breakdowns: &[TaskBreakdown]) -> Result<Vec<Task>> {
        let short = session_short(&session.session_id).to_string();

        let mut id_map: HashMap<&str, String> = HashMap::new();
        for b in breakdowns {
            let ordinal = breakdown_ordinal(&b.id)
                .ok_or_else(|| OrchestrateError::Validation(format!("unparseable breakdown id '{}'", b.id)))?;
            id_map.insert(b.id.as_str(), compose_task_id(&short, ordinal));
        }

        let mut tasks = Vec::with_capacity(breakdowns.len());
        for b in breakdowns {
            let task_id = id_map[b.id.as_str()].clone();
            let branch = compose_branch(&b.branch, &task_id);

            let mut task = Task::new(task_id, &self.repo_path, branch)
                .with_acceptance(&b.acceptance)
                .with_context(&b.context)
                .with_type(b.task_type)
                .with_scope_paths(b.scope_paths.clone())
                .with_dependencies(
                    b.dependencies
                        .iter()
                        .map(|d| id_map[d.as_str()].clone())
                        .collect(),
                )
                .with_session(session.session_id.clone(), session.root_session_id.clone());
            task.parent_session_id = session.parent_session_id.clone();
            task.estimated_duration = b.estimated_duration;
            task.summary = b.summary.clone();
            tasks.push(task);
        }
        Ok(tasks)
    }

    /// Pick retryable tasks (continuations first, then id order, capped),
    /// reset them to Ready, and stamp the one-shot integration-retry flag.
    async fn elect_and_reset_retries(&self, all_tasks: &[Task]) -> Result<Vec<String>> {
        let mut retryable: Vec<&Task> = all_tasks.iter().filter(|t| t.is_integration_retryable()).collect();
        retryable.sort_by(|a, b| {
            let a_rank = (a.state != TaskState::NeedsContinuation) as u8;
            let b_rank = (b.state != TaskState::NeedsContinuation) as u8;
            a_rank.cmp(&b_rank).then_with(|| a.task_id.cmp(&b.task_id))
        });
        retryable.truncate(self.config.max_retry_tasks);

        let mut ids = Vec::with_capacity(retryable.len());
        for task in retryable {
            self.store
                .update_cas::<Task, _>(&task.task_id, task.version, |t| {
                    t.state = TaskState::Ready;
                    t.owner = None;
                    t.block_reason = None;
                    t.block_message = None;
                    t.integration_retried = true;
                })
                .await?;
            ids.push(task.task_id.clone());
        }
        Ok(ids)
    }

    async fn call_agent(&self, prompt: &str) -> Result<String> {
        let request = AgentRequest::new(prompt, &self.repo_path, &self.config.model);
        let outcome = self.agent.run(request).await?;
        Ok(outcome.final_response)
    }

    fn limits(&self, require_summary: bool) -> BreakdownLimits {
        BreakdownLimits {
            max_task_duration: self.config.max_task_duration,
            max_tasks: self.config.max_tasks,
            strict_context_validation: self.config.strict_context_validation,
            require_summary,
        }
    }
}

enum QualityOutcome {
    Accepted,
    Rejected(Vec<String>),
}
