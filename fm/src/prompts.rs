//! Prompt templates for the executor, judge, and planner agents

use crate::domain::Task;
use crate::git::ConflictContent;

/// Executor prompt: acceptance criteria, the task brief, and the previous
/// attempt's verdict when this is a continuation.
pub fn executor_prompt(task: &Task) -> String {
    let mut prompt = String::new();

    prompt.push_str(&format!("# Task {}\n\n", task.task_id));
    prompt.push_str("## Acceptance criteria\n\n");
    prompt.push_str(&task.acceptance);
    prompt.push_str("\n\n## Context\n\n");
    prompt.push_str(&task.context);

    if !task.scope_paths.is_empty() {
        prompt.push_str("\n\n## Scope\n\nRestrict your changes to these paths:\n");
        for path in &task.scope_paths {
            prompt.push_str(&format!("- {}\n", path));
        }
    }

    if let Some(feedback) = &task.judgement_feedback {
        prompt.push_str("\n\n## Previous attempt\n\n");
        prompt.push_str(&format!(
            "A previous attempt was judged insufficient (attempt {} of {}).\n",
            feedback.iteration, feedback.max_iterations
        ));
        prompt.push_str(&format!("Reason: {}\n", feedback.judgement.reason));
        if !feedback.judgement.missing_requirements.is_empty() {
            prompt.push_str("Missing requirements:\n");
            for req in &feedback.judgement.missing_requirements {
                prompt.push_str(&format!("- {}\n", req));
            }
        }
    }

    prompt
}

/// Context for a conflict-resolution task: the branches to merge and all
/// three sides of every conflicted path.
pub fn conflict_resolution_context(
    parent_task_id: &str,
    branch: &str,
    dependency_branches: &[String],
    conflicts: &[ConflictContent],
) -> String {
    let mut ctx = String::new();

    ctx.push_str(&format!(
        "Merging dependency branches for task {} left conflicts on branch {}.\n\
         In your working directory, merge these branches in order, resolving every conflict\n\
         so the listed files keep the intent of both sides and the project builds:\n",
        parent_task_id, branch
    ));
    for dep_branch in dependency_branches {
        ctx.push_str(&format!("- {}\n", dep_branch));
    }
    ctx.push('\n');

    for conflict in conflicts {
        ctx.push_str(&format!("## {}\n\n", conflict.file_path));
        ctx.push_str(&format!("Incoming branch: {}\n\n", conflict.their_branch));
        if let Some(base) = &conflict.base {
            ctx.push_str("### Base\n\n```\n");
            ctx.push_str(base);
            ctx.push_str("```\n\n");
        }
        ctx.push_str("### Ours\n\n```\n");
        ctx.push_str(&conflict.ours);
        ctx.push_str("```\n\n### Theirs\n\n```\n");
        ctx.push_str(&conflict.theirs);
        ctx.push_str("```\n\n");
    }

    ctx
}

/// Judge prompt over a completed run
pub fn judge_prompt(task: &Task, final_response: &str, log_excerpt: &str) -> String {
    format!(
        "You are reviewing the work of a coding agent.\n\n\
         # Acceptance criteria\n\n{acceptance}\n\n\
         # Agent's final response\n\n{response}\n\n\
         # Run log (may be truncated)\n\n{log}\n\n\
         Decide whether the acceptance criteria are satisfied. Respond with a single JSON object:\n\
         ```json\n\
         {{\n\
           \"success\": bool,\n\
           \"shouldContinue\": bool,\n\
           \"shouldReplan\": bool,\n\
           \"alreadySatisfied\": bool,\n\
           \"reason\": \"one paragraph\",\n\
           \"missingRequirements\": [\"...\"]\n\
         }}\n\
         ```\n\
         Set shouldContinue only when another attempt with your feedback is likely to succeed.",
        acceptance = task.acceptance,
        response = final_response,
        log = log_excerpt,
    )
}

/// Planner decomposition prompt
pub fn planner_prompt(instruction: &str, max_tasks: u32, max_duration: f64) -> String {
    format!(
        "You are a software architect decomposing a development instruction into executable tasks.\n\n\
         # Instruction\n\n{instruction}\n\n\
         Produce a JSON array of at most {max_tasks} task objects:\n\
         ```json\n\
         [{{\n\
           \"id\": \"task-1\",\n\
           \"description\": \"what to build\",\n\
           \"branch\": \"feature/short-name\",\n\
           \"scopePaths\": [\"src/\"],\n\
           \"acceptance\": \"testable completion criteria\",\n\
           \"type\": \"implementation|documentation|investigation|integration\",\n\
           \"estimatedDuration\": 1.5,\n\
           \"context\": \"self-contained implementation brief\",\n\
           \"dependencies\": [\"task-1\"],\n\
           \"summary\": \"under 50 chars\"\n\
         }}]\n\
         ```\n\
         Rules:\n\
         - ids are sequential: task-1, task-2, ...\n\
         - dependencies reference sibling ids only and must not form cycles\n\
         - estimatedDuration is hours in [0.5, {max_duration}]\n\
         - every task must be independently executable from its context alone",
    )
}

/// Quality-judge prompt over a proposed task set
pub fn quality_judge_prompt(instruction: &str, tasks_json: &str) -> String {
    format!(
        "Score this task breakdown for the instruction below.\n\n\
         # Instruction\n\n{instruction}\n\n\
         # Proposed tasks\n\n{tasks_json}\n\n\
         Respond with a single JSON object:\n\
         ```json\n\
         {{\"isAcceptable\": bool, \"score\": 0-100, \"issues\": [\"...\"], \"suggestions\": [\"...\"]}}\n\
         ```\n\
         Judge coverage of the instruction, task independence, dependency correctness, and scope discipline.",
    )
}

/// Final-completion judge prompt
pub fn final_completion_prompt(
    instruction: &str,
    completed_descriptions: &[String],
    failed_descriptions: &[String],
    run_summaries: &str,
    code_diff_stat: &str,
) -> String {
    let completed = if completed_descriptions.is_empty() {
        "(none)".to_string()
    } else {
        completed_descriptions.join("\n- ")
    };
    let failed = if failed_descriptions.is_empty() {
        "(none)".to_string()
    } else {
        failed_descriptions.join("\n- ")
    };

    format!(
        "Decide whether the original instruction has been satisfied by the completed work.\n\n\
         # Instruction\n\n{instruction}\n\n\
         # Completed tasks\n\n- {completed}\n\n\
         # Failed tasks\n\n- {failed}\n\n\
         # Run summaries\n\n{run_summaries}\n\n\
         # Code changes\n\n{code_diff_stat}\n\n\
         Respond with a single JSON object:\n\
         ```json\n\
         {{\n\
           \"isComplete\": bool,\n\
           \"missingAspects\": [\"...\"],\n\
           \"additionalTaskSuggestions\": [\"...\"],\n\
           \"completionScore\": 0-100,\n\
           \"codeChangeAnalysis\": \"optional\"\n\
         }}\n\
         ```",
    )
}

/// Continuation-planning prompt
pub fn continuation_planner_prompt(
    instruction: &str,
    completed_summaries: &[String],
    retryable_ids: &[String],
    missing_aspects: &[String],
    max_tasks: u32,
    max_duration: f64,
) -> String {
    let completed = if completed_summaries.is_empty() {
        "(none)".to_string()
    } else {
        completed_summaries.join("\n- ")
    };
    let retryable = if retryable_ids.is_empty() {
        "(none)".to_string()
    } else {
        retryable_ids.join(", ")
    };
    let missing = missing_aspects.join("\n- ");

    format!(
        "{base}\n\n\
         # Already completed (do NOT recreate these)\n\n- {completed}\n\n\
         # Tasks queued for retry (do NOT recreate these either)\n\n{retryable}\n\n\
         # Missing aspects to address\n\n- {missing}\n\n\
         Plan only tasks that address the missing aspects. An empty array is a valid answer\n\
         when the retries alone will cover them.",
        base = planner_prompt(instruction, max_tasks, max_duration),
    )
}
