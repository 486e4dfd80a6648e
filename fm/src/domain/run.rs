//! Run record - metadata for one agent execution
//!
//! Runs are persisted by the run log (one metadata JSON per run next to the
//! log file), not the CAS store: a run is written by exactly one worker and
//! never contended.

use serde::{Deserialize, Serialize};
use workstore::now_ms;

/// Outcome of one agent run
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum RunStatus {
    #[default]
    Success,
    Failure,
    Timeout,
}

impl std::fmt::Display for RunStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Success => write!(f, "success"),
            Self::Failure => write!(f, "failure"),
            Self::Timeout => write!(f, "timeout"),
        }
    }
}

/// Metadata for one LLM execution. The log itself is a separate append-only
/// file at `log_path`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RunRecord {
    /// `run-<taskId>-<unixMillis>`
    pub run_id: String,

    pub task_id: String,

    /// Which agent executed (executor, judge, planner, ...)
    pub agent_type: String,

    /// Absolute path to the log file
    pub log_path: String,

    pub started_at: i64,
    pub finished_at: Option<i64>,

    pub status: RunStatus,
    pub error_message: Option<String>,

    /// Cross-references when this run was triggered by a planner run
    pub planner_run_id: Option<String>,
    pub planner_log_path: Option<String>,
}

impl RunRecord {
    /// Allocate a run id for a task at the current instant
    pub fn allocate(task_id: &str, agent_type: impl Into<String>) -> Self {
        let now = now_ms();
        Self {
            run_id: format!("run-{}-{}", task_id, now),
            task_id: task_id.to_string(),
            agent_type: agent_type.into(),
            log_path: String::new(),
            started_at: now,
            finished_at: None,
            status: RunStatus::Success,
            error_message: None,
            planner_run_id: None,
            planner_log_path: None,
        }
    }

    /// Mark finished with the given status
    pub fn finish(&mut self, status: RunStatus, error_message: Option<String>) {
        self.status = status;
        self.error_message = error_message;
        self.finished_at = Some(now_ms());
    }
}
