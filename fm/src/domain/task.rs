//! Task record - the fundamental unit of orchestration

use serde::{Deserialize, Serialize};
use workstore::{Record, now_ms};

/// Lifecycle state of a task
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum TaskState {
    /// Eligible for claiming
    #[default]
    Ready,
    /// Claimed by a worker
    Running,
    /// Judge allowed another attempt
    NeedsContinuation,
    /// Accepted and finished
    Done,
    /// No further progress without an explicit reset
    Blocked,
    /// Withdrawn
    Cancelled,
}

impl TaskState {
    /// Done and Cancelled never transition again
    pub fn is_terminal(self) -> bool {
        matches!(self, TaskState::Done | TaskState::Cancelled)
    }
}

impl std::fmt::Display for TaskState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Ready => write!(f, "ready"),
            Self::Running => write!(f, "running"),
            Self::NeedsContinuation => write!(f, "needs_continuation"),
            Self::Done => write!(f, "done"),
            Self::Blocked => write!(f, "blocked"),
            Self::Cancelled => write!(f, "cancelled"),
        }
    }
}

/// Why a task is blocked
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum BlockReason {
    MaxRetries,
    SystemErrorTransient,
    JudgeFailed,
    DependencyFailed,
    CyclicDependency,
    Unschedulable,
}

impl std::fmt::Display for BlockReason {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::MaxRetries => write!(f, "max_retries"),
            Self::SystemErrorTransient => write!(f, "system_error_transient"),
            Self::JudgeFailed => write!(f, "judge_failed"),
            Self::DependencyFailed => write!(f, "dependency_failed"),
            Self::CyclicDependency => write!(f, "cyclic_dependency"),
            Self::Unschedulable => write!(f, "unschedulable"),
        }
    }
}

/// Kind of work the task represents
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum TaskType {
    #[default]
    Implementation,
    Documentation,
    Investigation,
    Integration,
}

/// Verdict from one Judge evaluation
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Judgement {
    pub success: bool,
    pub should_continue: bool,
    pub should_replan: bool,
    #[serde(default)]
    pub already_satisfied: bool,
    pub reason: String,
    #[serde(default)]
    pub missing_requirements: Vec<String>,
}

impl Judgement {
    /// Fail-closed verdict used when the Judge's output cannot be parsed
    pub fn rejected(reason: impl Into<String>) -> Self {
        Self {
            success: false,
            should_continue: false,
            should_replan: false,
            already_satisfied: false,
            reason: reason.into(),
            missing_requirements: Vec::new(),
        }
    }
}

/// Continuation bookkeeping carried between attempts
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct JudgementFeedback {
    /// Last verdict
    pub judgement: Judgement,
    /// Attempts consumed so far
    pub iteration: u32,
    /// Ceiling; reaching it blocks the task with MaxRetries
    pub max_iterations: u32,
}

/// A task record. Fixed attributes come from the planner; mutable attributes
/// are only ever changed through compare-and-swap updates.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Task {
    /// Globally unique id (`task-<short8>-<n>`)
    pub task_id: String,

    /// Path to the repository this task edits
    pub repo_path: String,

    /// Branch name; always ends with the task id
    pub branch: String,

    /// Repo-relative paths this task is scoped to
    pub scope_paths: Vec<String>,

    /// Acceptance criteria the Judge evaluates against
    pub acceptance: String,

    /// Kind of work
    pub task_type: TaskType,

    /// Estimated hours (0.5 - 8.0)
    pub estimated_duration: f64,

    /// Self-contained implementation brief
    pub context: String,

    /// Task ids that must finish first
    pub dependencies: Vec<String>,

    /// Lifecycle state
    pub state: TaskState,

    /// Worker id while Running, None otherwise
    pub owner: Option<String>,

    /// CAS version counter
    pub version: u64,

    /// Most recent run id
    pub latest_run_id: Option<String>,

    /// Continuation bookkeeping from the Judge
    pub judgement_feedback: Option<JudgementFeedback>,

    /// Why the task is blocked (when state == Blocked)
    pub block_reason: Option<BlockReason>,

    /// Free-form detail accompanying the block reason
    pub block_message: Option<String>,

    /// Flips false -> true at most once, when the task is re-queued from the
    /// integration branch during re-planning
    pub integration_retried: bool,

    /// Short human summary
    pub summary: Option<String>,

    /// Planning session lineage
    pub session_id: String,
    pub parent_session_id: Option<String>,
    pub root_session_id: String,

    /// Unix-millisecond timestamps
    pub created_at: i64,
    pub updated_at: i64,
}

impl Task {
    /// Create a Ready task with the given identity
    pub fn new(task_id: impl Into<String>, repo_path: impl Into<String>, branch: impl Into<String>) -> Self {
        let now = now_ms();
        Self {
            task_id: task_id.into(),
            repo_path: repo_path.into(),
            branch: branch.into(),
            scope_paths: Vec::new(),
            acceptance: String::new(),
            task_type: TaskType::Implementation,
            estimated_duration: 1.0,
            context: String::new(),
            dependencies: Vec::new(),
            state: TaskState::Ready,
            owner: None,
            version: 0,
            latest_run_id: None,
            judgement_feedback: None,
            block_reason: None,
            block_message: None,
            integration_retried: false,
            summary: None,
            session_id: String::new(),
            parent_session_id: None,
            root_session_id: String::new(),
            created_at: now,
            updated_at: now,
        }
    }

    pub fn with_acceptance(mut self, acceptance: impl Into<String>) -> Self {
        self.acceptance = acceptance.into();
        self
    }

    pub fn with_context(mut self, context: impl Into<String>) -> Self {
        self.context = context.into();
        self
    }

    pub fn with_dependencies(mut self, dependencies: Vec<String>) -> Self {
        self.dependencies = dependencies;
        self
    }

    pub fn with_type(mut self, task_type: TaskType) -> Self {
        self.task_type = task_type;
        self
    }

    pub fn with_session(mut self, session_id: impl Into<String>, root_session_id: impl Into<String>) -> Self {
        self.session_id = session_id.into();
        self.root_session_id = root_session_id.into();
        self
    }

    pub fn with_scope_paths(mut self, scope_paths: Vec<String>) -> Self {
        self.scope_paths = scope_paths;
        self
    }

    /// Owner is present exactly while the task runs
    pub fn is_owned(&self) -> bool {
        self.owner.is_some()
    }

    /// Continuation attempts left under the judgement budget
    pub fn iterations_remaining(&self) -> Option<u32> {
        self.judgement_feedback
            .as_ref()
            .map(|f| f.max_iterations.saturating_sub(f.iteration))
    }

    /// Eligible for a re-planning retry: the Judge asked for continuation, or
    /// the task was blocked for a recoverable reason and has not yet used its
    /// one integration retry.
    pub fn is_integration_retryable(&self) -> bool {
        match self.state {
            TaskState::NeedsContinuation => true,
            TaskState::Blocked => {
                matches!(
                    self.block_reason,
                    Some(BlockReason::MaxRetries) | Some(BlockReason::SystemErrorTransient)
                ) && !self.integration_retried
            }
            _ => false,
        }
    }
}

impl Record for Task {
    fn id(&self) -> &str {
        &self.task_id
    }

    fn version(&self) -> u64 {
        self.version
    }

    fn set_version(&mut self, version: u64) {
        self.version = version;
    }

    fn touch(&mut self, now_ms: i64) {
        self.updated_at = now_ms;
    }

    fn collection_name() -> &'static str {
        "tasks"
    }
}
