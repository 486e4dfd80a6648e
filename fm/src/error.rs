//! Uniform error taxonomy for the orchestration engine
//!
//! Every component failure is expressed as one of these kinds so callers can
//! match on shape instead of string-sniffing. Context travels in fields, not
//! stack traces.

use std::time::Duration;

use thiserror::Error;

use crate::agent::AgentError;
use crate::git::GitError;
use workstore::StoreError;

/// Orchestration error taxonomy
#[derive(Debug, Error)]
pub enum OrchestrateError {
    // --- NotFound ---
    #[error("Task not found: {0}")]
    TaskNotFound(String),

    #[error("Session not found: {0}")]
    SessionNotFound(String),

    #[error("Run not found: {0}")]
    RunNotFound(String),

    // --- Conflict ---
    #[error("Task already exists: {0}")]
    TaskAlreadyExists(String),

    #[error("Concurrent modification: expected version {expected}, actual {actual}")]
    ConcurrentModification { expected: u64, actual: u64 },

    #[error("Conflict resolution required for {parent_task_id}: resolution task {resolution_task_id} on {temp_branch}")]
    ConflictResolutionRequired {
        parent_task_id: String,
        resolution_task_id: String,
        temp_branch: String,
    },

    #[error("Git merge conflict on {branch}: {message}")]
    GitMergeConflict { branch: String, message: String },

    // --- Validation ---
    #[error("Validation error: {0}")]
    Validation(String),

    // --- IO / External ---
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Git command failed: {command}: {stderr}")]
    GitCommandFailed { command: String, stderr: String },

    #[error("Agent execution error: {0}")]
    AgentExecution(String),

    #[error("Rate limited (retry after {retry_after:?})")]
    RateLimited { retry_after: Option<Duration> },

    // --- Capacity ---
    #[error("Worker capacity exceeded")]
    WorkerCapacityExceeded,

    // --- Policy ---
    #[error("Max iterations exceeded for task {task_id}: {iteration}/{max_iterations}")]
    MaxIterationsExceeded {
        task_id: String,
        iteration: u32,
        max_iterations: u32,
    },
}

impl OrchestrateError {
    /// Transient failures may be retried by the caller; everything else is
    /// a hard stop for the operation that produced it.
    pub fn is_transient(&self) -> bool {
        matches!(
            self,
            OrchestrateError::RateLimited { .. } | OrchestrateError::ConcurrentModification { .. }
        )
    }
}

impl From<StoreError> for OrchestrateError {
    fn from(e: StoreError) -> Self {
        match e {
            StoreError::NotFound(id) => OrchestrateError::TaskNotFound(id),
            StoreError::AlreadyExists(id) => OrchestrateError::TaskAlreadyExists(id),
            StoreError::VersionMismatch { expected, actual } => {
                OrchestrateError::ConcurrentModification { expected, actual }
            }
            StoreError::Io(e) => OrchestrateError::Io(e),
            StoreError::Serde(e) => OrchestrateError::Validation(e.to_string()),
        }
    }
}

impl From<GitError> for OrchestrateError {
    fn from(e: GitError) -> Self {
        match e {
            GitError::MergeConflict { branch, message } => OrchestrateError::GitMergeConflict { branch, message },
            GitError::CommandFailed { command, stderr } => OrchestrateError::GitCommandFailed { command, stderr },
            GitError::WorktreeMissing(path) => {
                OrchestrateError::GitCommandFailed {
                    command: "worktree".to_string(),
                    stderr: format!("worktree missing: {}", path),
                }
            }
            GitError::Io(e) => OrchestrateError::Io(e),
        }
    }
}

impl From<AgentError> for OrchestrateError {
    fn from(e: AgentError) -> Self {
        match e {
            AgentError::RateLimited { retry_after } => OrchestrateError::RateLimited { retry_after },
            other => OrchestrateError::AgentExecution(other.to_string()),
        }
    }
}

/// Result alias used across the engine
pub type Result<T> = std::result::Result<T, OrchestrateError>;
