//! Base-branch resolution
//!
//! Decides where a task's worktree branches from: HEAD when it has no
//! dependencies, the dependency's branch when it has one, and a deferred
//! in-worktree merge when it has several. The main repository HEAD is never
//! moved here.

use tracing::debug;

use crate::domain::{Store, Task};
use crate::error::{OrchestrateError, Result};

/// Where a task's branch starts from
#[derive(Debug, Clone, PartialEq)]
pub enum BaseBranchResolution {
    /// No dependencies; branch from HEAD
    None,

    /// Exactly one dependency; branch from its branch
    Single { base_branch: String },

    /// Two or more dependencies; WorkerOps merges them inside the worktree
    Multi { dependency_branches: Vec<String> },
}

/// Classify a task's dependencies and collect their branch names in
/// dependency order.
pub async fn resolve_base_branch(task: &Task, store: &Store) -> Result<BaseBranchResolution> {
    debug!(task_id = %task.task_id, deps = task.dependencies.len(), "resolve_base_branch: called");

    match task.dependencies.len() {
        0 => Ok(BaseBranchResolution::None),
        1 => {
            let dep: Task = store
                .read(&task.dependencies[0])
                .await
                .map_err(|_| OrchestrateError::TaskNotFound(task.dependencies[0].clone()))?;
            Ok(BaseBranchResolution::Single { base_branch: dep.branch })
        }
        _ => {
            let mut branches = Vec::with_capacity(task.dependencies.len());
            for dep_id in &task.dependencies {
                let dep: Task = store
                    .read(dep_id)
                    .await
                    .map_err(|_| OrchestrateError::TaskNotFound(dep_id.clone()))?;
                branches.push(dep.branch);
            }
            Ok(BaseBranchResolution::Multi {
                dependency_branches: branches,
            })
        }
    }
}
