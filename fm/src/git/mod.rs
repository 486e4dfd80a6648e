//! Git effects: the interface the engine drives git through
//!
//! All repository mutation happens via this trait so the engine can be
//! exercised against scratch repositories in tests. The default
//! implementation shells out to the `git` binary.

mod cli;

use std::path::{Path, PathBuf};

use async_trait::async_trait;

pub use cli::CliGit;

/// Errors from git operations
#[derive(Debug, thiserror::Error)]
pub enum GitError {
    #[error("git {command} failed: {stderr}")]
    CommandFailed { command: String, stderr: String },

    #[error("Merge conflict merging {branch}: {message}")]
    MergeConflict { branch: String, message: String },

    #[error("Worktree missing: {0}")]
    WorktreeMissing(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

/// Outcome of a merge attempt. A conflicted merge leaves the index in the
/// conflicted state so the caller can read the three sides before aborting.
#[derive(Debug, Clone)]
pub enum MergeOutcome {
    Clean,
    Conflict { message: String },
}

impl MergeOutcome {
    pub fn is_conflict(&self) -> bool {
        matches!(self, Self::Conflict { .. })
    }
}

/// The three sides of one conflicted path
#[derive(Debug, Clone)]
pub struct ConflictContent {
    pub file_path: String,
    pub ours: String,
    pub theirs: String,
    pub base: Option<String>,
    pub their_branch: String,
}

/// Everything the engine needs from git. One instance serves all
/// repositories; each call names its working directory.
#[async_trait]
pub trait GitEffects: Send + Sync {
    // Branches
    async fn create_branch(&self, repo: &Path, branch: &str, base: Option<&str>) -> Result<(), GitError>;
    async fn switch_branch(&self, workdir: &Path, branch: &str) -> Result<(), GitError>;
    async fn delete_branch(&self, repo: &Path, branch: &str) -> Result<(), GitError>;
    async fn list_branches(&self, repo: &Path) -> Result<Vec<String>, GitError>;
    async fn current_branch(&self, workdir: &Path) -> Result<String, GitError>;
    async fn branch_exists(&self, repo: &Path, branch: &str) -> Result<bool, GitError>;

    // Working tree
    async fn status_porcelain(&self, workdir: &Path) -> Result<String, GitError>;
    async fn diff_stat(&self, repo: &Path, from: &str, to: &str) -> Result<String, GitError>;
    async fn stage_all(&self, workdir: &Path) -> Result<(), GitError>;
    async fn commit(&self, workdir: &Path, message: &str) -> Result<(), GitError>;
    async fn push(&self, workdir: &Path, branch: &str) -> Result<(), GitError>;
    async fn pull(&self, workdir: &Path) -> Result<(), GitError>;

    // Worktrees
    async fn add_worktree(
        &self,
        repo: &Path,
        path: &Path,
        branch: &str,
        create_from: Option<&str>,
    ) -> Result<(), GitError>;
    async fn remove_worktree(&self, repo: &Path, path: &Path) -> Result<(), GitError>;
    async fn list_worktrees(&self, repo: &Path) -> Result<Vec<PathBuf>, GitError>;
    async fn prune_worktrees(&self, repo: &Path) -> Result<(), GitError>;

    // Merging
    async fn merge(&self, workdir: &Path, branch: &str, message: &str) -> Result<MergeOutcome, GitError>;
    async fn abort_merge(&self, workdir: &Path) -> Result<(), GitError>;
    async fn conflicted_files(&self, workdir: &Path) -> Result<Vec<String>, GitError>;
    async fn conflict_content(
        &self,
        workdir: &Path,
        file_path: &str,
        their_branch: &str,
    ) -> Result<ConflictContent, GitError>;
    async fn mark_resolved(&self, workdir: &Path, file_path: &str) -> Result<(), GitError>;
}
