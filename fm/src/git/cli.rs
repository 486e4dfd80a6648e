//! GitEffects implementation over the `git` binary

use std::path::{Path, PathBuf};

use async_trait::async_trait;
use tokio::process::Command;
use tracing::{debug, warn};

use super::{ConflictContent, GitEffects, GitError, MergeOutcome};

/// Shells out to `git` for every effect. Stateless; safe to share behind an
/// `Arc<dyn GitEffects>`.
#[derive(Debug, Default, Clone)]
pub struct CliGit;

impl CliGit {
    pub fn new() -> Self {
        Self
    }

    async fn run(&self, cwd: &Path, args: &[&str]) -> Result<String, GitError> {
        debug!(?args, cwd = %cwd.display(), "CliGit::run: called");
        let output = Command::new("git").args(args).current_dir(cwd).output().await?;

        if !output.status.success() {
            let stderr = String::from_utf8_lossy(&output.stderr).to_string();
            debug!(?args, %stderr, "CliGit::run: command failed");
            return Err(GitError::CommandFailed {
                command: args.join(" "),
                stderr,
            });
        }

        Ok(String::from_utf8_lossy(&output.stdout).to_string())
    }

    /// Read one stage of a conflicted path (1 = base, 2 = ours, 3 = theirs)
    async fn show_stage(&self, workdir: &Path, stage: u8, file_path: &str) -> Option<String> {
        let spec = format!(":{}:{}", stage, file_path);
        self.run(workdir, &["show", &spec]).await.ok()
    }
}

#[async_trait]
impl GitEffects for CliGit {
    async fn create_branch(&self, repo: &Path, branch: &str, base: Option<&str>) -> Result<(), GitError> {
        match base {
            Some(base) => self.run(repo, &["branch", branch, base]).await?,
            None => self.run(repo, &["branch", branch]).await?,
        };
        Ok(())
    }

    async fn switch_branch(&self, workdir: &Path, branch: &str) -> Result<(), GitError> {
        self.run(workdir, &["checkout", branch]).await?;
        Ok(())
    }

    async fn delete_branch(&self, repo: &Path, branch: &str) -> Result<(), GitError> {
        self.run(repo, &["branch", "-D", branch]).await?;
        Ok(())
    }

    async fn list_branches(&self, repo: &Path) -> Result<Vec<String>, GitError> {
        let out = self.run(repo, &["branch", "--format", "%(refname:short)"]).await?;
        Ok(out.lines().map(|l| l.trim().to_string()).filter(|l| !l.is_empty()).collect())
    }

    async fn current_branch(&self, workdir: &Path) -> Result<String, GitError> {
        let out = self.run(workdir, &["rev-parse", "--abbrev-ref", "HEAD"]).await?;
        Ok(out.trim().to_string())
    }

    async fn branch_exists(&self, repo: &Path, branch: &str) -> Result<bool, GitError> {
        let spec = format!("refs/heads/{}", branch);
        match self.run(repo, &["show-ref", "--verify", "--quiet", &spec]).await {
            Ok(_) => Ok(true),
            Err(GitError::CommandFailed { .. }) => Ok(false),
            Err(e) => Err(e),
        }
    }

    async fn status_porcelain(&self, workdir: &Path) -> Result<String, GitError> {
        self.run(workdir, &["status", "--porcelain"]).await
    }

    async fn diff_stat(&self, repo: &Path, from: &str, to: &str) -> Result<String, GitError> {
        let range = format!("{}..{}", from, to);
        self.run(repo, &["diff", "--stat", &range]).await
    }

    async fn stage_all(&self, workdir: &Path) -> Result<(), GitError> {
        self.run(workdir, &["add", "-A"]).await?;
        Ok(())
    }

    async fn commit(&self, workdir: &Path, message: &str) -> Result<(), GitError> {
        self.run(workdir, &["commit", "-m", message, "--allow-empty"]).await?;
        Ok(())
    }

    async fn push(&self, workdir: &Path, branch: &str) -> Result<(), GitError> {
        let refspec = format!("{}:{}", branch, branch);
        self.run(workdir, &["push", "origin", &refspec]).await?;
        Ok(())
    }

    async fn pull(&self, workdir: &Path) -> Result<(), GitError> {
        self.run(workdir, &["pull", "--rebase"]).await?;
        Ok(())
    }

    async fn add_worktree(
        &self,
        repo: &Path,
        path: &Path,
        branch: &str,
        create_from: Option<&str>,
    ) -> Result<(), GitError> {
        let path_str = path.display().to_string();
        match create_from {
            Some(base) => {
                self.run(repo, &["worktree", "add", &path_str, "-b", branch, base]).await?;
            }
            None => {
                self.run(repo, &["worktree", "add", &path_str, branch]).await?;
            }
        }
        Ok(())
    }

    async fn remove_worktree(&self, repo: &Path, path: &Path) -> Result<(), GitError> {
        let path_str = path.display().to_string();
        match self.run(repo, &["worktree", "remove", &path_str, "--force"]).await {
            Ok(_) => Ok(()),
            Err(GitError::CommandFailed { stderr, .. }) if stderr.contains("is not a working tree") => {
                // Already gone
                warn!(path = %path.display(), "Worktree already removed");
                Ok(())
            }
            Err(e) => Err(e),
        }
    }

    async fn list_worktrees(&self, repo: &Path) -> Result<Vec<PathBuf>, GitError> {
        let out = self.run(repo, &["worktree", "list", "--porcelain"]).await?;
        Ok(out
            .lines()
            .filter_map(|l| l.strip_prefix("worktree "))
            .map(PathBuf::from)
            .collect())
    }

    async fn prune_worktrees(&self, repo: &Path) -> Result<(), GitError> {
        self.run(repo, &["worktree", "prune"]).await?;
        Ok(())
    }

    async fn merge(&self, workdir: &Path, branch: &str, message: &str) -> Result<MergeOutcome, GitError> {
        match self.run(workdir, &["merge", "--no-ff", branch, "-m", message]).await {
            Ok(_) => Ok(MergeOutcome::Clean),
            Err(GitError::CommandFailed { stderr, .. }) => {
                // git prints CONFLICT lines to stdout; the exit status plus
                // unmerged paths in the index is the reliable signal
                let conflicted = self.conflicted_files(workdir).await.unwrap_or_default();
                if !conflicted.is_empty() || stderr.contains("CONFLICT") {
                    return Ok(MergeOutcome::Conflict { message: stderr });
                }
                Err(GitError::CommandFailed {
                    command: format!("merge --no-ff {}", branch),
                    stderr,
                })
            }
            Err(e) => Err(e),
        }
    }

    async fn abort_merge(&self, workdir: &Path) -> Result<(), GitError> {
        self.run(workdir, &["merge", "--abort"]).await?;
        Ok(())
    }

    async fn conflicted_files(&self, workdir: &Path) -> Result<Vec<String>, GitError> {
        let out = self.run(workdir, &["diff", "--name-only", "--diff-filter=U"]).await?;
        Ok(out.lines().map(|l| l.trim().to_string()).filter(|l| !l.is_empty()).collect())
    }

    async fn conflict_content(
        &self,
        workdir: &Path,
        file_path: &str,
        their_branch: &str,
    ) -> Result<ConflictContent, GitError> {
        let ours = self.show_stage(workdir, 2, file_path).await.unwrap_or_default();
        let theirs = self.show_stage(workdir, 3, file_path).await.unwrap_or_default();
        let base = self.show_stage(workdir, 1, file_path).await;

        Ok(ConflictContent {
            file_path: file_path.to_string(),
            ours,
            theirs,
            base,
            their_branch: their_branch.to_string(),
        })
    }

    async fn mark_resolved(&self, workdir: &Path, file_path: &str) -> Result<(), GitError> {
        self.run(workdir, &["add", file_path]).await?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    async fn git(dir: &Path, args: &[&str]) {
        let status = Command::new("git").args(args).current_dir(dir).output().await.unwrap();
        assert!(status.status.success(), "git {:?} failed", args);
    }

    async fn setup_repo(dir: &Path) {
        git(dir, &["init", "-b", "main"]).await;
        git(dir, &["config", "user.email", "test@test.com"]).await;
        git(dir, &["config", "user.name", "Test"]).await;
        tokio::fs::write(dir.join("README.md"), "hello\n").await.unwrap();
        git(dir, &["add", "-A"]).await;
        git(dir, &["commit", "-m", "initial"]).await;
    }

    #[tokio::test]
    async fn test_branch_lifecycle() {
        let repo = tempdir().unwrap();
        setup_repo(repo.path()).await;
        let effects = CliGit::new();

        assert!(!effects.branch_exists(repo.path(), "feature/x").await.unwrap());
        effects.create_branch(repo.path(), "feature/x", None).await.unwrap();
        assert!(effects.branch_exists(repo.path(), "feature/x").await.unwrap());

        let branches = effects.list_branches(repo.path()).await.unwrap();
        assert!(branches.contains(&"feature/x".to_string()));

        effects.delete_branch(repo.path(), "feature/x").await.unwrap();
        assert!(!effects.branch_exists(repo.path(), "feature/x").await.unwrap());
    }

    #[tokio::test]
    async fn test_worktree_add_and_remove() {
        let repo = tempdir().unwrap();
        setup_repo(repo.path()).await;
        let effects = CliGit::new();

        let wt_path = repo.path().join(".git").join("wt").join("t1");
        effects
            .add_worktree(repo.path(), &wt_path, "feature/t1", Some("main"))
            .await
            .unwrap();
        assert!(wt_path.exists());
        assert_eq!(effects.current_branch(&wt_path).await.unwrap(), "feature/t1");

        let worktrees = effects.list_worktrees(repo.path()).await.unwrap();
        assert_eq!(worktrees.len(), 2); // main tree + the new one

        effects.remove_worktree(repo.path(), &wt_path).await.unwrap();
        assert!(!wt_path.exists());

        // Removing again is not an error
        effects.remove_worktree(repo.path(), &wt_path).await.unwrap();
    }

    #[tokio::test]
    async fn test_commit_in_worktree() {
        let repo = tempdir().unwrap();
        setup_repo(repo.path()).await;
        let effects = CliGit::new();

        let wt_path = repo.path().join(".git").join("wt").join("t1");
        effects
            .add_worktree(repo.path(), &wt_path, "feature/t1", Some("main"))
            .await
            .unwrap();

        tokio::fs::write(wt_path.join("new.txt"), "content\n").await.unwrap();
        assert!(!effects.status_porcelain(&wt_path).await.unwrap().is_empty());

        effects.stage_all(&wt_path).await.unwrap();
        effects.commit(&wt_path, "add new.txt").await.unwrap();
        assert!(effects.status_porcelain(&wt_path).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_merge_clean() {
        let repo = tempdir().unwrap();
        setup_repo(repo.path()).await;
        let effects = CliGit::new();

        let wt_a = repo.path().join(".git").join("wt").join("a");
        effects.add_worktree(repo.path(), &wt_a, "feature/a", Some("main")).await.unwrap();
        tokio::fs::write(wt_a.join("a.txt"), "a\n").await.unwrap();
        effects.stage_all(&wt_a).await.unwrap();
        effects.commit(&wt_a, "a").await.unwrap();

        let wt_b = repo.path().join(".git").join("wt").join("b");
        effects.add_worktree(repo.path(), &wt_b, "feature/b", Some("main")).await.unwrap();
        tokio::fs::write(wt_b.join("b.txt"), "b\n").await.unwrap();
        effects.stage_all(&wt_b).await.unwrap();
        effects.commit(&wt_b, "b").await.unwrap();

        let outcome = effects.merge(&wt_a, "feature/b", "merge b into a").await.unwrap();
        assert!(matches!(outcome, MergeOutcome::Clean));
        assert!(wt_a.join("b.txt").exists());
    }

    #[tokio::test]
    async fn test_merge_conflict_readout_and_abort() {
        let repo = tempdir().unwrap();
        setup_repo(repo.path()).await;
        let effects = CliGit::new();

        // Two branches rewrite the same line of README.md
        let wt_a = repo.path().join(".git").join("wt").join("a");
        effects.add_worktree(repo.path(), &wt_a, "feature/a", Some("main")).await.unwrap();
        tokio::fs::write(wt_a.join("README.md"), "version a\n").await.unwrap();
        effects.stage_all(&wt_a).await.unwrap();
        effects.commit(&wt_a, "a").await.unwrap();

        let wt_b = repo.path().join(".git").join("wt").join("b");
        effects.add_worktree(repo.path(), &wt_b, "feature/b", Some("main")).await.unwrap();
        tokio::fs::write(wt_b.join("README.md"), "version b\n").await.unwrap();
        effects.stage_all(&wt_b).await.unwrap();
        effects.commit(&wt_b, "b").await.unwrap();

        let outcome = effects.merge(&wt_a, "feature/b", "merge b into a").await.unwrap();
        assert!(outcome.is_conflict());

        let conflicted = effects.conflicted_files(&wt_a).await.unwrap();
        assert_eq!(conflicted, vec!["README.md".to_string()]);

        let content = effects.conflict_content(&wt_a, "README.md", "feature/b").await.unwrap();
        assert_eq!(content.ours, "version a\n");
        assert_eq!(content.theirs, "version b\n");
        assert_eq!(content.base.as_deref(), Some("hello\n"));
        assert_eq!(content.their_branch, "feature/b");

        effects.abort_merge(&wt_a).await.unwrap();
        assert!(effects.conflicted_files(&wt_a).await.unwrap().is_empty());
    }
}
