//! Integration tests for foreman
//!
//! These exercise the schedulers and the orchestrator end to end against
//! real scratch git repositories, with scripted agents standing in for the
//! LLMs.

use std::collections::HashMap;
use std::path::Path;
use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;

use async_trait::async_trait;
use tempfile::tempdir;
use tokio::process::Command;
use tokio::sync::watch;

use foreman::agent::{AgentError, AgentOutcome, AgentRequest, AgentRunner};
use foreman::config::Config;
use foreman::domain::{BlockReason, Store, Task, TaskState, TaskType};
use foreman::git::{CliGit, GitEffects};
use foreman::graph::DependencyGraph;
use foreman::judge::{JudgeConfig, JudgeOps};
use foreman::orchestrator::Orchestrator;
use foreman::runlog::RunLog;
use foreman::scheduler::{DynamicScheduler, SchedulerOps, SerialChainExecutor};
use foreman::worker::{WorkerConfig, WorkerOps};

// =============================================================================
// Test helpers
// =============================================================================

async fn git(dir: &Path, args: &[&str]) {
    let out = Command::new("git").args(args).current_dir(dir).output().await.unwrap();
    assert!(
        out.status.success(),
        "git {:?} failed: {}",
        args,
        String::from_utf8_lossy(&out.stderr)
    );
}

async fn setup_repo(dir: &Path) {
    git(dir, &["init", "-b", "main"]).await;
    git(dir, &["config", "user.email", "test@test.com"]).await;
    git(dir, &["config", "user.name", "Test"]).await;
    tokio::fs::write(dir.join("README.md"), "hello\n").await.unwrap();
    git(dir, &["add", "-A"]).await;
    git(dir, &["commit", "-m", "initial"]).await;
}

/// Pull the task id out of an executor prompt ("# Task <id>")
fn task_id_of(prompt: &str) -> Option<String> {
    prompt
        .lines()
        .find_map(|l| l.strip_prefix("# Task "))
        .map(|s| s.trim().to_string())
}

/// Executor stand-in: writes a scripted file per task and tracks peak
/// concurrency.
struct ScriptedExecutor {
    /// task id -> (file name, content); tasks with an id containing "-merge-"
    /// fall back to the "resolution" entry when present
    files: HashMap<String, (String, String)>,
    resolution: Option<(String, String)>,
    delay: Duration,
    current: AtomicUsize,
    peak: AtomicUsize,
}

impl ScriptedExecutor {
    fn new(files: &[(&str, &str, &str)]) -> Self {
        Self {
            files: files
                .iter()
                .map(|(id, name, content)| (id.to_string(), (name.to_string(), content.to_string())))
                .collect(),
            resolution: None,
            delay: Duration::from_millis(0),
            current: AtomicUsize::new(0),
            peak: AtomicUsize::new(0),
        }
    }

    fn with_resolution(mut self, name: &str, content: &str) -> Self {
        self.resolution = Some((name.to_string(), content.to_string()));
        self
    }

    fn with_delay(mut self, delay: Duration) -> Self {
        self.delay = delay;
        self
    }
}

#[async_trait]
impl AgentRunner for ScriptedExecutor {
    async fn run(&self, request: AgentRequest) -> Result<AgentOutcome, AgentError> {
        let running = self.current.fetch_add(1, Ordering::SeqCst) + 1;
        self.peak.fetch_max(running, Ordering::SeqCst);
        tokio::time::sleep(self.delay).await;

        let id = task_id_of(&request.prompt).unwrap_or_default();
        let entry = if id.contains("-merge-") {
            self.resolution.as_ref()
        } else {
            // "*" is the any-task fallback
            self.files.get(&id).or_else(|| self.files.get("*"))
        };
        if let Some((name, content)) = entry {
            tokio::fs::write(request.workdir.join(name), content).await.unwrap();
        }

        self.current.fetch_sub(1, Ordering::SeqCst);
        Ok(AgentOutcome {
            final_response: format!("finished {}", id),
            session_id: None,
            items: Vec::new(),
        })
    }
}

/// Judge stand-in: accepts everything except acceptance texts listed as
/// failing or continuing.
struct ScriptedJudge {
    fail_on: Vec<String>,
    continue_on: Vec<String>,
}

impl ScriptedJudge {
    fn accept_all() -> Self {
        Self {
            fail_on: Vec::new(),
            continue_on: Vec::new(),
        }
    }

    fn failing_on(acceptance: &str) -> Self {
        Self {
            fail_on: vec![acceptance.to_string()],
            continue_on: Vec::new(),
        }
    }

    fn continuing_on(acceptance: &str) -> Self {
        Self {
            fail_on: Vec::new(),
            continue_on: vec![acceptance.to_string()],
        }
    }
}

#[async_trait]
impl AgentRunner for ScriptedJudge {
    async fn run(&self, request: AgentRequest) -> Result<AgentOutcome, AgentError> {
        let (success, should_continue) = if self.fail_on.iter().any(|a| request.prompt.contains(a.as_str())) {
            (false, false)
        } else if self.continue_on.iter().any(|a| request.prompt.contains(a.as_str())) {
            (false, true)
        } else {
            (true, false)
        };

        let verdict = format!(
            r#"{{"success": {success}, "shouldContinue": {should_continue}, "shouldReplan": false,
                "alreadySatisfied": false, "reason": "scripted", "missingRequirements": []}}"#
        );
        Ok(AgentOutcome {
            final_response: verdict,
            session_id: None,
            items: Vec::new(),
        })
    }
}

struct Harness {
    _state_dir: tempfile::TempDir,
    repo_dir: tempfile::TempDir,
    store: Store,
    runlog: RunLog,
    ops: SchedulerOps,
    git: Arc<CliGit>,
}

impl Harness {
    async fn new() -> Self {
        let state_dir = tempdir().unwrap();
        let repo_dir = tempdir().unwrap();
        setup_repo(repo_dir.path()).await;

        let store = Store::open(state_dir.path().join("store")).unwrap();
        let runlog = RunLog::new(state_dir.path().join("runs"));

        Self {
            store: store.clone(),
            runlog,
            ops: SchedulerOps::new(store),
            git: Arc::new(CliGit::new()),
            _state_dir: state_dir,
            repo_dir,
        }
    }

    fn task(&self, id: &str, acceptance: &str, deps: &[&str]) -> Task {
        Task::new(id, self.repo_dir.path().display().to_string(), format!("feature/{}-{}", id, id))
            .with_acceptance(acceptance)
            .with_context("scripted")
            .with_dependencies(deps.iter().map(|s| s.to_string()).collect())
    }

    fn worker(&self, executor: Arc<dyn AgentRunner>) -> WorkerOps {
        let (_tx, cancel) = watch::channel(false);
        WorkerOps::new(
            self.store.clone(),
            self.git.clone(),
            executor,
            self.runlog.clone(),
            WorkerConfig::default(),
            cancel,
        )
    }

    fn judge(&self, judge_agent: Arc<dyn AgentRunner>, max_iterations: u32) -> JudgeOps {
        JudgeOps::new(
            self.store.clone(),
            self.runlog.clone(),
            judge_agent,
            JudgeConfig {
                max_iterations,
                ..Default::default()
            },
        )
    }

    fn scheduler(
        &self,
        executor: Arc<dyn AgentRunner>,
        judge_agent: Arc<dyn AgentRunner>,
        max_workers: usize,
    ) -> DynamicScheduler {
        let (_tx, cancel) = watch::channel(false);
        DynamicScheduler::new(
            self.ops.clone(),
            self.worker(executor),
            self.judge(judge_agent, 3),
            max_workers,
            None,
            cancel,
        )
    }

    async fn read(&self, id: &str) -> Task {
        self.store.read(id).await.unwrap()
    }
}

// =============================================================================
// Dynamic scheduler
// =============================================================================

#[tokio::test]
async fn test_parallel_fanout_respects_capacity() {
    let h = Harness::new().await;

    let tasks = vec![
        h.task("task-aaaaaaaa-1", "a done", &[]),
        h.task("task-aaaaaaaa-2", "b done", &[]),
        h.task("task-aaaaaaaa-3", "c done", &[]),
    ];
    for t in &tasks {
        h.store.create(t).await.unwrap();
    }

    let executor = Arc::new(
        ScriptedExecutor::new(&[
            ("task-aaaaaaaa-1", "a.txt", "a"),
            ("task-aaaaaaaa-2", "b.txt", "b"),
            ("task-aaaaaaaa-3", "c.txt", "c"),
        ])
        .with_delay(Duration::from_millis(150)),
    );
    let judge = Arc::new(ScriptedJudge::accept_all());

    let graph = DependencyGraph::build(&tasks, None);
    let scheduler = h.scheduler(executor.clone(), judge, 2);
    let report = scheduler.run(tasks.clone(), &graph).await.unwrap();

    assert_eq!(report.completed.len(), 3);
    assert!(report.failed.is_empty());
    assert!(report.blocked.is_empty());

    // The running set never exceeded two workers
    assert!(executor.peak.load(Ordering::SeqCst) <= 2, "peak was {}", executor.peak.load(Ordering::SeqCst));

    // Three distinct branches were pushed, each carrying its task id
    for t in &tasks {
        assert!(h.git.branch_exists(h.repo_dir.path(), &t.branch).await.unwrap());
        assert!(t.branch.ends_with(&t.task_id));
        assert_eq!(h.read(&t.task_id).await.state, TaskState::Done);
    }

    // No worktrees left behind
    assert_eq!(h.git.list_worktrees(h.repo_dir.path()).await.unwrap().len(), 1);
}

#[tokio::test]
async fn test_dependency_failure_blocks_dependents() {
    let h = Harness::new().await;

    let tasks = vec![
        h.task("task-aaaaaaaa-1", "root criterion", &[]),
        h.task("task-aaaaaaaa-2", "b done", &["task-aaaaaaaa-1"]),
        h.task("task-aaaaaaaa-3", "c done", &["task-aaaaaaaa-1"]),
    ];
    for t in &tasks {
        h.store.create(t).await.unwrap();
    }

    let executor = Arc::new(ScriptedExecutor::new(&[("task-aaaaaaaa-1", "a.txt", "a")]));
    let judge = Arc::new(ScriptedJudge::failing_on("root criterion"));

    let graph = DependencyGraph::build(&tasks, None);
    let report = h.scheduler(executor, judge, 2).run(tasks.clone(), &graph).await.unwrap();

    assert_eq!(report.failed, vec!["task-aaaaaaaa-1".to_string()]);
    assert_eq!(report.blocked.len(), 2);
    assert!(report.completed.is_empty());

    let root = h.read("task-aaaaaaaa-1").await;
    assert_eq!(root.state, TaskState::Blocked);
    assert_eq!(root.block_reason, Some(BlockReason::JudgeFailed));

    for id in ["task-aaaaaaaa-2", "task-aaaaaaaa-3"] {
        let task = h.read(id).await;
        assert_eq!(task.state, TaskState::Blocked);
        assert_eq!(task.block_reason, Some(BlockReason::DependencyFailed));
        // Never claimed, so no branch (and no worktree) was ever created
        assert!(!h.git.branch_exists(h.repo_dir.path(), &task.branch).await.unwrap());
    }
}

#[tokio::test]
async fn test_conflict_spawns_resolution_task_and_converges() {
    let h = Harness::new().await;

    // a and b rewrite the same README line; c needs both
    let tasks = vec![
        h.task("task-aaaaaaaa-1", "a done", &[]),
        h.task("task-aaaaaaaa-2", "b done", &[]),
        h.task("task-aaaaaaaa-3", "c done", &["task-aaaaaaaa-1", "task-aaaaaaaa-2"]),
    ];
    for t in &tasks {
        h.store.create(t).await.unwrap();
    }

    let executor = Arc::new(
        ScriptedExecutor::new(&[
            ("task-aaaaaaaa-1", "README.md", "version a\n"),
            ("task-aaaaaaaa-2", "README.md", "version b\n"),
            ("task-aaaaaaaa-3", "c.txt", "c was here\n"),
        ])
        .with_resolution("README.md", "versions reconciled\n"),
    );
    let judge = Arc::new(ScriptedJudge::accept_all());

    let graph = DependencyGraph::build(&tasks, None);
    let report = h.scheduler(executor, judge, 2).run(tasks.clone(), &graph).await.unwrap();

    // A resolution task was spawned, executed, and completed alongside the
    // original three
    let all: Vec<Task> = h.store.list().await.unwrap();
    assert_eq!(all.len(), 4);
    let resolution = all.iter().find(|t| t.task_id.contains("-merge-")).expect("resolution task");
    assert_eq!(resolution.task_type, TaskType::Integration);
    assert_eq!(resolution.scope_paths, vec!["README.md".to_string()]);
    assert_eq!(resolution.acceptance, "all listed files resolved and the project builds");
    assert_eq!(resolution.state, TaskState::Done);

    assert_eq!(report.completed.len(), 4);
    assert!(report.failed.is_empty());
    assert_eq!(h.read("task-aaaaaaaa-3").await.state, TaskState::Done);

    // The parent's branch carries the reconciled README and its own change
    let show = Command::new("git")
        .args(["show", &format!("{}:README.md", tasks[2].branch)])
        .current_dir(h.repo_dir.path())
        .output()
        .await
        .unwrap();
    assert_eq!(String::from_utf8_lossy(&show.stdout), "versions reconciled\n");
}

#[tokio::test]
async fn test_deadlock_blocks_remaining_unschedulable() {
    let h = Harness::new().await;

    let dep = h.task("task-aaaaaaaa-1", "never runs", &[]);
    let dependent = h.task("task-aaaaaaaa-2", "waits forever", &["task-aaaaaaaa-1"]);
    h.store.create(&dep).await.unwrap();
    h.store.create(&dependent).await.unwrap();

    let executor: Arc<dyn AgentRunner> = Arc::new(ScriptedExecutor::new(&[]));
    let judge: Arc<dyn AgentRunner> = Arc::new(ScriptedJudge::accept_all());

    // Graph knows both tasks, but only the dependent is scheduled, so its
    // dependency can never be satisfied
    let graph = DependencyGraph::build(&[dep, dependent.clone()], None);
    let report = h.scheduler(executor, judge, 2).run(vec![dependent], &graph).await.unwrap();

    assert_eq!(report.blocked, vec!["task-aaaaaaaa-2".to_string()]);
    let task = h.read("task-aaaaaaaa-2").await;
    assert_eq!(task.state, TaskState::Blocked);
    assert_eq!(task.block_reason, Some(BlockReason::Unschedulable));
}

#[tokio::test]
async fn test_cycle_members_blocked_before_execution() {
    let h = Harness::new().await;

    let tasks = vec![
        h.task("task-aaaaaaaa-1", "x", &["task-aaaaaaaa-2"]),
        h.task("task-aaaaaaaa-2", "y", &["task-aaaaaaaa-1"]),
        h.task("task-aaaaaaaa-3", "free", &[]),
    ];
    for t in &tasks {
        h.store.create(t).await.unwrap();
    }

    let executor = Arc::new(ScriptedExecutor::new(&[("task-aaaaaaaa-3", "free.txt", "free")]));
    let judge = Arc::new(ScriptedJudge::accept_all());

    let graph = DependencyGraph::build(&tasks, None);
    let report = h.scheduler(executor, judge, 2).run(tasks.clone(), &graph).await.unwrap();

    assert_eq!(report.completed, vec!["task-aaaaaaaa-3".to_string()]);
    for id in ["task-aaaaaaaa-1", "task-aaaaaaaa-2"] {
        let task = h.read(id).await;
        assert_eq!(task.state, TaskState::Blocked);
        assert_eq!(task.block_reason, Some(BlockReason::CyclicDependency));
        assert!(!h.git.branch_exists(h.repo_dir.path(), &task.branch).await.unwrap());
    }
}

#[tokio::test]
async fn test_continuation_budget_exhaustion_blocks_max_retries() {
    let h = Harness::new().await;

    let task = h.task("task-aaaaaaaa-1", "never good enough", &[]);
    h.store.create(&task).await.unwrap();

    let executor = Arc::new(ScriptedExecutor::new(&[("task-aaaaaaaa-1", "try.txt", "attempt")]));
    let judge_agent = Arc::new(ScriptedJudge::continuing_on("never good enough"));

    let graph = DependencyGraph::build(std::slice::from_ref(&task), None);
    let (_tx, cancel) = watch::channel(false);
    let scheduler = DynamicScheduler::new(
        h.ops.clone(),
        h.worker(executor),
        h.judge(judge_agent, 2), // maxIterations = 2
        1,
        None,
        cancel,
    );
    let report = scheduler.run(vec![task], &graph).await.unwrap();

    assert_eq!(report.failed, vec!["task-aaaaaaaa-1".to_string()]);

    let task = h.read("task-aaaaaaaa-1").await;
    assert_eq!(task.state, TaskState::Blocked);
    assert_eq!(task.block_reason, Some(BlockReason::MaxRetries));
    let feedback = task.judgement_feedback.expect("feedback recorded");
    assert_eq!(feedback.iteration, 2);
    assert!(!task.integration_retried);
}

// =============================================================================
// Serial chains
// =============================================================================

#[tokio::test]
async fn test_serial_chain_accumulates_in_one_worktree() {
    let h = Harness::new().await;

    let t1 = h.task("task-aaaaaaaa-1", "first step done", &[]);
    let t2 = h.task("task-aaaaaaaa-2", "second step done", &["task-aaaaaaaa-1"]);
    h.store.create(&t1).await.unwrap();
    h.store.create(&t2).await.unwrap();

    let executor = Arc::new(ScriptedExecutor::new(&[
        ("task-aaaaaaaa-1", "one.txt", "one\n"),
        ("task-aaaaaaaa-2", "two.txt", "two\n"),
    ]));
    let judge = Arc::new(ScriptedJudge::accept_all());

    let executor_ops = SerialChainExecutor::new(
        h.ops.clone(),
        h.worker(executor),
        h.judge(judge, 3),
        h.git.clone(),
        3,
    );

    let report = executor_ops.run_chain(&[t1.clone(), t2.clone()]).await.unwrap();
    assert_eq!(report.completed.len(), 2);
    assert!(report.blocked.is_empty());

    assert_eq!(h.read(&t1.task_id).await.state, TaskState::Done);
    assert_eq!(h.read(&t2.task_id).await.state, TaskState::Done);

    // The second branch carries the first step's file: the chain shared one
    // worktree and changes accumulated
    let show = Command::new("git")
        .args(["show", &format!("{}:one.txt", t2.branch)])
        .current_dir(h.repo_dir.path())
        .output()
        .await
        .unwrap();
    assert!(show.status.success());

    // Shared worktree cleaned up
    assert_eq!(h.git.list_worktrees(h.repo_dir.path()).await.unwrap().len(), 1);
}

#[tokio::test]
async fn test_serial_chain_failure_blocks_remaining() {
    let h = Harness::new().await;

    let t1 = h.task("task-aaaaaaaa-1", "bad step", &[]);
    let t2 = h.task("task-aaaaaaaa-2", "never reached", &["task-aaaaaaaa-1"]);
    h.store.create(&t1).await.unwrap();
    h.store.create(&t2).await.unwrap();

    let executor = Arc::new(ScriptedExecutor::new(&[("task-aaaaaaaa-1", "bad.txt", "bad")]));
    let judge = Arc::new(ScriptedJudge::failing_on("bad step"));

    let chain_executor = SerialChainExecutor::new(
        h.ops.clone(),
        h.worker(executor),
        h.judge(judge, 3),
        h.git.clone(),
        3,
    );

    let report = chain_executor.run_chain(&[t1.clone(), t2.clone()]).await.unwrap();
    assert!(report.completed.is_empty());
    assert_eq!(report.blocked.len(), 2);

    assert_eq!(h.read(&t1.task_id).await.block_reason, Some(BlockReason::JudgeFailed));
    assert_eq!(h.read(&t2.task_id).await.block_reason, Some(BlockReason::DependencyFailed));
}

// =============================================================================
// Orchestrator end to end
// =============================================================================

/// Routes prompts to the right scripted persona by their distinctive
/// headers; the orchestrator drives every agent through one runner.
struct RouterAgent {
    executor: ScriptedExecutor,
}

#[async_trait]
impl AgentRunner for RouterAgent {
    async fn run(&self, request: AgentRequest) -> Result<AgentOutcome, AgentError> {
        let text = |s: &str| {
            Ok(AgentOutcome {
                final_response: s.to_string(),
                session_id: None,
                items: Vec::new(),
            })
        };

        if request.prompt.contains("Score this task breakdown") {
            return text(r#"{"isAcceptable": true, "score": 95, "issues": [], "suggestions": []}"#);
        }
        if request.prompt.contains("Decide whether the original instruction") {
            return text(r#"{"isComplete": true, "missingAspects": [], "additionalTaskSuggestions": [], "completionScore": 100}"#);
        }
        if request.prompt.contains("You are reviewing the work") {
            return text(
                r#"{"success": true, "shouldContinue": false, "shouldReplan": false, "alreadySatisfied": false, "reason": "ok", "missingRequirements": []}"#,
            );
        }
        if request.prompt.contains("You are a software architect") {
            return text(
                r#"```json
[
  {"id": "task-1", "description": "write the endpoint", "branch": "feature/endpoint",
   "scopePaths": ["src/"], "acceptance": "endpoint exists", "type": "implementation",
   "estimatedDuration": 1.0, "context": "create endpoint file", "dependencies": [], "summary": "endpoint"},
  {"id": "task-2", "description": "document it", "branch": "feature/docs",
   "scopePaths": ["docs/"], "acceptance": "docs exist", "type": "documentation",
   "estimatedDuration": 0.5, "context": "write docs", "dependencies": ["task-1"], "summary": "docs"}
]
```"#,
            );
        }
        // Executor
        self.executor.run(request).await
    }
}

#[tokio::test]
async fn test_orchestrator_happy_path_two_task_chain() {
    let state_dir = tempdir().unwrap();
    let repo_dir = tempdir().unwrap();
    setup_repo(repo_dir.path()).await;

    let store = Store::open(state_dir.path().join("store")).unwrap();
    let runlog = RunLog::new(state_dir.path().join("runs"));
    runlog.ensure_runs_dir().await.unwrap();

    let mut config = Config::default();
    config.git.repo_root = repo_dir.path().to_path_buf();
    config.workers.max_workers = 2;

    // The planner emits ids task-1/task-2; the materialized ids are
    // task-<short8>-<n>, so the executor matches on any id
    let mut files = HashMap::new();
    files.insert("*".to_string(), ("work.txt".to_string(), "work\n".to_string()));
    let executor = ScriptedExecutor {
        files,
        resolution: None,
        delay: Duration::from_millis(0),
        current: AtomicUsize::new(0),
        peak: AtomicUsize::new(0),
    };

    let agent = Arc::new(RouterAgent { executor });
    let (_cancel_tx, cancel_rx) = watch::channel(false);

    let orchestrator = Orchestrator::new(
        config,
        store.clone(),
        Arc::new(CliGit::new()),
        agent,
        runlog,
        cancel_rx,
    );

    let outcome = orchestrator.run("add an endpoint and document it").await.unwrap();
    assert!(outcome.complete);
    assert_eq!(outcome.rounds, 1);

    // Both planned tasks are Done and their branches exist with the id
    // suffix intact
    let tasks: Vec<Task> = store.list().await.unwrap();
    let done: Vec<&Task> = tasks.iter().filter(|t| t.state == TaskState::Done).collect();
    assert_eq!(done.len(), 2);

    let effects = CliGit::new();
    for task in &done {
        assert!(task.branch.ends_with(&task.task_id));
        assert!(effects.branch_exists(repo_dir.path(), &task.branch).await.unwrap());
    }

    // The integration branch exists and accumulated the work
    assert!(
        effects
            .branch_exists(repo_dir.path(), &outcome.integration_branch)
            .await
            .unwrap()
    );
}
