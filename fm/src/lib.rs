//! Foreman - multi-agent development orchestrator
//!
//! Foreman takes a natural-language instruction, decomposes it into coding
//! tasks via a Planner LLM, executes each task with a coding agent inside an
//! isolated git worktree, judges the results, and loops through re-planning
//! until the instruction is satisfied or the iteration budget runs out.
//!
//! # Core concepts
//!
//! - **CAS task store**: every task mutation is a compare-and-swap on a
//!   versioned file record; lost races surface instead of clobbering.
//! - **Disjoint worktrees**: agents never touch the main working tree; each
//!   task gets its own branch and worktree, merged dependencies included.
//! - **Message passing**: workers report to a single scheduler loop over a
//!   channel; nothing mutates shared scheduler state concurrently.
//!
//! # Modules
//!
//! - [`planner`] - instruction decomposition, quality judging, re-planning
//! - [`graph`] - dependency DAG, cycles, levels, serial chains
//! - [`scheduler`] - CAS transitions, parallel DAG execution, serial chains
//! - [`worker`] - worktree lifecycle and agent execution
//! - [`judge`] - per-run acceptance judging
//! - [`git`] - the GitEffects interface and CLI-git implementation
//! - [`agent`] - the AgentRunner interface and Anthropic implementation

pub mod agent;
pub mod cli;
pub mod config;
pub mod domain;
pub mod error;
pub mod git;
pub mod graph;
pub mod judge;
pub mod orchestrator;
pub mod planner;
pub mod prompts;
pub mod resolver;
pub mod runlog;
pub mod scheduler;
pub mod worker;

// Re-export commonly used types
pub use agent::{AgentError, AgentOutcome, AgentRequest, AgentRunner, AnthropicRunner, RetryPolicy};
pub use config::Config;
pub use domain::{
    BlockReason, Judgement, JudgementFeedback, PlannerSession, Record, RunRecord, RunStatus, Store, Task, TaskState,
    TaskType,
};
pub use error::{OrchestrateError, Result};
pub use git::{CliGit, ConflictContent, GitEffects, GitError, MergeOutcome};
pub use graph::DependencyGraph;
pub use judge::{JudgeConfig, JudgeDecision, JudgeOps};
pub use orchestrator::{OrchestrationOutcome, Orchestrator, Phase};
pub use planner::{CompletionReport, ContinuationPlan, PlannerConfig, PlannerOps, TaskBreakdown};
pub use resolver::{BaseBranchResolution, resolve_base_branch};
pub use runlog::{RunLog, RunLogError, truncate_middle};
pub use scheduler::{
    ChainReport, DynamicScheduler, SchedulerOps, SchedulerReport, SchedulerState, SerialChainExecutor,
};
pub use worker::{ExecutionOutcome, WorkerConfig, WorkerOps};
