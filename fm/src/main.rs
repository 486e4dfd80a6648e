//! Foreman - multi-agent development orchestrator
//!
//! CLI entry point: plan an instruction, execute the task DAG over isolated
//! worktrees, judge the result.

use std::sync::Arc;

use clap::Parser;
use eyre::{Context, Result};
use tokio::sync::watch;
use tracing::info;

use foreman::agent::create_runner;
use foreman::cli::{Cli, Command};
use foreman::config::Config;
use foreman::domain::{Store, Task};
use foreman::git::CliGit;
use foreman::orchestrator::Orchestrator;
use foreman::planner::PlannerOps;
use foreman::runlog::RunLog;

fn setup_logging(verbose: bool) {
    let default_level = if verbose { tracing::Level::DEBUG } else { tracing::Level::INFO };
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::from_default_env().add_directive(default_level.into()),
        )
        .init();
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    setup_logging(cli.verbose);

    let mut config = Config::load(cli.config.as_ref()).context("Failed to load configuration")?;

    match cli.command {
        Command::Run {
            instruction,
            repo,
            max_workers,
            model,
            dry_run,
        } => {
            if let Some(repo) = repo {
                config.git.repo_root = repo;
            }
            if let Some(max_workers) = max_workers {
                config.workers.max_workers = max_workers;
            }
            if let Some(model) = model {
                config.llm.model = model;
            }
            config.validate().context("Invalid configuration")?;

            let exit = run_orchestration(&config, &instruction, dry_run).await?;
            std::process::exit(exit);
        }
        Command::Tasks => {
            let store = Store::open(&config.storage.state_dir)?;
            let mut tasks: Vec<Task> = store.list().await?;
            tasks.sort_by(|a, b| a.task_id.cmp(&b.task_id));
            for task in tasks {
                println!(
                    "{}\t{}\t{}\t{}",
                    task.task_id,
                    task.state,
                    task.branch,
                    task.summary.unwrap_or_default()
                );
            }
        }
        Command::Runs => {
            let runlog = RunLog::new(&config.storage.runs_dir);
            for run in runlog.list_runs().await? {
                println!(
                    "{}\t{}\t{}\t{}",
                    run.run_id,
                    run.status,
                    run.agent_type,
                    run.error_message.unwrap_or_default()
                );
            }
        }
    }

    Ok(())
}

async fn run_orchestration(config: &Config, instruction: &str, dry_run: bool) -> Result<i32> {
    let store = Store::open(&config.storage.state_dir)?;
    let runlog = RunLog::new(&config.storage.runs_dir);
    runlog.ensure_runs_dir().await?;

    let git = Arc::new(CliGit::new());
    let agent = create_runner(&config.llm, runlog.clone()).context("Failed to create agent runner")?;

    // Ctrl-C flips the cancellation flag; schedulers honor it at task
    // boundaries without killing in-flight agent runs
    let (cancel_tx, cancel_rx) = watch::channel(false);
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            info!("Interrupt received, finishing in-flight tasks");
            let _ = cancel_tx.send(true);
        }
    });

    if dry_run {
        let planner = PlannerOps::new(
            store.clone(),
            agent,
            config.git.repo_root.display().to_string(),
            config.planner_config(),
        );
        let (session, tasks) = planner.plan_tasks(instruction).await?;
        println!("session: {}", session.session_id);
        for task in tasks {
            println!("{}\t{}\t{:?}", task.task_id, task.branch, task.dependencies);
        }
        return Ok(0);
    }

    let orchestrator = Orchestrator::new(config.clone(), store, git, agent, runlog, cancel_rx);
    let outcome = orchestrator.run(instruction).await?;

    println!(
        "{} after {} round(s); integration branch: {}",
        if outcome.complete { "complete" } else { "incomplete" },
        outcome.rounds,
        outcome.integration_branch
    );
    for aspect in &outcome.report.missing_aspects {
        println!("missing: {}", aspect);
    }

    Ok(if outcome.complete { 0 } else { 1 })
}
