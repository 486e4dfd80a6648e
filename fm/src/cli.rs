//! CLI command definitions and subcommands

use clap::{Parser, Subcommand};
use std::path::PathBuf;

/// Foreman - multi-agent development orchestrator
#[derive(Parser)]
#[command(
    name = "fm",
    about = "Decomposes an instruction into tasks and runs coding agents over isolated worktrees",
    version
)]
pub struct Cli {
    /// Path to config file
    #[arg(short, long, global = true, help = "Path to config file")]
    pub config: Option<PathBuf>,

    /// Enable verbose output
    #[arg(short, long, global = true, help = "Enable verbose output")]
    pub verbose: bool,

    /// Subcommand to execute
    #[command(subcommand)]
    pub command: Command,
}

/// CLI subcommands
#[derive(Subcommand)]
pub enum Command {
    /// Plan and execute an instruction against a repository
    Run {
        /// The natural-language instruction
        instruction: String,

        /// Repository to work in (overrides config)
        #[arg(short, long)]
        repo: Option<PathBuf>,

        /// Maximum concurrent workers (overrides config)
        #[arg(short = 'w', long)]
        max_workers: Option<usize>,

        /// Model identifier (overrides config)
        #[arg(short, long)]
        model: Option<String>,

        /// Stop after planning; print the task set without executing
        #[arg(long)]
        dry_run: bool,
    },

    /// List task records and their states
    Tasks,

    /// List run metadata, newest first
    Runs,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_cli_parse_run() {
        let cli = Cli::parse_from(["fm", "run", "add a health endpoint"]);
        if let Command::Run {
            instruction,
            repo,
            max_workers,
            dry_run,
            ..
        } = cli.command
        {
            assert_eq!(instruction, "add a health endpoint");
            assert!(repo.is_none());
            assert!(max_workers.is_none());
            assert!(!dry_run);
        } else {
            panic!("Expected Run command");
        }
    }

    #[test]
    fn test_cli_parse_run_with_overrides() {
        let cli = Cli::parse_from(["fm", "run", "do it", "-w", "5", "--dry-run", "-r", "/some/repo"]);
        if let Command::Run {
            repo,
            max_workers,
            dry_run,
            ..
        } = cli.command
        {
            assert_eq!(repo, Some(PathBuf::from("/some/repo")));
            assert_eq!(max_workers, Some(5));
            assert!(dry_run);
        } else {
            panic!("Expected Run command");
        }
    }

    #[test]
    fn test_cli_parse_tasks_and_runs() {
        assert!(matches!(Cli::parse_from(["fm", "tasks"]).command, Command::Tasks));
        assert!(matches!(Cli::parse_from(["fm", "runs"]).command, Command::Runs));
    }

    #[test]
    fn test_cli_with_config() {
        let cli = Cli::parse_from(["fm", "-c", "/path/to/config.yml", "tasks"]);
        assert_eq!(cli.config, Some(PathBuf::from("/path/to/config.yml")));
    }
}
