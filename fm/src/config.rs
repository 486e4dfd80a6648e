//! Foreman configuration types and loading

use eyre::{Context, Result};
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::{Path, PathBuf};

use crate::agent::RetryPolicy;
use crate::judge::JudgeConfig;
use crate::planner::PlannerConfig;
use crate::worker::WorkerConfig;

/// Main foreman configuration
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    /// LLM provider configuration
    pub llm: LlmConfig,

    /// Worker concurrency
    pub workers: WorkersConfig,

    /// Retry and iteration budgets
    pub iterations: IterationsConfig,

    /// Planner knobs
    pub planner: PlannerSection,

    /// Git and commit behavior
    pub git: GitConfig,

    /// Storage locations
    pub storage: StorageConfig,
}

impl Config {
    /// Load configuration with fallback chain: explicit path, then
    /// `.foreman.yml` in the working directory, then the user config dir,
    /// then defaults.
    pub fn load(config_path: Option<&PathBuf>) -> Result<Self> {
        if let Some(path) = config_path {
            return Self::load_from_file(path).context(format!("Failed to load config from {}", path.display()));
        }

        let local_config = PathBuf::from(".foreman.yml");
        if local_config.exists() {
            match Self::load_from_file(&local_config) {
                Ok(config) => return Ok(config),
                Err(e) => {
                    tracing::warn!("Failed to load config from {}: {}", local_config.display(), e);
                }
            }
        }

        if let Some(config_dir) = dirs::config_dir() {
            let user_config = config_dir.join("foreman").join("foreman.yml");
            if user_config.exists() {
                match Self::load_from_file(&user_config) {
                    Ok(config) => return Ok(config),
                    Err(e) => {
                        tracing::warn!("Failed to load config from {}: {}", user_config.display(), e);
                    }
                }
            }
        }

        tracing::info!("No config file found, using defaults");
        Ok(Self::default())
    }

    fn load_from_file<P: AsRef<Path>>(path: P) -> Result<Self> {
        let content = fs::read_to_string(&path).context("Failed to read config file")?;
        let config: Self = serde_yaml::from_str(&content).context("Failed to parse config file")?;
        tracing::info!("Loaded config from: {}", path.as_ref().display());
        Ok(config)
    }

    /// Check requirements that only bite at runtime
    pub fn validate(&self) -> Result<()> {
        if std::env::var(&self.llm.api_key_env).is_err() {
            eyre::bail!("Environment variable {} is not set", self.llm.api_key_env);
        }
        if self.workers.max_workers == 0 {
            eyre::bail!("workers.max-workers must be at least 1");
        }
        Ok(())
    }

    pub fn planner_config(&self) -> PlannerConfig {
        PlannerConfig {
            model: self.llm.model.clone(),
            max_tasks: self.planner.max_tasks,
            max_task_duration: self.planner.max_task_duration,
            strict_context_validation: self.planner.strict_context_validation,
            quality_retries: self.planner.quality_retries,
            quality_threshold: self.planner.quality_threshold,
            max_retry_tasks: self.planner.max_retry_tasks,
            max_validation_retries: self.planner.max_validation_retries,
            max_consecutive_json_errors: self.planner.max_consecutive_json_errors,
        }
    }

    pub fn worker_config(&self) -> WorkerConfig {
        WorkerConfig {
            model: self.llm.model.clone(),
            retry: self.retry_policy(),
            auto_signature: self.git.auto_signature,
        }
    }

    pub fn judge_config(&self) -> JudgeConfig {
        JudgeConfig {
            model: self.llm.model.clone(),
            max_iterations: self.iterations.max_judgement_iterations,
            ..Default::default()
        }
    }

    pub fn retry_policy(&self) -> RetryPolicy {
        RetryPolicy {
            enabled: self.iterations.enable_rate_limit_retry,
            max_retries: self.iterations.rate_limit_retries,
            ..Default::default()
        }
    }
}

/// LLM provider configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct LlmConfig {
    /// Provider name (currently only "anthropic")
    pub provider: String,

    /// Model identifier
    pub model: String,

    /// Environment variable containing the API key
    #[serde(rename = "api-key-env")]
    pub api_key_env: String,

    /// API base URL
    #[serde(rename = "base-url")]
    pub base_url: String,

    /// Maximum tokens per response
    #[serde(rename = "max-tokens")]
    pub max_tokens: u32,

    /// Request timeout in milliseconds
    #[serde(rename = "timeout-ms")]
    pub timeout_ms: u64,
}

impl Default for LlmConfig {
    fn default() -> Self {
        Self {
            provider: "anthropic".to_string(),
            model: "claude-sonnet-4-20250514".to_string(),
            api_key_env: "ANTHROPIC_API_KEY".to_string(),
            base_url: "https://api.anthropic.com".to_string(),
            max_tokens: 16384,
            timeout_ms: 300_000,
        }
    }
}

/// Worker concurrency
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct WorkersConfig {
    /// Maximum concurrently executing tasks
    #[serde(rename = "max-workers")]
    pub max_workers: usize,
}

impl Default for WorkersConfig {
    fn default() -> Self {
        Self { max_workers: 3 }
    }
}

/// Retry and iteration budgets
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct IterationsConfig {
    /// In-place retries per serial-chain step
    #[serde(rename = "serial-chain-task-retries")]
    pub serial_chain_task_retries: u32,

    /// Judge-granted continuations per task
    #[serde(rename = "max-judgement-iterations")]
    pub max_judgement_iterations: u32,

    /// Re-planning rounds after the first execution
    #[serde(rename = "max-replanning-rounds")]
    pub max_replanning_rounds: u32,

    /// Rate-limit retries per agent call
    #[serde(rename = "rate-limit-retries")]
    pub rate_limit_retries: u32,

    /// Master switch for rate-limit retrying
    #[serde(rename = "enable-rate-limit-retry")]
    pub enable_rate_limit_retry: bool,
}

impl Default for IterationsConfig {
    fn default() -> Self {
        Self {
            serial_chain_task_retries: 3,
            max_judgement_iterations: 3,
            max_replanning_rounds: 2,
            rate_limit_retries: 3,
            enable_rate_limit_retry: true,
        }
    }
}

/// Planner knobs
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct PlannerSection {
    #[serde(rename = "max-tasks")]
    pub max_tasks: u32,

    #[serde(rename = "max-task-duration")]
    pub max_task_duration: f64,

    #[serde(rename = "strict-context-validation")]
    pub strict_context_validation: bool,

    #[serde(rename = "quality-retries")]
    pub quality_retries: u32,

    #[serde(rename = "quality-threshold")]
    pub quality_threshold: u32,

    #[serde(rename = "max-retry-tasks")]
    pub max_retry_tasks: usize,

    #[serde(rename = "max-validation-retries")]
    pub max_validation_retries: u32,

    #[serde(rename = "max-consecutive-json-errors")]
    pub max_consecutive_json_errors: u32,
}

impl Default for PlannerSection {
    fn default() -> Self {
        Self {
            max_tasks: 5,
            max_task_duration: 4.0,
            strict_context_validation: false,
            quality_retries: 5,
            quality_threshold: 60,
            max_retry_tasks: 5,
            max_validation_retries: 3,
            max_consecutive_json_errors: 3,
        }
    }
}

/// Git and commit behavior
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct GitConfig {
    /// Repository the orchestration edits
    #[serde(rename = "repo-root")]
    pub repo_root: PathBuf,

    /// Append a signature line to commit messages
    #[serde(rename = "auto-signature")]
    pub auto_signature: bool,
}

impl Default for GitConfig {
    fn default() -> Self {
        Self {
            repo_root: PathBuf::from("."),
            auto_signature: false,
        }
    }
}

/// Storage locations
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct StorageConfig {
    /// Directory for task/session records
    #[serde(rename = "state-dir")]
    pub state_dir: PathBuf,

    /// Directory for run logs and metadata
    #[serde(rename = "runs-dir")]
    pub runs_dir: PathBuf,
}

impl Default for StorageConfig {
    fn default() -> Self {
        Self {
            state_dir: PathBuf::from(".foreman/state"),
            runs_dir: PathBuf::from(".foreman/runs"),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_config() {
        let config = Config::default();

        assert_eq!(config.llm.provider, "anthropic");
        assert_eq!(config.workers.max_workers, 3);
        assert_eq!(config.iterations.serial_chain_task_retries, 3);
        assert_eq!(config.planner.quality_threshold, 60);
        assert_eq!(config.planner.max_tasks, 5);
        assert!(!config.git.auto_signature);
    }

    #[test]
    fn test_deserialize_config() {
        let yaml = r#"
llm:
  model: claude-opus-4
  api-key-env: MY_API_KEY
  max-tokens: 8192

workers:
  max-workers: 8

iterations:
  serial-chain-task-retries: 1
  max-judgement-iterations: 2
  enable-rate-limit-retry: false

planner:
  quality-threshold: 80
  strict-context-validation: true
"#;
        let config: Config = serde_yaml::from_str(yaml).unwrap();

        assert_eq!(config.llm.model, "claude-opus-4");
        assert_eq!(config.llm.api_key_env, "MY_API_KEY");
        assert_eq!(config.workers.max_workers, 8);
        assert_eq!(config.iterations.serial_chain_task_retries, 1);
        assert!(!config.iterations.enable_rate_limit_retry);
        assert_eq!(config.planner.quality_threshold, 80);
        assert!(config.planner.strict_context_validation);
    }

    #[test]
    fn test_partial_config_uses_defaults() {
        let yaml = r#"
workers:
  max-workers: 1
"#;
        let config: Config = serde_yaml::from_str(yaml).unwrap();

        assert_eq!(config.workers.max_workers, 1);
        assert_eq!(config.llm.provider, "anthropic");
        assert_eq!(config.planner.max_retry_tasks, 5);
    }

    #[test]
    fn test_derived_configs() {
        let config = Config::default();

        let planner = config.planner_config();
        assert_eq!(planner.quality_retries, 5);
        assert_eq!(planner.max_consecutive_json_errors, 3);

        let retry = config.retry_policy();
        assert!(retry.enabled);
        assert_eq!(retry.max_retries, 3);

        let judge = config.judge_config();
        assert_eq!(judge.max_iterations, 3);
    }
}
