//! Agent execution interface
//!
//! The engine never talks to an LLM directly; it hands a prompt and a
//! working directory to an `AgentRunner` and gets back the agent's final
//! textual response. The default runner speaks the Anthropic Messages API
//! and streams events into the run log.

mod anthropic;
mod error;
mod ratelimit;
pub mod retry;

use std::path::PathBuf;
use std::sync::Arc;

use async_trait::async_trait;
use tracing::debug;

pub use anthropic::AnthropicRunner;
pub use error::AgentError;
pub use ratelimit::response_mentions_rate_limit;
pub use retry::{RetryPolicy, run_agent_with_retry};

use crate::config::LlmConfig;
use crate::runlog::RunLog;

/// One agent invocation
#[derive(Debug, Clone)]
pub struct AgentRequest {
    /// Full prompt for the agent
    pub prompt: String,

    /// Directory the agent works in
    pub workdir: PathBuf,

    /// Model identifier
    pub model: String,

    /// When set, the runner streams events into this run's log
    pub run_id: Option<String>,

    /// Provider-side conversation to resume, if any
    pub session_id: Option<String>,
}

impl AgentRequest {
    pub fn new(prompt: impl Into<String>, workdir: impl Into<PathBuf>, model: impl Into<String>) -> Self {
        Self {
            prompt: prompt.into(),
            workdir: workdir.into(),
            model: model.into(),
            run_id: None,
            session_id: None,
        }
    }

    pub fn with_run_id(mut self, run_id: impl Into<String>) -> Self {
        self.run_id = Some(run_id.into());
        self
    }
}

/// What the agent produced
#[derive(Debug, Clone)]
pub struct AgentOutcome {
    /// Final textual response
    pub final_response: String,

    /// Provider-side session for continuation, if any
    pub session_id: Option<String>,

    /// Structured items the provider emitted alongside the text
    pub items: Vec<serde_json::Value>,
}

/// Executes one agent turn in a working directory
#[async_trait]
pub trait AgentRunner: Send + Sync {
    async fn run(&self, request: AgentRequest) -> Result<AgentOutcome, AgentError>;
}

/// Create the configured agent runner
pub fn create_runner(config: &LlmConfig, runlog: RunLog) -> Result<Arc<dyn AgentRunner>, AgentError> {
    debug!(provider = %config.provider, model = %config.model, "create_runner: called");
    match config.provider.as_str() {
        "anthropic" => Ok(Arc::new(AnthropicRunner::from_config(config, runlog)?)),
        other => Err(AgentError::InvalidResponse(format!(
            "Unknown agent provider: '{}'. Supported: anthropic",
            other
        ))),
    }
}
