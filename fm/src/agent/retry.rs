//! Bounded rate-limit retry around agent invocations
//!
//! Only rate-limit errors are retried; everything else surfaces
//! immediately. The sleep honors the provider's retry-after hint (capped),
//! adds a little jitter so parallel workers do not stampede, and is
//! interruptible through the cancellation channel.

use std::time::Duration;

use rand::Rng;
use tokio::sync::watch;
use tracing::{debug, warn};

use super::{AgentError, AgentOutcome, AgentRequest, AgentRunner};

/// Retry policy for rate-limited agent calls
#[derive(Debug, Clone)]
pub struct RetryPolicy {
    /// Retry rate limits at all
    pub enabled: bool,

    /// Attempts after the first call
    pub max_retries: u32,

    /// Sleep when the provider gives no hint
    pub default_backoff: Duration,

    /// Ceiling on provider hints
    pub max_backoff: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            enabled: true,
            max_retries: 3,
            default_backoff: Duration::from_secs(60),
            max_backoff: Duration::from_secs(300),
        }
    }
}

impl RetryPolicy {
    fn backoff_for(&self, hint: Option<Duration>) -> Duration {
        let base = hint.unwrap_or(self.default_backoff).min(self.max_backoff);
        // Up to 10% jitter
        let jitter_ms = rand::rng().random_range(0..=base.as_millis().max(1) as u64 / 10);
        base + Duration::from_millis(jitter_ms)
    }
}

/// Run the agent, retrying rate limits up to the policy's budget.
///
/// `cancel` flips to true when the orchestration is shutting down; the
/// backoff sleep returns early and the rate-limit error surfaces.
pub async fn run_agent_with_retry(
    runner: &dyn AgentRunner,
    request: AgentRequest,
    policy: &RetryPolicy,
    cancel: &watch::Receiver<bool>,
) -> Result<AgentOutcome, AgentError> {
    let mut attempt = 0u32;

    loop {
        match runner.run(request.clone()).await {
            Ok(outcome) => return Ok(outcome),
            Err(e) if e.is_rate_limit() && policy.enabled && attempt < policy.max_retries => {
                attempt += 1;
                let backoff = policy.backoff_for(e.retry_after());
                warn!(attempt, ?backoff, "Agent rate limited, backing off");

                let mut cancel = cancel.clone();
                tokio::select! {
                    _ = tokio::time::sleep(backoff) => {}
                    _ = wait_for_cancel(&mut cancel) => {
                        debug!("run_agent_with_retry: cancelled during backoff");
                        return Err(e);
                    }
                }
            }
            Err(e) => {
                if e.is_rate_limit() {
                    warn!(attempt, "Rate-limit retry budget exhausted");
                }
                return Err(e);
            }
        }
    }
}

/// Resolves only when cancellation is actually signalled. A dropped sender
/// means cancellation can never arrive, so the future parks forever and the
/// backoff sleep wins the select.
async fn wait_for_cancel(cancel: &mut watch::Receiver<bool>) {
    loop {
        if *cancel.borrow() {
            return;
        }
        if cancel.changed().await.is_err() {
            std::future::pending::<()>().await;
        }
    }
}
