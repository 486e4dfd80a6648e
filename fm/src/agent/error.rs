//! Agent error types

use std::time::Duration;

use thiserror::Error;

/// Errors from agent execution
#[derive(Debug, Error)]
pub enum AgentError {
    #[error("Rate limited, retry after {retry_after:?}")]
    RateLimited { retry_after: Option<Duration> },

    #[error("API error {status}: {message}")]
    Api { status: u16, message: String },

    #[error("Network error: {0}")]
    Network(#[from] reqwest::Error),

    #[error("Invalid response: {0}")]
    InvalidResponse(String),

    #[error("Timeout after {0:?}")]
    Timeout(Duration),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),
}

impl AgentError {
    pub fn is_rate_limit(&self) -> bool {
        matches!(self, AgentError::RateLimited { .. })
    }

    pub fn retry_after(&self) -> Option<Duration> {
        match self {
            AgentError::RateLimited { retry_after } => *retry_after,
            _ => None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_is_rate_limit() {
        assert!(
            AgentError::RateLimited {
                retry_after: Some(Duration::from_secs(10))
            }
            .is_rate_limit()
        );
        assert!(
            !AgentError::Api {
                status: 500,
                message: "oops".into()
            }
            .is_rate_limit()
        );
    }

    #[test]
    fn test_retry_after() {
        let err = AgentError::RateLimited {
            retry_after: Some(Duration::from_secs(42)),
        };
        assert_eq!(err.retry_after(), Some(Duration::from_secs(42)));
        assert_eq!(AgentError::InvalidResponse("x".into()).retry_after(), None);
    }
}
