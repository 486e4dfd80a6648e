//! Anthropic Messages API runner
//!
//! Implements AgentRunner against the Messages API. When the request names a
//! run id the response is streamed and text deltas are appended to the run
//! log as they arrive; otherwise a blocking call is made.

use std::time::Duration;

use async_trait::async_trait;
use futures::StreamExt;
use reqwest::Client;
use reqwest_eventsource::{Event, EventSource};
use serde::Deserialize;
use tracing::debug;

use super::{AgentError, AgentOutcome, AgentRequest, AgentRunner};
use crate::config::LlmConfig;
use crate::runlog::RunLog;

/// Hard ceiling on provider retry-after hints
const MAX_RETRY_AFTER: Duration = Duration::from_secs(300);
const DEFAULT_RETRY_AFTER: Duration = Duration::from_secs(60);

/// Anthropic-backed agent runner
pub struct AnthropicRunner {
    api_key: String,
    base_url: String,
    http: Client,
    max_tokens: u32,
    runlog: RunLog,
}

impl AnthropicRunner {
    /// Create a runner from configuration. The API key is read from the
    /// environment variable named in the config.
    pub fn from_config(config: &LlmConfig, runlog: RunLog) -> Result<Self, AgentError> {
        let api_key = std::env::var(&config.api_key_env)
            .map_err(|_| AgentError::InvalidResponse(format!("Environment variable {} not set", config.api_key_env)))?;

        let http = Client::builder()
            .timeout(Duration::from_millis(config.timeout_ms))
            .build()
            .map_err(AgentError::Network)?;

        Ok(Self {
            api_key,
            base_url: config.base_url.clone(),
            http,
            max_tokens: config.max_tokens,
            runlog,
        })
    }

    fn build_body(&self, request: &AgentRequest, stream: bool) -> serde_json::Value {
        let system = format!(
            "You are an autonomous software engineer. Your working directory is {}. \
             Complete the task described by the user and finish with a summary of what you changed.",
            request.workdir.display()
        );

        let mut body = serde_json::json!({
            "model": request.model,
            "max_tokens": self.max_tokens,
            "system": system,
            "messages": [{ "role": "user", "content": request.prompt }],
        });
        if stream {
            body["stream"] = serde_json::json!(true);
        }
        body
    }

    fn rate_limit_error(headers: &reqwest::header::HeaderMap) -> AgentError {
        let retry_after = headers
            .get("retry-after")
            .and_then(|v| v.to_str().ok())
            .and_then(|s| s.parse::<u64>().ok())
            .map(Duration::from_secs)
            .unwrap_or(DEFAULT_RETRY_AFTER)
            .min(MAX_RETRY_AFTER);

        AgentError::RateLimited {
            retry_after: Some(retry_after),
        }
    }

    async fn run_blocking(&self, request: &AgentRequest) -> Result<AgentOutcome, AgentError> {
        let url = format!("{}/v1/messages", self.base_url);
        let response = self
            .http
            .post(url)
            .header("x-api-key", self.api_key.clone())
            .header("anthropic-version", "2023-06-01")
            .header("content-type", "application/json")
            .json(&self.build_body(request, false))
            .send()
            .await?;

        if response.status().as_u16() == 429 {
            return Err(Self::rate_limit_error(response.headers()));
        }

        if !response.status().is_success() {
            let status = response.status().as_u16();
            let text = response.text().await.unwrap_or_default();
            if text.contains("rate_limit_error") {
                return Err(AgentError::RateLimited {
                    retry_after: Some(DEFAULT_RETRY_AFTER),
                });
            }
            return Err(AgentError::Api { status, message: text });
        }

        let api_response: MessagesResponse = response.json().await?;
        let mut final_response = String::new();
        let mut items = Vec::new();
        for block in api_response.content {
            if let ContentBlock::Text { text } = &block {
                final_response.push_str(text);
            }
            items.push(serde_json::to_value(&block)?);
        }

        Ok(AgentOutcome {
            final_response,
            session_id: request.session_id.clone(),
            items,
        })
    }

    async fn run_streaming(&self, request: &AgentRequest, run_id: &str) -> Result<AgentOutcome, AgentError> {
        let url = format!("{}/v1/messages", self.base_url);
        let http_request = self
            .http
            .post(url)
            .header("x-api-key", self.api_key.clone())
            .header("anthropic-version", "2023-06-01")
            .header("content-type", "application/json")
            .json(&self.build_body(request, true));

        let mut es = EventSource::new(http_request).map_err(|e| AgentError::InvalidResponse(e.to_string()))?;

        let mut final_response = String::new();

        while let Some(event) = es.next().await {
            match event {
                Ok(Event::Message(msg)) => {
                    let data: serde_json::Value = serde_json::from_str(&msg.data)?;
                    match data["type"].as_str() {
                        Some("content_block_delta") => {
                            if let Some(text) = data["delta"]["text"].as_str() {
                                final_response.push_str(text);
                                if let Err(e) = self.runlog.append(run_id, text).await {
                                    debug!(error = %e, "Failed to append stream delta to run log");
                                }
                            }
                        }
                        Some("error") => {
                            let message = data["error"]["message"].as_str().unwrap_or("unknown").to_string();
                            if data["error"]["type"].as_str() == Some("rate_limit_error") {
                                return Err(AgentError::RateLimited {
                                    retry_after: Some(DEFAULT_RETRY_AFTER),
                                });
                            }
                            return Err(AgentError::InvalidResponse(message));
                        }
                        Some("message_stop") => break,
                        _ => {}
                    }
                }
                Ok(Event::Open) => {}
                Err(reqwest_eventsource::Error::StreamEnded) => break,
                Err(e) => {
                    // 429 at connect time arrives as an invalid status error
                    if let reqwest_eventsource::Error::InvalidStatusCode(status, response) = &e {
                        if status.as_u16() == 429 {
                            return Err(Self::rate_limit_error(response.headers()));
                        }
                    }
                    return Err(AgentError::InvalidResponse(e.to_string()));
                }
            }
        }

        Ok(AgentOutcome {
            final_response,
            session_id: request.session_id.clone(),
            items: Vec::new(),
        })
    }
}

#[async_trait]
impl AgentRunner for AnthropicRunner {
    async fn run(&self, request: AgentRequest) -> Result<AgentOutcome, AgentError> {
        debug!(model = %request.model, workdir = %request.workdir.display(), "AnthropicRunner::run: called");
        match &request.run_id {
            Some(run_id) => self.run_streaming(&request, &run_id.clone()).await,
            None => self.run_blocking(&request).await,
        }
    }
}

// Messages API response types

#[derive(Debug, Deserialize)]
struct MessagesResponse {
    content: Vec<ContentBlock>,
}

#[derive(Debug, serde::Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
enum ContentBlock {
    Text { text: String },
    #[serde(other)]
    Other,
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    fn runner() -> AnthropicRunner {
        AnthropicRunner {
            api_key: "test-key".to_string(),
            base_url: "https://api.anthropic.com".to_string(),
            http: Client::new(),
            max_tokens: 8192,
            runlog: RunLog::new(tempdir().unwrap().path().join("runs")),
        }
    }

    #[test]
    fn test_build_body() {
        let request = AgentRequest::new("implement the endpoint", "/work/tree", "claude-sonnet-4-20250514");
        let body = runner().build_body(&request, false);

        assert_eq!(body["model"], "claude-sonnet-4-20250514");
        assert_eq!(body["max_tokens"], 8192);
        assert!(body["system"].as_str().unwrap().contains("/work/tree"));
        assert_eq!(body["messages"][0]["content"], "implement the endpoint");
        assert!(body.get("stream").is_none());
    }

    #[test]
    fn test_build_body_streaming_flag() {
        let request = AgentRequest::new("x", "/w", "m");
        let body = runner().build_body(&request, true);
        assert_eq!(body["stream"], true);
    }

    #[test]
    fn test_rate_limit_error_reads_header() {
        let mut headers = reqwest::header::HeaderMap::new();
        headers.insert("retry-after", "42".parse().unwrap());
        let err = AnthropicRunner::rate_limit_error(&headers);
        assert_eq!(err.retry_after(), Some(Duration::from_secs(42)));
    }

    #[test]
    fn test_rate_limit_error_caps_hint() {
        let mut headers = reqwest::header::HeaderMap::new();
        headers.insert("retry-after", "9000".parse().unwrap());
        let err = AnthropicRunner::rate_limit_error(&headers);
        assert_eq!(err.retry_after(), Some(MAX_RETRY_AFTER));
    }

    #[test]
    fn test_rate_limit_error_defaults_without_header() {
        let headers = reqwest::header::HeaderMap::new();
        let err = AnthropicRunner::rate_limit_error(&headers);
        assert_eq!(err.retry_after(), Some(DEFAULT_RETRY_AFTER));
    }

    #[test]
    fn test_content_block_parsing_tolerates_unknown() {
        let json = r#"{"content": [
            {"type": "text", "text": "hello"},
            {"type": "tool_use", "id": "x", "name": "t", "input": {}}
        ]}"#;
        let parsed: MessagesResponse = serde_json::from_str(json).unwrap();
        assert_eq!(parsed.content.len(), 2);
        assert!(matches!(&parsed.content[0], ContentBlock::Text { text } if text == "hello"));
        assert!(matches!(&parsed.content[1], ContentBlock::Other));
    }
}
