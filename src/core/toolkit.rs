//! The opaque callable a worker invokes to produce a job's result.
//!
//! The contract is `execute(input, env_context, credentials) -> (result,
//! usage) | ToolkitError`, with the error split into retriable and fatal so
//! the worker's retry policy can tell them apart. The shipped implementation
//! talks to an OpenAI-compatible chat-completions endpoint.

use std::collections::HashMap;
use std::time::Duration;

use async_trait::async_trait;
use serde::Deserialize;
use thiserror::Error;

use crate::core::types::{CredentialData, UsageMetrics};

#[derive(Debug, Error)]
pub enum ToolkitError {
    /// Transient: credential expired, endpoint overloaded or unreachable.
    /// Worth retrying with backoff.
    #[error("retriable toolkit failure: {0}")]
    Retriable(String),
    /// The toolkit rejected the work itself; retrying the same input cannot
    /// succeed.
    #[error("fatal toolkit failure: {0}")]
    Fatal(String),
}

#[derive(Debug, Clone)]
pub struct ToolkitOutput {
    pub result: String,
    pub usage: UsageMetrics,
}

#[async_trait]
pub trait Toolkit: Send + Sync {
    async fn execute(
        &self,
        input: &str,
        env_context: &HashMap<String, String>,
        credentials: &CredentialData,
    ) -> Result<ToolkitOutput, ToolkitError>;
}

/// Chat-completions client. The API key comes from the job's `env_context`
/// snapshot (captured at submission); the owner's OAuth credentials and the
/// scope grant travel alongside so the remote agent can act on their behalf.
pub struct ChatToolkit {
    http: reqwest::Client,
    base_url: String,
    model: String,
}

#[derive(Deserialize)]
struct ChatResponse {
    choices: Vec<ChatChoice>,
    #[serde(default)]
    usage: Option<ChatUsage>,
}

#[derive(Deserialize)]
struct ChatChoice {
    message: ChatMessage,
}

#[derive(Deserialize)]
struct ChatMessage {
    content: Option<String>,
}

#[derive(Deserialize, Default)]
struct ChatUsage {
    #[serde(default)]
    prompt_tokens: i64,
    #[serde(default)]
    completion_tokens: i64,
    #[serde(default)]
    total_tokens: i64,
}

impl ChatToolkit {
    pub fn new(base_url: String, model: String, timeout: Duration) -> Self {
        let http = reqwest::Client::builder()
            .timeout(timeout)
            .build()
            .unwrap_or_default();
        Self {
            http,
            base_url: base_url.trim_end_matches('/').to_string(),
            model,
        }
    }
}

#[async_trait]
impl Toolkit for ChatToolkit {
    async fn execute(
        &self,
        input: &str,
        env_context: &HashMap<String, String>,
        credentials: &CredentialData,
    ) -> Result<ToolkitOutput, ToolkitError> {
        let api_key = env_context
            .get("OPENAI_API_KEY")
            .filter(|k| !k.is_empty())
            .ok_or_else(|| {
                ToolkitError::Fatal("no OPENAI_API_KEY in job environment".to_string())
            })?;

        let authorized_scopes = env_context
            .get("GOOGLE_AUTHORIZED_SCOPES")
            .cloned()
            .unwrap_or_else(|| "[]".to_string());
        let system = format!(
            "You are an assistant acting on the user's behalf. \
             Authorized provider scopes: {authorized_scopes}. \
             A provider access token is available to your tools."
        );

        let body = serde_json::json!({
            "model": self.model,
            "messages": [
                { "role": "system", "content": system },
                { "role": "user", "content": input },
            ],
            "metadata": {
                "provider_token_present": !credentials.access_token.is_empty(),
            },
        });

        let response = self
            .http
            .post(format!("{}/chat/completions", self.base_url))
            .bearer_auth(api_key)
            .json(&body)
            .send()
            .await
            .map_err(|e| ToolkitError::Retriable(format!("request failed: {e}")))?;

        let status = response.status();
        let text = response
            .text()
            .await
            .map_err(|e| ToolkitError::Retriable(format!("failed to read response: {e}")))?;

        if status.as_u16() == 408 || status.as_u16() == 429 || status.is_server_error() {
            return Err(ToolkitError::Retriable(format!(
                "toolkit endpoint returned {status}: {text}"
            )));
        }
        if !status.is_success() {
            return Err(ToolkitError::Fatal(format!(
                "toolkit endpoint rejected request ({status}): {text}"
            )));
        }

        let parsed: ChatResponse = serde_json::from_str(&text)
            .map_err(|e| ToolkitError::Fatal(format!("malformed toolkit response: {e}")))?;
        let content = parsed
            .choices
            .into_iter()
            .next()
            .and_then(|c| c.message.content)
            .ok_or_else(|| ToolkitError::Fatal("toolkit response had no content".to_string()))?;
        let usage = parsed.usage.unwrap_or_default();

        Ok(ToolkitOutput {
            result: content,
            usage: UsageMetrics {
                input_tokens: usage.prompt_tokens,
                output_tokens: usage.completion_tokens,
                total_tokens: usage.total_tokens,
            },
        })
    }
}
