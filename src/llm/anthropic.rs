//! Anthropic provider adapter (messages API).

use async_trait::async_trait;
use reqwest::Client;
use serde::{Deserialize, Serialize};
use std::time::Duration;

use crate::error::{AskError, Result};
use crate::llm::{Completion, Message, ModelProfile, ProviderClient, Role};
use crate::logging::redact;

const DEFAULT_BASE_URL: &str = "https://api.anthropic.com";

/// Anthropic API version header.
const ANTHROPIC_VERSION: &str = "2023-06-01";

/// Anthropic adapter.
#[derive(Debug, Clone)]
pub struct AnthropicProvider {
    profile: ModelProfile,
    client: Client,
}

impl AnthropicProvider {
    /// Creates an adapter from the model profile.
    pub fn new(profile: ModelProfile) -> Result<Self> {
        let client = Client::builder()
            .timeout(Duration::from_secs(profile.timeout_secs))
            .build()
            .map_err(|e| AskError::internal(format!("Failed to create HTTP client: {e}")))?;

        Ok(Self { profile, client })
    }

    fn endpoint(&self) -> String {
        let base = self
            .profile
            .base_url
            .as_deref()
            .unwrap_or(DEFAULT_BASE_URL)
            .trim_end_matches('/');
        format!("{base}/v1/messages")
    }

    /// The system prompt travels in a separate field; other roles become
    /// the message list.
    fn convert_messages(messages: &[Message]) -> (Option<String>, Vec<ApiMessage>) {
        let mut system = None;
        let mut converted = Vec::new();

        for msg in messages {
            match msg.role {
                Role::System => system = Some(msg.content.clone()),
                Role::User | Role::Assistant => converted.push(ApiMessage {
                    role: msg.role.as_str().to_string(),
                    content: msg.content.clone(),
                }),
            }
        }

        (system, converted)
    }

    fn classify_status(&self, status: reqwest::StatusCode, body: &str) -> AskError {
        let detail = serde_json::from_str::<ErrorResponse>(body)
            .map(|e| e.error.message)
            .unwrap_or_else(|_| body.chars().take(200).collect());
        let detail = redact(&detail, &self.profile.api_key);

        if status == reqwest::StatusCode::TOO_MANY_REQUESTS {
            AskError::ModelUnavailable(format!("rate limited: {detail}"))
        } else if status.is_server_error() {
            AskError::ModelUnavailable(format!("provider error {status}: {detail}"))
        } else {
            AskError::ModelRejected(format!("{status}: {detail}"))
        }
    }
}

#[async_trait]
impl ProviderClient for AnthropicProvider {
    async fn complete(&self, messages: &[Message]) -> Result<Completion> {
        let (system, converted) = Self::convert_messages(messages);

        let request = MessagesRequest {
            model: self.profile.model.clone(),
            max_tokens: self.profile.max_tokens,
            temperature: self.profile.temperature,
            system,
            messages: converted,
        };

        let response = self
            .client
            .post(self.endpoint())
            .header("x-api-key", &self.profile.api_key)
            .header("anthropic-version", ANTHROPIC_VERSION)
            .json(&request)
            .send()
            .await
            .map_err(|e| {
                let msg = redact(&e.to_string(), &self.profile.api_key);
                AskError::ModelUnavailable(format!("request failed: {msg}"))
            })?;

        let status = response.status();
        let body = response
            .text()
            .await
            .map_err(|e| AskError::ModelUnavailable(format!("failed to read response: {e}")))?;

        if !status.is_success() {
            return Err(self.classify_status(status, &body));
        }

        let parsed: MessagesResponse = serde_json::from_str(&body)
            .map_err(|e| AskError::ModelUnavailable(format!("failed to parse response: {e}")))?;

        let text = parsed
            .content
            .into_iter()
            .filter(|block| block.content_type == "text")
            .map(|block| block.text)
            .collect::<Vec<_>>()
            .join("");

        if text.is_empty() {
            return Err(AskError::ModelUnavailable("empty completion".to_string()));
        }

        let tokens_used = parsed
            .usage
            .map(|u| u.input_tokens.unwrap_or(0) + u.output_tokens.unwrap_or(0));

        Ok(Completion { text, tokens_used })
    }
}

// Anthropic API types

#[derive(Debug, Serialize)]
struct MessagesRequest {
    model: String,
    max_tokens: u32,
    temperature: f32,
    #[serde(skip_serializing_if = "Option::is_none")]
    system: Option<String>,
    messages: Vec<ApiMessage>,
}

#[derive(Debug, Serialize)]
struct ApiMessage {
    role: String,
    content: String,
}

#[derive(Debug, Deserialize)]
struct MessagesResponse {
    content: Vec<ContentBlock>,
    usage: Option<Usage>,
}

#[derive(Debug, Deserialize)]
struct ContentBlock {
    #[serde(rename = "type")]
    content_type: String,
    #[serde(default)]
    text: String,
}

#[derive(Debug, Deserialize)]
struct Usage {
    input_tokens: Option<u32>,
    output_tokens: Option<u32>,
}

#[derive(Debug, Deserialize)]
struct ErrorResponse {
    error: ErrorBody,
}

#[derive(Debug, Deserialize)]
struct ErrorBody {
    message: String,
}
