//! OpenAI provider adapter (chat completions API).

use async_trait::async_trait;
use reqwest::Client;
use serde::{Deserialize, Serialize};
use std::time::Duration;

use crate::error::{AskError, Result};
use crate::llm::{Completion, Message, ModelProfile, ProviderClient};
use crate::logging::redact;

const DEFAULT_BASE_URL: &str = "https://api.openai.com/v1";

/// OpenAI adapter.
#[derive(Debug, Clone)]
pub struct OpenAiProvider {
    profile: ModelProfile,
    client: Client,
}

impl OpenAiProvider {
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
        format!("{base}/chat/completions")
    }

    /// Maps an HTTP failure status onto the crate error kinds.
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
impl ProviderClient for OpenAiProvider {
    async fn complete(&self, messages: &[Message]) -> Result<Completion> {
        let request = ChatRequest {
            model: self.profile.model.clone(),
            messages: messages
                .iter()
                .map(|m| ChatMessage {
                    role: m.role.as_str().to_string(),
                    content: m.content.clone(),
                })
                .collect(),
            max_tokens: self.profile.max_tokens,
            temperature: self.profile.temperature,
        };

        let response = self
            .client
            .post(self.endpoint())
            .bearer_auth(&self.profile.api_key)
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

        let parsed: ChatResponse = serde_json::from_str(&body)
            .map_err(|e| AskError::ModelUnavailable(format!("failed to parse response: {e}")))?;

        let text = parsed
            .choices
            .into_iter()
            .next()
            .and_then(|c| c.message.content)
            .unwrap_or_default();

        if text.is_empty() {
            return Err(AskError::ModelUnavailable("empty completion".to_string()));
        }

        Ok(Completion {
            text,
            tokens_used: parsed.usage.map(|u| u.total_tokens),
        })
    }
}

// OpenAI API types

#[derive(Debug, Serialize)]
struct ChatRequest {
    model: String,
    messages: Vec<ChatMessage>,
    max_tokens: u32,
    temperature: f32,
}

#[derive(Debug, Serialize)]
struct ChatMessage {
    role: String,
    content: String,
}

#[derive(Debug, Deserialize)]
struct ChatResponse {
    choices: Vec<Choice>,
    usage: Option<Usage>,
}

#[derive(Debug, Deserialize)]
struct Choice {
    message: ChoiceMessage,
}

#[derive(Debug, Deserialize)]
struct ChoiceMessage {
    content: Option<String>,
}

#[derive(Debug, Deserialize)]
struct Usage {
    total_tokens: u32,
}

#[derive(Debug, Deserialize)]
struct ErrorResponse {
    error: ErrorBody,
}

#[derive(Debug, Deserialize)]
struct ErrorBody {
    message: String,
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::llm::test_profile;

    fn provider() -> OpenAiProvider {
        OpenAiProvider::new(test_profile("openai")).unwrap()
    }

    #[test]
    fn test_default_endpoint() {
        assert_eq!(
            provider().endpoint(),
            "https://api.openai.com/v1/chat/completions"
        );
    }

    #[test]
    fn test_custom_base_url() {
        let mut profile = test_profile("openai");
        profile.base_url = Some("https://proxy.internal/v1/".to_string());
        let provider = OpenAiProvider::new(profile).unwrap();
        assert_eq!(provider.endpoint(), "https://proxy.internal/v1/chat/completions");
    }

    #[test]
    fn test_rate_limit_is_retryable() {
        let err = provider().classify_status(reqwest::StatusCode::TOO_MANY_REQUESTS, "{}");
        assert!(matches!(err, AskError::ModelUnavailable(_)));
    }

    #[test]
    fn test_server_error_is_retryable() {
        let err = provider().classify_status(reqwest::StatusCode::BAD_GATEWAY, "upstream sad");
        assert!(matches!(err, AskError::ModelUnavailable(_)));
    }

    #[test]
    fn test_client_error_is_rejected() {
        let body = r#"{"error":{"message":"invalid model"}}"#;
        let err = provider().classify_status(reqwest::StatusCode::BAD_REQUEST, body);
        assert!(matches!(err, AskError::ModelRejected(_)));
        assert!(err.to_string().contains("invalid model"));
    }

    #[test]
    fn test_error_body_redacts_key() {
        let body = r#"{"error":{"message":"bad key sk-test supplied"}}"#;
        let err = provider().classify_status(reqwest::StatusCode::UNAUTHORIZED, body);
        assert!(!err.to_string().contains("sk-test"));
    }

    #[test]
    fn test_parse_usage() {
        let body = r#"{
            "choices": [{"message": {"content": "hello"}}],
            "usage": {"prompt_tokens": 10, "completion_tokens": 5, "total_tokens": 15}
        }"#;
        let parsed: ChatResponse = serde_json::from_str(body).unwrap();
        assert_eq!(parsed.usage.unwrap().total_tokens, 15);
    }
}
