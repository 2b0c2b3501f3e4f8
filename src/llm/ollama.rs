//! Ollama provider adapter (local chat API, non-streaming).

use async_trait::async_trait;
use reqwest::Client;
use serde::{Deserialize, Serialize};
use std::time::Duration;

use crate::error::{AskError, Result};
use crate::llm::{Completion, Message, ModelProfile, ProviderClient};

const DEFAULT_BASE_URL: &str = "http://localhost:11434";

/// Ollama adapter. No API key; the base URL points at the local daemon.
#[derive(Debug, Clone)]
pub struct OllamaProvider {
    profile: ModelProfile,
    client: Client,
}

impl OllamaProvider {
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
        format!("{base}/api/chat")
    }
}

#[async_trait]
impl ProviderClient for OllamaProvider {
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
            stream: false,
            options: ChatOptions {
                temperature: self.profile.temperature,
                num_predict: self.profile.max_tokens,
            },
        };

        let response = self
            .client
            .post(self.endpoint())
            .json(&request)
            .send()
            .await
            .map_err(|e| AskError::ModelUnavailable(format!("request failed: {e}")))?;

        let status = response.status();
        let body = response
            .text()
            .await
            .map_err(|e| AskError::ModelUnavailable(format!("failed to read response: {e}")))?;

        if !status.is_success() {
            // A 404 usually means the model is not pulled; not retryable.
            return if status.is_client_error() {
                Err(AskError::ModelRejected(format!("{status}: {body}")))
            } else {
                Err(AskError::ModelUnavailable(format!("{status}: {body}")))
            };
        }

        let parsed: ChatResponse = serde_json::from_str(&body)
            .map_err(|e| AskError::ModelUnavailable(format!("failed to parse response: {e}")))?;

        let text = parsed.message.map(|m| m.content).unwrap_or_default();
        if text.is_empty() {
            return Err(AskError::ModelUnavailable("empty completion".to_string()));
        }

        let tokens_used = match (parsed.prompt_eval_count, parsed.eval_count) {
            (None, None) => None,
            (p, e) => Some(p.unwrap_or(0) + e.unwrap_or(0)),
        };

        Ok(Completion { text, tokens_used })
    }
}

// Ollama API types

#[derive(Debug, Serialize)]
struct ChatRequest {
    model: String,
    messages: Vec<ChatMessage>,
    stream: bool,
    options: ChatOptions,
}

#[derive(Debug, Serialize)]
struct ChatMessage {
    role: String,
    content: String,
}

#[derive(Debug, Serialize)]
struct ChatOptions {
    temperature: f32,
    num_predict: u32,
}

#[derive(Debug, Deserialize)]
struct ChatResponse {
    message: Option<ResponseMessage>,
    prompt_eval_count: Option<u32>,
    eval_count: Option<u32>,
}

#[derive(Debug, Deserialize)]
struct ResponseMessage {
    content: String,
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::llm::test_profile;

    #[test]
    fn test_default_endpoint() {
        let provider = OllamaProvider::new(test_profile("ollama")).unwrap();
        assert_eq!(provider.endpoint(), "http://localhost:11434/api/chat");
    }

    #[test]
    fn test_custom_base_url() {
        let mut profile = test_profile("ollama");
        profile.base_url = Some("http://gpu-box:11434".to_string());
        let provider = OllamaProvider::new(profile).unwrap();
        assert_eq!(provider.endpoint(), "http://gpu-box:11434/api/chat");
    }

    #[test]
    fn test_parse_response_tokens() {
        let body = r#"{
            "message": {"role": "assistant", "content": "SELECT 1"},
            "prompt_eval_count": 50,
            "eval_count": 10
        }"#;
        let parsed: ChatResponse = serde_json::from_str(body).unwrap();
        assert_eq!(parsed.prompt_eval_count, Some(50));
        assert_eq!(parsed.eval_count, Some(10));
    }
}
