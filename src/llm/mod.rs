//! LLM integration.
//!
//! One adapter per provider behind a shared trait, a startup registry
//! mapping provider keys to adapter factories, the retrying router, and the
//! prompt composer.

pub mod anthropic;
pub mod mock;
pub mod ollama;
pub mod openai;
pub mod prompt;
pub mod router;

pub use anthropic::AnthropicProvider;
pub use mock::MockProvider;
pub use ollama::OllamaProvider;
pub use openai::OpenAiProvider;
pub use prompt::{compose, HistoryTurn, PromptInputs};
pub use router::{Invocation, LlmRouter, RouterOptions};

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;

use crate::error::{AskError, Result};

/// Role of a message in a conversation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Role {
    /// System message providing context and instructions.
    System,
    /// User message (human input).
    User,
    /// Assistant message (LLM response).
    Assistant,
}

impl Role {
    /// Returns the role as a string for API requests.
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::System => "system",
            Self::User => "user",
            Self::Assistant => "assistant",
        }
    }
}

/// A single message in a conversation.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Message {
    pub role: Role,
    pub content: String,
}

impl Message {
    pub fn new(role: Role, content: impl Into<String>) -> Self {
        Self {
            role,
            content: content.into(),
        }
    }

    pub fn system(content: impl Into<String>) -> Self {
        Self::new(Role::System, content)
    }

    pub fn user(content: impl Into<String>) -> Self {
        Self::new(Role::User, content)
    }

    pub fn assistant(content: impl Into<String>) -> Self {
        Self::new(Role::Assistant, content)
    }
}

/// One completion returned by a provider.
#[derive(Debug, Clone)]
pub struct Completion {
    /// Raw model text.
    pub text: String,
    /// Tokens billed for the call, when the provider reports them.
    pub tokens_used: Option<u32>,
}

/// Runtime model settings handed to an adapter. The API key arrives
/// decrypted just-in-time and must never be logged.
#[derive(Clone)]
pub struct ModelProfile {
    /// Provider key, e.g. "openai".
    pub provider: String,
    /// Provider-specific model identifier.
    pub model: String,
    pub api_key: String,
    pub base_url: Option<String>,
    pub max_tokens: u32,
    pub temperature: f32,
    /// Per-attempt HTTP timeout.
    pub timeout_secs: u64,
}

impl std::fmt::Debug for ModelProfile {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ModelProfile")
            .field("provider", &self.provider)
            .field("model", &self.model)
            .field("api_key", &"***")
            .field("base_url", &self.base_url)
            .field("max_tokens", &self.max_tokens)
            .field("temperature", &self.temperature)
            .finish()
    }
}

/// Trait for provider adapters.
///
/// Adapters map provider failures onto the crate error kinds: retryable
/// conditions (network trouble, 5xx, rate limits) become *ModelUnavailable*
/// and non-retryable provider rejections become *ModelRejected*. The router
/// keys its retry policy off that distinction.
#[async_trait]
pub trait ProviderClient: Send + Sync + std::fmt::Debug {
    /// Generates a completion for the given messages.
    async fn complete(&self, messages: &[Message]) -> Result<Completion>;
}

type AdapterFactory = Box<dyn Fn(&ModelProfile) -> Result<Box<dyn ProviderClient>> + Send + Sync>;

/// Registry of provider adapters, keyed by provider string.
///
/// Adapters register at startup; asking for an unknown key fails with
/// *ModelUnsupported*.
#[derive(Default)]
pub struct ProviderRegistry {
    factories: HashMap<String, AdapterFactory>,
}

impl ProviderRegistry {
    /// Creates an empty registry.
    pub fn new() -> Self {
        Self::default()
    }

    /// Creates a registry with the built-in adapters registered.
    pub fn with_builtins() -> Self {
        let mut registry = Self::new();
        registry.register("openai", |profile| {
            Ok(Box::new(OpenAiProvider::new(profile.clone())?))
        });
        registry.register("anthropic", |profile| {
            Ok(Box::new(AnthropicProvider::new(profile.clone())?))
        });
        registry.register("ollama", |profile| {
            Ok(Box::new(OllamaProvider::new(profile.clone())?))
        });
        registry.register("mock", |_profile| Ok(Box::new(MockProvider::new())));
        registry
    }

    /// Registers an adapter factory under a provider key.
    pub fn register<F>(&mut self, key: impl Into<String>, factory: F)
    where
        F: Fn(&ModelProfile) -> Result<Box<dyn ProviderClient>> + Send + Sync + 'static,
    {
        self.factories.insert(key.into(), Box::new(factory));
    }

    /// Builds a client for the profile's provider.
    pub fn create(&self, profile: &ModelProfile) -> Result<Box<dyn ProviderClient>> {
        match self.factories.get(&profile.provider) {
            Some(factory) => factory(profile),
            None => Err(AskError::ModelUnsupported(profile.provider.clone())),
        }
    }

    /// Registered provider keys, sorted.
    pub fn providers(&self) -> Vec<&str> {
        let mut keys: Vec<&str> = self.factories.keys().map(String::as_str).collect();
        keys.sort_unstable();
        keys
    }
}

#[cfg(test)]
pub(crate) fn test_profile(provider: &str) -> ModelProfile {
    ModelProfile {
        provider: provider.to_string(),
        model: "test-model".to_string(),
        api_key: "sk-test".to_string(),
        base_url: None,
        max_tokens: 1024,
        temperature: 0.2,
        timeout_secs: 5,
    }
}
