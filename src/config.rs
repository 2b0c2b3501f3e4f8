//! Configuration management for askdb.
//!
//! Handles loading configuration from a TOML file and environment variables.
//! The process encryption key is environment-only and never written to disk.

use crate::error::{AskError, Result};
use serde::{Deserialize, Serialize};
use std::path::Path;

/// Environment variable holding the base64 AES-256 key for secrets at rest.
pub const ENCRYPTION_KEY_ENV: &str = "ASKDB_ENCRYPTION_KEY";

/// Main configuration structure for askdb.
#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct Config {
    /// HTTP server settings.
    #[serde(default)]
    pub server: ServerConfig,

    /// Self-storage settings (sessions, messages, knowledge, models).
    #[serde(default)]
    pub store: StoreConfig,

    /// Connection-pool settings for user data sources.
    #[serde(default)]
    pub pool: PoolConfig,

    /// Per-step timeouts.
    #[serde(default)]
    pub timeouts: TimeoutConfig,

    /// Knowledge-retrieval caps.
    #[serde(default)]
    pub retrieval: RetrievalConfig,

    /// LLM defaults.
    #[serde(default)]
    pub llm: LlmConfig,
}

/// HTTP server settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ServerConfig {
    /// Socket address to bind, e.g. "0.0.0.0:8080".
    #[serde(default = "default_bind")]
    pub bind: String,

    /// Origins allowed by CORS. Empty means same-origin only.
    #[serde(default)]
    pub allowed_origins: Vec<String>,

    /// Accepted bearer tokens. Loaded from config or `ASKDB_API_TOKEN`.
    #[serde(default)]
    pub api_tokens: Vec<String>,
}

fn default_bind() -> String {
    "127.0.0.1:8080".to_string()
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            bind: default_bind(),
            allowed_origins: Vec::new(),
            api_tokens: Vec::new(),
        }
    }
}

/// Self-storage settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StoreConfig {
    /// SQLite DSN for the application's own state.
    #[serde(default = "default_store_dsn")]
    pub dsn: String,
}

fn default_store_dsn() -> String {
    "sqlite:askdb.db?mode=rwc".to_string()
}

impl Default for StoreConfig {
    fn default() -> Self {
        Self {
            dsn: default_store_dsn(),
        }
    }
}

/// Connection-pool settings for user data sources.
#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
pub struct PoolConfig {
    /// Upper bound on connections per data source.
    #[serde(default = "default_max_connections")]
    pub max_connections: u32,

    /// Seconds an idle connection may linger before being reaped.
    #[serde(default = "default_idle_timeout_secs")]
    pub idle_timeout_secs: u64,

    /// Seconds a connection may live before it is recycled.
    #[serde(default = "default_max_lifetime_secs")]
    pub max_lifetime_secs: u64,

    /// Seconds to wait for the initial probe before declaring the source
    /// unreachable.
    #[serde(default = "default_probe_timeout_secs")]
    pub probe_timeout_secs: u64,
}

fn default_max_connections() -> u32 {
    5
}
fn default_idle_timeout_secs() -> u64 {
    300
}
fn default_max_lifetime_secs() -> u64 {
    1800
}
fn default_probe_timeout_secs() -> u64 {
    10
}

impl Default for PoolConfig {
    fn default() -> Self {
        Self {
            max_connections: default_max_connections(),
            idle_timeout_secs: default_idle_timeout_secs(),
            max_lifetime_secs: default_max_lifetime_secs(),
            probe_timeout_secs: default_probe_timeout_secs(),
        }
    }
}

/// Per-step timeouts, in seconds.
#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
pub struct TimeoutConfig {
    /// Single LLM attempt.
    #[serde(default = "default_llm_attempt_secs")]
    pub llm_attempt_secs: u64,

    /// Overall LLM budget across retries.
    #[serde(default = "default_llm_overall_secs")]
    pub llm_overall_secs: u64,

    /// SQL execution.
    #[serde(default = "default_sql_secs")]
    pub sql_secs: u64,

    /// Knowledge retrieval.
    #[serde(default = "default_retrieval_secs")]
    pub retrieval_secs: u64,

    /// Schema load.
    #[serde(default = "default_schema_secs")]
    pub schema_secs: u64,

    /// End-to-end hard ceiling per turn.
    #[serde(default = "default_turn_secs")]
    pub turn_secs: u64,
}

fn default_llm_attempt_secs() -> u64 {
    30
}
fn default_llm_overall_secs() -> u64 {
    60
}
fn default_sql_secs() -> u64 {
    30
}
fn default_retrieval_secs() -> u64 {
    2
}
fn default_schema_secs() -> u64 {
    5
}
fn default_turn_secs() -> u64 {
    120
}

impl Default for TimeoutConfig {
    fn default() -> Self {
        Self {
            llm_attempt_secs: default_llm_attempt_secs(),
            llm_overall_secs: default_llm_overall_secs(),
            sql_secs: default_sql_secs(),
            retrieval_secs: default_retrieval_secs(),
            schema_secs: default_schema_secs(),
            turn_secs: default_turn_secs(),
        }
    }
}

/// Knowledge-retrieval caps.
#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
pub struct RetrievalConfig {
    /// Most terms returned per question.
    #[serde(default = "default_max_terms")]
    pub max_terms: usize,

    /// Most SQL examples returned per question (dialect-filtered).
    #[serde(default = "default_max_examples")]
    pub max_examples: usize,

    /// Most knowledge articles returned per question.
    #[serde(default = "default_max_articles")]
    pub max_articles: usize,

    /// Token budget across all retrieved items.
    #[serde(default = "default_retrieval_token_budget")]
    pub token_budget: usize,
}

fn default_max_terms() -> usize {
    10
}
fn default_max_examples() -> usize {
    5
}
fn default_max_articles() -> usize {
    3
}
fn default_retrieval_token_budget() -> usize {
    2000
}

impl Default for RetrievalConfig {
    fn default() -> Self {
        Self {
            max_terms: default_max_terms(),
            max_examples: default_max_examples(),
            max_articles: default_max_articles(),
            token_budget: default_retrieval_token_budget(),
        }
    }
}

/// LLM defaults applied when a model config leaves them unset.
#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
pub struct LlmConfig {
    /// Retry attempts on transient provider failures.
    #[serde(default = "default_max_retries")]
    pub max_retries: u32,

    /// Prompt token budget (conservative chars/4 estimate).
    #[serde(default = "default_prompt_token_budget")]
    pub prompt_token_budget: usize,

    /// Conversation turns carried into the prompt.
    #[serde(default = "default_history_turns")]
    pub history_turns: usize,

    /// Row cap applied to executed queries.
    #[serde(default = "default_row_limit")]
    pub row_limit: usize,
}

fn default_max_retries() -> u32 {
    3
}
fn default_prompt_token_budget() -> usize {
    8000
}
fn default_history_turns() -> usize {
    5
}
fn default_row_limit() -> usize {
    1000
}

impl Default for LlmConfig {
    fn default() -> Self {
        Self {
            max_retries: default_max_retries(),
            prompt_token_budget: default_prompt_token_budget(),
            history_turns: default_history_turns(),
            row_limit: default_row_limit(),
        }
    }
}

impl Config {
    /// Loads configuration from a TOML file, then applies environment
    /// overrides. A missing file yields the defaults.
    pub fn load(path: Option<&Path>) -> Result<Self> {
        let mut config = match path {
            Some(p) if p.exists() => {
                let content = std::fs::read_to_string(p)
                    .map_err(|e| AskError::config(format!("Failed to read config file: {e}")))?;
                toml::from_str(&content).map_err(|e| {
                    AskError::config(format!("Configuration error in {}:\n  {}", p.display(), e))
                })?
            }
            _ => Self::default(),
        };

        config.apply_env_overrides();
        Ok(config)
    }

    /// Applies environment variables on top of file values.
    fn apply_env_overrides(&mut self) {
        if let Ok(bind) = std::env::var("ASKDB_BIND") {
            self.server.bind = bind;
        }
        if let Ok(dsn) = std::env::var("ASKDB_STORE_DSN") {
            self.store.dsn = dsn;
        }
        if let Ok(token) = std::env::var("ASKDB_API_TOKEN") {
            if !self.server.api_tokens.contains(&token) {
                self.server.api_tokens.push(token);
            }
        }
        if let Ok(origins) = std::env::var("ASKDB_ALLOWED_ORIGINS") {
            self.server.allowed_origins =
                origins.split(',').map(|s| s.trim().to_string()).collect();
        }
    }

    /// Reads the base64-encoded process encryption key from the environment.
    pub fn encryption_key() -> Result<String> {
        std::env::var(ENCRYPTION_KEY_ENV).map_err(|_| {
            AskError::config(format!(
                "{ENCRYPTION_KEY_ENV} not set; generate one with `openssl rand -base64 32`"
            ))
        })
    }
}
