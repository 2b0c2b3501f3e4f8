//! Conversational domain model: sessions, messages, data sources, models.

mod migrations;
pub mod orchestrator;
pub mod store;

pub use orchestrator::{ChatOrchestrator, TurnRequest};
pub use store::Store;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use uuid::Uuid;

use crate::answer::{ChartConfig, ChartKind};
use crate::db::{Dialect, Value};

/// Rows of an executed result kept on the message for transcript display.
pub const RESULT_SAMPLE_ROWS: usize = 50;

/// Session lifecycle status.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SessionStatus {
    Active,
    Archived,
}

impl SessionStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Active => "active",
            Self::Archived => "archived",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "active" => Some(Self::Active),
            "archived" => Some(Self::Archived),
            _ => None,
        }
    }
}

/// A conversation pinned to one data source and a fixed set of tables.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Session {
    pub id: Uuid,
    pub user_id: String,
    pub title: String,
    pub data_source_id: Uuid,
    /// Ordered and immutable for the session's lifetime.
    pub selected_tables: Vec<String>,
    pub status: SessionStatus,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

/// Message author role.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum MessageRole {
    User,
    Assistant,
}

impl MessageRole {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::User => "user",
            Self::Assistant => "assistant",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "user" => Some(Self::User),
            "assistant" => Some(Self::Assistant),
            _ => None,
        }
    }
}

/// A bounded snapshot of an executed result, persisted with the message.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ResultSnapshot {
    pub columns: Vec<String>,
    pub rows: Vec<Vec<Value>>,
    pub total_rows: Option<u64>,
    pub truncated: bool,
}

/// One transcript entry. Append-only; only `chart_kind` may change later.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Message {
    pub id: Uuid,
    pub session_id: Uuid,
    pub role: MessageRole,
    pub content: String,
    /// Generated or edited SQL (assistant messages only).
    pub sql: Option<String>,
    pub result: Option<ResultSnapshot>,
    pub chart_config: Option<ChartConfig>,
    pub chart_kind: Option<ChartKind>,
    pub error_text: Option<String>,
    pub tokens_used: Option<i64>,
    pub latency_seconds: Option<f64>,
    pub recommended_questions: Vec<String>,
    pub contains_complex_sql: bool,
    /// The client may resubmit with edited SQL.
    pub can_retry: bool,
    pub created_at: DateTime<Utc>,
}

impl Message {
    /// A bare user message for a question.
    pub fn user(session_id: Uuid, content: impl Into<String>) -> Self {
        Self {
            id: Uuid::new_v4(),
            session_id,
            role: MessageRole::User,
            content: content.into(),
            sql: None,
            result: None,
            chart_config: None,
            chart_kind: None,
            error_text: None,
            tokens_used: None,
            latency_seconds: None,
            recommended_questions: Vec::new(),
            contains_complex_sql: false,
            can_retry: false,
            created_at: Utc::now(),
        }
    }

    /// An empty assistant message to be filled by the turn.
    pub fn assistant(session_id: Uuid) -> Self {
        Self {
            role: MessageRole::Assistant,
            ..Self::user(session_id, "")
        }
    }
}

/// A user-configured database connection. The password is stored
/// enciphered and only decrypted on the way into a driver.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DataSource {
    pub id: Uuid,
    pub name: String,
    pub dialect: Dialect,
    pub host: Option<String>,
    pub port: Option<u16>,
    pub database: Option<String>,
    pub username: Option<String>,
    /// Sealed by the process cipher; never serialized outward.
    #[serde(skip_serializing)]
    pub password_cipher: Option<String>,
    pub charset: Option<String>,
    pub extra_params: BTreeMap<String, String>,
    pub active: bool,
    pub owner: String,
    pub deleted: bool,
}

/// A configured model. Exactly one row is the default whenever any exist.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AiModel {
    pub id: Uuid,
    pub name: String,
    pub provider: String,
    /// Sealed by the process cipher; never serialized outward.
    #[serde(skip_serializing)]
    pub api_key_cipher: Option<String>,
    pub base_url: Option<String>,
    pub model_id: String,
    pub max_tokens: u32,
    pub temperature: f32,
    pub is_default: bool,
    pub active: bool,
    pub scene: Option<String>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_message_constructors() {
        let session_id = Uuid::new_v4();
        let user = Message::user(session_id, "how many orders?");
        assert_eq!(user.role, MessageRole::User);
        assert!(user.sql.is_none());

        let assistant = Message::assistant(session_id);
        assert_eq!(assistant.role, MessageRole::Assistant);
        assert!(assistant.content.is_empty());
    }

    #[test]
    fn test_status_round_trip() {
        assert_eq!(
            SessionStatus::parse(SessionStatus::Active.as_str()),
            Some(SessionStatus::Active)
        );
        assert_eq!(SessionStatus::parse("nope"), None);
    }

    #[test]
    fn test_data_source_password_not_serialized() {
        let source = DataSource {
            id: Uuid::new_v4(),
            name: "sales".into(),
            dialect: Dialect::MySql,
            host: Some("db".into()),
            port: Some(3306),
            database: Some("sales".into()),
            username: Some("reader".into()),
            password_cipher: Some("sealed-bytes".into()),
            charset: None,
            extra_params: BTreeMap::new(),
            active: true,
            owner: "u1".into(),
            deleted: false,
        };
        let json = serde_json::to_string(&source).unwrap();
        assert!(!json.contains("sealed-bytes"));
        assert!(!json.contains("password"));
    }

    #[test]
    fn test_ai_model_key_not_serialized() {
        let model = AiModel {
            id: Uuid::new_v4(),
            name: "default".into(),
            provider: "openai".into(),
            api_key_cipher: Some("sealed-key".into()),
            base_url: None,
            model_id: "gpt-4o".into(),
            max_tokens: 2048,
            temperature: 0.2,
            is_default: true,
            active: true,
            scene: None,
        };
        let json = serde_json::to_string(&model).unwrap();
        assert!(!json.contains("sealed-key"));
        assert!(!json.contains("api_key"));
    }
}
