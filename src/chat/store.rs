//! Self-storage for sessions, messages, data sources, models and knowledge.
//!
//! Backed by SQLite through sqlx. JSON columns hold the bags (selected
//! tables, chart config, result snapshots). Secrets are sealed by the
//! process cipher before they reach a row and unsealed just-in-time on the
//! way into a driver or provider.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use sqlx::sqlite::{SqliteConnectOptions, SqlitePool, SqlitePoolOptions};
use sqlx::Row as _;
use std::str::FromStr;
use std::time::Duration;
use tracing::info;
use uuid::Uuid;

use crate::answer::{ChartConfig, ChartKind};
use crate::chat::{
    migrations, AiModel, DataSource, Message, MessageRole, ResultSnapshot, Session, SessionStatus,
};
use crate::crypto::SecretCipher;
use crate::db::registry::SourceResolver;
use crate::db::{Dialect, SourceConfig};
use crate::error::{AskError, Result};
use crate::knowledge::KnowledgeItem;
use crate::llm::ModelProfile;

/// Filters for session listing.
#[derive(Debug, Clone, Default)]
pub struct SessionFilter {
    pub keyword: Option<String>,
    pub data_source_id: Option<Uuid>,
    pub from: Option<DateTime<Utc>>,
    pub to: Option<DateTime<Utc>>,
    pub page: u32,
    pub page_size: u32,
}

impl SessionFilter {
    fn page_size(&self) -> u32 {
        self.page_size.clamp(1, 100)
    }

    fn offset(&self) -> u32 {
        self.page.saturating_sub(1) * self.page_size()
    }
}

/// The self-storage store.
pub struct Store {
    pool: SqlitePool,
    cipher: SecretCipher,
}

impl Store {
    /// Opens (or creates) the store at the given DSN and runs migrations.
    pub async fn open(dsn: &str, cipher: SecretCipher) -> Result<Self> {
        let options = SqliteConnectOptions::from_str(dsn)
            .map_err(|e| AskError::store(format!("Invalid store DSN: {e}")))?
            .busy_timeout(Duration::from_secs(5))
            .foreign_keys(true)
            .create_if_missing(true);

        let pool = SqlitePoolOptions::new()
            .max_connections(1)
            .acquire_timeout(Duration::from_secs(10))
            .connect_with(options)
            .await
            .map_err(|e| AskError::store(format!("Failed to open store: {e}")))?;

        migrations::run_migrations(&pool).await?;
        info!("Self-storage ready at {dsn}");

        Ok(Self { pool, cipher })
    }

    /// Returns the underlying pool. Useful for tests.
    pub fn pool(&self) -> &SqlitePool {
        &self.pool
    }

    // --- sessions ---

    /// Creates a session pinned to a data source and table set.
    pub async fn create_session(
        &self,
        user_id: &str,
        title: &str,
        data_source_id: Uuid,
        selected_tables: Vec<String>,
    ) -> Result<Session> {
        let now = Utc::now();
        let session = Session {
            id: Uuid::new_v4(),
            user_id: user_id.to_string(),
            title: title.to_string(),
            data_source_id,
            selected_tables,
            status: SessionStatus::Active,
            created_at: now,
            updated_at: now,
        };

        sqlx::query(
            "INSERT INTO sessions \
             (id, user_id, title, data_source_id, selected_tables, status, created_at, updated_at) \
             VALUES (?, ?, ?, ?, ?, ?, ?, ?)",
        )
        .bind(session.id.to_string())
        .bind(&session.user_id)
        .bind(&session.title)
        .bind(session.data_source_id.to_string())
        .bind(serde_json::to_string(&session.selected_tables).unwrap_or_default())
        .bind(session.status.as_str())
        .bind(now.to_rfc3339())
        .bind(now.to_rfc3339())
        .execute(&self.pool)
        .await?;

        Ok(session)
    }

    /// Fetches a session by id.
    pub async fn get_session(&self, id: Uuid) -> Result<Option<Session>> {
        let row = sqlx::query("SELECT * FROM sessions WHERE id = ?")
            .bind(id.to_string())
            .fetch_optional(&self.pool)
            .await?;

        row.map(|r| session_from_row(&r)).transpose()
    }

    /// Lists sessions for a user with pagination and filters. Returns the
    /// page plus the total match count.
    pub async fn list_sessions(
        &self,
        user_id: &str,
        filter: &SessionFilter,
    ) -> Result<(Vec<Session>, u64)> {
        let mut conditions = vec!["user_id = ?".to_string()];
        if filter.keyword.is_some() {
            conditions.push("title LIKE ?".to_string());
        }
        if filter.data_source_id.is_some() {
            conditions.push("data_source_id = ?".to_string());
        }
        if filter.from.is_some() {
            conditions.push("created_at >= ?".to_string());
        }
        if filter.to.is_some() {
            conditions.push("created_at <= ?".to_string());
        }
        let where_clause = conditions.join(" AND ");

        let count_sql = format!("SELECT COUNT(*) AS n FROM sessions WHERE {where_clause}");
        let total: i64 = bind_session_filters(sqlx::query(&count_sql), user_id, filter)
            .fetch_one(&self.pool)
            .await?
            .try_get("n")?;

        let page_sql = format!(
            "SELECT * FROM sessions WHERE {where_clause} \
             ORDER BY updated_at DESC LIMIT {} OFFSET {}",
            filter.page_size(),
            filter.offset()
        );
        let rows = bind_session_filters(sqlx::query(&page_sql), user_id, filter)
            .fetch_all(&self.pool)
            .await?;

        let sessions = rows
            .iter()
            .map(session_from_row)
            .collect::<Result<Vec<_>>>()?;
        Ok((sessions, total as u64))
    }

    /// Renames and/or archives a session. Selected tables stay immutable.
    pub async fn update_session(
        &self,
        id: Uuid,
        title: Option<&str>,
        status: Option<SessionStatus>,
    ) -> Result<Session> {
        let mut session = self
            .get_session(id)
            .await?
            .ok_or_else(|| AskError::invalid(format!("Unknown session: {id}")))?;

        if let Some(title) = title {
            session.title = title.to_string();
        }
        if let Some(status) = status {
            session.status = status;
        }
        session.updated_at = Utc::now();

        sqlx::query("UPDATE sessions SET title = ?, status = ?, updated_at = ? WHERE id = ?")
            .bind(&session.title)
            .bind(session.status.as_str())
            .bind(session.updated_at.to_rfc3339())
            .bind(id.to_string())
            .execute(&self.pool)
            .await?;

        Ok(session)
    }

    /// Touches a session's updated_at, bumping it in listings.
    pub async fn touch_session(&self, id: Uuid) -> Result<()> {
        sqlx::query("UPDATE sessions SET updated_at = ? WHERE id = ?")
            .bind(Utc::now().to_rfc3339())
            .bind(id.to_string())
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    /// Deletes a session and exactly its messages.
    pub async fn delete_session(&self, id: Uuid) -> Result<()> {
        let mut tx = self.pool.begin().await?;
        sqlx::query("DELETE FROM messages WHERE session_id = ?")
            .bind(id.to_string())
            .execute(&mut *tx)
            .await?;
        sqlx::query("DELETE FROM sessions WHERE id = ?")
            .bind(id.to_string())
            .execute(&mut *tx)
            .await?;
        tx.commit().await?;
        Ok(())
    }

    // --- messages ---

    /// Appends a message. An assistant message must follow at least one
    /// user message in the same session.
    pub async fn insert_message(&self, message: &Message) -> Result<()> {
        if message.role == MessageRole::Assistant {
            let users: i64 = sqlx::query(
                "SELECT COUNT(*) AS n FROM messages WHERE session_id = ? AND role = 'user'",
            )
            .bind(message.session_id.to_string())
            .fetch_one(&self.pool)
            .await?
            .try_get("n")?;
            if users == 0 {
                return Err(AskError::internal(
                    "assistant message without a preceding user message",
                ));
            }
        }

        sqlx::query(
            "INSERT INTO messages \
             (id, session_id, role, content, sql_text, result_json, chart_config, chart_kind, \
              error_text, tokens_used, latency_seconds, recommended_questions, \
              contains_complex_sql, can_retry, created_at) \
             VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?)",
        )
        .bind(message.id.to_string())
        .bind(message.session_id.to_string())
        .bind(message.role.as_str())
        .bind(&message.content)
        .bind(&message.sql)
        .bind(
            message
                .result
                .as_ref()
                .map(|r| serde_json::to_string(r).unwrap_or_default()),
        )
        .bind(
            message
                .chart_config
                .as_ref()
                .map(|c| serde_json::to_string(c).unwrap_or_default()),
        )
        .bind(message.chart_kind.map(|k| k.as_str().to_string()))
        .bind(&message.error_text)
        .bind(message.tokens_used)
        .bind(message.latency_seconds)
        .bind(serde_json::to_string(&message.recommended_questions).unwrap_or_default())
        .bind(message.contains_complex_sql as i64)
        .bind(message.can_retry as i64)
        .bind(message.created_at.to_rfc3339())
        .execute(&self.pool)
        .await?;

        Ok(())
    }

    /// Paginated transcript, oldest first.
    pub async fn list_messages(
        &self,
        session_id: Uuid,
        page: u32,
        page_size: u32,
    ) -> Result<(Vec<Message>, u64)> {
        let page_size = page_size.clamp(1, 200);
        let offset = page.saturating_sub(1) * page_size;

        let total: i64 = sqlx::query("SELECT COUNT(*) AS n FROM messages WHERE session_id = ?")
            .bind(session_id.to_string())
            .fetch_one(&self.pool)
            .await?
            .try_get("n")?;

        let rows = sqlx::query(&format!(
            "SELECT * FROM messages WHERE session_id = ? \
             ORDER BY created_at ASC, id ASC LIMIT {page_size} OFFSET {offset}"
        ))
        .bind(session_id.to_string())
        .fetch_all(&self.pool)
        .await?;

        let messages = rows
            .iter()
            .map(message_from_row)
            .collect::<Result<Vec<_>>>()?;
        Ok((messages, total as u64))
    }

    /// The last `limit` messages of a session, oldest first. Feeds the
    /// transcript window for the prompt.
    pub async fn recent_messages(&self, session_id: Uuid, limit: usize) -> Result<Vec<Message>> {
        let rows = sqlx::query(&format!(
            "SELECT * FROM messages WHERE session_id = ? \
             ORDER BY created_at DESC, id DESC LIMIT {limit}"
        ))
        .bind(session_id.to_string())
        .fetch_all(&self.pool)
        .await?;

        let mut messages = rows
            .iter()
            .map(message_from_row)
            .collect::<Result<Vec<_>>>()?;
        messages.reverse();
        Ok(messages)
    }

    /// The one post-creation mutation a message allows.
    pub async fn update_chart_kind(&self, message_id: Uuid, kind: ChartKind) -> Result<()> {
        sqlx::query("UPDATE messages SET chart_kind = ? WHERE id = ?")
            .bind(kind.as_str())
            .bind(message_id.to_string())
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    // --- data sources ---

    /// Stores a data source, sealing the password.
    pub async fn create_data_source(
        &self,
        mut source: DataSource,
        password: Option<&str>,
    ) -> Result<DataSource> {
        source.password_cipher = password.map(|p| self.cipher.seal(p)).transpose()?;
        let now = Utc::now().to_rfc3339();

        sqlx::query(
            "INSERT INTO data_sources \
             (id, name, dialect, host, port, db_name, username, password_cipher, charset, \
              extra_params, active, owner, deleted, created_at, updated_at) \
             VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?)",
        )
        .bind(source.id.to_string())
        .bind(&source.name)
        .bind(source.dialect.as_str())
        .bind(&source.host)
        .bind(source.port.map(|p| p as i64))
        .bind(&source.database)
        .bind(&source.username)
        .bind(&source.password_cipher)
        .bind(&source.charset)
        .bind(serde_json::to_string(&source.extra_params).unwrap_or_default())
        .bind(source.active as i64)
        .bind(&source.owner)
        .bind(source.deleted as i64)
        .bind(&now)
        .bind(&now)
        .execute(&self.pool)
        .await?;

        Ok(source)
    }

    /// Fetches a data source by id, deleted ones included.
    pub async fn get_data_source(&self, id: Uuid) -> Result<Option<DataSource>> {
        let row = sqlx::query("SELECT * FROM data_sources WHERE id = ?")
            .bind(id.to_string())
            .fetch_optional(&self.pool)
            .await?;
        row.map(|r| data_source_from_row(&r)).transpose()
    }

    /// Soft-deletes a data source. A source referenced by a session is
    /// never hard-deleted.
    pub async fn soft_delete_data_source(&self, id: Uuid) -> Result<()> {
        sqlx::query("UPDATE data_sources SET deleted = 1, active = 0, updated_at = ? WHERE id = ?")
            .bind(Utc::now().to_rfc3339())
            .bind(id.to_string())
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    // --- AI models ---

    /// Stores a model, sealing the API key and keeping the default flag
    /// unique. The first model becomes the default regardless.
    pub async fn save_ai_model(&self, mut model: AiModel, api_key: Option<&str>) -> Result<AiModel> {
        model.api_key_cipher = api_key.map(|k| self.cipher.seal(k)).transpose()?;

        let mut tx = self.pool.begin().await?;

        let existing: i64 = sqlx::query("SELECT COUNT(*) AS n FROM ai_models")
            .fetch_one(&mut *tx)
            .await?
            .try_get("n")?;
        if existing == 0 {
            model.is_default = true;
        }

        if model.is_default {
            sqlx::query("UPDATE ai_models SET is_default = 0")
                .execute(&mut *tx)
                .await?;
        }

        sqlx::query(
            "INSERT INTO ai_models \
             (id, name, provider, api_key_cipher, base_url, model_id, max_tokens, temperature, \
              is_default, active, scene, created_at) \
             VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?) \
             ON CONFLICT(id) DO UPDATE SET \
               name = excluded.name, provider = excluded.provider, \
               api_key_cipher = COALESCE(excluded.api_key_cipher, ai_models.api_key_cipher), \
               base_url = excluded.base_url, model_id = excluded.model_id, \
               max_tokens = excluded.max_tokens, temperature = excluded.temperature, \
               is_default = excluded.is_default, active = excluded.active, scene = excluded.scene",
        )
        .bind(model.id.to_string())
        .bind(&model.name)
        .bind(&model.provider)
        .bind(&model.api_key_cipher)
        .bind(&model.base_url)
        .bind(&model.model_id)
        .bind(model.max_tokens as i64)
        .bind(model.temperature as f64)
        .bind(model.is_default as i64)
        .bind(model.active as i64)
        .bind(&model.scene)
        .bind(Utc::now().to_rfc3339())
        .execute(&mut *tx)
        .await?;

        tx.commit().await?;
        Ok(model)
    }

    /// Returns the active default model.
    pub async fn default_model(&self) -> Result<AiModel> {
        let row = sqlx::query("SELECT * FROM ai_models WHERE is_default = 1 AND active = 1")
            .fetch_optional(&self.pool)
            .await?;
        match row {
            Some(r) => ai_model_from_row(&r),
            None => Err(AskError::ModelUnavailable(
                "no active default model configured".to_string(),
            )),
        }
    }

    /// Count of rows with the default flag. Used by invariant tests.
    pub async fn default_model_count(&self) -> Result<i64> {
        let n: i64 = sqlx::query("SELECT COUNT(*) AS n FROM ai_models WHERE is_default = 1")
            .fetch_one(&self.pool)
            .await?
            .try_get("n")?;
        Ok(n)
    }

    /// Builds the runtime profile for a model, unsealing the key.
    pub fn model_profile(&self, model: &AiModel, attempt_timeout_secs: u64) -> Result<ModelProfile> {
        let api_key = match &model.api_key_cipher {
            Some(sealed) => self.cipher.open(sealed)?,
            None => String::new(),
        };

        Ok(ModelProfile {
            provider: model.provider.clone(),
            model: model.model_id.clone(),
            api_key,
            base_url: model.base_url.clone(),
            max_tokens: model.max_tokens,
            temperature: model.temperature,
            timeout_secs: attempt_timeout_secs,
        })
    }

    // --- knowledge ---

    /// Stores one knowledge item as its JSON body plus a kind tag.
    pub async fn insert_knowledge(&self, item: &KnowledgeItem) -> Result<()> {
        sqlx::query(
            "INSERT OR REPLACE INTO knowledge_items (id, kind, body, created_at) \
             VALUES (?, ?, ?, ?)",
        )
        .bind(item.id().to_string())
        .bind(item.kind())
        .bind(serde_json::to_string(item).map_err(|e| AskError::store(e.to_string()))?)
        .bind(Utc::now().to_rfc3339())
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    /// Loads the whole knowledge base for the in-memory index.
    pub async fn load_knowledge(&self) -> Result<Vec<KnowledgeItem>> {
        let rows = sqlx::query("SELECT body FROM knowledge_items ORDER BY created_at ASC")
            .fetch_all(&self.pool)
            .await?;

        rows.iter()
            .map(|r| {
                let body: String = r.try_get("body")?;
                serde_json::from_str(&body)
                    .map_err(|e| AskError::store(format!("Corrupt knowledge item: {e}")))
            })
            .collect()
    }
}

#[async_trait]
impl SourceResolver for Store {
    async fn resolve(&self, data_source_id: Uuid) -> Result<SourceConfig> {
        let source = self
            .get_data_source(data_source_id)
            .await?
            .filter(|s| !s.deleted && s.active)
            .ok_or_else(|| AskError::invalid(format!("Unknown data source: {data_source_id}")))?;

        let password = source
            .password_cipher
            .as_deref()
            .map(|sealed| self.cipher.open(sealed))
            .transpose()?;

        Ok(SourceConfig {
            dialect: Some(source.dialect),
            host: source.host,
            port: source.port,
            database: source.database,
            username: source.username,
            password,
            charset: source.charset,
            extra_params: source.extra_params,
        })
    }
}

type SqliteQuery<'q> =
    sqlx::query::Query<'q, sqlx::Sqlite, sqlx::sqlite::SqliteArguments<'q>>;

/// Binds the session-listing filters in the order the WHERE clause names
/// them.
fn bind_session_filters<'q>(
    mut q: SqliteQuery<'q>,
    user_id: &str,
    filter: &SessionFilter,
) -> SqliteQuery<'q> {
    q = q.bind(user_id.to_string());
    if let Some(keyword) = &filter.keyword {
        q = q.bind(format!("%{keyword}%"));
    }
    if let Some(id) = filter.data_source_id {
        q = q.bind(id.to_string());
    }
    if let Some(from) = filter.from {
        q = q.bind(from.to_rfc3339());
    }
    if let Some(to) = filter.to {
        q = q.bind(to.to_rfc3339());
    }
    q
}

// --- row mapping ---

fn parse_timestamp(raw: &str) -> Result<DateTime<Utc>> {
    DateTime::parse_from_rfc3339(raw)
        .map(|d| d.with_timezone(&Utc))
        .map_err(|e| AskError::store(format!("Bad timestamp '{raw}': {e}")))
}

fn parse_uuid(raw: &str) -> Result<Uuid> {
    Uuid::parse_str(raw).map_err(|e| AskError::store(format!("Bad uuid '{raw}': {e}")))
}

fn session_from_row(row: &sqlx::sqlite::SqliteRow) -> Result<Session> {
    let status_raw: String = row.try_get("status")?;
    Ok(Session {
        id: parse_uuid(&row.try_get::<String, _>("id")?)?,
        user_id: row.try_get("user_id")?,
        title: row.try_get("title")?,
        data_source_id: parse_uuid(&row.try_get::<String, _>("data_source_id")?)?,
        selected_tables: serde_json::from_str(&row.try_get::<String, _>("selected_tables")?)
            .unwrap_or_default(),
        status: SessionStatus::parse(&status_raw)
            .ok_or_else(|| AskError::store(format!("Bad session status '{status_raw}'")))?,
        created_at: parse_timestamp(&row.try_get::<String, _>("created_at")?)?,
        updated_at: parse_timestamp(&row.try_get::<String, _>("updated_at")?)?,
    })
}

fn message_from_row(row: &sqlx::sqlite::SqliteRow) -> Result<Message> {
    let role_raw: String = row.try_get("role")?;
    let result: Option<ResultSnapshot> = row
        .try_get::<Option<String>, _>("result_json")?
        .and_then(|s| serde_json::from_str(&s).ok());
    let chart_config: Option<ChartConfig> = row
        .try_get::<Option<String>, _>("chart_config")?
        .and_then(|s| serde_json::from_str(&s).ok());
    let chart_kind: Option<ChartKind> = row
        .try_get::<Option<String>, _>("chart_kind")?
        .and_then(|s| s.parse().ok());

    Ok(Message {
        id: parse_uuid(&row.try_get::<String, _>("id")?)?,
        session_id: parse_uuid(&row.try_get::<String, _>("session_id")?)?,
        role: MessageRole::parse(&role_raw)
            .ok_or_else(|| AskError::store(format!("Bad message role '{role_raw}'")))?,
        content: row.try_get("content")?,
        sql: row.try_get("sql_text")?,
        result,
        chart_config,
        chart_kind,
        error_text: row.try_get("error_text")?,
        tokens_used: row.try_get("tokens_used")?,
        latency_seconds: row.try_get("latency_seconds")?,
        recommended_questions: serde_json::from_str(
            &row.try_get::<String, _>("recommended_questions")?,
        )
        .unwrap_or_default(),
        contains_complex_sql: row.try_get::<i64, _>("contains_complex_sql")? != 0,
        can_retry: row.try_get::<i64, _>("can_retry")? != 0,
        created_at: parse_timestamp(&row.try_get::<String, _>("created_at")?)?,
    })
}

fn data_source_from_row(row: &sqlx::sqlite::SqliteRow) -> Result<DataSource> {
    let dialect_raw: String = row.try_get("dialect")?;
    Ok(DataSource {
        id: parse_uuid(&row.try_get::<String, _>("id")?)?,
        name: row.try_get("name")?,
        dialect: dialect_raw
            .parse::<Dialect>()
            .map_err(AskError::Store)?,
        host: row.try_get("host")?,
        port: row.try_get::<Option<i64>, _>("port")?.map(|p| p as u16),
        database: row.try_get("db_name")?,
        username: row.try_get("username")?,
        password_cipher: row.try_get("password_cipher")?,
        charset: row.try_get("charset")?,
        extra_params: serde_json::from_str(&row.try_get::<String, _>("extra_params")?)
            .unwrap_or_default(),
        active: row.try_get::<i64, _>("active")? != 0,
        owner: row.try_get("owner")?,
        deleted: row.try_get::<i64, _>("deleted")? != 0,
    })
}

fn ai_model_from_row(row: &sqlx::sqlite::SqliteRow) -> Result<AiModel> {
    Ok(AiModel {
        id: parse_uuid(&row.try_get::<String, _>("id")?)?,
        name: row.try_get("name")?,
        provider: row.try_get("provider")?,
        api_key_cipher: row.try_get("api_key_cipher")?,
        base_url: row.try_get("base_url")?,
        model_id: row.try_get("model_id")?,
        max_tokens: row.try_get::<i64, _>("max_tokens")? as u32,
        temperature: row.try_get::<f64, _>("temperature")? as f32,
        is_default: row.try_get::<i64, _>("is_default")? != 0,
        active: row.try_get::<i64, _>("active")? != 0,
        scene: row.try_get("scene")?,
    })
}

#[cfg(test)]
pub(crate) async fn memory_store() -> Store {
    use base64::engine::general_purpose::STANDARD as BASE64;
    use base64::Engine;
    let cipher = SecretCipher::from_base64_key(&BASE64.encode([0u8; 32])).unwrap();
    Store::open("sqlite::memory:", cipher).await.unwrap()
}
