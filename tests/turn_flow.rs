//! End-to-end turn flows against a seeded SQLite data source and the mock
//! provider. No network, no live servers.

use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use base64::engine::general_purpose::STANDARD as BASE64;
use base64::Engine;
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

use askdb::answer::ChartKind;
use askdb::chat::{ChatOrchestrator, DataSource, AiModel, Store, TurnRequest};
use askdb::config::Config;
use askdb::crypto::SecretCipher;
use askdb::db::{ConnectionRegistry, Dialect, SchemaLoader};
use askdb::error::AskError;
use askdb::knowledge::{Example, KnowledgeIndex, KnowledgeItem, Retriever, Term};
use askdb::llm::{
    Completion, LlmRouter, Message as LlmMessage, MockProvider, ModelProfile, ProviderClient,
    ProviderRegistry,
};

struct Harness {
    orchestrator: Arc<ChatOrchestrator>,
    store: Arc<Store>,
    session_id: Uuid,
    _dir: tempfile::TempDir,
}

async fn seed_source_db(path: &std::path::Path) {
    let pool = sqlx::sqlite::SqlitePoolOptions::new()
        .max_connections(1)
        .connect(&format!("sqlite:{}?mode=rwc", path.display()))
        .await
        .unwrap();

    sqlx::query(
        "CREATE TABLE orders (
            id INTEGER PRIMARY KEY,
            customer TEXT NOT NULL,
            region TEXT NOT NULL,
            amount REAL NOT NULL,
            order_date TEXT NOT NULL
        )",
    )
    .execute(&pool)
    .await
    .unwrap();

    let regions = ["north", "south", "east", "west", "central", "overseas"];
    for i in 0..60 {
        sqlx::query(
            "INSERT INTO orders (customer, region, amount, order_date) VALUES (?, ?, ?, ?)",
        )
        .bind(if i % 3 == 0 { "O'Brien" } else { "Chen" })
        .bind(regions[i % regions.len()])
        .bind(50.0 + i as f64)
        .bind(format!("2024-06-{:02}", (i % 28) + 1))
        .execute(&pool)
        .await
        .unwrap();
    }
    pool.close().await;
}

fn seed_knowledge(index: &KnowledgeIndex) {
    index.replace(vec![
        KnowledgeItem::Term(Term {
            id: Uuid::new_v4(),
            phrase: "销售额".into(),
            field: "amount".into(),
            table: Some("orders".into()),
            category: None,
        }),
        KnowledgeItem::Example(Example {
            id: Uuid::new_v4(),
            question: "各地区销售额排名".into(),
            sql: "SELECT region, SUM(amount) FROM orders GROUP BY region \
                  ORDER BY SUM(amount) DESC LIMIT 5"
                .into(),
            dialect: Some(Dialect::Sqlite),
            table: Some("orders".into()),
            chart_kind: Some(ChartKind::Bar),
        }),
        KnowledgeItem::Example(Example {
            id: Uuid::new_v4(),
            question: "本月销售额趋势".into(),
            sql: "SELECT order_date, SUM(amount) FROM orders GROUP BY order_date".into(),
            dialect: None,
            table: Some("orders".into()),
            chart_kind: Some(ChartKind::Line),
        }),
    ]);
}

/// Builds the whole pipeline around a custom mock provider.
async fn harness(build_mock: impl Fn() -> MockProvider + Send + Sync + 'static) -> Harness {
    let dir = tempfile::tempdir().unwrap();
    let db_path = dir.path().join("sales.db");
    seed_source_db(&db_path).await;

    let cipher = SecretCipher::from_base64_key(&BASE64.encode([0u8; 32])).unwrap();
    let store = Arc::new(Store::open("sqlite::memory:", cipher).await.unwrap());

    let source = store
        .create_data_source(
            DataSource {
                id: Uuid::new_v4(),
                name: "sales".into(),
                dialect: Dialect::Sqlite,
                host: None,
                port: None,
                database: Some(db_path.display().to_string()),
                username: None,
                password_cipher: None,
                charset: None,
                extra_params: BTreeMap::new(),
                active: true,
                owner: "u1".into(),
                deleted: false,
            },
            None,
        )
        .await
        .unwrap();

    store
        .save_ai_model(
            AiModel {
                id: Uuid::new_v4(),
                name: "default".into(),
                provider: "mock".into(),
                api_key_cipher: None,
                base_url: None,
                model_id: "mock-1".into(),
                max_tokens: 2048,
                temperature: 0.2,
                is_default: true,
                active: true,
                scene: None,
            },
            None,
        )
        .await
        .unwrap();

    let config = Config::default();
    let index = Arc::new(KnowledgeIndex::new());
    seed_knowledge(&index);

    let registry = Arc::new(ConnectionRegistry::new(store.clone(), config.pool));
    let schema_loader = Arc::new(SchemaLoader::new(
        registry.clone(),
        Duration::from_secs(60),
        Duration::from_secs(config.timeouts.schema_secs),
    ));
    let retriever = Arc::new(Retriever::new(index, None, config.retrieval));

    let mut providers = ProviderRegistry::new();
    providers.register("mock", move |_| Ok(Box::new(build_mock())));
    let router = Arc::new(LlmRouter::new(providers));

    let orchestrator = Arc::new(ChatOrchestrator::new(
        store.clone(),
        registry,
        schema_loader,
        retriever,
        router,
        config,
    ));

    let session = store
        .create_session("u1", "sales", source.id, vec!["orders".into()])
        .await
        .unwrap();

    Harness {
        orchestrator,
        store,
        session_id: session.id,
        _dir: dir,
    }
}

fn question_turn(session_id: Uuid, question: &str) -> TurnRequest {
    TurnRequest {
        session_id,
        question: question.to_string(),
        edited_sql: None,
    }
}

#[tokio::test]
async fn happy_path_top_regions() {
    let h = harness(MockProvider::new).await;

    let message = h
        .orchestrator
        .run_turn(
            question_turn(h.session_id, "本月各地区销售额前五"),
            CancellationToken::new(),
        )
        .await
        .unwrap();

    let sql = message.sql.as_deref().unwrap();
    assert!(sql.starts_with("SELECT"));
    assert!(sql.contains("GROUP BY region"));
    assert!(sql.to_uppercase().contains("DESC"));
    assert!(sql.contains("LIMIT 5"));

    assert_eq!(message.chart_kind, Some(ChartKind::Bar));
    assert!(message.error_text.is_none());

    let result = message.result.as_ref().unwrap();
    assert!(result.rows.len() <= 5);
    assert!(!message.recommended_questions.is_empty());
    assert!(message.tokens_used.is_some());
    assert!(message.latency_seconds.is_some());

    // The transcript holds exactly user then assistant.
    let (messages, total) = h.store.list_messages(h.session_id, 1, 10).await.unwrap();
    assert_eq!(total, 2);
    assert_eq!(messages[0].role, askdb::chat::MessageRole::User);
    assert_eq!(messages[1].role, askdb::chat::MessageRole::Assistant);
}

#[tokio::test]
async fn parameter_stays_bound_not_interpolated() {
    let h = harness(|| {
        MockProvider::new().with_response(
            "O'Brien",
            "```json\n{\"sql\": \"SELECT COUNT(*) AS cnt FROM orders WHERE customer = :customer\", \
             \"explanation\": \"Order count\", \"chartKind\": \"table\", \
             \"params\": {\"customer\": \"O'Brien\"}}\n```",
        )
    })
    .await;

    let message = h
        .orchestrator
        .run_turn(
            question_turn(h.session_id, "客户 O'Brien 的订单数"),
            CancellationToken::new(),
        )
        .await
        .unwrap();

    // The executed SQL carries a placeholder, not the literal.
    let sql = message.sql.as_deref().unwrap();
    assert!(sql.contains('?'));
    assert!(!sql.contains("O'Brien"));

    let result = message.result.as_ref().unwrap();
    assert_eq!(result.columns, vec!["cnt"]);
    assert_eq!(result.rows[0][0], askdb::db::Value::Int(20));
}

#[tokio::test]
async fn edit_and_retry_round_trip() {
    let h = harness(|| {
        MockProvider::new().with_response(
            "badcol",
            "```json\n{\"sql\": \"SELECT amt FROM orders\", \"explanation\": \"\"}\n```",
        )
    })
    .await;

    // First turn: the generated SQL references a column that is not there.
    let first = h
        .orchestrator
        .run_turn(
            question_turn(h.session_id, "show badcol"),
            CancellationToken::new(),
        )
        .await
        .unwrap();

    assert!(first.error_text.is_some());
    assert!(first.sql.as_deref().unwrap().contains("amt"));
    assert!(first.can_retry);
    assert!(first.result.is_none());

    // Second turn: the user asserts corrected SQL; it persists verbatim.
    let edited = "SELECT amount FROM orders LIMIT 10";
    let second = h
        .orchestrator
        .run_turn(
            TurnRequest {
                session_id: h.session_id,
                question: String::new(),
                edited_sql: Some(edited.to_string()),
            },
            CancellationToken::new(),
        )
        .await
        .unwrap();

    assert!(second.error_text.is_none());
    assert_eq!(second.sql.as_deref(), Some(edited));
    assert_eq!(second.result.as_ref().unwrap().rows.len(), 10);
}

#[tokio::test]
async fn non_read_sql_is_rejected_not_executed() {
    let h = harness(|| {
        MockProvider::new().with_response(
            "drop",
            "```json\n{\"sql\": \"DROP TABLE orders\", \"explanation\": \"\"}\n```",
        )
    })
    .await;

    let message = h
        .orchestrator
        .run_turn(
            question_turn(h.session_id, "please drop the table"),
            CancellationToken::new(),
        )
        .await
        .unwrap();

    assert!(message
        .error_text
        .as_deref()
        .unwrap()
        .contains("not read-only"));
    assert_eq!(message.sql.as_deref(), Some("DROP TABLE orders"));
    assert!(message.result.is_none());

    // The table survived.
    let again = h
        .orchestrator
        .run_turn(
            TurnRequest {
                session_id: h.session_id,
                question: String::new(),
                edited_sql: Some("SELECT COUNT(*) AS cnt FROM orders".to_string()),
            },
            CancellationToken::new(),
        )
        .await
        .unwrap();
    assert_eq!(
        again.result.as_ref().unwrap().rows[0][0],
        askdb::db::Value::Int(60)
    );
}

/// Provider that never returns; only cancellation ends the call.
struct HangingProvider;

#[async_trait]
impl ProviderClient for HangingProvider {
    async fn complete(&self, _messages: &[LlmMessage]) -> askdb::error::Result<Completion> {
        tokio::time::sleep(Duration::from_secs(3600)).await;
        unreachable!()
    }
}

#[tokio::test]
async fn cancellation_persists_cancelled_message_without_sql() {
    let dir = tempfile::tempdir().unwrap();
    let db_path = dir.path().join("sales.db");
    seed_source_db(&db_path).await;

    let cipher = SecretCipher::from_base64_key(&BASE64.encode([0u8; 32])).unwrap();
    let store = Arc::new(Store::open("sqlite::memory:", cipher).await.unwrap());
    let source = store
        .create_data_source(
            DataSource {
                id: Uuid::new_v4(),
                name: "sales".into(),
                dialect: Dialect::Sqlite,
                host: None,
                port: None,
                database: Some(db_path.display().to_string()),
                username: None,
                password_cipher: None,
                charset: None,
                extra_params: BTreeMap::new(),
                active: true,
                owner: "u1".into(),
                deleted: false,
            },
            None,
        )
        .await
        .unwrap();
    store
        .save_ai_model(
            AiModel {
                id: Uuid::new_v4(),
                name: "default".into(),
                provider: "mock".into(),
                api_key_cipher: None,
                base_url: None,
                model_id: "mock-1".into(),
                max_tokens: 2048,
                temperature: 0.2,
                is_default: true,
                active: true,
                scene: None,
            },
            None,
        )
        .await
        .unwrap();

    let config = Config::default();
    let registry = Arc::new(ConnectionRegistry::new(store.clone(), config.pool));
    let schema_loader = Arc::new(SchemaLoader::new(
        registry.clone(),
        Duration::from_secs(60),
        Duration::from_secs(config.timeouts.schema_secs),
    ));
    let retriever = Arc::new(Retriever::new(
        Arc::new(KnowledgeIndex::new()),
        None,
        config.retrieval,
    ));
    let mut providers = ProviderRegistry::new();
    providers.register("mock", |_profile: &ModelProfile| {
        Ok(Box::new(HangingProvider) as Box<dyn ProviderClient>)
    });
    let router = Arc::new(LlmRouter::new(providers));
    let orchestrator = Arc::new(ChatOrchestrator::new(
        store.clone(),
        registry,
        schema_loader,
        retriever,
        router,
        config,
    ));

    let session = store
        .create_session("u1", "s", source.id, vec!["orders".into()])
        .await
        .unwrap();

    let cancel = CancellationToken::new();
    let turn = {
        let orchestrator = orchestrator.clone();
        let cancel = cancel.clone();
        tokio::spawn(async move {
            orchestrator
                .run_turn(question_turn(session.id, "count everything"), cancel)
                .await
        })
    };

    tokio::time::sleep(Duration::from_millis(100)).await;
    cancel.cancel();

    let message = turn.await.unwrap().unwrap();
    assert_eq!(message.error_text.as_deref(), Some("cancelled"));
    assert!(message.sql.is_none());

    // The cancelled attempt still left a persisted transcript pair.
    let (messages, total) = store.list_messages(session.id, 1, 10).await.unwrap();
    assert_eq!(total, 2);
    assert_eq!(messages[1].error_text.as_deref(), Some("cancelled"));
}

#[tokio::test]
async fn concurrent_turns_one_busy_one_answered() {
    let h = harness(MockProvider::new).await;

    let a = {
        let orchestrator = h.orchestrator.clone();
        let session_id = h.session_id;
        tokio::spawn(async move {
            orchestrator
                .run_turn(
                    question_turn(session_id, "各地区销售额"),
                    CancellationToken::new(),
                )
                .await
        })
    };
    let b = {
        let orchestrator = h.orchestrator.clone();
        let session_id = h.session_id;
        tokio::spawn(async move {
            orchestrator
                .run_turn(
                    question_turn(session_id, "各地区销售额"),
                    CancellationToken::new(),
                )
                .await
        })
    };

    let (a, b) = (a.await.unwrap(), b.await.unwrap());
    let busy_count = [&a, &b]
        .iter()
        .filter(|r| matches!(r, Err(AskError::SessionBusy)))
        .count();
    let ok_count = [&a, &b].iter().filter(|r| r.is_ok()).count();

    // Either the turns overlapped (one busy) or they serialized cleanly.
    assert!(busy_count + ok_count == 2);
    assert!(ok_count >= 1);

    let (messages, _) = h.store.list_messages(h.session_id, 1, 20).await.unwrap();
    let assistants = messages
        .iter()
        .filter(|m| m.role == askdb::chat::MessageRole::Assistant)
        .count();
    assert_eq!(assistants, ok_count);
}

#[tokio::test]
async fn conversational_reply_without_sql() {
    let h = harness(MockProvider::new).await;

    let message = h
        .orchestrator
        .run_turn(
            question_turn(h.session_id, "what is the meaning of life?"),
            CancellationToken::new(),
        )
        .await
        .unwrap();

    assert!(message.sql.is_none());
    assert!(message.result.is_none());
    assert!(message.error_text.is_none());
    assert!(message.content.contains("rephrase"));
}

#[tokio::test]
async fn unknown_session_is_invalid_request() {
    let h = harness(MockProvider::new).await;

    let err = h
        .orchestrator
        .run_turn(
            question_turn(Uuid::new_v4(), "anything"),
            CancellationToken::new(),
        )
        .await
        .unwrap_err();

    assert!(matches!(err, AskError::InvalidRequest(_)));
}

#[tokio::test]
async fn result_snapshot_is_bounded() {
    let h = harness(|| {
        MockProvider::new().with_response(
            "everything",
            "```json\n{\"sql\": \"SELECT id, customer FROM orders\", \"explanation\": \"\", \
             \"chartKind\": \"table\"}\n```",
        )
    })
    .await;

    let message = h
        .orchestrator
        .run_turn(
            question_turn(h.session_id, "show everything"),
            CancellationToken::new(),
        )
        .await
        .unwrap();

    let snapshot = message.result.as_ref().unwrap();
    assert!(snapshot.rows.len() <= askdb::chat::RESULT_SAMPLE_ROWS);
    assert_eq!(snapshot.total_rows, Some(60));
}
