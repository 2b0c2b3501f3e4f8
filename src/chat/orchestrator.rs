//! The per-turn state machine.
//!
//! One instance serves the whole process; each user message runs
//! Received → Retrieving → Composing → Calling → Validating → Executing →
//! Shaping → Answered, with failures surfaced on the persisted assistant
//! message so the user can edit the SQL or refine the question. Turns
//! within one session serialize through a per-session mutex; a second turn
//! arriving while one is in flight is rejected with *SessionBusy*.

use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};
use uuid::Uuid;

use crate::answer::{self, ChartKind, ParsedReply};
use crate::chat::{Message, ResultSnapshot, Session, Store, RESULT_SAMPLE_ROWS};
use crate::config::Config;
use crate::db::executor::{self, ExecuteOptions};
use crate::db::{ConnectionRegistry, QueryResult, SchemaLoader, Value};
use crate::error::{AskError, Result};
use crate::knowledge::{RetrievalBundle, Retriever};
use crate::llm::{compose, HistoryTurn, LlmRouter, PromptInputs, RouterOptions};
use crate::sqlguard;

/// Follow-up questions returned with a successful answer.
const RECOMMENDED_QUESTIONS: usize = 5;

/// One user turn as submitted by the client.
#[derive(Debug, Clone)]
pub struct TurnRequest {
    pub session_id: Uuid,
    pub question: String,
    /// When present, the user is asserting the SQL: retrieval and the
    /// model are skipped and the text goes straight to validation.
    pub edited_sql: Option<String>,
}

/// Drives the ask-to-answer pipeline.
pub struct ChatOrchestrator {
    store: Arc<Store>,
    registry: Arc<ConnectionRegistry>,
    schema_loader: Arc<SchemaLoader>,
    retriever: Arc<Retriever>,
    router: Arc<LlmRouter>,
    config: Config,
    session_locks: Mutex<HashMap<Uuid, Arc<tokio::sync::Mutex<()>>>>,
}

impl ChatOrchestrator {
    pub fn new(
        store: Arc<Store>,
        registry: Arc<ConnectionRegistry>,
        schema_loader: Arc<SchemaLoader>,
        retriever: Arc<Retriever>,
        router: Arc<LlmRouter>,
        config: Config,
    ) -> Self {
        Self {
            store,
            registry,
            schema_loader,
            retriever,
            router,
            config,
            session_locks: Mutex::new(HashMap::new()),
        }
    }

    /// Runs one turn to completion and returns the persisted assistant
    /// message. The cancellation token aborts the model call and the SQL
    /// execution; the in-progress message is then persisted as cancelled.
    pub async fn run_turn(
        &self,
        request: TurnRequest,
        cancel: CancellationToken,
    ) -> Result<Message> {
        let session = self
            .store
            .get_session(request.session_id)
            .await?
            .ok_or_else(|| {
                AskError::invalid(format!("Unknown session: {}", request.session_id))
            })?;

        if request.question.trim().is_empty() && request.edited_sql.is_none() {
            return Err(AskError::invalid("Question must not be empty"));
        }

        let lock = {
            let mut locks = self.session_locks.lock().expect("session locks poisoned");
            locks
                .entry(session.id)
                .or_insert_with(|| Arc::new(tokio::sync::Mutex::new(())))
                .clone()
        };
        let _guard = lock.try_lock_owned().map_err(|_| AskError::SessionBusy)?;

        // History is captured before the new user message lands so the
        // prompt does not echo the current question.
        let history = self.load_history(session.id).await?;

        let user_content = if request.question.trim().is_empty() {
            request.edited_sql.clone().unwrap_or_default()
        } else {
            request.question.clone()
        };
        self.store
            .insert_message(&Message::user(session.id, user_content))
            .await?;

        let turn_budget = Duration::from_secs(self.config.timeouts.turn_secs);
        let started = Instant::now();

        let outcome = tokio::time::timeout(
            turn_budget,
            self.turn_body(&session, &request, history, &cancel, started),
        )
        .await;

        let message = match outcome {
            Ok(message) => message?,
            Err(_) => {
                let mut failed = Message::assistant(session.id);
                failed.error_text = Some(format!(
                    "turn exceeded the {}s ceiling",
                    turn_budget.as_secs()
                ));
                failed.latency_seconds = Some(started.elapsed().as_secs_f64());
                failed
            }
        };

        self.store.insert_message(&message).await?;
        self.store.touch_session(session.id).await?;

        info!(
            session = %session.id,
            cancelled = cancel.is_cancelled(),
            error = message.error_text.as_deref().unwrap_or("none"),
            latency_s = message.latency_seconds.unwrap_or_default(),
            "Turn finished"
        );

        Ok(message)
    }

    /// Everything between the user message and the persisted reply. Always
    /// yields a message; failures land in its error fields.
    async fn turn_body(
        &self,
        session: &Session,
        request: &TurnRequest,
        history: Vec<HistoryTurn>,
        cancel: &CancellationToken,
        started: Instant,
    ) -> Result<Message> {
        let mut message = Message::assistant(session.id);

        let reply = if let Some(edited) = &request.edited_sql {
            // The user asserts this SQL verbatim.
            ParsedReply {
                sql: Some(edited.clone()),
                ..Default::default()
            }
        } else {
            match self.generate_sql(session, request, history, cancel, &mut message).await {
                Ok(reply) => reply,
                Err(e) => return Ok(self.fail(message, e, None, started)),
            }
        };

        message.contains_complex_sql = reply.complex || reply.has_advisory_block;
        if message.content.is_empty() {
            message.content = reply.explanation.clone();
        }

        let Some(raw_sql) = reply.sql.clone() else {
            // Conversational reply, nothing to execute.
            message.chart_kind = Some(ChartKind::Table);
            message.latency_seconds = Some(started.elapsed().as_secs_f64());
            return Ok(message);
        };

        // Validating.
        let source = match self.store.get_data_source(session.data_source_id).await? {
            Some(s) => s,
            None => {
                return Ok(self.fail(
                    message,
                    AskError::invalid(format!("Unknown data source: {}", session.data_source_id)),
                    Some(raw_sql),
                    started,
                ))
            }
        };

        let validated = match sqlguard::validate(&raw_sql, source.dialect) {
            Ok(v) => v,
            Err(e) => return Ok(self.fail(message, e, Some(raw_sql), started)),
        };

        // The persisted SQL is the edited text verbatim, or the normalized
        // statement for generated SQL.
        let persisted_sql = match &request.edited_sql {
            Some(edited) => edited.clone(),
            None => validated.sql.clone(),
        };

        // Unbound named parameters become NULL; nothing is interpolated.
        let params: Vec<Value> = validated
            .param_names
            .iter()
            .map(|name| reply.params.get(name).cloned().unwrap_or(Value::Null))
            .collect();

        // Executing.
        let result = match self
            .execute_validated(session, &validated.sql, &params, cancel)
            .await
        {
            Ok(result) => result,
            Err(e) => return Ok(self.fail(message, e, Some(persisted_sql), started)),
        };

        // Shaping.
        let kind = answer::infer_chart_kind(&result, reply.chart_hint);
        let title = if reply.explanation.is_empty() {
            request.question.clone()
        } else {
            reply.explanation.clone()
        };
        message.chart_config = Some(answer::build_chart_config(&result, kind, title));
        message.chart_kind = Some(kind);
        message.sql = Some(persisted_sql);
        message.result = Some(snapshot(&result));

        message.recommended_questions = self
            .retriever
            .recommend_questions(&request.question, RECOMMENDED_QUESTIONS)
            .await;

        if message.content.is_empty() {
            message.content = format!(
                "Returned {} row{}{}",
                result.rows.len(),
                if result.rows.len() == 1 { "" } else { "s" },
                if result.truncated { " (truncated)" } else { "" }
            );
        }

        message.latency_seconds = Some(started.elapsed().as_secs_f64());
        Ok(message)
    }

    /// Retrieving → Composing → Calling.
    async fn generate_sql(
        &self,
        session: &Session,
        request: &TurnRequest,
        history: Vec<HistoryTurn>,
        cancel: &CancellationToken,
        message: &mut Message,
    ) -> Result<ParsedReply> {
        let source = self
            .store
            .get_data_source(session.data_source_id)
            .await?
            .ok_or_else(|| {
                AskError::invalid(format!("Unknown data source: {}", session.data_source_id))
            })?;

        // Retrieval and schema load run concurrently. Retrieval overrunning
        // its budget degrades to an empty bundle; schema is load-bearing
        // and its failure fails the turn.
        let retrieval_budget = Duration::from_secs(self.config.timeouts.retrieval_secs);
        let (bundle, schemas) = tokio::join!(
            async {
                match tokio::time::timeout(
                    retrieval_budget,
                    self.retriever.retrieve(&request.question, source.dialect),
                )
                .await
                {
                    Ok(bundle) => bundle,
                    Err(_) => {
                        warn!("Retrieval exceeded {retrieval_budget:?}, continuing without it");
                        RetrievalBundle::default()
                    }
                }
            },
            self.schema_loader
                .load(session.data_source_id, &session.selected_tables),
        );
        let schemas = schemas?;

        let missing: Vec<&str> = schemas
            .iter()
            .filter(|s| !s.found)
            .map(|s| s.name.as_str())
            .collect();
        if !missing.is_empty() {
            message.content = format!("Warning: table not found: {}", missing.join(", "));
        }

        // Composing.
        let fragments = self.retriever.prompt_fragments();
        let (messages, stats) = compose(&PromptInputs {
            dialect: source.dialect,
            schemas: &schemas,
            bundle: &bundle,
            fragments: &fragments,
            history: &history,
            question: &request.question,
            token_budget: self.config.llm.prompt_token_budget,
        });
        if !stats.dropped.is_empty() {
            info!(dropped = ?stats.dropped, "Prompt sections dropped for budget");
        }

        // Calling.
        let model = self.store.default_model().await?;
        let profile = self
            .store
            .model_profile(&model, self.config.timeouts.llm_attempt_secs)?;
        let invocation = self
            .router
            .invoke(
                &profile,
                &messages,
                RouterOptions {
                    max_retries: self.config.llm.max_retries,
                    attempt_timeout: Duration::from_secs(self.config.timeouts.llm_attempt_secs),
                    overall_timeout: Duration::from_secs(self.config.timeouts.llm_overall_secs),
                },
                cancel,
            )
            .await?;

        message.tokens_used = invocation.tokens_used.map(|t| t as i64);

        Ok(answer::parse_reply(&invocation.text))
    }

    /// Acquire → execute, with a truncation-triggered count round trip.
    async fn execute_validated(
        &self,
        session: &Session,
        sql: &str,
        params: &[Value],
        cancel: &CancellationToken,
    ) -> Result<QueryResult> {
        let client = self.registry.acquire(session.data_source_id).await?;
        let options = ExecuteOptions {
            limit: self.config.llm.row_limit,
            timeout: Duration::from_secs(self.config.timeouts.sql_secs),
            want_total: false,
        };

        let mut result = executor::execute(client.as_ref(), sql, params, options, cancel).await?;

        if result.truncated {
            // The preview hit the cap; fetch the real cardinality so the
            // client can page.
            let count = executor::execute(
                client.as_ref(),
                sql,
                params,
                ExecuteOptions {
                    limit: 1,
                    want_total: true,
                    ..options
                },
                cancel,
            )
            .await?;
            result.total_rows = count.total_rows;
        }

        Ok(result)
    }

    /// Folds a step failure into the assistant message.
    fn fail(
        &self,
        mut message: Message,
        error: AskError,
        sql: Option<String>,
        started: Instant,
    ) -> Message {
        let cancelled = matches!(error, AskError::Cancelled);
        message.error_text = Some(error.to_string());
        // A cancelled attempt keeps no SQL; any other failure keeps it so
        // the user can edit and resubmit.
        message.sql = if cancelled { None } else { sql };
        message.can_retry = message.sql.is_some() && error.is_sql_fixable();
        message.latency_seconds = Some(started.elapsed().as_secs_f64());
        if !cancelled {
            warn!(category = error.category(), "Turn step failed: {error}");
        }
        message
    }

    async fn load_history(&self, session_id: Uuid) -> Result<Vec<HistoryTurn>> {
        let window = self.config.llm.history_turns * 2;
        let messages = self.store.recent_messages(session_id, window).await?;

        let mut turns = Vec::new();
        let mut pending_question: Option<String> = None;
        for msg in messages {
            match msg.role {
                crate::chat::MessageRole::User => {
                    if let Some(question) = pending_question.take() {
                        turns.push(HistoryTurn {
                            question,
                            sql: None,
                        });
                    }
                    pending_question = Some(msg.content);
                }
                crate::chat::MessageRole::Assistant => {
                    if let Some(question) = pending_question.take() {
                        turns.push(HistoryTurn {
                            question,
                            sql: msg.sql,
                        });
                    }
                }
            }
        }
        if let Some(question) = pending_question {
            turns.push(HistoryTurn {
                question,
                sql: None,
            });
        }
        Ok(turns)
    }
}

/// Bounded snapshot persisted with the message.
fn snapshot(result: &QueryResult) -> ResultSnapshot {
    ResultSnapshot {
        columns: result.columns.iter().map(|c| c.name.clone()).collect(),
        rows: result.rows.iter().take(RESULT_SAMPLE_ROWS).cloned().collect(),
        total_rows: result.total_rows,
        truncated: result.truncated,
    }
}
