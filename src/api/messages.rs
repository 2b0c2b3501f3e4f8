//! Turn submission and transcript endpoints.

use axum::extract::{Path, Query, State};
use axum::Extension;
use serde::Deserialize;
use std::sync::Arc;
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

use crate::api::{ok, ok_paged, sessions::fetch_owned, ApiResult, AppState, AuthUser, Pagination};
use crate::chat::{Message, TurnRequest};
use crate::error::AskError;

#[derive(Debug, Deserialize)]
pub struct SubmitTurnBody {
    #[serde(default)]
    pub question: String,
    /// Must match the session's pinned source when present.
    pub data_source_id: Option<Uuid>,
    /// Ignored beyond validation; tables are pinned at session creation.
    #[serde(default)]
    pub selected_tables: Vec<String>,
    /// Short-circuits straight to validation and execution.
    pub edited_sql: Option<String>,
}

/// POST /chat/sessions/{id}/messages
///
/// The turn runs on its own task so a dropped client connection cancels
/// the model call and the SQL statement without killing the bookkeeping:
/// the in-progress message still persists as cancelled.
pub async fn submit_turn(
    State(state): State<Arc<AppState>>,
    Extension(AuthUser(user)): Extension<AuthUser>,
    Path(id): Path<Uuid>,
    axum::Json(body): axum::Json<SubmitTurnBody>,
) -> ApiResult<Message> {
    let session = fetch_owned(&state, &user, id).await?;

    if let Some(source_id) = body.data_source_id {
        if source_id != session.data_source_id {
            return Err(AskError::invalid(
                "data_source_id does not match the session's pinned data source",
            )
            .into());
        }
    }

    let request = TurnRequest {
        session_id: session.id,
        question: body.question,
        edited_sql: body.edited_sql.filter(|s| !s.trim().is_empty()),
    };

    let cancel = CancellationToken::new();
    let guard = cancel.clone().drop_guard();

    let orchestrator = state.orchestrator.clone();
    let handle = tokio::spawn(async move { orchestrator.run_turn(request, cancel).await });

    let message = handle
        .await
        .map_err(|e| AskError::internal(format!("turn task failed: {e}")))??;

    // Completed normally; the client is still here, nothing to cancel.
    let _ = guard.disarm();

    Ok(ok(message))
}

#[derive(Debug, Deserialize)]
pub struct ListMessagesQuery {
    pub page: Option<u32>,
    pub page_size: Option<u32>,
}

/// GET /chat/sessions/{id}/messages
pub async fn list_messages(
    State(state): State<Arc<AppState>>,
    Extension(AuthUser(user)): Extension<AuthUser>,
    Path(id): Path<Uuid>,
    Query(query): Query<ListMessagesQuery>,
) -> ApiResult<Vec<Message>> {
    fetch_owned(&state, &user, id).await?;

    let page = query.page.unwrap_or(1).max(1);
    let page_size = query.page_size.unwrap_or(50);

    let (messages, total) = state.store.list_messages(id, page, page_size).await?;
    Ok(ok_paged(
        messages,
        Pagination {
            total,
            page,
            page_size,
        },
    ))
}
