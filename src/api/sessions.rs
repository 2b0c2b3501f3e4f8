//! Session endpoints.

use axum::extract::{Path, Query, State};
use axum::Extension;
use chrono::{DateTime, Utc};
use serde::Deserialize;
use std::sync::Arc;
use uuid::Uuid;

use crate::api::{ok, ok_paged, ApiResult, AppState, AuthUser, Pagination};
use crate::chat::store::SessionFilter;
use crate::chat::{Session, SessionStatus};
use crate::error::AskError;

#[derive(Debug, Deserialize)]
pub struct CreateSessionBody {
    pub title: Option<String>,
    pub data_source_id: Uuid,
    #[serde(default)]
    pub selected_tables: Vec<String>,
}

/// POST /chat/sessions
pub async fn create_session(
    State(state): State<Arc<AppState>>,
    Extension(AuthUser(user)): Extension<AuthUser>,
    axum::Json(body): axum::Json<CreateSessionBody>,
) -> ApiResult<Session> {
    if body.selected_tables.is_empty() {
        return Err(AskError::invalid("selected_tables must not be empty").into());
    }

    let source = state
        .store
        .get_data_source(body.data_source_id)
        .await?
        .filter(|s| !s.deleted)
        .ok_or_else(|| {
            AskError::invalid(format!("Unknown data source: {}", body.data_source_id))
        })?;

    // Pinned tables must exist in the source at creation time. Later
    // catalog drift degrades to a "table not found" marker instead.
    let client = state.registry.acquire(source.id).await?;
    let available = client.fetch_tables().await?;
    let unknown: Vec<&String> = body
        .selected_tables
        .iter()
        .filter(|t| !available.contains(t))
        .collect();
    if !unknown.is_empty() {
        return Err(AskError::invalid(format!(
            "Tables not present in data source: {}",
            unknown
                .iter()
                .map(|s| s.as_str())
                .collect::<Vec<_>>()
                .join(", ")
        ))
        .into());
    }

    let title = body
        .title
        .filter(|t| !t.trim().is_empty())
        .unwrap_or_else(|| "New session".to_string());

    let session = state
        .store
        .create_session(&user, &title, body.data_source_id, body.selected_tables)
        .await?;

    Ok(ok(session))
}

#[derive(Debug, Deserialize)]
pub struct ListSessionsQuery {
    pub page: Option<u32>,
    pub page_size: Option<u32>,
    pub keyword: Option<String>,
    pub data_source_id: Option<Uuid>,
    pub from: Option<DateTime<Utc>>,
    pub to: Option<DateTime<Utc>>,
}

/// GET /chat/sessions
pub async fn list_sessions(
    State(state): State<Arc<AppState>>,
    Extension(AuthUser(user)): Extension<AuthUser>,
    Query(query): Query<ListSessionsQuery>,
) -> ApiResult<Vec<Session>> {
    let page = query.page.unwrap_or(1).max(1);
    let page_size = query.page_size.unwrap_or(20);

    let filter = SessionFilter {
        keyword: query.keyword,
        data_source_id: query.data_source_id,
        from: query.from,
        to: query.to,
        page,
        page_size,
    };

    let (sessions, total) = state.store.list_sessions(&user, &filter).await?;
    Ok(ok_paged(
        sessions,
        Pagination {
            total,
            page,
            page_size,
        },
    ))
}

/// GET /chat/sessions/{id}
pub async fn get_session(
    State(state): State<Arc<AppState>>,
    Extension(AuthUser(user)): Extension<AuthUser>,
    Path(id): Path<Uuid>,
) -> ApiResult<Session> {
    let session = fetch_owned(&state, &user, id).await?;
    Ok(ok(session))
}

#[derive(Debug, Deserialize)]
pub struct UpdateSessionBody {
    pub title: Option<String>,
    pub status: Option<SessionStatus>,
}

/// PUT /chat/sessions/{id}
pub async fn update_session(
    State(state): State<Arc<AppState>>,
    Extension(AuthUser(user)): Extension<AuthUser>,
    Path(id): Path<Uuid>,
    axum::Json(body): axum::Json<UpdateSessionBody>,
) -> ApiResult<Session> {
    fetch_owned(&state, &user, id).await?;
    let session = state
        .store
        .update_session(id, body.title.as_deref(), body.status)
        .await?;
    Ok(ok(session))
}

/// DELETE /chat/sessions/{id}
pub async fn delete_session(
    State(state): State<Arc<AppState>>,
    Extension(AuthUser(user)): Extension<AuthUser>,
    Path(id): Path<Uuid>,
) -> ApiResult<()> {
    fetch_owned(&state, &user, id).await?;
    state.store.delete_session(id).await?;
    Ok(ok(()))
}

/// Loads a session and checks ownership.
pub(crate) async fn fetch_owned(
    state: &AppState,
    user: &str,
    id: Uuid,
) -> Result<Session, AskError> {
    let session = state
        .store
        .get_session(id)
        .await?
        .ok_or_else(|| AskError::invalid(format!("Unknown session: {id}")))?;

    if session.user_id != user {
        // Do not reveal whether the session exists.
        return Err(AskError::invalid(format!("Unknown session: {id}")));
    }

    Ok(session)
}
