//! Data-source endpoints consumed by session creation.

use axum::extract::{Path, State};
use std::sync::Arc;
use uuid::Uuid;

use crate::api::{ok, ApiResult, AppState};
use crate::error::AskError;

/// GET /chat/datasources/{id}/tables
///
/// Lists base tables so the client can pick the session's table set.
pub async fn list_tables(
    State(state): State<Arc<AppState>>,
    Path(id): Path<Uuid>,
) -> ApiResult<Vec<String>> {
    state
        .store
        .get_data_source(id)
        .await?
        .filter(|s| !s.deleted && s.active)
        .ok_or_else(|| AskError::invalid(format!("Unknown data source: {id}")))?;

    let client = state.registry.acquire(id).await?;
    let tables = client.fetch_tables().await?;
    Ok(ok(tables))
}
