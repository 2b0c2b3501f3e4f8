//! HTTP surface, versioned under `/api/v1`.
//!
//! Every response uses the `{code, success, message, data, pagination?}`
//! envelope. Authentication is a bearer token on every request; `/healthz`
//! is the one unauthenticated route.

mod datasources;
mod messages;
mod sessions;

use axum::extract::{Request, State};
use axum::http::{header, StatusCode};
use axum::middleware::{self, Next};
use axum::response::{IntoResponse, Response};
use axum::routing::{get, post};
use axum::{Json, Router};
use serde::Serialize;
use std::sync::Arc;
use tower_http::cors::{AllowOrigin, CorsLayer};
use tower_http::trace::TraceLayer;
use tracing::{error, warn};
use uuid::Uuid;

use crate::chat::{ChatOrchestrator, Store};
use crate::db::ConnectionRegistry;
use crate::error::AskError;

/// Shared application state.
pub struct AppState {
    pub store: Arc<Store>,
    pub registry: Arc<ConnectionRegistry>,
    pub orchestrator: Arc<ChatOrchestrator>,
    pub api_tokens: Vec<String>,
}

/// The authenticated principal, injected by the auth middleware.
#[derive(Debug, Clone)]
pub struct AuthUser(pub String);

/// Uniform response envelope.
#[derive(Debug, Serialize)]
pub struct Envelope<T: Serialize> {
    pub code: i32,
    pub success: bool,
    pub message: String,
    pub data: Option<T>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub pagination: Option<Pagination>,
}

#[derive(Debug, Serialize)]
pub struct Pagination {
    pub total: u64,
    pub page: u32,
    pub page_size: u32,
}

/// Successful envelope.
pub fn ok<T: Serialize>(data: T) -> Json<Envelope<T>> {
    Json(Envelope {
        code: 0,
        success: true,
        message: "ok".to_string(),
        data: Some(data),
        pagination: None,
    })
}

/// Successful envelope with pagination metadata.
pub fn ok_paged<T: Serialize>(data: T, pagination: Pagination) -> Json<Envelope<T>> {
    Json(Envelope {
        code: 0,
        success: true,
        message: "ok".to_string(),
        data: Some(data),
        pagination: Some(pagination),
    })
}

/// Error wrapper so handlers can use `?` on crate errors.
pub struct ApiError(pub AskError);

impl From<AskError> for ApiError {
    fn from(e: AskError) -> Self {
        Self(e)
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let error = self.0;
        let code = error.code();

        // Internal details stay in the log; the client gets a reference id.
        let message = if code == 500 {
            let correlation = Uuid::new_v4();
            error!(%correlation, category = error.category(), "Request failed: {error}");
            format!("Internal error (ref {correlation})")
        } else {
            error.to_string()
        };

        let status = match code {
            400 => StatusCode::BAD_REQUEST,
            401 => StatusCode::UNAUTHORIZED,
            409 => StatusCode::CONFLICT,
            500 => StatusCode::INTERNAL_SERVER_ERROR,
            _ => StatusCode::OK,
        };

        let envelope = Envelope::<()> {
            code,
            success: false,
            message,
            data: None,
            pagination: None,
        };
        (status, Json(envelope)).into_response()
    }
}

pub type ApiResult<T> = std::result::Result<Json<Envelope<T>>, ApiError>;

/// Builds the full router.
pub fn build_router(state: Arc<AppState>, allowed_origins: &[String]) -> Router {
    let cors = if allowed_origins.is_empty() {
        CorsLayer::new()
    } else {
        let origins: Vec<_> = allowed_origins
            .iter()
            .filter_map(|o| o.parse().ok())
            .collect();
        CorsLayer::new()
            .allow_origin(AllowOrigin::list(origins))
            .allow_methods(tower_http::cors::Any)
            .allow_headers(tower_http::cors::Any)
    };

    let api = Router::new()
        .route(
            "/chat/sessions",
            post(sessions::create_session).get(sessions::list_sessions),
        )
        .route(
            "/chat/sessions/:id",
            get(sessions::get_session)
                .put(sessions::update_session)
                .delete(sessions::delete_session),
        )
        .route(
            "/chat/sessions/:id/messages",
            post(messages::submit_turn).get(messages::list_messages),
        )
        .route(
            "/chat/datasources/:id/tables",
            get(datasources::list_tables),
        )
        .layer(middleware::from_fn_with_state(state.clone(), authenticate));

    Router::new()
        .route("/healthz", get(healthz))
        .nest("/api/v1", api)
        .layer(TraceLayer::new_for_http())
        .layer(cors)
        .with_state(state)
}

/// Liveness probe; no auth.
async fn healthz(State(state): State<Arc<AppState>>) -> Json<serde_json::Value> {
    Json(serde_json::json!({
        "status": "ok",
        "pools": state.registry.pool_count(),
    }))
}

/// Bearer-token check. An empty token list disables auth (development
/// only); that state is warned about at startup.
async fn authenticate(
    State(state): State<Arc<AppState>>,
    mut request: Request,
    next: Next,
) -> Response {
    if state.api_tokens.is_empty() {
        request
            .extensions_mut()
            .insert(AuthUser("anonymous".to_string()));
        return next.run(request).await;
    }

    let presented = request
        .headers()
        .get(header::AUTHORIZATION)
        .and_then(|v| v.to_str().ok())
        .and_then(|v| v.strip_prefix("Bearer "));

    match presented {
        Some(token) if state.api_tokens.iter().any(|t| t == token) => {
            // The principal is derived from the token, not echoed from it.
            let user = format!("user-{:016x}", fingerprint(token));
            request.extensions_mut().insert(AuthUser(user));
            next.run(request).await
        }
        _ => {
            warn!("Rejected request with missing or invalid bearer token");
            ApiError(AskError::Unauthorized("invalid bearer token".to_string()))
                .into_response()
        }
    }
}

/// FNV-1a. Enough to identify a token without storing it anywhere.
fn fingerprint(token: &str) -> u64 {
    let mut hash: u64 = 0xcbf29ce484222325;
    for byte in token.bytes() {
        hash ^= byte as u64;
        hash = hash.wrapping_mul(0x100000001b3);
    }
    hash
}
