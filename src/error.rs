//! Error types for askdb.
//!
//! Defines the main error enum used throughout the application. Each variant
//! maps to a wire `code` surfaced in the response envelope.

use thiserror::Error;

/// Main error type for askdb operations.
#[derive(Error, Debug)]
pub enum AskError {
    /// Malformed or incomplete client input (missing session, unknown data
    /// source, unselected tables, bad pagination).
    #[error("Invalid request: {0}")]
    InvalidRequest(String),

    /// Missing or wrong bearer token.
    #[error("Unauthorized: {0}")]
    Unauthorized(String),

    /// Another turn is in flight for the same session.
    #[error("Session is busy with another turn")]
    SessionBusy,

    /// No usable model, or all retries against the provider exhausted.
    #[error("Model unavailable: {0}")]
    ModelUnavailable(String),

    /// The provider rejected the request with a non-retryable 4xx.
    #[error("Model rejected the request: {0}")]
    ModelRejected(String),

    /// No adapter registered for the requested provider key.
    #[error("Unsupported model provider: {0}")]
    ModelUnsupported(String),

    /// The SQL is not a read-only statement.
    #[error("SQL is not read-only: {0}")]
    SqlNotReadOnly(String),

    /// More than one statement in the body.
    #[error("SQL contains multiple statements")]
    SqlMultiStatement,

    /// Nothing left after stripping fences and whitespace.
    #[error("SQL is empty")]
    SqlEmpty,

    /// Statement exceeds the length or comment-density cap.
    #[error("SQL exceeds limits: {0}")]
    SqlLengthExceeded(String),

    /// Query did not finish within its deadline.
    #[error("Query timed out after {0} seconds")]
    QueryTimeout(u64),

    /// The connection dropped mid-query.
    #[error("Connection lost: {0}")]
    ConnectionLost(String),

    /// The database user lacks privileges for the statement.
    #[error("Permission denied: {0}")]
    PermissionDenied(String),

    /// Unknown table or column referenced by the statement.
    #[error("Unknown identifier: {0}")]
    UnknownIdentifier(String),

    /// The database rejected the statement as malformed.
    #[error("SQL syntax error: {0}")]
    SyntaxError(String),

    /// Driver error that fits no other query kind.
    #[error("Query error: {0}")]
    QueryFailed(String),

    /// The initial probe against the data source failed.
    #[error("Data source unreachable: {0}")]
    DataSourceUnreachable(String),

    /// The dialect has no live driver in this build.
    #[error("No driver for dialect: {0}")]
    DialectUnsupported(String),

    /// The client aborted the turn.
    #[error("cancelled")]
    Cancelled,

    /// Configuration errors (bad config file, missing key material).
    #[error("Configuration error: {0}")]
    Config(String),

    /// Self-storage errors (sessions, messages, knowledge, models).
    #[error("Storage error: {0}")]
    Store(String),

    /// Internal application errors (unexpected states, bugs).
    #[error("Internal error: {0}")]
    Internal(String),
}

impl AskError {
    /// Creates an invalid-request error with the given message.
    pub fn invalid(msg: impl Into<String>) -> Self {
        Self::InvalidRequest(msg.into())
    }

    /// Creates a configuration error with the given message.
    pub fn config(msg: impl Into<String>) -> Self {
        Self::Config(msg.into())
    }

    /// Creates a storage error with the given message.
    pub fn store(msg: impl Into<String>) -> Self {
        Self::Store(msg.into())
    }

    /// Creates an internal error with the given message.
    pub fn internal(msg: impl Into<String>) -> Self {
        Self::Internal(msg.into())
    }

    /// Returns the wire code surfaced in the response envelope.
    pub fn code(&self) -> i32 {
        match self {
            Self::InvalidRequest(_) => 400,
            Self::Unauthorized(_) => 401,
            Self::SessionBusy => 409,
            Self::ModelUnavailable(_) => 1001,
            Self::ModelRejected(_) => 1002,
            Self::ModelUnsupported(_) => 1003,
            Self::SqlNotReadOnly(_) => 1101,
            Self::SqlMultiStatement => 1102,
            Self::SqlEmpty => 1103,
            Self::SqlLengthExceeded(_) => 1104,
            Self::QueryTimeout(_) => 1201,
            Self::ConnectionLost(_) => 1202,
            Self::PermissionDenied(_) => 1203,
            Self::UnknownIdentifier(_) => 1204,
            Self::SyntaxError(_) => 1205,
            Self::QueryFailed(_) => 1206,
            Self::DataSourceUnreachable(_) => 1301,
            Self::DialectUnsupported(_) => 1302,
            Self::Cancelled => 1400,
            Self::Config(_) | Self::Store(_) | Self::Internal(_) => 500,
        }
    }

    /// Returns true when the turn may be retried by editing the SQL.
    pub fn is_sql_fixable(&self) -> bool {
        matches!(
            self,
            Self::SqlNotReadOnly(_)
                | Self::SqlMultiStatement
                | Self::SqlEmpty
                | Self::SqlLengthExceeded(_)
                | Self::QueryTimeout(_)
                | Self::ConnectionLost(_)
                | Self::PermissionDenied(_)
                | Self::UnknownIdentifier(_)
                | Self::SyntaxError(_)
                | Self::QueryFailed(_)
        )
    }

    /// Returns the error category as a string for logs and telemetry.
    pub fn category(&self) -> &'static str {
        match self {
            Self::InvalidRequest(_) => "invalid_request",
            Self::Unauthorized(_) => "unauthorized",
            Self::SessionBusy => "session_busy",
            Self::ModelUnavailable(_) => "model_unavailable",
            Self::ModelRejected(_) => "model_rejected",
            Self::ModelUnsupported(_) => "model_unsupported",
            Self::SqlNotReadOnly(_) => "sql_not_read_only",
            Self::SqlMultiStatement => "sql_multi_statement",
            Self::SqlEmpty => "sql_empty",
            Self::SqlLengthExceeded(_) => "sql_length_exceeded",
            Self::QueryTimeout(_) => "query_timeout",
            Self::ConnectionLost(_) => "connection_lost",
            Self::PermissionDenied(_) => "permission_denied",
            Self::UnknownIdentifier(_) => "unknown_identifier",
            Self::SyntaxError(_) => "syntax_error",
            Self::QueryFailed(_) => "query_failed",
            Self::DataSourceUnreachable(_) => "data_source_unreachable",
            Self::DialectUnsupported(_) => "dialect_unsupported",
            Self::Cancelled => "cancelled",
            Self::Config(_) => "config",
            Self::Store(_) => "store",
            Self::Internal(_) => "internal",
        }
    }
}

impl From<sqlx::Error> for AskError {
    fn from(e: sqlx::Error) -> Self {
        Self::Store(e.to_string())
    }
}

/// Result type alias using AskError.
pub type Result<T> = std::result::Result<T, AskError>;
