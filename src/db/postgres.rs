//! PostgreSQL client for user data sources.
//!
//! Implements the `DatabaseClient` trait over a sqlx pool. Queries run with
//! explicit binds only; rows stream in and stop at the caller's cap.

use async_trait::async_trait;
use futures::StreamExt;
use sqlx::postgres::{PgPool, PgPoolOptions, PgRow};
use sqlx::{Column as SqlxColumn, Row as SqlxRow, TypeInfo};
use std::time::{Duration, Instant};
use tracing::{debug, warn};

use crate::config::PoolConfig;
use crate::db::{
    group_catalog_rows, CatalogRow, ColumnInfo, DatabaseClient, Dialect, QueryResult, Row,
    ScalarKind, SourceConfig, TableSchema, Value,
};
use crate::error::{AskError, Result};

/// PostgreSQL data-source client.
#[derive(Debug)]
pub struct PostgresClient {
    pool: PgPool,
}

impl PostgresClient {
    /// Connects to the data source, probing within the configured timeout.
    pub async fn connect(config: &SourceConfig, pool_cfg: &PoolConfig) -> Result<Self> {
        let dsn = config.dsn()?;

        debug!("Opening postgres pool for {}", config.display());

        let pool = PgPoolOptions::new()
            .max_connections(pool_cfg.max_connections)
            .idle_timeout(Duration::from_secs(pool_cfg.idle_timeout_secs))
            .max_lifetime(Duration::from_secs(pool_cfg.max_lifetime_secs))
            .acquire_timeout(Duration::from_secs(pool_cfg.probe_timeout_secs))
            .test_before_acquire(true)
            .connect(&dsn)
            .await
            .map_err(|e| {
                AskError::DataSourceUnreachable(format!("{}: {}", config.display(), e))
            })?;

        Ok(Self { pool })
    }

    /// Wraps an existing pool. Useful for tests.
    #[allow(dead_code)]
    pub fn from_pool(pool: PgPool) -> Self {
        Self { pool }
    }
}

#[async_trait]
impl DatabaseClient for PostgresClient {
    fn dialect(&self) -> Dialect {
        Dialect::PostgreSql
    }

    async fn run_query(&self, sql: &str, params: &[Value], limit: usize) -> Result<QueryResult> {
        let start = Instant::now();

        let mut query = sqlx::query(sql);
        for param in params {
            query = match param {
                Value::Null => query.bind(None::<String>),
                Value::Bool(b) => query.bind(*b),
                Value::Int(i) => query.bind(*i),
                Value::Float(f) => query.bind(*f),
                Value::String(s) => query.bind(s.clone()),
            };
        }

        let mut stream = query.fetch(&self.pool);
        let mut rows: Vec<Row> = Vec::new();
        let mut columns: Option<Vec<ColumnInfo>> = None;
        let mut truncated = false;

        while let Some(row_result) = stream.next().await {
            let pg_row = row_result.map_err(map_query_error)?;

            if columns.is_none() {
                columns = Some(
                    pg_row
                        .columns()
                        .iter()
                        .map(|col| ColumnInfo::new(col.name(), col.type_info().name()))
                        .collect(),
                );
            }

            if rows.len() < limit {
                rows.push(convert_row(&pg_row));
            } else {
                truncated = true;
                break;
            }
        }

        if truncated {
            warn!("Query exceeded {} rows, result truncated", limit);
        }

        Ok(QueryResult {
            columns: columns.unwrap_or_default(),
            rows,
            total_rows: None,
            truncated,
            execution_time: start.elapsed(),
        })
    }

    async fn fetch_tables(&self) -> Result<Vec<String>> {
        sqlx::query_scalar(Dialect::PostgreSql.list_tables_query())
            .fetch_all(&self.pool)
            .await
            .map_err(map_query_error)
    }

    async fn fetch_columns(&self, tables: &[String]) -> Result<Vec<TableSchema>> {
        if tables.is_empty() {
            return Ok(Vec::new());
        }
        let rows: Vec<CatalogRow> = sqlx::query_as(&Dialect::PostgreSql.catalog_query(tables))
            .fetch_all(&self.pool)
            .await
            .map_err(map_query_error)?;
        Ok(group_catalog_rows(tables, rows))
    }

    async fn ping(&self) -> Result<()> {
        sqlx::query_scalar::<_, i32>("SELECT 1")
            .fetch_one(&self.pool)
            .await
            .map(|_| ())
            .map_err(map_query_error)
    }

    async fn close(&self) {
        self.pool.close().await;
    }
}

/// Converts a PgRow to the neutral Row type. Columns classify through the
/// dialect's scalar kinds; Postgres integers and floats come in several
/// widths, so the numeric decoders fall back from wide to narrow.
fn convert_row(row: &PgRow) -> Row {
    row.columns()
        .iter()
        .enumerate()
        .map(|(i, col)| {
            let kind = Dialect::PostgreSql.scalar_kind(col.type_info().name());
            match kind {
                ScalarKind::Bool => row.try_get::<Option<bool>, _>(i).map(Value::from),
                ScalarKind::Int => row
                    .try_get::<Option<i64>, _>(i)
                    .or_else(|_| row.try_get::<Option<i32>, _>(i).map(|v| v.map(i64::from)))
                    .or_else(|_| row.try_get::<Option<i16>, _>(i).map(|v| v.map(i64::from)))
                    .map(Value::from),
                ScalarKind::Float => row
                    .try_get::<Option<f64>, _>(i)
                    .or_else(|_| row.try_get::<Option<f32>, _>(i).map(|v| v.map(f64::from)))
                    .map(Value::from),
                // Everything else (text, numerics, dates, json) renders as
                // text.
                ScalarKind::Text => row.try_get::<Option<String>, _>(i).map(Value::from),
            }
            .unwrap_or(Value::Null)
        })
        .collect()
}

/// Classifies a sqlx error into the executor error kinds.
pub(crate) fn map_query_error(error: sqlx::Error) -> AskError {
    match &error {
        sqlx::Error::Io(_) | sqlx::Error::PoolClosed | sqlx::Error::PoolTimedOut => {
            return AskError::ConnectionLost(error.to_string());
        }
        sqlx::Error::Database(db) => {
            let code = db.code().map(|c| c.to_string()).unwrap_or_default();
            let message = db.message().to_string();
            // PostgreSQL SQLSTATE classes.
            return match code.as_str() {
                "42601" => AskError::SyntaxError(message),
                "42501" => AskError::PermissionDenied(message),
                "42P01" | "42703" => AskError::UnknownIdentifier(message),
                "57014" => AskError::Cancelled,
                _ => classify_by_message(&message),
            };
        }
        _ => {}
    }
    classify_by_message(&error.to_string())
}

/// Fallback classification by message, shared with the other sqlx clients
/// whose drivers report numeric codes differently.
pub(crate) fn classify_by_message(message: &str) -> AskError {
    let lower = message.to_lowercase();
    if lower.contains("syntax") {
        AskError::SyntaxError(message.to_string())
    } else if lower.contains("denied") || lower.contains("permission") {
        AskError::PermissionDenied(message.to_string())
    } else if lower.contains("no such table")
        || lower.contains("no such column")
        || lower.contains("does not exist")
        || lower.contains("unknown column")
        || lower.contains("doesn't exist")
    {
        AskError::UnknownIdentifier(message.to_string())
    } else if lower.contains("connection reset")
        || lower.contains("broken pipe")
        || lower.contains("connection closed")
        || lower.contains("gone away")
    {
        AskError::ConnectionLost(message.to_string())
    } else {
        AskError::QueryFailed(message.to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_classify_syntax() {
        assert!(matches!(
            classify_by_message("syntax error at or near \"FORM\""),
            AskError::SyntaxError(_)
        ));
    }

    #[test]
    fn test_classify_unknown_identifier() {
        assert!(matches!(
            classify_by_message("column \"amt\" does not exist"),
            AskError::UnknownIdentifier(_)
        ));
        assert!(matches!(
            classify_by_message("no such table: ordrs"),
            AskError::UnknownIdentifier(_)
        ));
        assert!(matches!(
            classify_by_message("Unknown column 'amt' in 'field list'"),
            AskError::UnknownIdentifier(_)
        ));
    }

    #[test]
    fn test_classify_permission() {
        assert!(matches!(
            classify_by_message("permission denied for table orders"),
            AskError::PermissionDenied(_)
        ));
    }

    #[test]
    fn test_classify_connection_lost() {
        assert!(matches!(
            classify_by_message("MySQL server has gone away"),
            AskError::ConnectionLost(_)
        ));
        assert!(matches!(
            classify_by_message("connection reset by peer"),
            AskError::ConnectionLost(_)
        ));
    }

    #[test]
    fn test_classify_other() {
        assert!(matches!(
            classify_by_message("division by zero"),
            AskError::QueryFailed(_)
        ));
    }
}
