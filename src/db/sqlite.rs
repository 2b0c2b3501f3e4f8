//! SQLite client for user data sources.
//!
//! The file is opened read-only (`mode=ro`), so the read-only guarantee
//! holds at the driver level on top of validation.

use async_trait::async_trait;
use futures::StreamExt;
use sqlx::sqlite::{SqlitePool, SqlitePoolOptions, SqliteRow};
use sqlx::{Column as SqlxColumn, Row as SqlxRow, TypeInfo};
use std::time::{Duration, Instant};
use tracing::{debug, warn};

use crate::config::PoolConfig;
use crate::db::postgres::classify_by_message;
use crate::db::{
    group_catalog_rows, CatalogRow, ColumnInfo, DatabaseClient, Dialect, QueryResult, Row,
    ScalarKind, SourceConfig, TableSchema, Value,
};
use crate::error::{AskError, Result};

/// SQLite data-source client.
#[derive(Debug)]
pub struct SqliteClient {
    pool: SqlitePool,
}

impl SqliteClient {
    /// Opens the database file read-only.
    pub async fn connect(config: &SourceConfig, pool_cfg: &PoolConfig) -> Result<Self> {
        let dsn = config.dsn()?;

        debug!("Opening sqlite pool for {}", config.display());

        let pool = SqlitePoolOptions::new()
            .max_connections(pool_cfg.max_connections)
            .idle_timeout(Duration::from_secs(pool_cfg.idle_timeout_secs))
            .acquire_timeout(Duration::from_secs(pool_cfg.probe_timeout_secs))
            .connect(&dsn)
            .await
            .map_err(|e| {
                AskError::DataSourceUnreachable(format!("{}: {}", config.display(), e))
            })?;

        Ok(Self { pool })
    }

    /// Wraps an existing pool. Useful for tests.
    #[allow(dead_code)]
    pub fn from_pool(pool: SqlitePool) -> Self {
        Self { pool }
    }
}

#[async_trait]
impl DatabaseClient for SqliteClient {
    fn dialect(&self) -> Dialect {
        Dialect::Sqlite
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
            let lite_row = row_result.map_err(map_query_error)?;

            if columns.is_none() {
                columns = Some(
                    lite_row
                        .columns()
                        .iter()
                        .map(|col| ColumnInfo::new(col.name(), col.type_info().name()))
                        .collect(),
                );
            }

            if rows.len() < limit {
                rows.push(convert_row(&lite_row));
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
        sqlx::query_scalar(Dialect::Sqlite.list_tables_query())
            .fetch_all(&self.pool)
            .await
            .map_err(map_query_error)
    }

    async fn fetch_columns(&self, tables: &[String]) -> Result<Vec<TableSchema>> {
        if tables.is_empty() {
            return Ok(Vec::new());
        }
        let rows: Vec<CatalogRow> = sqlx::query_as(&Dialect::Sqlite.catalog_query(tables))
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

/// Converts a SqliteRow to the neutral Row type. SQLite reports runtime
/// storage classes (one integer and one float width), so each scalar kind
/// has exactly one decode.
fn convert_row(row: &SqliteRow) -> Row {
    row.columns()
        .iter()
        .enumerate()
        .map(|(i, col)| {
            let kind = Dialect::Sqlite.scalar_kind(col.type_info().name());
            match kind {
                ScalarKind::Bool => row.try_get::<Option<bool>, _>(i).map(Value::from),
                ScalarKind::Int => row.try_get::<Option<i64>, _>(i).map(Value::from),
                ScalarKind::Float => row.try_get::<Option<f64>, _>(i).map(Value::from),
                ScalarKind::Text => row.try_get::<Option<String>, _>(i).map(Value::from),
            }
            .unwrap_or(Value::Null)
        })
        .collect()
}

/// SQLite reports errors mostly by message; reuse the shared classifier.
fn map_query_error(error: sqlx::Error) -> AskError {
    match &error {
        sqlx::Error::Io(_) | sqlx::Error::PoolClosed | sqlx::Error::PoolTimedOut => {
            AskError::ConnectionLost(error.to_string())
        }
        sqlx::Error::Database(db) => {
            let message = db.message().to_string();
            if message.contains("attempt to write a readonly database") {
                AskError::PermissionDenied(message)
            } else {
                classify_by_message(&message)
            }
        }
        _ => classify_by_message(&error.to_string()),
    }
}
