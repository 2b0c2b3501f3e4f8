//! MySQL client for user data sources.

use async_trait::async_trait;
use futures::StreamExt;
use sqlx::mysql::{MySqlPool, MySqlPoolOptions, MySqlRow};
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

/// MySQL data-source client.
#[derive(Debug)]
pub struct MySqlClient {
    pool: MySqlPool,
}

impl MySqlClient {
    /// Connects to the data source, probing within the configured timeout.
    pub async fn connect(config: &SourceConfig, pool_cfg: &PoolConfig) -> Result<Self> {
        let dsn = config.dsn()?;

        debug!("Opening mysql pool for {}", config.display());

        let pool = MySqlPoolOptions::new()
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
}

#[async_trait]
impl DatabaseClient for MySqlClient {
    fn dialect(&self) -> Dialect {
        Dialect::MySql
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
            let my_row = row_result.map_err(map_query_error)?;

            if columns.is_none() {
                columns = Some(
                    my_row
                        .columns()
                        .iter()
                        .map(|col| ColumnInfo::new(col.name(), col.type_info().name()))
                        .collect(),
                );
            }

            if rows.len() < limit {
                rows.push(convert_row(&my_row));
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
        sqlx::query_scalar(Dialect::MySql.list_tables_query())
            .fetch_all(&self.pool)
            .await
            .map_err(map_query_error)
    }

    async fn fetch_columns(&self, tables: &[String]) -> Result<Vec<TableSchema>> {
        if tables.is_empty() {
            return Ok(Vec::new());
        }
        let rows: Vec<CatalogRow> = sqlx::query_as(&Dialect::MySql.catalog_query(tables))
            .fetch_all(&self.pool)
            .await
            .map_err(map_query_error)?;
        Ok(group_catalog_rows(tables, rows))
    }

    async fn ping(&self) -> Result<()> {
        sqlx::query_scalar::<_, i64>("SELECT 1")
            .fetch_one(&self.pool)
            .await
            .map(|_| ())
            .map_err(map_query_error)
    }

    async fn close(&self) {
        self.pool.close().await;
    }
}

/// Converts a MySqlRow to the neutral Row type. MySQL reports one signed
/// and one unsigned integer family; unsigned BIGINT values beyond i64 fall
/// through to their decimal text form rather than wrapping.
fn convert_row(row: &MySqlRow) -> Row {
    row.columns()
        .iter()
        .enumerate()
        .map(|(i, col)| {
            let kind = Dialect::MySql.scalar_kind(col.type_info().name());
            match kind {
                ScalarKind::Bool => row.try_get::<Option<bool>, _>(i).map(Value::from),
                ScalarKind::Int => row
                    .try_get::<Option<i64>, _>(i)
                    .map(Value::from)
                    .or_else(|_| {
                        row.try_get::<Option<u64>, _>(i).map(|v| match v {
                            Some(u) => i64::try_from(u)
                                .map(Value::Int)
                                .unwrap_or_else(|_| Value::String(u.to_string())),
                            None => Value::Null,
                        })
                    }),
                ScalarKind::Float => row
                    .try_get::<Option<f64>, _>(i)
                    .or_else(|_| row.try_get::<Option<f32>, _>(i).map(|v| v.map(f64::from)))
                    .map(Value::from),
                ScalarKind::Text => row.try_get::<Option<String>, _>(i).map(Value::from),
            }
            .unwrap_or(Value::Null)
        })
        .collect()
}

/// Classifies a sqlx error into the executor error kinds using MySQL error
/// numbers, falling back to message matching.
fn map_query_error(error: sqlx::Error) -> AskError {
    match &error {
        sqlx::Error::Io(_) | sqlx::Error::PoolClosed | sqlx::Error::PoolTimedOut => {
            return AskError::ConnectionLost(error.to_string());
        }
        sqlx::Error::Database(db) => {
            let code = db.code().map(|c| c.to_string()).unwrap_or_default();
            let message = db.message().to_string();
            return match code.as_str() {
                "1064" => AskError::SyntaxError(message),
                "1044" | "1045" | "1142" | "1143" => AskError::PermissionDenied(message),
                "1146" | "1054" => AskError::UnknownIdentifier(message),
                "1317" => AskError::Cancelled,
                "2006" | "2013" => AskError::ConnectionLost(message),
                _ => classify_by_message(&message),
            };
        }
        _ => {}
    }
    classify_by_message(&error.to_string())
}
