//! Bounded, cancellable query execution.
//!
//! Thin layer over a [`DatabaseClient`] that enforces the row cap, the
//! per-query deadline, and cancellation, and that fetches pagination
//! metadata through the dialect count wrapper when asked.

use std::time::Duration;
use tokio_util::sync::CancellationToken;

use crate::db::{DatabaseClient, QueryResult, Value};
use crate::error::{AskError, Result};

/// Row cap applied when the caller does not specify one.
pub const DEFAULT_ROW_LIMIT: usize = 1000;

/// Execution options for one statement.
#[derive(Debug, Clone, Copy)]
pub struct ExecuteOptions {
    /// Row cap for the result.
    pub limit: usize,

    /// Deadline for the statement.
    pub timeout: Duration,

    /// Whether to issue a COUNT(*) round trip for the total row count.
    pub want_total: bool,
}

impl Default for ExecuteOptions {
    fn default() -> Self {
        Self {
            limit: DEFAULT_ROW_LIMIT,
            timeout: Duration::from_secs(30),
            want_total: false,
        }
    }
}

/// Runs validated SQL with bound parameters under a deadline.
///
/// The statement is submitted with explicit binds only; the caller's
/// cancellation token aborts the wait and surfaces *Cancelled*.
pub async fn execute(
    client: &dyn DatabaseClient,
    sql: &str,
    params: &[Value],
    options: ExecuteOptions,
    cancel: &CancellationToken,
) -> Result<QueryResult> {
    let mut result = run_bounded(
        client.run_query(sql, params, options.limit),
        options.timeout,
        cancel,
    )
    .await?;

    if options.want_total {
        let count_sql = client.dialect().count_wrapper(sql);
        let count_result = run_bounded(
            client.run_query(&count_sql, params, 1),
            options.timeout,
            cancel,
        )
        .await?;
        result.total_rows = count_result
            .rows
            .first()
            .and_then(|row| row.first())
            .and_then(|v| match v {
                Value::Int(n) if *n >= 0 => Some(*n as u64),
                Value::String(s) => s.parse().ok(),
                _ => None,
            });
    } else if !result.truncated {
        result.total_rows = Some(result.rows.len() as u64);
    }

    Ok(result)
}

/// Awaits a query future under the deadline and the cancellation token.
async fn run_bounded(
    fut: impl std::future::Future<Output = Result<QueryResult>>,
    timeout: Duration,
    cancel: &CancellationToken,
) -> Result<QueryResult> {
    tokio::select! {
        _ = cancel.cancelled() => Err(AskError::Cancelled),
        outcome = tokio::time::timeout(timeout, fut) => match outcome {
            Ok(result) => result,
            Err(_) => Err(AskError::QueryTimeout(timeout.as_secs())),
        },
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db::SqliteClient;
    use sqlx::sqlite::SqlitePoolOptions;

    async fn seeded_client() -> SqliteClient {
        let pool = SqlitePoolOptions::new()
            .max_connections(1)
            .connect("sqlite::memory:")
            .await
            .unwrap();

        sqlx::query(
            "CREATE TABLE orders (
                id INTEGER PRIMARY KEY,
                customer TEXT NOT NULL,
                region TEXT NOT NULL,
                amount REAL NOT NULL
            )",
        )
        .execute(&pool)
        .await
        .unwrap();

        for i in 0..10 {
            sqlx::query("INSERT INTO orders (customer, region, amount) VALUES (?, ?, ?)")
                .bind(if i % 2 == 0 { "O'Brien" } else { "Chen" })
                .bind(if i < 5 { "north" } else { "south" })
                .bind(100.0 + i as f64)
                .execute(&pool)
                .await
                .unwrap();
        }

        SqliteClient::from_pool(pool)
    }

    fn options(limit: usize) -> ExecuteOptions {
        ExecuteOptions {
            limit,
            timeout: Duration::from_secs(5),
            want_total: false,
        }
    }

    #[tokio::test]
    async fn test_execute_basic() {
        let client = seeded_client().await;
        let cancel = CancellationToken::new();

        let result = execute(
            &client,
            "SELECT id, customer FROM orders ORDER BY id",
            &[],
            options(100),
            &cancel,
        )
        .await
        .unwrap();

        assert_eq!(result.columns.len(), 2);
        assert_eq!(result.rows.len(), 10);
        assert!(!result.truncated);
        assert_eq!(result.total_rows, Some(10));
    }

    #[tokio::test]
    async fn test_row_cap_sets_truncated() {
        let client = seeded_client().await;
        let cancel = CancellationToken::new();

        let result = execute(
            &client,
            "SELECT id FROM orders ORDER BY id",
            &[],
            options(3),
            &cancel,
        )
        .await
        .unwrap();

        assert_eq!(result.rows.len(), 3);
        assert!(result.truncated);
        // Truncated without a count round trip means the total is unknown.
        assert_eq!(result.total_rows, None);
    }

    #[tokio::test]
    async fn test_want_total_issues_count() {
        let client = seeded_client().await;
        let cancel = CancellationToken::new();

        let result = execute(
            &client,
            "SELECT id FROM orders",
            &[],
            ExecuteOptions {
                limit: 3,
                timeout: Duration::from_secs(5),
                want_total: true,
            },
            &cancel,
        )
        .await
        .unwrap();

        assert_eq!(result.rows.len(), 3);
        assert!(result.truncated);
        assert_eq!(result.total_rows, Some(10));
    }

    #[tokio::test]
    async fn test_bound_parameters_not_interpolated() {
        let client = seeded_client().await;
        let cancel = CancellationToken::new();

        // The apostrophe in O'Brien travels as a bind, never spliced into
        // the statement text.
        let result = execute(
            &client,
            "SELECT COUNT(*) AS cnt FROM orders WHERE customer = ?",
            &[Value::String("O'Brien".into())],
            options(10),
            &cancel,
        )
        .await
        .unwrap();

        assert_eq!(result.rows[0][0], Value::Int(5));
    }

    #[tokio::test]
    async fn test_null_parameter_binds() {
        let client = seeded_client().await;
        let cancel = CancellationToken::new();

        let result = execute(
            &client,
            "SELECT COUNT(*) FROM orders WHERE customer = ?",
            &[Value::Null],
            options(10),
            &cancel,
        )
        .await
        .unwrap();

        assert_eq!(result.rows[0][0], Value::Int(0));
    }

    #[tokio::test]
    async fn test_cancellation_before_start() {
        let client = seeded_client().await;
        let cancel = CancellationToken::new();
        cancel.cancel();

        let err = execute(&client, "SELECT 1", &[], options(10), &cancel)
            .await
            .unwrap_err();
        assert!(matches!(err, AskError::Cancelled));
    }

    #[tokio::test]
    async fn test_unknown_identifier_maps_cleanly() {
        let client = seeded_client().await;
        let cancel = CancellationToken::new();

        let err = execute(
            &client,
            "SELECT amt FROM orders",
            &[],
            options(10),
            &cancel,
        )
        .await
        .unwrap_err();
        assert!(matches!(err, AskError::UnknownIdentifier(_)));
    }
}
