//! Database access layer for user data sources.
//!
//! Provides a trait-based interface over the supported backends so the
//! executor and schema loader stay dialect-agnostic. SQL shaping lives in
//! [`dialect`]; live connectivity exists for the sqlx-backed dialects.

pub mod dialect;
mod mysql;
mod postgres;
pub mod registry;
pub mod schema;
mod sqlite;
mod types;

pub mod executor;

pub use dialect::{Dialect, ScalarKind};
pub use mysql::MySqlClient;
pub use postgres::PostgresClient;
pub use registry::ConnectionRegistry;
pub use schema::SchemaLoader;
pub use sqlite::SqliteClient;
pub use types::{ColumnInfo, ColumnSchema, QueryResult, Row, TableSchema, Value};

use crate::config::PoolConfig;
use crate::error::{AskError, Result};
use async_trait::async_trait;
use std::collections::BTreeMap;
use url::Url;

/// Connection settings for one user data source, with the password already
/// decrypted. Built just-in-time by the registry and never persisted.
#[derive(Debug, Clone, Default)]
pub struct SourceConfig {
    pub dialect: Option<Dialect>,
    pub host: Option<String>,
    pub port: Option<u16>,
    pub database: Option<String>,
    pub username: Option<String>,
    pub password: Option<String>,
    pub charset: Option<String>,
    pub extra_params: BTreeMap<String, String>,
}

impl SourceConfig {
    /// Returns the dialect, which is mandatory for connecting.
    pub fn dialect(&self) -> Result<Dialect> {
        self.dialect
            .ok_or_else(|| AskError::invalid("Data source has no dialect"))
    }

    /// Builds the driver DSN. Credentials are URL-encoded by the url crate.
    pub fn dsn(&self) -> Result<String> {
        let dialect = self.dialect()?;
        let database = self
            .database
            .as_deref()
            .ok_or_else(|| AskError::invalid("Data source has no database"))?;

        if dialect == Dialect::Sqlite {
            // The database field carries the file path.
            return Ok(format!("sqlite:{database}?mode=ro"));
        }

        let scheme = match dialect {
            Dialect::MySql => "mysql",
            Dialect::PostgreSql => "postgres",
            _ => {
                return Err(AskError::DialectUnsupported(dialect.to_string()));
            }
        };

        let host = self.host.as_deref().unwrap_or("localhost");
        let mut url = Url::parse(&format!("{scheme}://{host}"))
            .map_err(|e| AskError::invalid(format!("Invalid host '{host}': {e}")))?;

        let port = self.port.or_else(|| dialect.default_port());
        url.set_port(port)
            .map_err(|_| AskError::invalid("Invalid port"))?;

        if let Some(user) = &self.username {
            url.set_username(user)
                .map_err(|_| AskError::invalid("Invalid username"))?;
            if let Some(password) = &self.password {
                url.set_password(Some(password))
                    .map_err(|_| AskError::invalid("Invalid password"))?;
            }
        }

        url.set_path(&format!("/{database}"));

        {
            let mut query = url.query_pairs_mut();
            if let Some(charset) = &self.charset {
                query.append_pair("charset", charset);
            }
            for (k, v) in &self.extra_params {
                query.append_pair(k, v);
            }
        }

        Ok(url.to_string())
    }

    /// Returns a display-safe string (no password) for logs.
    pub fn display(&self) -> String {
        let dialect = self
            .dialect
            .map(|d| d.to_string())
            .unwrap_or_else(|| "unknown".to_string());
        let database = self.database.as_deref().unwrap_or("unknown");
        match (&self.host, self.port) {
            (Some(host), Some(port)) => format!("{dialect}://{host}:{port}/{database}"),
            (Some(host), None) => format!("{dialect}://{host}/{database}"),
            _ => format!("{dialect}:{database}"),
        }
    }
}

/// Trait defining the interface to one live data source.
///
/// All implementations stream rows up to the caller's cap and map driver
/// errors to the crate error kinds.
#[async_trait]
pub trait DatabaseClient: Send + Sync + std::fmt::Debug {
    /// The dialect behind this client.
    fn dialect(&self) -> Dialect;

    /// Executes a read statement with bound parameters, returning at most
    /// `limit` rows and flagging truncation.
    async fn run_query(&self, sql: &str, params: &[Value], limit: usize) -> Result<QueryResult>;

    /// Lists base table names for session creation.
    async fn fetch_tables(&self) -> Result<Vec<String>>;

    /// Describes the given tables via the dialect catalog query. Tables the
    /// catalog no longer knows come back as not-found markers.
    async fn fetch_columns(&self, tables: &[String]) -> Result<Vec<TableSchema>>;

    /// Cheap liveness check used by the registry's pre-use probe.
    async fn ping(&self) -> Result<()>;

    /// Closes the underlying pool.
    async fn close(&self);
}

/// Opens a client for the given source. This is the central factory for
/// data-source connections.
pub async fn connect(
    config: &SourceConfig,
    pool: &PoolConfig,
) -> Result<Box<dyn DatabaseClient>> {
    match config.dialect()? {
        Dialect::MySql => Ok(Box::new(MySqlClient::connect(config, pool).await?)),
        Dialect::PostgreSql => Ok(Box::new(PostgresClient::connect(config, pool).await?)),
        Dialect::Sqlite => Ok(Box::new(SqliteClient::connect(config, pool).await?)),
        other => Err(AskError::DialectUnsupported(other.to_string())),
    }
}

/// Shape of one catalog row: (table, table comment, column, type, nullable,
/// column comment).
pub(crate) type CatalogRow = (
    String,
    Option<String>,
    String,
    String,
    String,
    Option<String>,
);

/// Groups flat catalog rows into per-table descriptions, inserting not-found
/// markers for tables the catalog did not report, in the caller's order.
pub(crate) fn group_catalog_rows(tables: &[String], rows: Vec<CatalogRow>) -> Vec<TableSchema> {
    let mut by_table: BTreeMap<String, TableSchema> = BTreeMap::new();

    for (table, table_comment, column, data_type, nullable, column_comment) in rows {
        let entry = by_table.entry(table.clone()).or_insert_with(|| TableSchema {
            name: table,
            comment: None,
            columns: Vec::new(),
            found: true,
        });
        if entry.comment.is_none() {
            entry.comment = table_comment.filter(|c| !c.is_empty());
        }
        entry.columns.push(ColumnSchema {
            name: column,
            data_type,
            nullable: nullable.eq_ignore_ascii_case("YES"),
            comment: column_comment.filter(|c| !c.is_empty()),
        });
    }

    tables
        .iter()
        .map(|name| {
            by_table
                .remove(name)
                .unwrap_or_else(|| TableSchema::not_found(name))
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_dsn_mysql() {
        let config = SourceConfig {
            dialect: Some(Dialect::MySql),
            host: Some("db.internal".into()),
            port: Some(3307),
            database: Some("sales".into()),
            username: Some("reader".into()),
            password: Some("p@ss:word".into()),
            charset: Some("utf8mb4".into()),
            ..Default::default()
        };
        let dsn = config.dsn().unwrap();
        assert!(dsn.starts_with("mysql://reader:"));
        assert!(dsn.contains("@db.internal:3307/sales"));
        assert!(dsn.contains("charset=utf8mb4"));
        // Special characters in the password must be URL-encoded.
        assert!(!dsn.contains("p@ss:word"));
    }

    #[test]
    fn test_dsn_postgres_default_port() {
        let config = SourceConfig {
            dialect: Some(Dialect::PostgreSql),
            host: Some("localhost".into()),
            database: Some("app".into()),
            username: Some("postgres".into()),
            ..Default::default()
        };
        let dsn = config.dsn().unwrap();
        assert!(dsn.starts_with("postgres://postgres@localhost:5432/app"));
    }

    #[test]
    fn test_dsn_sqlite_is_read_only() {
        let config = SourceConfig {
            dialect: Some(Dialect::Sqlite),
            database: Some("/data/app.db".into()),
            ..Default::default()
        };
        assert_eq!(config.dsn().unwrap(), "sqlite:/data/app.db?mode=ro");
    }

    #[test]
    fn test_dsn_unsupported_dialect() {
        let config = SourceConfig {
            dialect: Some(Dialect::Oracle),
            host: Some("ora".into()),
            database: Some("XE".into()),
            ..Default::default()
        };
        assert!(matches!(
            config.dsn(),
            Err(AskError::DialectUnsupported(_))
        ));
    }

    #[test]
    fn test_display_omits_password() {
        let config = SourceConfig {
            dialect: Some(Dialect::MySql),
            host: Some("db".into()),
            port: Some(3306),
            database: Some("sales".into()),
            password: Some("hunter2".into()),
            ..Default::default()
        };
        let display = config.display();
        assert_eq!(display, "mysql://db:3306/sales");
        assert!(!display.contains("hunter2"));
    }

    #[test]
    fn test_group_catalog_rows() {
        let tables = vec!["orders".to_string(), "ghost".to_string()];
        let rows: Vec<CatalogRow> = vec![
            (
                "orders".into(),
                Some("order fact table".into()),
                "id".into(),
                "bigint".into(),
                "NO".into(),
                None,
            ),
            (
                "orders".into(),
                Some("order fact table".into()),
                "amount".into(),
                "decimal(10,2)".into(),
                "YES".into(),
                Some("order amount".into()),
            ),
        ];

        let schemas = group_catalog_rows(&tables, rows);
        assert_eq!(schemas.len(), 2);

        assert_eq!(schemas[0].name, "orders");
        assert!(schemas[0].found);
        assert_eq!(schemas[0].comment.as_deref(), Some("order fact table"));
        assert_eq!(schemas[0].columns.len(), 2);
        assert!(!schemas[0].columns[0].nullable);
        assert!(schemas[0].columns[1].nullable);

        assert_eq!(schemas[1].name, "ghost");
        assert!(!schemas[1].found);
    }
}
