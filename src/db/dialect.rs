//! Per-dialect SQL shaping.
//!
//! Pure value functions selected by the data source dialect: identifier
//! quoting, parameter placeholder form, pagination wrapping, count wrapping,
//! and the catalog query that materializes table descriptions.

use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

/// Storage class a driver-reported column type maps to when rows become
/// neutral [`Value`](crate::db::Value)s. Anything unclassified renders as
/// text, which is always safe for display and charting.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ScalarKind {
    Bool,
    Int,
    Float,
    Text,
}

/// SQL flavor of a data source.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Dialect {
    #[serde(alias = "mariadb")]
    MySql,
    #[serde(alias = "postgres")]
    PostgreSql,
    Sqlite,
    SqlServer,
    Oracle,
}

impl Dialect {
    /// Returns the dialect as a string for persistence.
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::MySql => "mysql",
            Self::PostgreSql => "postgresql",
            Self::Sqlite => "sqlite",
            Self::SqlServer => "sqlserver",
            Self::Oracle => "oracle",
        }
    }

    /// Returns the default port for this dialect, when it listens on one.
    pub fn default_port(&self) -> Option<u16> {
        match self {
            Self::MySql => Some(3306),
            Self::PostgreSql => Some(5432),
            Self::Sqlite => None,
            Self::SqlServer => Some(1433),
            Self::Oracle => Some(1521),
        }
    }

    /// Returns true when this build can open live connections for the
    /// dialect. The others still get SQL shaping and validation.
    pub fn has_driver(&self) -> bool {
        matches!(self, Self::MySql | Self::PostgreSql | Self::Sqlite)
    }

    /// Quotes an identifier according to the dialect's rules. Embedded
    /// quoting characters are doubled (or escaped) so the result is always a
    /// single valid identifier.
    pub fn quote_ident(&self, name: &str) -> String {
        match self {
            Self::MySql => format!("`{}`", name.replace('`', "``")),
            Self::PostgreSql | Self::Sqlite | Self::Oracle => {
                format!("\"{}\"", name.replace('"', "\"\""))
            }
            Self::SqlServer => format!("[{}]", name.replace(']', "]]")),
        }
    }

    /// Returns the placeholder for the 1-based parameter `index`.
    pub fn param_form(&self, index: usize) -> String {
        match self {
            Self::MySql | Self::Sqlite => "?".to_string(),
            Self::PostgreSql => format!("${index}"),
            Self::SqlServer => format!("@p{index}"),
            Self::Oracle => format!(":p{index}"),
        }
    }

    /// Wraps an arbitrary SELECT in the dialect's pagination form.
    pub fn wrap_pagination(&self, sql: &str, offset: u64, limit: u64) -> String {
        let sql = sql.trim().trim_end_matches(';');
        match self {
            Self::MySql | Self::PostgreSql | Self::Sqlite => {
                if offset == 0 {
                    format!("{sql} LIMIT {limit}")
                } else {
                    format!("{sql} LIMIT {limit} OFFSET {offset}")
                }
            }
            Self::SqlServer => {
                if offset == 0 {
                    format!("SELECT TOP {limit} * FROM ({sql}) AS t")
                } else {
                    format!(
                        "SELECT * FROM ({sql}) AS t ORDER BY (SELECT NULL) \
                         OFFSET {offset} ROWS FETCH NEXT {limit} ROWS ONLY"
                    )
                }
            }
            Self::Oracle => {
                let upper = offset + limit;
                format!(
                    "SELECT * FROM (SELECT t.*, ROWNUM rn FROM ({sql}) t \
                     WHERE ROWNUM <= {upper}) WHERE rn > {offset}"
                )
            }
        }
    }

    /// Wraps an arbitrary SELECT as a single-column COUNT(*).
    pub fn count_wrapper(&self, sql: &str) -> String {
        let sql = sql.trim().trim_end_matches(';');
        match self {
            Self::SqlServer => format!("SELECT COUNT(*) FROM ({sql}) AS t"),
            _ => format!("SELECT COUNT(*) FROM ({sql}) t"),
        }
    }

    /// Classifies a driver-reported type name into its scalar class.
    ///
    /// The name arrives exactly as the driver spells it, so matching is on
    /// the uppercased exact name, not substrings (`POINT` and `INTERVAL`
    /// must not read as integers).
    pub fn scalar_kind(&self, type_name: &str) -> ScalarKind {
        let upper = type_name.to_uppercase();

        // MySQL idiom: booleans are TINYINT(1) on the wire.
        if *self == Self::MySql && upper == "TINYINT(1)" {
            return ScalarKind::Bool;
        }

        match upper.as_str() {
            "BOOL" | "BOOLEAN" => ScalarKind::Bool,
            "TINYINT" | "SMALLINT" | "MEDIUMINT" | "INT" | "INTEGER" | "BIGINT" | "INT2"
            | "INT4" | "INT8" | "BIGINT UNSIGNED" => ScalarKind::Int,
            "REAL" | "FLOAT" | "FLOAT4" | "FLOAT8" | "DOUBLE" | "DOUBLE PRECISION" => {
                ScalarKind::Float
            }
            _ => ScalarKind::Text,
        }
    }

    /// Returns the query listing base table names, one text column, sorted.
    pub fn list_tables_query(&self) -> &'static str {
        match self {
            Self::MySql => {
                "SELECT TABLE_NAME FROM information_schema.TABLES \
                 WHERE TABLE_SCHEMA = DATABASE() AND TABLE_TYPE = 'BASE TABLE' \
                 ORDER BY TABLE_NAME"
            }
            Self::PostgreSql => {
                "SELECT table_name::text FROM information_schema.tables \
                 WHERE table_schema = 'public' AND table_type = 'BASE TABLE' \
                 ORDER BY table_name"
            }
            Self::Sqlite => {
                "SELECT name FROM sqlite_master \
                 WHERE type = 'table' AND name NOT LIKE 'sqlite_%' ORDER BY name"
            }
            Self::SqlServer => {
                "SELECT TABLE_NAME FROM INFORMATION_SCHEMA.TABLES \
                 WHERE TABLE_TYPE = 'BASE TABLE' ORDER BY TABLE_NAME"
            }
            Self::Oracle => "SELECT TABLE_NAME FROM USER_TABLES ORDER BY TABLE_NAME",
        }
    }

    /// Returns the catalog query describing `tables` as rows of
    /// `(table_name, table_comment, column_name, data_type, is_nullable,
    /// column_comment)` where `is_nullable` is the literal `YES`/`NO`.
    ///
    /// Table names are embedded as escaped string literals: catalog queries
    /// run against system views, not user SQL, and the names were already
    /// pinned at session creation.
    pub fn catalog_query(&self, tables: &[String]) -> String {
        match self {
            Self::MySql => format!(
                "SELECT c.TABLE_NAME, t.TABLE_COMMENT, c.COLUMN_NAME, c.COLUMN_TYPE, \
                 c.IS_NULLABLE, c.COLUMN_COMMENT \
                 FROM information_schema.COLUMNS c \
                 JOIN information_schema.TABLES t \
                   ON t.TABLE_SCHEMA = c.TABLE_SCHEMA AND t.TABLE_NAME = c.TABLE_NAME \
                 WHERE c.TABLE_SCHEMA = DATABASE() AND c.TABLE_NAME IN ({}) \
                 ORDER BY c.TABLE_NAME, c.ORDINAL_POSITION",
                string_list(tables)
            ),
            Self::PostgreSql => format!(
                "SELECT c.table_name::text, obj_description(pc.oid)::text, \
                 c.column_name::text, c.data_type::text, c.is_nullable::text, \
                 col_description(pc.oid, c.ordinal_position)::text \
                 FROM information_schema.columns c \
                 JOIN pg_class pc ON pc.relname = c.table_name \
                 JOIN pg_namespace n ON n.oid = pc.relnamespace AND n.nspname = c.table_schema \
                 WHERE c.table_schema = 'public' AND c.table_name IN ({}) \
                 ORDER BY c.table_name, c.ordinal_position",
                string_list(tables)
            ),
            Self::Sqlite => tables
                .iter()
                .map(|t| {
                    let lit = string_literal(t);
                    format!(
                        "SELECT {lit} AS table_name, NULL AS table_comment, name, type, \
                         CASE \"notnull\" WHEN 0 THEN 'YES' ELSE 'NO' END AS is_nullable, \
                         NULL AS column_comment FROM pragma_table_info({lit})"
                    )
                })
                .collect::<Vec<_>>()
                .join(" UNION ALL "),
            Self::SqlServer => format!(
                "SELECT TABLE_NAME, NULL, COLUMN_NAME, DATA_TYPE, IS_NULLABLE, NULL \
                 FROM INFORMATION_SCHEMA.COLUMNS \
                 WHERE TABLE_NAME IN ({}) \
                 ORDER BY TABLE_NAME, ORDINAL_POSITION",
                string_list(tables)
            ),
            Self::Oracle => format!(
                "SELECT c.TABLE_NAME, tc.COMMENTS, c.COLUMN_NAME, c.DATA_TYPE, \
                 CASE c.NULLABLE WHEN 'Y' THEN 'YES' ELSE 'NO' END, cc.COMMENTS \
                 FROM USER_TAB_COLUMNS c \
                 LEFT JOIN USER_TAB_COMMENTS tc ON tc.TABLE_NAME = c.TABLE_NAME \
                 LEFT JOIN USER_COL_COMMENTS cc \
                   ON cc.TABLE_NAME = c.TABLE_NAME AND cc.COLUMN_NAME = c.COLUMN_NAME \
                 WHERE c.TABLE_NAME IN ({}) \
                 ORDER BY c.TABLE_NAME, c.COLUMN_ID",
                string_list(tables)
            ),
        }
    }
}

impl FromStr for Dialect {
    type Err = String;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "mysql" | "mariadb" => Ok(Self::MySql),
            "postgres" | "postgresql" => Ok(Self::PostgreSql),
            "sqlite" | "sqlite3" => Ok(Self::Sqlite),
            "sqlserver" | "mssql" => Ok(Self::SqlServer),
            "oracle" => Ok(Self::Oracle),
            _ => Err(format!("Unknown dialect: {}", s)),
        }
    }
}

impl fmt::Display for Dialect {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// Renders a SQL string literal with single quotes doubled.
fn string_literal(s: &str) -> String {
    format!("'{}'", s.replace('\'', "''"))
}

/// Renders a comma-separated list of string literals.
fn string_list(items: &[String]) -> String {
    items
        .iter()
        .map(|s| string_literal(s))
        .collect::<Vec<_>>()
        .join(", ")
}
