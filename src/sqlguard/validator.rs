//! Validation rules, applied in order: fence stripping and statement
//! extraction, read-only classification, parameter normalization, and the
//! length/comment-density caps.

use sqlparser::ast::{Query, Select, SetExpr, Statement, TableFactor, TableWithJoins};
use sqlparser::dialect::{
    Dialect as ParserDialect, GenericDialect, MsSqlDialect, MySqlDialect, PostgreSqlDialect,
    SQLiteDialect,
};
use sqlparser::parser::Parser;

use crate::db::Dialect;
use crate::error::{AskError, Result};
use crate::sqlguard::scanner::{scan, ParamSite};
use crate::sqlguard::ValidatedSql;

/// Hard cap on statement length, in characters.
pub const MAX_SQL_CHARS: usize = 8192;

/// Comments may make up at most this share of the statement.
const MAX_COMMENT_RATIO: f64 = 0.5;

/// Strips a surrounding markdown fence (```sql ... ``` or ``` ... ```).
pub fn strip_fences(text: &str) -> String {
    let trimmed = text.trim();
    let Some(rest) = trimmed.strip_prefix("```") else {
        return trimmed.to_string();
    };

    // Drop the language tag up to the first newline.
    let rest = match rest.find('\n') {
        Some(i) => &rest[i + 1..],
        None => rest,
    };
    let rest = rest.strip_suffix("```").unwrap_or(rest);
    rest.trim().to_string()
}

/// Validates one statement for read-only execution against `dialect`.
///
/// On success the returned SQL has named `:param` tokens replaced by the
/// dialect's placeholders, with the names listed in placeholder order.
pub fn validate(raw: &str, dialect: Dialect) -> Result<ValidatedSql> {
    let body = strip_fences(raw);
    if body.is_empty() {
        return Err(AskError::SqlEmpty);
    }
    if body.chars().count() > MAX_SQL_CHARS {
        return Err(AskError::SqlLengthExceeded(format!(
            "statement is longer than {MAX_SQL_CHARS} characters"
        )));
    }

    let outcome = scan(&body);
    if outcome.statements.is_empty() {
        return Err(AskError::SqlEmpty);
    }
    if outcome.statements.len() > 1 {
        return Err(AskError::SqlMultiStatement);
    }
    if outcome.comment_bytes as f64 > body.len() as f64 * MAX_COMMENT_RATIO {
        return Err(AskError::SqlLengthExceeded(
            "statement is mostly comments".to_string(),
        ));
    }

    // Trim the statement span without losing byte offsets; the parameter
    // sites below are rebased against the trimmed start.
    let (span_start, span_end) = outcome.statements[0];
    let segment = &body[span_start..span_end];
    let start = span_start + (segment.len() - segment.trim_start().len());
    let end = span_end - (segment.len() - segment.trim_end().len());
    let statement = &body[start..end];

    // Parameter sites inside the statement span, rebased onto it.
    let sites: Vec<ParamSite> = outcome
        .params
        .into_iter()
        .filter(|site| site.start >= start && site.end <= end)
        .map(|site| ParamSite {
            start: site.start - start,
            end: site.end - start,
            name: site.name,
        })
        .collect();

    // Classification runs on a copy with parameters stubbed out so the
    // parser never sees placeholder syntax it does not know.
    let classify_text = substitute_params(statement, &sites, |_, _| "NULL".to_string());
    ensure_read_only(&classify_text, dialect)?;

    let mut param_names = Vec::with_capacity(sites.len());
    let normalized = substitute_params(statement, &sites, |index, name| {
        param_names.push(name.to_string());
        dialect.param_form(index)
    });

    Ok(ValidatedSql {
        sql: normalized,
        param_names,
    })
}

/// Rewrites each parameter site using `replacement(1-based index, name)`.
fn substitute_params(
    statement: &str,
    sites: &[ParamSite],
    mut replacement: impl FnMut(usize, &str) -> String,
) -> String {
    let mut out = String::with_capacity(statement.len());
    let mut cursor = 0usize;
    for (i, site) in sites.iter().enumerate() {
        out.push_str(&statement[cursor..site.start]);
        out.push_str(&replacement(i + 1, &site.name));
        cursor = site.end;
    }
    out.push_str(&statement[cursor..]);
    out
}

/// Parses the statement and rejects anything that is not a SELECT, or a
/// WITH whose every part is read-only.
fn ensure_read_only(sql: &str, dialect: Dialect) -> Result<()> {
    let statements = Parser::parse_sql(parser_dialect(dialect).as_ref(), sql)
        .map_err(|e| AskError::SqlNotReadOnly(format!("could not parse SQL: {e}")))?;

    match statements.len() {
        0 => Err(AskError::SqlEmpty),
        1 => ensure_read_only_statement(&statements[0]),
        _ => Err(AskError::SqlMultiStatement),
    }
}

fn parser_dialect(dialect: Dialect) -> Box<dyn ParserDialect> {
    match dialect {
        Dialect::MySql => Box::new(MySqlDialect {}),
        Dialect::PostgreSql => Box::new(PostgreSqlDialect {}),
        Dialect::Sqlite => Box::new(SQLiteDialect {}),
        Dialect::SqlServer => Box::new(MsSqlDialect {}),
        Dialect::Oracle => Box::new(GenericDialect {}),
    }
}

fn ensure_read_only_statement(statement: &Statement) -> Result<()> {
    match statement {
        Statement::Query(query) => ensure_read_only_query(query),
        other => Err(AskError::SqlNotReadOnly(top_keyword(other).to_string())),
    }
}

/// Recursively checks a Query, including data-modifying CTEs.
fn ensure_read_only_query(query: &Query) -> Result<()> {
    if let Some(with) = &query.with {
        for cte in &with.cte_tables {
            ensure_read_only_query(&cte.query)?;
        }
    }
    ensure_read_only_set_expr(&query.body)
}

fn ensure_read_only_set_expr(set_expr: &SetExpr) -> Result<()> {
    match set_expr {
        SetExpr::Insert(_) => Err(AskError::SqlNotReadOnly("INSERT".to_string())),
        SetExpr::Update(_) => Err(AskError::SqlNotReadOnly("UPDATE".to_string())),
        SetExpr::Delete(_) => Err(AskError::SqlNotReadOnly("DELETE".to_string())),
        SetExpr::Merge(_) => Err(AskError::SqlNotReadOnly("MERGE".to_string())),
        SetExpr::Query(query) => ensure_read_only_query(query),
        SetExpr::Select(select) => ensure_read_only_select(select),
        SetExpr::SetOperation { left, right, .. } => {
            ensure_read_only_set_expr(left)?;
            ensure_read_only_set_expr(right)
        }
        SetExpr::Values(_) | SetExpr::Table(_) => Ok(()),
    }
}

/// Checks a SELECT's FROM clause for derived tables hiding mutations.
fn ensure_read_only_select(select: &Select) -> Result<()> {
    for table_with_joins in &select.from {
        ensure_read_only_table_with_joins(table_with_joins)?;
    }
    Ok(())
}

fn ensure_read_only_table_with_joins(twj: &TableWithJoins) -> Result<()> {
    ensure_read_only_table_factor(&twj.relation)?;
    for join in &twj.joins {
        ensure_read_only_table_factor(&join.relation)?;
    }
    Ok(())
}

fn ensure_read_only_table_factor(factor: &TableFactor) -> Result<()> {
    match factor {
        TableFactor::Derived { subquery, .. } => ensure_read_only_query(subquery),
        TableFactor::NestedJoin {
            table_with_joins, ..
        } => ensure_read_only_table_with_joins(table_with_joins),
        _ => Ok(()),
    }
}

/// Names the top-level construct for the rejection message.
fn top_keyword(statement: &Statement) -> &'static str {
    match statement {
        Statement::Insert(_) => "INSERT",
        Statement::Update { .. } => "UPDATE",
        Statement::Delete(_) => "DELETE",
        Statement::Drop { .. } => "DROP",
        Statement::Truncate { .. } => "TRUNCATE",
        Statement::Merge { .. } => "MERGE",
        Statement::AlterTable { .. }
        | Statement::AlterIndex { .. }
        | Statement::AlterView { .. }
        | Statement::AlterRole { .. } => "ALTER",
        Statement::CreateTable { .. }
        | Statement::CreateIndex { .. }
        | Statement::CreateView { .. }
        | Statement::CreateSchema { .. }
        | Statement::CreateDatabase { .. }
        | Statement::CreateFunction { .. }
        | Statement::CreateProcedure { .. }
        | Statement::CreateRole { .. }
        | Statement::CreateSequence { .. }
        | Statement::CreateType { .. } => "CREATE",
        Statement::Grant { .. } => "GRANT",
        Statement::Revoke { .. } => "REVOKE",
        Statement::Call(_) => "CALL",
        _ => "statement",
    }
}
