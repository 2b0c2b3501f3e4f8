//! Answer shaping.
//!
//! Turns the model's raw reply into something executable and displayable:
//! parses the fenced JSON envelope (with a permissive fallback to the first
//! fenced SQL block), infers the chart kind from the executed result, and
//! builds the serializer-neutral chart configuration.

use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::fmt;
use std::str::FromStr;

use crate::db::{ColumnInfo, QueryResult, Value};

/// Low-cardinality ceiling for recommending a pie chart.
const PIE_MAX_SLICES: usize = 6;

/// How a result should be rendered.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ChartKind {
    #[default]
    Table,
    Bar,
    Line,
    Pie,
    Scatter,
    Area,
}

impl ChartKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Table => "table",
            Self::Bar => "bar",
            Self::Line => "line",
            Self::Pie => "pie",
            Self::Scatter => "scatter",
            Self::Area => "area",
        }
    }
}

impl FromStr for ChartKind {
    type Err = String;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "table" => Ok(Self::Table),
            "bar" => Ok(Self::Bar),
            "line" => Ok(Self::Line),
            "pie" => Ok(Self::Pie),
            "scatter" => Ok(Self::Scatter),
            "area" => Ok(Self::Area),
            _ => Err(format!("Unknown chart kind: {s}")),
        }
    }
}

impl fmt::Display for ChartKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// One y-axis series of a chart.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Series {
    /// Display name, usually the column name.
    pub name: String,
    /// Data column the series reads from.
    pub column: String,
}

/// Framework-neutral chart description.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ChartConfig {
    pub kind: ChartKind,
    pub title: String,
    /// Columns forming the x axis (categories or time).
    pub x_axis: Vec<String>,
    /// Y-axis series.
    pub series: Vec<Series>,
    /// All result columns, in order.
    pub columns: Vec<String>,
}

/// The model reply after envelope parsing.
#[derive(Debug, Clone, Default)]
pub struct ParsedReply {
    /// SQL to validate and execute, when the model produced any.
    pub sql: Option<String>,
    /// Prose shown to the user.
    pub explanation: String,
    /// The model's chart suggestion, when valid.
    pub chart_hint: Option<ChartKind>,
    /// The model flagged its own answer as beyond plain SELECT.
    pub complex: bool,
    /// Named parameter bindings supplied alongside the SQL.
    pub params: HashMap<String, Value>,
    /// A secondary non-SELECT code block was present; it is surfaced for
    /// manual execution, never run.
    pub has_advisory_block: bool,
}

#[derive(Debug, Deserialize)]
struct ReplyEnvelope {
    sql: Option<String>,
    explanation: Option<String>,
    #[serde(rename = "chartKind")]
    chart_kind: Option<String>,
    complex: Option<bool>,
    params: Option<serde_json::Map<String, serde_json::Value>>,
}

/// Parses the model's raw text.
///
/// Only fenced JSON is parsed as the envelope. When no envelope is found
/// the first fenced SQL block is extracted permissively and the remaining
/// text becomes the explanation.
pub fn parse_reply(raw: &str) -> ParsedReply {
    let blocks = fenced_blocks(raw);

    // Envelope pass: the first fenced block that parses as a JSON object.
    for block in &blocks {
        if !matches!(block.lang.as_str(), "" | "json") {
            continue;
        }
        if let Ok(envelope) = serde_json::from_str::<ReplyEnvelope>(&block.body) {
            let mut reply = ParsedReply {
                sql: envelope.sql.map(|s| s.trim().to_string()).filter(|s| !s.is_empty()),
                explanation: envelope.explanation.unwrap_or_default(),
                chart_hint: envelope
                    .chart_kind
                    .as_deref()
                    .and_then(|s| s.parse().ok()),
                complex: envelope.complex.unwrap_or(false),
                params: envelope
                    .params
                    .map(|m| m.into_iter().map(|(k, v)| (k, json_to_value(v))).collect())
                    .unwrap_or_default(),
                has_advisory_block: false,
            };
            reply.has_advisory_block = blocks
                .iter()
                .filter(|b| !std::ptr::eq(*b, block))
                .any(|b| is_non_select_sql(&b.body));
            return reply;
        }
    }

    // Fallback pass: first fenced SQL block, rest is prose.
    for block in &blocks {
        if matches!(block.lang.as_str(), "" | "sql") && !block.body.trim().is_empty() {
            let explanation = remove_span(raw, block.span).trim().to_string();
            let has_advisory_block = blocks
                .iter()
                .filter(|b| !std::ptr::eq(*b, block))
                .any(|b| is_non_select_sql(&b.body));
            return ParsedReply {
                sql: Some(block.body.trim().to_string()),
                explanation,
                chart_hint: None,
                complex: false,
                params: HashMap::new(),
                has_advisory_block,
            };
        }
    }

    ParsedReply {
        explanation: raw.trim().to_string(),
        ..Default::default()
    }
}

/// Picks the chart kind for an executed result.
///
/// The model's suggestion wins when it is valid and not `table`; otherwise
/// the shape of the data decides.
pub fn infer_chart_kind(result: &QueryResult, hint: Option<ChartKind>) -> ChartKind {
    if let Some(kind) = hint {
        if kind != ChartKind::Table {
            return kind;
        }
    }

    let numeric: Vec<usize> = numeric_columns(result);
    let temporal: Vec<usize> = temporal_columns(result);
    let categorical: Vec<usize> = (0..result.columns.len())
        .filter(|i| !numeric.contains(i) && !temporal.contains(i))
        .collect();

    // A single aggregate row reads best as a table.
    if result.rows.len() <= 1 {
        return ChartKind::Table;
    }

    // Time on x, one measure on y.
    if temporal.len() == 1 && numeric.len() == 1 {
        return ChartKind::Line;
    }

    // One label column, one measure: pie when the slices stay readable.
    if categorical.len() == 1 && numeric.len() == 1 && temporal.is_empty() {
        return if result.rows.len() <= PIE_MAX_SLICES {
            ChartKind::Pie
        } else {
            ChartKind::Bar
        };
    }

    // Up to two label dimensions with a single measure.
    if (1..=2).contains(&categorical.len()) && numeric.len() == 1 {
        return ChartKind::Bar;
    }

    // Two bare numbers against each other.
    if numeric.len() == 2 && categorical.is_empty() && temporal.is_empty() {
        return ChartKind::Scatter;
    }

    ChartKind::Table
}

/// Builds the chart configuration for an executed result.
pub fn build_chart_config(
    result: &QueryResult,
    kind: ChartKind,
    title: impl Into<String>,
) -> ChartConfig {
    let numeric = numeric_columns(result);
    let columns: Vec<String> = result.columns.iter().map(|c| c.name.clone()).collect();

    let (x_axis, series) = match kind {
        ChartKind::Table => (Vec::new(), Vec::new()),
        ChartKind::Scatter => {
            let mut nums = numeric.iter().map(|&i| columns[i].clone());
            let x = nums.next().into_iter().collect();
            let series = nums
                .map(|c| Series {
                    name: c.clone(),
                    column: c,
                })
                .collect();
            (x, series)
        }
        _ => {
            let x_axis: Vec<String> = (0..columns.len())
                .filter(|i| !numeric.contains(i))
                .map(|i| columns[i].clone())
                .collect();
            let series = numeric
                .iter()
                .map(|&i| Series {
                    name: columns[i].clone(),
                    column: columns[i].clone(),
                })
                .collect();
            (x_axis, series)
        }
    };

    ChartConfig {
        kind,
        title: title.into(),
        x_axis,
        series,
        columns,
    }
}

/// Indexes of numeric columns, judged by driver type with a value fallback.
fn numeric_columns(result: &QueryResult) -> Vec<usize> {
    (0..result.columns.len())
        .filter(|&i| {
            let type_name = result.columns[i].data_type.to_uppercase();
            if type_name.contains("INT")
                || type_name.contains("FLOAT")
                || type_name.contains("DOUBLE")
                || type_name.contains("REAL")
                || type_name.contains("DECIMAL")
                || type_name.contains("NUMERIC")
            {
                return true;
            }
            column_values(result, i).any(|v| v.as_f64().is_some())
        })
        .collect()
}

/// Indexes of date/timestamp columns, judged by type name, column name, or
/// ISO-looking string values.
fn temporal_columns(result: &QueryResult) -> Vec<usize> {
    (0..result.columns.len())
        .filter(|&i| {
            let type_name = result.columns[i].data_type.to_uppercase();
            if type_name.contains("DATE") || type_name.contains("TIME") {
                return true;
            }
            let name = result.columns[i].name.to_lowercase();
            if name.ends_with("date") || name.ends_with("_at") || name == "day" || name == "month" {
                return true;
            }
            column_values(result, i).any(|v| match v {
                Value::String(s) => looks_like_date(s),
                _ => false,
            }) && column_values(result, i).all(|v| match v {
                Value::String(s) => looks_like_date(s),
                Value::Null => true,
                _ => false,
            })
        })
        .collect()
}

fn column_values(result: &QueryResult, index: usize) -> impl Iterator<Item = &Value> {
    result.rows.iter().filter_map(move |row| row.get(index))
}

/// "2024-06-01", "2024-06-01 12:00:00", "2024/06" and friends.
fn looks_like_date(s: &str) -> bool {
    let bytes = s.as_bytes();
    bytes.len() >= 6
        && bytes[..4].iter().all(u8::is_ascii_digit)
        && (bytes[4] == b'-' || bytes[4] == b'/')
}

/// A fenced code block with its language tag and byte span in the source.
struct FencedBlock {
    lang: String,
    body: String,
    span: (usize, usize),
}

fn fenced_blocks(text: &str) -> Vec<FencedBlock> {
    let mut blocks = Vec::new();
    let mut cursor = 0usize;

    while let Some(open) = text[cursor..].find("```") {
        let open = cursor + open;
        let after_fence = open + 3;
        let Some(newline) = text[after_fence..].find('\n') else {
            break;
        };
        let lang = text[after_fence..after_fence + newline].trim().to_lowercase();
        let body_start = after_fence + newline + 1;
        let Some(close) = text[body_start..].find("```") else {
            break;
        };
        let body_end = body_start + close;
        blocks.push(FencedBlock {
            lang,
            body: text[body_start..body_end].to_string(),
            span: (open, body_end + 3),
        });
        cursor = body_end + 3;
    }

    blocks
}

fn remove_span(text: &str, span: (usize, usize)) -> String {
    format!("{}{}", &text[..span.0], &text[span.1..])
}

/// True when a code block's first keyword is something other than
/// SELECT/WITH.
fn is_non_select_sql(body: &str) -> bool {
    let first_word = body
        .trim()
        .split_whitespace()
        .next()
        .unwrap_or("")
        .to_uppercase();
    matches!(
        first_word.as_str(),
        "INSERT"
            | "UPDATE"
            | "DELETE"
            | "DROP"
            | "ALTER"
            | "CREATE"
            | "TRUNCATE"
            | "RENAME"
            | "GRANT"
            | "REVOKE"
            | "CALL"
            | "MERGE"
    )
}

fn json_to_value(v: serde_json::Value) -> Value {
    match v {
        serde_json::Value::Null => Value::Null,
        serde_json::Value::Bool(b) => Value::Bool(b),
        serde_json::Value::Number(n) => {
            if let Some(i) = n.as_i64() {
                Value::Int(i)
            } else {
                Value::Float(n.as_f64().unwrap_or(0.0))
            }
        }
        serde_json::Value::String(s) => Value::String(s),
        other => Value::String(other.to_string()),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    fn result_with(columns: &[(&str, &str)], rows: Vec<Vec<Value>>) -> QueryResult {
        QueryResult::with_data(
            columns
                .iter()
                .map(|(n, t)| ColumnInfo::new(*n, *t))
                .collect(),
            rows,
        )
    }

    // Envelope parsing

    #[test]
    fn test_parse_json_envelope() {
        let raw = r#"```json
{"sql": "SELECT region, SUM(amount) FROM orders GROUP BY region", "explanation": "Sales by region", "chartKind": "bar"}
```"#;
        let reply = parse_reply(raw);
        assert!(reply.sql.as_deref().unwrap().starts_with("SELECT region"));
        assert_eq!(reply.explanation, "Sales by region");
        assert_eq!(reply.chart_hint, Some(ChartKind::Bar));
        assert!(!reply.complex);
        assert!(!reply.has_advisory_block);
    }

    #[test]
    fn test_parse_envelope_with_params() {
        let raw = r#"```json
{"sql": "SELECT COUNT(*) FROM orders WHERE customer = :customer", "explanation": "", "chartKind": "table", "params": {"customer": "O'Brien"}}
```"#;
        let reply = parse_reply(raw);
        assert_eq!(
            reply.params.get("customer"),
            Some(&Value::String("O'Brien".into()))
        );
    }

    #[test]
    fn test_unfenced_json_is_not_parsed() {
        // Only fenced JSON counts as the envelope.
        let raw = r#"{"sql": "SELECT 1"}"#;
        let reply = parse_reply(raw);
        assert_eq!(reply.sql, None);
        assert_eq!(reply.explanation, raw);
    }

    #[test]
    fn test_fallback_to_sql_block() {
        let raw = "Here you go:\n\n```sql\nSELECT * FROM orders LIMIT 10\n```\n\nTen rows.";
        let reply = parse_reply(raw);
        assert_eq!(reply.sql.as_deref(), Some("SELECT * FROM orders LIMIT 10"));
        assert!(reply.explanation.contains("Here you go:"));
        assert!(reply.explanation.contains("Ten rows."));
    }

    #[test]
    fn test_prose_only_reply() {
        let reply = parse_reply("I cannot answer that from the selected tables.");
        assert_eq!(reply.sql, None);
        assert!(reply.explanation.contains("cannot answer"));
    }

    #[test]
    fn test_invalid_chart_hint_dropped() {
        let raw = "```json\n{\"sql\": \"SELECT 1\", \"chartKind\": \"hologram\"}\n```";
        let reply = parse_reply(raw);
        assert_eq!(reply.chart_hint, None);
    }

    #[test]
    fn test_secondary_non_select_block_flagged() {
        let raw = r#"```json
{"sql": "SELECT * FROM orders", "explanation": "plus an index you should add"}
```

```sql
CREATE INDEX idx_orders_region ON orders(region)
```"#;
        let reply = parse_reply(raw);
        assert!(reply.has_advisory_block);
        assert_eq!(reply.sql.as_deref(), Some("SELECT * FROM orders"));
    }

    #[test]
    fn test_complex_flag_carried() {
        let raw = "```json\n{\"sql\": \"SELECT 1\", \"complex\": true}\n```";
        assert!(parse_reply(raw).complex);
    }

    // Chart inference

    #[test]
    fn test_hint_wins_when_not_table() {
        let result = result_with(
            &[("region", "TEXT"), ("total", "REAL")],
            vec![
                vec![Value::String("north".into()), Value::Float(10.0)],
                vec![Value::String("south".into()), Value::Float(20.0)],
            ],
        );
        assert_eq!(
            infer_chart_kind(&result, Some(ChartKind::Area)),
            ChartKind::Area
        );
    }

    #[test]
    fn test_single_aggregate_row_is_table() {
        let result = result_with(&[("cnt", "INTEGER")], vec![vec![Value::Int(42)]]);
        assert_eq!(infer_chart_kind(&result, None), ChartKind::Table);
    }

    #[test]
    fn test_time_series_is_line() {
        let result = result_with(
            &[("day", "DATE"), ("total", "REAL")],
            vec![
                vec![Value::String("2024-06-01".into()), Value::Float(1.0)],
                vec![Value::String("2024-06-02".into()), Value::Float(2.0)],
            ],
        );
        assert_eq!(infer_chart_kind(&result, None), ChartKind::Line);
    }

    #[test]
    fn test_low_cardinality_category_is_pie() {
        let result = result_with(
            &[("status", "TEXT"), ("cnt", "INTEGER")],
            vec![
                vec![Value::String("open".into()), Value::Int(5)],
                vec![Value::String("closed".into()), Value::Int(7)],
                vec![Value::String("void".into()), Value::Int(1)],
            ],
        );
        assert_eq!(infer_chart_kind(&result, None), ChartKind::Pie);
    }

    #[test]
    fn test_high_cardinality_category_is_bar() {
        let rows: Vec<Vec<Value>> = (0..20)
            .map(|i| vec![Value::String(format!("c{i}")), Value::Int(i)])
            .collect();
        let result = result_with(&[("city", "TEXT"), ("cnt", "INTEGER")], rows);
        assert_eq!(infer_chart_kind(&result, None), ChartKind::Bar);
    }

    #[test]
    fn test_two_dimensions_one_measure_is_bar() {
        let result = result_with(
            &[("region", "TEXT"), ("product", "TEXT"), ("total", "REAL")],
            vec![
                vec![
                    Value::String("north".into()),
                    Value::String("widget".into()),
                    Value::Float(1.0),
                ],
                vec![
                    Value::String("south".into()),
                    Value::String("widget".into()),
                    Value::Float(2.0),
                ],
            ],
        );
        assert_eq!(infer_chart_kind(&result, None), ChartKind::Bar);
    }

    #[test]
    fn test_two_numerics_is_scatter() {
        let result = result_with(
            &[("price", "REAL"), ("quantity", "INTEGER")],
            vec![
                vec![Value::Float(9.5), Value::Int(3)],
                vec![Value::Float(7.25), Value::Int(11)],
            ],
        );
        assert_eq!(infer_chart_kind(&result, None), ChartKind::Scatter);
    }

    #[test]
    fn test_wide_result_falls_back_to_table() {
        let result = result_with(
            &[
                ("a", "TEXT"),
                ("b", "TEXT"),
                ("c", "TEXT"),
                ("x", "REAL"),
                ("y", "REAL"),
            ],
            vec![vec![
                Value::String("1".into()),
                Value::String("2".into()),
                Value::String("3".into()),
                Value::Float(1.0),
                Value::Float(2.0),
            ]; 3],
        );
        assert_eq!(infer_chart_kind(&result, None), ChartKind::Table);
    }

    // Chart config

    #[test]
    fn test_build_chart_config_bar() {
        let result = result_with(
            &[("region", "TEXT"), ("total", "REAL")],
            vec![vec![Value::String("north".into()), Value::Float(10.0)]],
        );
        let config = build_chart_config(&result, ChartKind::Bar, "Sales by region");
        assert_eq!(config.kind, ChartKind::Bar);
        assert_eq!(config.title, "Sales by region");
        assert_eq!(config.x_axis, vec!["region"]);
        assert_eq!(config.series.len(), 1);
        assert_eq!(config.series[0].column, "total");
        assert_eq!(config.columns, vec!["region", "total"]);
    }

    #[test]
    fn test_build_chart_config_scatter_splits_numerics() {
        let result = result_with(
            &[("price", "REAL"), ("quantity", "INTEGER")],
            vec![vec![Value::Float(1.0), Value::Int(2)]],
        );
        let config = build_chart_config(&result, ChartKind::Scatter, "");
        assert_eq!(config.x_axis, vec!["price"]);
        assert_eq!(config.series.len(), 1);
        assert_eq!(config.series[0].column, "quantity");
    }

    #[test]
    fn test_build_chart_config_table_has_no_axes() {
        let result = result_with(&[("cnt", "INTEGER")], vec![vec![Value::Int(1)]]);
        let config = build_chart_config(&result, ChartKind::Table, "Count");
        assert!(config.x_axis.is_empty());
        assert!(config.series.is_empty());
        assert_eq!(config.columns, vec!["cnt"]);
    }

    #[test]
    fn test_chart_kind_serde() {
        assert_eq!(serde_json::to_string(&ChartKind::Bar).unwrap(), "\"bar\"");
        let kind: ChartKind = serde_json::from_str("\"scatter\"").unwrap();
        assert_eq!(kind, ChartKind::Scatter);
    }
}
