//! Schema loader for the prompt's table descriptions.
//!
//! Materializes the table-and-column description for a session's selected
//! tables. Results are cached per (data source, table set) with a short TTL;
//! concurrent cold loads for the same key are single-flighted so a stampede
//! of turns issues one catalog query.

use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};
use tracing::debug;
use uuid::Uuid;

use crate::db::{ConnectionRegistry, TableSchema};
use crate::error::{AskError, Result};

/// Cache key: data source plus the ordered table set.
type CacheKey = (Uuid, Vec<String>);

struct CacheEntry {
    loaded_at: Instant,
    schemas: Vec<TableSchema>,
}

/// Loads and caches table descriptions.
pub struct SchemaLoader {
    registry: Arc<ConnectionRegistry>,
    ttl: Duration,
    timeout: Duration,
    cache: Mutex<HashMap<CacheKey, CacheEntry>>,
    inflight: Mutex<HashMap<CacheKey, Arc<tokio::sync::Mutex<()>>>>,
}

impl SchemaLoader {
    /// Creates a loader over the registry with the given TTL and per-load
    /// timeout.
    pub fn new(registry: Arc<ConnectionRegistry>, ttl: Duration, timeout: Duration) -> Self {
        Self {
            registry,
            ttl,
            timeout,
            cache: Mutex::new(HashMap::new()),
            inflight: Mutex::new(HashMap::new()),
        }
    }

    /// Returns the description of the selected tables. A table the catalog
    /// no longer knows comes back as a not-found marker, not an error.
    pub async fn load(&self, data_source_id: Uuid, tables: &[String]) -> Result<Vec<TableSchema>> {
        let key: CacheKey = (data_source_id, tables.to_vec());

        if let Some(schemas) = self.fresh_entry(&key) {
            return Ok(schemas);
        }

        // Take the per-key lock so only one caller fetches; the rest find
        // the warm cache when the lock frees up.
        let flight = {
            let mut inflight = self.inflight.lock().expect("schema inflight lock poisoned");
            inflight
                .entry(key.clone())
                .or_insert_with(|| Arc::new(tokio::sync::Mutex::new(())))
                .clone()
        };
        let _guard = flight.lock().await;

        if let Some(schemas) = self.fresh_entry(&key) {
            return Ok(schemas);
        }

        debug!(data_source = %data_source_id, tables = ?tables, "Loading schema");
        let client = self.registry.acquire(data_source_id).await?;
        let schemas = tokio::time::timeout(self.timeout, client.fetch_columns(tables))
            .await
            .map_err(|_| AskError::QueryTimeout(self.timeout.as_secs()))??;

        let mut cache = self.cache.lock().expect("schema cache lock poisoned");
        cache.insert(
            key,
            CacheEntry {
                loaded_at: Instant::now(),
                schemas: schemas.clone(),
            },
        );

        Ok(schemas)
    }

    /// Drops all cached entries for a data source. Called on config update.
    pub fn invalidate(&self, data_source_id: Uuid) {
        let mut cache = self.cache.lock().expect("schema cache lock poisoned");
        cache.retain(|(id, _), _| *id != data_source_id);
    }

    /// Returns the cached schemas when the entry is still within TTL.
    fn fresh_entry(&self, key: &CacheKey) -> Option<Vec<TableSchema>> {
        let cache = self.cache.lock().expect("schema cache lock poisoned");
        cache.get(key).and_then(|entry| {
            (entry.loaded_at.elapsed() < self.ttl).then(|| entry.schemas.clone())
        })
    }
}

/// Renders table descriptions as the prompt's schema block.
pub fn format_for_prompt(schemas: &[TableSchema]) -> String {
    let mut out = String::new();
    for schema in schemas {
        if !schema.found {
            out.push_str(&format!("Table: {} -- table not found\n\n", schema.name));
            continue;
        }
        out.push_str(&format!("Table: {}", schema.name));
        if let Some(comment) = &schema.comment {
            out.push_str(&format!(" -- {comment}"));
        }
        out.push('\n');
        for col in &schema.columns {
            out.push_str(&format!(
                "  {}: {}{}",
                col.name,
                col.data_type,
                if col.nullable { "" } else { " NOT NULL" }
            ));
            if let Some(comment) = &col.comment {
                out.push_str(&format!(" -- {comment}"));
            }
            out.push('\n');
        }
        out.push('\n');
    }
    out.trim_end().to_string()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db::ColumnSchema;

    fn orders_schema() -> TableSchema {
        TableSchema {
            name: "orders".into(),
            comment: Some("order facts".into()),
            columns: vec![
                ColumnSchema {
                    name: "id".into(),
                    data_type: "INTEGER".into(),
                    nullable: false,
                    comment: None,
                },
                ColumnSchema {
                    name: "amount".into(),
                    data_type: "REAL".into(),
                    nullable: true,
                    comment: Some("order amount".into()),
                },
            ],
            found: true,
        }
    }

    #[test]
    fn test_format_for_prompt() {
        let text = format_for_prompt(&[orders_schema()]);
        assert!(text.contains("Table: orders -- order facts"));
        assert!(text.contains("id: INTEGER NOT NULL"));
        assert!(text.contains("amount: REAL -- order amount"));
    }

    #[test]
    fn test_format_marks_missing_table() {
        let text = format_for_prompt(&[orders_schema(), TableSchema::not_found("ghost")]);
        assert!(text.contains("Table: ghost -- table not found"));
    }

    #[test]
    fn test_format_empty() {
        assert_eq!(format_for_prompt(&[]), "");
    }
}
