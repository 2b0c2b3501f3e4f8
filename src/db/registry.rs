//! Connection registry for user data sources.
//!
//! Owns one live client (and its pool) per data source. Credentials are
//! resolved and decrypted just-in-time through the [`SourceResolver`] seam;
//! plaintext never enters the registry's state.

use async_trait::async_trait;
use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use tokio::sync::OnceCell;
use tracing::{debug, info};
use uuid::Uuid;

use crate::config::PoolConfig;
use crate::db::{connect, DatabaseClient, SourceConfig};
use crate::error::Result;

/// Resolves a data-source id to connection settings with the password
/// already decrypted. Implemented by the self-storage store.
#[async_trait]
pub trait SourceResolver: Send + Sync {
    async fn resolve(&self, data_source_id: Uuid) -> Result<SourceConfig>;
}

type PoolSlot = Arc<OnceCell<Arc<dyn DatabaseClient>>>;

/// Process-wide registry of data-source pools.
pub struct ConnectionRegistry {
    resolver: Arc<dyn SourceResolver>,
    pool_config: PoolConfig,
    pools: Mutex<HashMap<Uuid, PoolSlot>>,
}

impl ConnectionRegistry {
    /// Creates an empty registry.
    pub fn new(resolver: Arc<dyn SourceResolver>, pool_config: PoolConfig) -> Self {
        Self {
            resolver,
            pool_config,
            pools: Mutex::new(HashMap::new()),
        }
    }

    /// Returns the client for the data source, creating its pool on first
    /// use. Concurrent first users share a single connection attempt; a
    /// failed attempt leaves no pool behind.
    pub async fn acquire(&self, data_source_id: Uuid) -> Result<Arc<dyn DatabaseClient>> {
        let slot = {
            let mut pools = self.pools.lock().expect("registry lock poisoned");
            pools
                .entry(data_source_id)
                .or_insert_with(|| Arc::new(OnceCell::new()))
                .clone()
        };

        let result = slot
            .get_or_try_init(|| async {
                let config = self.resolver.resolve(data_source_id).await?;
                debug!(
                    data_source = %data_source_id,
                    target = %config.display(),
                    "Opening pool"
                );
                let client = connect(&config, &self.pool_config).await?;
                Ok::<_, crate::error::AskError>(Arc::from(client))
            })
            .await;

        match result {
            Ok(client) => Ok(client.clone()),
            Err(e) => {
                // Drop the failed slot so the next acquire retries the probe.
                let mut pools = self.pools.lock().expect("registry lock poisoned");
                if let Some(existing) = pools.get(&data_source_id) {
                    if existing.get().is_none() {
                        pools.remove(&data_source_id);
                    }
                }
                Err(e)
            }
        }
    }

    /// Validates credentials with a throwaway connection. No pool is
    /// registered.
    pub async fn test(&self, config: &SourceConfig) -> Result<()> {
        let client = connect(config, &self.pool_config).await?;
        let outcome = client.ping().await;
        client.close().await;
        outcome
    }

    /// Drains and discards the pool for a data source. Called on config
    /// update or explicit admin action.
    pub async fn invalidate(&self, data_source_id: Uuid) {
        let slot = {
            let mut pools = self.pools.lock().expect("registry lock poisoned");
            pools.remove(&data_source_id)
        };

        if let Some(slot) = slot {
            if let Some(client) = slot.get() {
                info!(data_source = %data_source_id, "Invalidating pool");
                client.close().await;
            }
        }
    }

    /// Number of live pools. Used by tests and the health endpoint.
    pub fn pool_count(&self) -> usize {
        self.pools.lock().expect("registry lock poisoned").len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db::Dialect;
    use crate::error::AskError;
    use std::io::Write;

    struct FixedResolver {
        config: SourceConfig,
    }

    #[async_trait]
    impl SourceResolver for FixedResolver {
        async fn resolve(&self, _id: Uuid) -> Result<SourceConfig> {
            Ok(self.config.clone())
        }
    }

    fn sqlite_source(path: &std::path::Path) -> SourceConfig {
        SourceConfig {
            dialect: Some(Dialect::Sqlite),
            database: Some(path.display().to_string()),
            ..Default::default()
        }
    }

    fn registry_for(config: SourceConfig) -> ConnectionRegistry {
        ConnectionRegistry::new(Arc::new(FixedResolver { config }), PoolConfig::default())
    }

    fn temp_db() -> tempfile::NamedTempFile {
        // An empty file is a valid (empty) SQLite database.
        let mut f = tempfile::NamedTempFile::new().unwrap();
        f.flush().unwrap();
        f
    }

    #[tokio::test]
    async fn test_acquire_creates_one_pool() {
        let db = temp_db();
        let registry = registry_for(sqlite_source(db.path()));
        let id = Uuid::new_v4();

        let a = registry.acquire(id).await.unwrap();
        let b = registry.acquire(id).await.unwrap();
        assert!(Arc::ptr_eq(&a, &b));
        assert_eq!(registry.pool_count(), 1);
    }

    #[tokio::test]
    async fn test_acquire_unreachable_leaves_no_pool() {
        let registry = registry_for(SourceConfig {
            dialect: Some(Dialect::Sqlite),
            database: Some("/nonexistent/dir/no.db".into()),
            ..Default::default()
        });

        let err = registry.acquire(Uuid::new_v4()).await.unwrap_err();
        assert!(matches!(err, AskError::DataSourceUnreachable(_)));
        assert_eq!(registry.pool_count(), 0);
    }

    #[tokio::test]
    async fn test_unsupported_dialect() {
        let registry = registry_for(SourceConfig {
            dialect: Some(Dialect::Oracle),
            host: Some("ora".into()),
            database: Some("XE".into()),
            ..Default::default()
        });

        let err = registry.acquire(Uuid::new_v4()).await.unwrap_err();
        assert!(matches!(err, AskError::DialectUnsupported(_)));
    }

    #[tokio::test]
    async fn test_invalidate_drops_pool() {
        let db = temp_db();
        let registry = registry_for(sqlite_source(db.path()));
        let id = Uuid::new_v4();

        registry.acquire(id).await.unwrap();
        assert_eq!(registry.pool_count(), 1);

        registry.invalidate(id).await;
        assert_eq!(registry.pool_count(), 0);
    }

    #[tokio::test]
    async fn test_test_does_not_register_pool() {
        let db = temp_db();
        let registry = registry_for(sqlite_source(db.path()));

        registry.test(&sqlite_source(db.path())).await.unwrap();
        assert_eq!(registry.pool_count(), 0);
    }
}
