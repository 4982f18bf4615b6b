//! SQLite connection pool, migrations and the key-value table

use async_trait::async_trait;
use sqlx::sqlite::{SqliteConnectOptions, SqlitePool, SqlitePoolOptions};
use std::str::FromStr;
use std::time::Duration;
use tracing::info;

use crate::kv::{KvStore, StorageError};

/// SQLite configuration options
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SqliteConfig {
    /// Database URL (e.g., "sqlite:sluice.db?mode=rwc" or "sqlite::memory:")
    pub url: String,
    /// Maximum number of connections in the pool
    pub max_connections: u32,
    /// Enable WAL journal mode so readers don't block the claiming writer
    pub wal_mode: bool,
    /// Busy timeout in seconds
    pub busy_timeout_secs: u32,
    /// How long to wait for a pooled connection
    pub acquire_timeout_secs: u64,
}

impl Default for SqliteConfig {
    fn default() -> Self {
        Self {
            url: "sqlite:sluice.db?mode=rwc".to_string(),
            max_connections: 5,
            wal_mode: true,
            busy_timeout_secs: 30,
            acquire_timeout_secs: 10,
        }
    }
}

impl SqliteConfig {
    /// Create config for in-memory database (testing).
    ///
    /// Every in-memory connection is its own database, so the pool is
    /// pinned to a single connection that is never recycled.
    pub fn memory() -> Self {
        Self {
            url: "sqlite::memory:".to_string(),
            max_connections: 1,
            wal_mode: false,
            busy_timeout_secs: 5,
            acquire_timeout_secs: 10,
        }
    }

    pub fn file(url: &str) -> Self {
        Self {
            url: url.to_string(),
            ..Default::default()
        }
    }

    fn is_memory(&self) -> bool {
        self.url.contains(":memory:")
    }
}

/// SQLite storage backend
#[derive(Debug, Clone)]
pub struct SqliteBackend {
    pool: SqlitePool,
}

impl SqliteBackend {
    /// Create a new SQLite backend with default config
    pub async fn new(url: &str) -> Result<Self, StorageError> {
        Self::new_with_config(SqliteConfig::file(url)).await
    }

    /// Connect, apply pragmas and run migrations
    pub async fn new_with_config(config: SqliteConfig) -> Result<Self, StorageError> {
        let mut options = SqliteConnectOptions::from_str(&config.url)
            .map_err(|e| StorageError::Connection(e.to_string()))?
            .busy_timeout(Duration::from_secs(config.busy_timeout_secs as u64));

        if config.wal_mode && !config.is_memory() {
            options = options.pragma("journal_mode", "WAL");
        }

        let mut pool_options = SqlitePoolOptions::new()
            .max_connections(config.max_connections.max(1))
            .acquire_timeout(Duration::from_secs(config.acquire_timeout_secs));
        if config.is_memory() {
            pool_options = pool_options
                .max_connections(1)
                .idle_timeout(None)
                .max_lifetime(None);
        }

        let pool = pool_options
            .connect_with(options)
            .await
            .map_err(|e| StorageError::Connection(e.to_string()))?;

        info!(
            url = %config.url,
            wal = config.wal_mode,
            max_connections = config.max_connections,
            "Connected to SQLite"
        );

        sqlx::migrate!("./migrations")
            .run(&pool)
            .await
            .map_err(|e| StorageError::Migration(e.to_string()))?;

        Ok(Self { pool })
    }

    /// Get the connection pool
    pub fn pool(&self) -> &SqlitePool {
        &self.pool
    }

    pub async fn close(&self) {
        self.pool.close().await;
    }
}

/// Backs onto the `kv_store` table
#[async_trait]
impl KvStore for SqliteBackend {
    async fn read(&self, key: &str) -> Result<Option<String>, StorageError> {
        sqlx::query_scalar("SELECT value FROM kv_store WHERE key = ?")
            .bind(key)
            .fetch_optional(&self.pool)
            .await
            .map_err(|e| StorageError::Query(e.to_string()))
    }

    async fn write(&self, key: &str, value: String) -> Result<(), StorageError> {
        let now = chrono::Utc::now().timestamp_millis();
        sqlx::query(
            "INSERT INTO kv_store (key, value, created_at, updated_at) VALUES (?, ?, ?, ?) \
             ON CONFLICT(key) DO UPDATE SET value = excluded.value, updated_at = excluded.updated_at",
        )
        .bind(key)
        .bind(value)
        .bind(now)
        .bind(now)
        .execute(&self.pool)
        .await
        .map_err(|e| StorageError::Query(e.to_string()))?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_kv_cells_overwrite_in_place() {
        let backend = SqliteBackend::new_with_config(SqliteConfig::memory())
            .await
            .unwrap();
        assert!(backend.read("pace:metrics").await.unwrap().is_none());

        backend.write("pace:metrics", "{\"v\":1}".to_string()).await.unwrap();
        backend.write("pace:metrics", "{\"v\":2}".to_string()).await.unwrap();
        assert_eq!(
            backend.read("pace:metrics").await.unwrap().as_deref(),
            Some("{\"v\":2}")
        );

        let rows: i64 = sqlx::query_scalar("SELECT COUNT(*) FROM kv_store")
            .fetch_one(backend.pool())
            .await
            .unwrap();
        assert_eq!(rows, 1);
    }

    #[tokio::test]
    async fn test_closed_pool_reports_query_error() {
        let backend = SqliteBackend::new_with_config(SqliteConfig::memory())
            .await
            .unwrap();
        backend.close().await;
        assert!(matches!(
            backend.read("pace:metrics").await,
            Err(StorageError::Query(_))
        ));
    }
}
