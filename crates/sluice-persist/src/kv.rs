//! String-valued key-value table used for small bits of durable state

use std::collections::HashMap;
use std::fmt::Debug;

use async_trait::async_trait;
use tokio::sync::RwLock;

/// Errors from the SQLite layer outside the job table
#[derive(Debug, thiserror::Error)]
pub enum StorageError {
    #[error("Connection error: {0}")]
    Connection(String),

    #[error("Query error: {0}")]
    Query(String),

    #[error("Migration failed: {0}")]
    Migration(String),
}

/// Last-write-wins string cells keyed by name
#[async_trait]
pub trait KvStore: Send + Sync + Debug {
    async fn read(&self, key: &str) -> Result<Option<String>, StorageError>;

    async fn write(&self, key: &str, value: String) -> Result<(), StorageError>;
}

/// In-process [`KvStore`]; nothing survives a restart
#[derive(Debug, Default)]
pub struct MemoryKv {
    cells: RwLock<HashMap<String, String>>,
}

impl MemoryKv {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl KvStore for MemoryKv {
    async fn read(&self, key: &str) -> Result<Option<String>, StorageError> {
        Ok(self.cells.read().await.get(key).cloned())
    }

    async fn write(&self, key: &str, value: String) -> Result<(), StorageError> {
        self.cells.write().await.insert(key.to_string(), value);
        Ok(())
    }
}
