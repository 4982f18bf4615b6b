//! Pacing state persisted through the key-value table

use std::sync::Arc;

use async_trait::async_trait;
use sluice_resilience::{PaceSnapshot, PaceStore, PaceStoreError};

use crate::kv::KvStore;

/// [`PaceStore`] over a [`KvStore`], one JSON cell per limiter under `pace:<name>`
#[derive(Debug, Clone)]
pub struct StoragePaceStore {
    kv: Arc<dyn KvStore>,
}

impl StoragePaceStore {
    pub fn new(kv: Arc<dyn KvStore>) -> Self {
        Self { kv }
    }

    fn key(name: &str) -> String {
        format!("pace:{}", name)
    }
}

#[async_trait]
impl PaceStore for StoragePaceStore {
    async fn load(&self, name: &str) -> Result<Option<PaceSnapshot>, PaceStoreError> {
        let Some(raw) = self
            .kv
            .read(&Self::key(name))
            .await
            .map_err(|e| PaceStoreError::Unavailable(e.to_string()))?
        else {
            return Ok(None);
        };
        serde_json::from_str(&raw)
            .map(Some)
            .map_err(|e| PaceStoreError::Serialization(e.to_string()))
    }

    async fn save(&self, snapshot: &PaceSnapshot) -> Result<(), PaceStoreError> {
        let raw = serde_json::to_string(snapshot)
            .map_err(|e| PaceStoreError::Serialization(e.to_string()))?;
        self.kv
            .write(&Self::key(&snapshot.name), raw)
            .await
            .map_err(|e| PaceStoreError::Unavailable(e.to_string()))
    }
}
