//! # Sluice Persist
//!
//! SQLite storage for Sluice: the durable job table, a small key-value
//! table, and pacing state for adaptive rate limiters.
//!
//! ```no_run
//! use sluice_persist::{SqliteBackend, SqliteQueueStore};
//!
//! # async fn run() -> Result<(), Box<dyn std::error::Error>> {
//! let backend = SqliteBackend::new("sqlite:sluice.db?mode=rwc").await?;
//! let store = SqliteQueueStore::new(backend.pool().clone());
//! # let _ = store;
//! # Ok(())
//! # }
//! ```

pub mod kv;
pub mod pace;
pub mod queue;
pub mod sqlite;

pub use kv::{KvStore, MemoryKv, StorageError};
pub use pace::StoragePaceStore;
pub use queue::SqliteQueueStore;
pub use sqlite::{SqliteBackend, SqliteConfig};
