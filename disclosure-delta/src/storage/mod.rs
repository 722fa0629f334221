//! Durable blob storage behind the change cache and the fact store.
//!
//! # Backends
//!
//! - [`FileStore`]: one file per key under a root directory
//! - [`SqliteStore`]: one row per key in a single database
//! - [`MemoryStore`]: in-process map, for tests and dry runs
//!
//! A read of a missing or unreadable key yields `None`; callers treat that
//! as an empty store. Only writes report errors.

pub mod file;
pub mod sqlite;

pub use file::FileStore;
pub use sqlite::SqliteStore;

use async_trait::async_trait;
use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::RwLock;

use disclosure_common::{Config, Result, StorageBackend};

/// Key-addressed byte store.
#[async_trait]
pub trait BlobStore: Send + Sync {
    /// Read a blob. Missing or unreadable data is `None`.
    async fn read(&self, key: &str) -> Option<Vec<u8>>;

    /// Write a blob, replacing any previous content.
    async fn write(&self, key: &str, bytes: &[u8]) -> Result<()>;

    /// Human-readable location, for logs.
    fn describe(&self) -> String;
}

/// In-process store.
#[derive(Debug, Default, Clone)]
pub struct MemoryStore {
    blobs: Arc<RwLock<HashMap<String, Vec<u8>>>>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of keys currently held.
    pub async fn len(&self) -> usize {
        self.blobs.read().await.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.blobs.read().await.is_empty()
    }
}

#[async_trait]
impl BlobStore for MemoryStore {
    async fn read(&self, key: &str) -> Option<Vec<u8>> {
        self.blobs.read().await.get(key).cloned()
    }

    async fn write(&self, key: &str, bytes: &[u8]) -> Result<()> {
        self.blobs.write().await.insert(key.to_string(), bytes.to_vec());
        Ok(())
    }

    fn describe(&self) -> String {
        "memory".to_string()
    }
}

/// Open the backend selected in the configuration.
pub fn open_store(config: &Config) -> Result<Arc<dyn BlobStore>> {
    match config.storage.backend {
        StorageBackend::File => Ok(Arc::new(FileStore::new(config.storage.data_dir_path()))),
        StorageBackend::Sqlite => Ok(Arc::new(SqliteStore::open(
            &config.storage.sqlite_file_path(),
        )?)),
    }
}
