//! SQLite blob store.

use async_trait::async_trait;
use chrono::Utc;
use rusqlite::{params, Connection, OptionalExtension};
use std::path::Path;
use std::sync::{Arc, Mutex};
use tracing::{info, warn};

use disclosure_common::{Error, Result};

use super::BlobStore;

const CREATE_TABLES_SQL: &str = r#"
CREATE TABLE IF NOT EXISTS blobs (
    path TEXT PRIMARY KEY,
    data BLOB NOT NULL,
    updated_at TEXT NOT NULL
);
"#;

/// Stores each key as a row of the `blobs` table.
///
/// Queries are blocking and run on the blocking thread pool.
pub struct SqliteStore {
    /// rusqlite::Connection is Send but not Sync
    db: Arc<Mutex<Connection>>,
    location: String,
}

impl SqliteStore {
    /// Open (or create) the database at `path`.
    pub fn open(path: &Path) -> Result<Self> {
        if let Some(parent) = path.parent() {
            if !parent.as_os_str().is_empty() {
                std::fs::create_dir_all(parent)?;
            }
        }

        let conn = Connection::open(path).map_err(storage_error)?;
        conn.execute_batch("PRAGMA journal_mode=WAL; PRAGMA synchronous=NORMAL;")
            .map_err(storage_error)?;

        info!(db_path = %path.display(), "Opened sqlite store");
        Self::from_connection(conn, format!("sqlite:{}", path.display()))
    }

    /// In-memory database.
    pub fn open_in_memory() -> Result<Self> {
        let conn = Connection::open_in_memory().map_err(storage_error)?;
        Self::from_connection(conn, "sqlite::memory:".to_string())
    }

    fn from_connection(conn: Connection, location: String) -> Result<Self> {
        conn.execute_batch(CREATE_TABLES_SQL).map_err(storage_error)?;
        Ok(Self {
            db: Arc::new(Mutex::new(conn)),
            location,
        })
    }
}

fn storage_error(e: rusqlite::Error) -> Error {
    Error::Storage(e.to_string())
}

impl SqliteStore {
    /// Run `op` against the connection on the blocking pool.
    async fn with_connection<T, F>(&self, op: F) -> Result<T>
    where
        T: Send + 'static,
        F: FnOnce(&Connection) -> rusqlite::Result<T> + Send + 'static,
    {
        let db = Arc::clone(&self.db);
        tokio::task::spawn_blocking(move || {
            let conn = db
                .lock()
                .map_err(|_| Error::Storage("sqlite connection lock poisoned".into()))?;
            op(&conn).map_err(storage_error)
        })
        .await
        .map_err(|e| Error::Storage(format!("sqlite task failed: {}", e)))?
    }
}

#[async_trait]
impl BlobStore for SqliteStore {
    async fn read(&self, key: &str) -> Option<Vec<u8>> {
        let path = key.to_string();
        let result = self
            .with_connection(move |db| {
                db.query_row("SELECT data FROM blobs WHERE path = ?1", params![path], |row| {
                    row.get::<_, Vec<u8>>(0)
                })
                .optional()
            })
            .await;

        match result {
            Ok(data) => data,
            Err(e) => {
                warn!(key, error = %e, "Unreadable sqlite blob, treating as empty");
                None
            }
        }
    }

    async fn write(&self, key: &str, bytes: &[u8]) -> Result<()> {
        let path = key.to_string();
        let data = bytes.to_vec();
        self.with_connection(move |db| {
            db.execute(
                "INSERT OR REPLACE INTO blobs (path, data, updated_at) VALUES (?1, ?2, ?3)",
                params![path, data, Utc::now().to_rfc3339()],
            )
        })
        .await?;
        Ok(())
    }

    fn describe(&self) -> String {
        self.location.clone()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_round_trip_and_overwrite() {
        let store = SqliteStore::open_in_memory().unwrap();
        assert!(store.read("k").await.is_none());

        store.write("k", b"first").await.unwrap();
        store.write("k", b"second").await.unwrap();
        assert_eq!(store.read("k").await.unwrap(), b"second");
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn test_concurrent_writers_on_multi_thread_runtime() {
        let store = Arc::new(SqliteStore::open_in_memory().unwrap());
        let mut handles = Vec::new();
        for i in 0..8 {
            let store = Arc::clone(&store);
            handles.push(tokio::spawn(async move {
                store.write(&format!("key-{}", i), format!("v{}", i).as_bytes()).await
            }));
        }
        for handle in handles {
            handle.await.unwrap().unwrap();
        }

        for i in 0..8 {
            assert_eq!(store.read(&format!("key-{}", i)).await.unwrap(), format!("v{}", i).into_bytes());
        }
    }

    #[tokio::test]
    async fn test_persists_across_reopen() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("store.db");

        {
            let store = SqliteStore::open(&path).unwrap();
            store.write("facts", b"[]").await.unwrap();
        }

        let store = SqliteStore::open(&path).unwrap();
        assert_eq!(store.read("facts").await.unwrap(), b"[]");
        assert!(store.describe().starts_with("sqlite:"));
    }
}
