//! File-system blob store.

use async_trait::async_trait;
use std::path::{Path, PathBuf};
use tracing::{debug, warn};

use disclosure_common::error::ResultExt;
use disclosure_common::{Error, Result};

use super::BlobStore;

/// Stores each key as a file under `root`.
#[derive(Debug, Clone)]
pub struct FileStore {
    root: PathBuf,
}

impl FileStore {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    fn path_for(&self, key: &str) -> PathBuf {
        self.root.join(key)
    }
}

#[async_trait]
impl BlobStore for FileStore {
    async fn read(&self, key: &str) -> Option<Vec<u8>> {
        let path = self.path_for(key);
        match tokio::fs::read(&path).await {
            Ok(bytes) => Some(bytes),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => None,
            Err(e) => {
                warn!(path = %path.display(), error = %e, "Unreadable store file, treating as empty");
                None
            }
        }
    }

    async fn write(&self, key: &str, bytes: &[u8]) -> Result<()> {
        let path = self.path_for(key);
        if let Some(parent) = path.parent() {
            tokio::fs::create_dir_all(parent).await?;
        }

        // Write-then-rename so a crash never leaves a half-written file.
        let file_name = path
            .file_name()
            .map(|n| n.to_string_lossy().into_owned())
            .ok_or_else(|| Error::Storage(format!("invalid store key '{}'", key)))?;
        let tmp = path.with_file_name(format!(".{}.{}.tmp", file_name, uuid::Uuid::new_v4()));

        tokio::fs::write(&tmp, bytes)
            .await
            .context(format!("writing {}", tmp.display()))?;
        if let Err(e) = tokio::fs::rename(&tmp, &path).await {
            let _ = tokio::fs::remove_file(&tmp).await;
            return Err(Error::from(e).with_context(format!("replacing {}", path.display())));
        }

        debug!(path = %path.display(), bytes = bytes.len(), "Wrote store file");
        Ok(())
    }

    fn describe(&self) -> String {
        format!("file:{}", self.root.display())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_missing_file_reads_none() {
        let dir = tempfile::tempdir().unwrap();
        let store = FileStore::new(dir.path());
        assert!(store.read("nope.json").await.is_none());
    }

    #[tokio::test]
    async fn test_write_creates_parents_and_replaces() {
        let dir = tempfile::tempdir().unwrap();
        let store = FileStore::new(dir.path().join("nested"));

        store.write("cache/analysis.json", b"one").await.unwrap();
        store.write("cache/analysis.json", b"two").await.unwrap();

        assert_eq!(store.read("cache/analysis.json").await.unwrap(), b"two");

        let leftovers: Vec<_> = std::fs::read_dir(dir.path().join("nested/cache"))
            .unwrap()
            .filter_map(|e| e.ok())
            .filter(|e| e.file_name().to_string_lossy().ends_with(".tmp"))
            .collect();
        assert!(leftovers.is_empty());
    }

    #[tokio::test]
    async fn test_directory_key_reads_none() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::create_dir(dir.path().join("sub")).unwrap();
        let store = FileStore::new(dir.path());
        assert!(store.read("sub").await.is_none());
    }
}
