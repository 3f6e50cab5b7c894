//! JSON file-backed document store
//!
//! Keeps every collection in memory and rewrites a single JSON file after
//! each mutation. Atomic writes via temp file + rename to prevent corruption.
//!
//! Meant for development and single-node deployments with modest data
//! volumes: every insert re-serializes the whole store and writes it with
//! blocking `std::fs` calls on the calling task. A failed write rolls the
//! insert back, so memory never holds a document the file does not.

use super::memory::{Collection, MemoryStore};
use super::{Document, DocumentStore, Filter, FindOptions, StoreInfo};
use crate::error::{BrokerError, Result};
use async_trait::async_trait;
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use tokio::sync::Mutex;

/// Document store persisted to one JSON file
///
/// Write cost grows with the total store size, not the size of the insert.
pub struct FileStore {
    path: PathBuf,
    inner: MemoryStore,

    /// Serializes each mutation with its snapshot write
    write_lock: Mutex<()>,
}

impl FileStore {
    /// Open the store at `path`, loading existing contents if the file exists
    pub fn open(path: impl Into<PathBuf>) -> Result<Self> {
        let path = path.into();
        let collections = load(&path)?;
        tracing::debug!(
            path = %path.display(),
            collections = collections.len(),
            "File store opened"
        );

        Ok(Self {
            path,
            inner: MemoryStore::from_snapshot(collections),
            write_lock: Mutex::new(()),
        })
    }

    /// Get the file path
    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Write the current snapshot; callers hold `write_lock`
    fn persist(&self) -> Result<()> {
        let snapshot = self.inner.snapshot()?;
        let json = serde_json::to_string(&snapshot)?;

        let tmp_path = self.path.with_extension("tmp");

        if let Some(parent) = self.path.parent() {
            std::fs::create_dir_all(parent).map_err(|e| {
                BrokerError::Storage(format!(
                    "Failed to create store directory {}: {}",
                    parent.display(),
                    e
                ))
            })?;
        }

        std::fs::write(&tmp_path, json).map_err(|e| {
            BrokerError::Storage(format!(
                "Failed to write store file {}: {}",
                tmp_path.display(),
                e
            ))
        })?;

        std::fs::rename(&tmp_path, &self.path).map_err(|e| {
            BrokerError::Storage(format!(
                "Failed to rename store file {} → {}: {}",
                tmp_path.display(),
                self.path.display(),
                e
            ))
        })?;

        Ok(())
    }
}

fn load(path: &Path) -> Result<HashMap<String, Collection>> {
    if !path.exists() {
        return Ok(HashMap::new());
    }

    let json = std::fs::read_to_string(path).map_err(|e| {
        BrokerError::Storage(format!("Failed to read store file {}: {}", path.display(), e))
    })?;

    serde_json::from_str(&json).map_err(|e| {
        BrokerError::Storage(format!("Failed to parse store file {}: {}", path.display(), e))
    })
}

#[async_trait]
impl DocumentStore for FileStore {
    async fn insert_one(&self, collection: &str, doc: Document) -> Result<String> {
        let _guard = self.write_lock.lock().await;
        let id = self.inner.insert_one(collection, doc).await?;
        if let Err(e) = self.persist() {
            self.inner.remove(collection, &id)?;
            tracing::warn!(collection, error = %e, "Insert rolled back after failed write");
            return Err(e);
        }
        Ok(id)
    }

    async fn find(
        &self,
        collection: &str,
        filter: &Filter,
        options: &FindOptions,
    ) -> Result<Vec<Document>> {
        self.inner.find(collection, filter, options).await
    }

    async fn count(&self, collection: &str, filter: &Filter) -> Result<u64> {
        self.inner.count(collection, filter).await
    }

    async fn ensure_unique(&self, collection: &str, field: &str) -> Result<()> {
        let _guard = self.write_lock.lock().await;
        self.inner.ensure_unique(collection, field).await?;
        self.persist()
    }

    async fn collections(&self) -> Result<Vec<String>> {
        self.inner.collections().await
    }

    async fn info(&self) -> Result<StoreInfo> {
        let mut info = self.inner.info().await?;
        info.store = "file".to_string();
        Ok(info)
    }

    fn name(&self) -> &str {
        "file"
    }
}
