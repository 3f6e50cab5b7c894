//! In-memory document store
//!
//! Stores collections in a `HashMap` protected by `RwLock`.
//! Everything is lost on process restart; use `FileStore` to persist.

use super::{new_id, Document, DocumentStore, Filter, FindOptions, SortOrder, StoreInfo, ID_FIELD};
use crate::error::{BrokerError, Result};
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::HashMap;
use std::sync::RwLock;

/// One collection: documents in insertion order plus its unique fields
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub(crate) struct Collection {
    pub(crate) docs: Vec<Document>,
    #[serde(default)]
    pub(crate) unique: Vec<String>,
}

/// In-memory document store for single-process use and testing
#[derive(Default)]
pub struct MemoryStore {
    collections: RwLock<HashMap<String, Collection>>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub(crate) fn from_snapshot(collections: HashMap<String, Collection>) -> Self {
        Self {
            collections: RwLock::new(collections),
        }
    }

    pub(crate) fn snapshot(&self) -> Result<HashMap<String, Collection>> {
        let collections = self.collections.read().map_err(lock_err)?;
        Ok(collections.clone())
    }

    /// Drop the document with `id`, if present
    pub(crate) fn remove(&self, collection: &str, id: &str) -> Result<()> {
        let mut collections = self.collections.write().map_err(lock_err)?;
        if let Some(coll) = collections.get_mut(collection) {
            coll.docs
                .retain(|d| d.get(ID_FIELD).and_then(Value::as_str) != Some(id));
        }
        Ok(())
    }
}

fn lock_err<E: std::fmt::Display>(e: E) -> BrokerError {
    BrokerError::Storage(format!("Memory store lock poisoned: {}", e))
}

fn sort_key(doc: &Document, field: &str) -> i64 {
    doc.get(field).and_then(Value::as_i64).unwrap_or(i64::MIN)
}

#[async_trait]
impl DocumentStore for MemoryStore {
    async fn insert_one(&self, collection: &str, mut doc: Document) -> Result<String> {
        let id = match doc.get(ID_FIELD).and_then(Value::as_str) {
            Some(id) => id.to_string(),
            None => {
                let id = new_id();
                doc.insert(ID_FIELD.to_string(), Value::String(id.clone()));
                id
            }
        };

        let mut collections = self.collections.write().map_err(lock_err)?;
        let coll = collections.entry(collection.to_string()).or_default();

        let unique_fields = coll
            .unique
            .iter()
            .map(String::as_str)
            .chain(std::iter::once(ID_FIELD));
        for field in unique_fields {
            if let Some(value) = doc.get(field) {
                if coll.docs.iter().any(|d| d.get(field) == Some(value)) {
                    return Err(BrokerError::DuplicateKey {
                        collection: collection.to_string(),
                        field: field.to_string(),
                        value: match value {
                            Value::String(s) => s.clone(),
                            other => other.to_string(),
                        },
                    });
                }
            }
        }

        coll.docs.push(doc);
        Ok(id)
    }

    async fn find(
        &self,
        collection: &str,
        filter: &Filter,
        options: &FindOptions,
    ) -> Result<Vec<Document>> {
        let collections = self.collections.read().map_err(lock_err)?;
        let mut found: Vec<Document> = match collections.get(collection) {
            Some(coll) => coll.docs.iter().filter(|d| filter.matches(d)).cloned().collect(),
            None => return Ok(Vec::new()),
        };
        drop(collections);

        // Stable sorts keep insertion order between equal keys
        match &options.sort {
            Some(SortOrder::Ascending(field)) => {
                found.sort_by_key(|d| sort_key(d, field));
            }
            Some(SortOrder::Descending(field)) => {
                found.reverse();
                found.sort_by_key(|d| std::cmp::Reverse(sort_key(d, field)));
            }
            None => {}
        }

        if let Some(limit) = options.limit {
            found.truncate(limit);
        }
        Ok(found)
    }

    async fn count(&self, collection: &str, filter: &Filter) -> Result<u64> {
        let collections = self.collections.read().map_err(lock_err)?;
        Ok(collections
            .get(collection)
            .map(|coll| coll.docs.iter().filter(|d| filter.matches(d)).count() as u64)
            .unwrap_or(0))
    }

    async fn ensure_unique(&self, collection: &str, field: &str) -> Result<()> {
        let mut collections = self.collections.write().map_err(lock_err)?;
        let coll = collections.entry(collection.to_string()).or_default();
        if !coll.unique.iter().any(|f| f == field) {
            coll.unique.push(field.to_string());
        }
        Ok(())
    }

    async fn collections(&self) -> Result<Vec<String>> {
        let collections = self.collections.read().map_err(lock_err)?;
        let mut names: Vec<String> = collections
            .iter()
            .filter(|(_, coll)| !coll.docs.is_empty())
            .map(|(name, _)| name.clone())
            .collect();
        names.sort();
        Ok(names)
    }

    async fn info(&self) -> Result<StoreInfo> {
        let collections = self.collections.read().map_err(lock_err)?;
        Ok(StoreInfo {
            store: "memory".to_string(),
            collections: collections.values().filter(|c| !c.docs.is_empty()).count(),
            documents: collections.values().map(|c| c.docs.len() as u64).sum(),
        })
    }

    fn name(&self) -> &str {
        "memory"
    }
}
