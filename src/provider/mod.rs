//! Document store trait: the storage abstraction behind the broker
//!
//! All storage backends implement `DocumentStore` to provide a uniform
//! API for inserting and querying JSON documents grouped in named
//! collections. The broker never touches physical I/O directly.

use crate::error::Result;
use async_trait::async_trait;
use serde_json::Value;

pub mod file;
pub mod memory;

/// A stored JSON document; `_id` is assigned on insert when absent
pub type Document = serde_json::Map<String, Value>;

/// Field holding a document's identifier
pub const ID_FIELD: &str = "_id";

/// Inclusive integer range on one field; either side may be open
#[derive(Debug, Clone, PartialEq)]
pub struct RangeFilter {
    pub field: String,
    pub min: Option<i64>,
    pub max: Option<i64>,
}

/// Conjunction of equality and range conditions
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Filter {
    pub equals: Vec<(String, Value)>,
    pub range: Option<RangeFilter>,
}

impl Filter {
    /// Match every document
    pub fn all() -> Self {
        Self::default()
    }

    pub fn eq(mut self, field: impl Into<String>, value: impl Into<Value>) -> Self {
        self.equals.push((field.into(), value.into()));
        self
    }

    pub fn between(mut self, field: impl Into<String>, min: Option<i64>, max: Option<i64>) -> Self {
        self.range = Some(RangeFilter {
            field: field.into(),
            min,
            max,
        });
        self
    }

    /// Whether `doc` satisfies every condition
    pub fn matches(&self, doc: &Document) -> bool {
        let equals_ok = self
            .equals
            .iter()
            .all(|(field, value)| doc.get(field) == Some(value));

        let range_ok = match &self.range {
            None => true,
            Some(range) => match doc.get(&range.field).and_then(Value::as_i64) {
                Some(v) => range.min.map_or(true, |min| v >= min) && range.max.map_or(true, |max| v <= max),
                None => false,
            },
        };

        equals_ok && range_ok
    }
}

/// Sort direction on an integer field
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SortOrder {
    Ascending(String),
    Descending(String),
}

/// Ordering and limit applied after filtering
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct FindOptions {
    pub sort: Option<SortOrder>,
    pub limit: Option<usize>,
}

impl FindOptions {
    /// Newest-first by `field`, at most `limit` documents
    pub fn newest(field: impl Into<String>, limit: usize) -> Self {
        Self {
            sort: Some(SortOrder::Descending(field.into())),
            limit: Some(limit),
        }
    }

    /// Oldest-first by `field`, no limit
    pub fn oldest_first(field: impl Into<String>) -> Self {
        Self {
            sort: Some(SortOrder::Ascending(field.into())),
            limit: None,
        }
    }
}

/// Core trait for storage backends
///
/// Implementations must provide at-least atomic single-document inserts
/// and enforce unique indexes declared with `ensure_unique`.
#[async_trait]
pub trait DocumentStore: Send + Sync {
    /// Insert one document, returning its `_id`
    ///
    /// Fails with `DuplicateKey` when a unique field value is already taken.
    async fn insert_one(&self, collection: &str, doc: Document) -> Result<String>;

    /// Find documents matching `filter`
    async fn find(
        &self,
        collection: &str,
        filter: &Filter,
        options: &FindOptions,
    ) -> Result<Vec<Document>>;

    /// Count documents matching `filter`
    async fn count(&self, collection: &str, filter: &Filter) -> Result<u64>;

    /// Declare `field` unique within `collection`
    async fn ensure_unique(&self, collection: &str, field: &str) -> Result<()>;

    /// Names of all non-empty collections
    async fn collections(&self) -> Result<Vec<String>>;

    /// Store status information
    async fn info(&self) -> Result<StoreInfo>;

    /// Store name (e.g., "memory", "file")
    fn name(&self) -> &str;

    /// Health check; returns true if the store is operational
    ///
    /// Default implementation delegates to `info()`.
    async fn health(&self) -> Result<bool> {
        self.info().await.map(|_| true)
    }
}

/// Store status information
#[derive(Debug, Clone)]
pub struct StoreInfo {
    /// Store name
    pub store: String,
    /// Number of collections holding documents
    pub collections: usize,
    /// Total documents stored
    pub documents: u64,
}

/// Fresh document identifier
pub(crate) fn new_id() -> String {
    uuid::Uuid::new_v4().simple().to_string()
}
