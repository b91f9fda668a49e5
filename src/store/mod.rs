//! Document store abstraction consumed by the settlement engine.
//!
//! The engine is a computation layer over an externally-defined document
//! schema; this module defines the narrow interface it needs (point reads,
//! collection scans with a single range filter, chunked batch writes, and
//! multi-document transactions) plus two backends: an in-memory versioned
//! store with optimistic concurrency and a SQLite-backed store for durable
//! local deployments.

pub mod memory;
pub mod sqlite;

use serde::de::DeserializeOwned;
use serde::Serialize;
use serde_json::Value;
use thiserror::Error;

use crate::error::EngineError;

pub use memory::MemoryStore;
pub use sqlite::SqliteStore;

#[derive(Debug, Error)]
pub enum StoreError {
    #[error("document {collection}/{id} not found")]
    NotFound { collection: String, id: String },
    #[error("document {collection}/{id} already exists")]
    AlreadyExists { collection: String, id: String },
    #[error("write conflict on {collection}/{id}")]
    Conflict { collection: String, id: String },
    #[error("serialization error: {0}")]
    Serde(#[from] serde_json::Error),
    #[error("sqlite error: {0}")]
    Sqlite(#[from] rusqlite::Error),
}

/// A stored document: id plus its JSON payload
#[derive(Debug, Clone)]
pub struct Document {
    pub id: String,
    pub data: Value,
}

impl Document {
    pub fn new(id: impl Into<String>, data: Value) -> Self {
        Self { id: id.into(), data }
    }

    /// Decode the payload into a typed entity
    pub fn parse<T: DeserializeOwned>(&self) -> Result<T, StoreError> {
        Ok(serde_json::from_value(self.data.clone())?)
    }

    /// Build a document from a typed entity
    pub fn from_entity<T: Serialize>(id: &str, entity: &T) -> Result<Self, StoreError> {
        Ok(Self::new(id, serde_json::to_value(entity)?))
    }
}

/// Write semantics for a single operation
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WriteMode {
    /// Merge fields into an existing document; fails if it does not exist
    Update,
    /// Insert a new document; fails if it already exists
    Create,
    /// Insert or fully replace
    Set,
}

/// One write in a batch
#[derive(Debug, Clone)]
pub struct WriteOp {
    pub collection: String,
    pub id: String,
    pub fields: Value,
    pub mode: WriteMode,
}

impl WriteOp {
    pub fn update(collection: &str, id: &str, fields: Value) -> Self {
        Self {
            collection: collection.to_string(),
            id: id.to_string(),
            fields,
            mode: WriteMode::Update,
        }
    }

    pub fn create(collection: &str, id: &str, fields: Value) -> Self {
        Self {
            collection: collection.to_string(),
            id: id.to_string(),
            fields,
            mode: WriteMode::Create,
        }
    }

    pub fn set(collection: &str, id: &str, fields: Value) -> Self {
        Self {
            collection: collection.to_string(),
            id: id.to_string(),
            fields,
            mode: WriteMode::Set,
        }
    }
}

/// Single range filter supported by collection scans
#[derive(Debug, Clone)]
pub enum Filter {
    /// Numeric field strictly greater than a value
    Gt { field: String, value: f64 },
}

impl Filter {
    pub fn gt(field: &str, value: f64) -> Self {
        Filter::Gt { field: field.to_string(), value }
    }

    pub(crate) fn matches(&self, data: &Value) -> bool {
        match self {
            Filter::Gt { field, value } => data
                .get(field)
                .and_then(Value::as_f64)
                .map(|v| v > *value)
                .unwrap_or(false),
        }
    }
}

/// Read/write handle scoped to one transaction attempt.
///
/// Reads observe committed state; writes are applied atomically at commit.
/// Backends may re-run the transaction body on contention, so the body must
/// be safe to execute more than once.
pub trait StoreTxn {
    fn get(&mut self, collection: &str, id: &str) -> Result<Option<Document>, StoreError>;
    fn update(&mut self, collection: &str, id: &str, fields: Value) -> Result<(), StoreError>;
    fn create(&mut self, collection: &str, id: &str, data: Value) -> Result<(), StoreError>;
}

/// The store interface consumed by the orchestrators.
///
/// `transact` runs the body against a transaction handle and commits
/// atomically; commit-time conflicts are retried a bounded number of times
/// before surfacing as [`EngineError::Conflict`]. A body error aborts the
/// transaction without retry (validation failures are not contention).
pub trait Store: Send + Sync {
    fn get(&self, collection: &str, id: &str) -> Result<Option<Document>, StoreError>;

    fn list(&self, collection: &str, filter: Option<&Filter>) -> Result<Vec<Document>, StoreError>;

    /// Apply a batch of writes. Individual op failures (missing target,
    /// duplicate create) are logged and skipped; the applied count is
    /// returned. Callers chunk batches to `MAX_BATCH_WRITES`.
    fn batch_write(&self, writes: &[WriteOp]) -> Result<usize, StoreError>;

    fn transact(
        &self,
        body: &mut dyn FnMut(&mut dyn StoreTxn) -> Result<(), EngineError>,
    ) -> Result<(), EngineError>;

    /// Allocate a fresh document id for a collection
    fn allocate_id(&self, collection: &str) -> String;
}

/// Shallow top-level field merge, matching document-store update semantics:
/// named fields are replaced wholesale, unnamed fields are untouched.
pub(crate) fn merge_fields(target: &mut Value, fields: &Value) {
    if let (Value::Object(target), Value::Object(fields)) = (target, fields) {
        for (key, value) in fields {
            target.insert(key.clone(), value.clone());
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_merge_fields_is_shallow() {
        let mut doc = json!({"a": 1, "pool": {"YES": 1.0, "NO": 2.0}, "keep": true});
        merge_fields(&mut doc, &json!({"a": 2, "pool": {"YES": 5.0}}));

        assert_eq!(doc["a"], 2);
        assert_eq!(doc["keep"], true);
        // Nested objects are replaced, not deep-merged
        assert_eq!(doc["pool"], json!({"YES": 5.0}));
    }

    #[test]
    fn test_filter_gt() {
        let filter = Filter::gt("timestamp", 100.0);
        assert!(filter.matches(&json!({"timestamp": 101})));
        assert!(!filter.matches(&json!({"timestamp": 100})));
        assert!(!filter.matches(&json!({"timestamp": 50})));
        assert!(!filter.matches(&json!({"other": 500})));
    }
}
