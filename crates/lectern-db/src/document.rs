//! Document store abstraction
//!
//! Records are JSON objects grouped in named collections. Writes that must be
//! atomic go through [`DocumentStore::commit_batch`], whose size is bounded by
//! [`DocumentStore::max_batch_ops`].

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use thiserror::Error;

/// Document store errors
#[derive(Debug, Error)]
pub enum DocumentStoreError {
    #[error("Database error: {0}")]
    Database(#[from] sqlx::Error),

    #[error("Migration failed: {0}")]
    Migration(String),

    #[error("Batch of {ops} operations exceeds the limit of {max}")]
    BatchTooLarge { ops: usize, max: usize },

    #[error("Document {collection}/{id} not found")]
    NotFound { collection: String, id: String },

    #[error("Invalid record: {0}")]
    InvalidRecord(String),

    #[error("Document store unavailable: {0}")]
    Unavailable(String),
}

pub type DocumentStoreResult<T> = Result<T, DocumentStoreError>;

/// A stored record.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Document {
    pub id: String,
    pub collection: String,
    pub data: Value,
}

impl Document {
    /// Field value, `None` when absent.
    pub fn field(&self, name: &str) -> Option<&Value> {
        self.data.get(name)
    }
}

/// Predicate selecting documents within a collection.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum RecordFilter {
    All,
    FieldEquals { field: String, value: Value },
}

impl RecordFilter {
    pub fn field_equals(field: impl Into<String>, value: impl Into<Value>) -> Self {
        RecordFilter::FieldEquals {
            field: field.into(),
            value: value.into(),
        }
    }

    pub fn matches(&self, data: &Value) -> bool {
        match self {
            RecordFilter::All => true,
            RecordFilter::FieldEquals { field, value } => data.get(field) == Some(value),
        }
    }
}

/// One mutation of a document field.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "op", rename_all = "snake_case")]
pub enum FieldChange {
    /// Add `delta` to an integer field; a missing field counts as 0.
    Increment { field: String, delta: i64 },
    Set { field: String, value: Value },
}

impl FieldChange {
    pub fn field(&self) -> &str {
        match self {
            FieldChange::Increment { field, .. } | FieldChange::Set { field, .. } => field,
        }
    }

    /// Apply to a JSON object in place.
    pub fn apply(&self, data: &mut Map<String, Value>) -> DocumentStoreResult<()> {
        match self {
            FieldChange::Increment { field, delta } => {
                let current = match data.get(field) {
                    None | Some(Value::Null) => 0,
                    Some(v) => v.as_i64().ok_or_else(|| {
                        DocumentStoreError::InvalidRecord(format!(
                            "Field {} is not an integer: {}",
                            field, v
                        ))
                    })?,
                };
                data.insert(field.clone(), Value::from(current.saturating_add(*delta)));
            }
            FieldChange::Set { field, value } => {
                data.insert(field.clone(), value.clone());
            }
        }
        Ok(())
    }
}

/// Update of one document inside an atomic batch.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BatchOp {
    pub collection: String,
    pub id: String,
    pub changes: Vec<FieldChange>,
}

impl BatchOp {
    pub fn update(collection: impl Into<String>, id: impl Into<String>) -> Self {
        Self {
            collection: collection.into(),
            id: id.into(),
            changes: Vec::new(),
        }
    }

    pub fn change(mut self, change: FieldChange) -> Self {
        self.changes.push(change);
        self
    }
}

/// Backing store for content records.
#[async_trait]
pub trait DocumentStore: Send + Sync {
    /// Insert a JSON object and return its generated id.
    async fn create(&self, collection: &str, record: Value) -> DocumentStoreResult<String>;

    /// Insert or replace the document stored under `id`. Repeating the call
    /// leaves a single document.
    async fn put(&self, collection: &str, id: &str, record: Value) -> DocumentStoreResult<()>;

    async fn get(&self, collection: &str, id: &str) -> DocumentStoreResult<Option<Document>>;

    /// Documents matching `filter`, in creation order.
    async fn query(
        &self,
        collection: &str,
        filter: &RecordFilter,
    ) -> DocumentStoreResult<Vec<Document>>;

    /// Apply every op or none of them.
    ///
    /// Fails with [`DocumentStoreError::BatchTooLarge`] when `ops` is longer
    /// than [`max_batch_ops`](Self::max_batch_ops), and with `NotFound` when a
    /// target document does not exist.
    async fn commit_batch(&self, ops: Vec<BatchOp>) -> DocumentStoreResult<()>;

    /// Maximum operations accepted by a single `commit_batch`.
    fn max_batch_ops(&self) -> usize;
}

/// Reject records that are not JSON objects.
pub(crate) fn require_object(record: Value) -> DocumentStoreResult<Map<String, Value>> {
    match record {
        Value::Object(map) => Ok(map),
        other => Err(DocumentStoreError::InvalidRecord(format!(
            "Expected a JSON object, got {}",
            other
        ))),
    }
}
