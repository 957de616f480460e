use crate::document::{
    require_object, BatchOp, Document, DocumentStore, DocumentStoreError, DocumentStoreResult,
    RecordFilter,
};
use async_trait::async_trait;
use serde_json::{Map, Value};
use std::collections::HashMap;
use tokio::sync::RwLock;
use uuid::Uuid;

/// In-process document store.
///
/// A batch is validated and applied under one write lock, so readers never
/// observe half of a commit. Used by tests and by dry runs.
pub struct MemoryDocumentStore {
    collections: RwLock<HashMap<String, Vec<Document>>>,
    max_batch_ops: usize,
}

impl MemoryDocumentStore {
    pub fn new(max_batch_ops: usize) -> Self {
        Self {
            collections: RwLock::new(HashMap::new()),
            max_batch_ops,
        }
    }

    /// Number of documents in `collection`.
    pub async fn count(&self, collection: &str) -> usize {
        self.collections
            .read()
            .await
            .get(collection)
            .map(Vec::len)
            .unwrap_or(0)
    }
}

#[async_trait]
impl DocumentStore for MemoryDocumentStore {
    #[tracing::instrument(skip(self, record), fields(db.system = "memory", db.operation = "insert"))]
    async fn create(&self, collection: &str, record: Value) -> DocumentStoreResult<String> {
        let data = require_object(record)?;
        let id = Uuid::new_v4().to_string();
        self.collections
            .write()
            .await
            .entry(collection.to_string())
            .or_default()
            .push(Document {
                id: id.clone(),
                collection: collection.to_string(),
                data: Value::Object(data),
            });
        Ok(id)
    }

    #[tracing::instrument(skip(self, record), fields(db.system = "memory", db.operation = "upsert"))]
    async fn put(&self, collection: &str, id: &str, record: Value) -> DocumentStoreResult<()> {
        let data = Value::Object(require_object(record)?);
        let mut collections = self.collections.write().await;
        let docs = collections.entry(collection.to_string()).or_default();
        match docs.iter_mut().find(|d| d.id == id) {
            Some(doc) => doc.data = data,
            None => docs.push(Document {
                id: id.to_string(),
                collection: collection.to_string(),
                data,
            }),
        }
        Ok(())
    }

    async fn get(&self, collection: &str, id: &str) -> DocumentStoreResult<Option<Document>> {
        Ok(self
            .collections
            .read()
            .await
            .get(collection)
            .and_then(|docs| docs.iter().find(|d| d.id == id))
            .cloned())
    }

    #[tracing::instrument(skip(self), fields(db.system = "memory", db.operation = "select"))]
    async fn query(
        &self,
        collection: &str,
        filter: &RecordFilter,
    ) -> DocumentStoreResult<Vec<Document>> {
        Ok(self
            .collections
            .read()
            .await
            .get(collection)
            .map(|docs| {
                docs.iter()
                    .filter(|d| filter.matches(&d.data))
                    .cloned()
                    .collect()
            })
            .unwrap_or_default())
    }

    #[tracing::instrument(skip(self, ops), fields(db.system = "memory", db.operation = "batch", ops = ops.len()))]
    async fn commit_batch(&self, ops: Vec<BatchOp>) -> DocumentStoreResult<()> {
        if ops.len() > self.max_batch_ops {
            return Err(DocumentStoreError::BatchTooLarge {
                ops: ops.len(),
                max: self.max_batch_ops,
            });
        }

        let mut collections = self.collections.write().await;

        // Stage every change first; nothing is written unless all ops apply.
        let mut staged: HashMap<(String, String), Map<String, Value>> = HashMap::new();
        for op in &ops {
            let slot = (op.collection.clone(), op.id.clone());
            let mut data = match staged.remove(&slot) {
                Some(data) => data,
                None => collections
                    .get(&op.collection)
                    .and_then(|docs| docs.iter().find(|d| d.id == op.id))
                    .and_then(|d| d.data.as_object().cloned())
                    .ok_or_else(|| DocumentStoreError::NotFound {
                        collection: op.collection.clone(),
                        id: op.id.clone(),
                    })?,
            };
            for change in &op.changes {
                change.apply(&mut data)?;
            }
            staged.insert(slot, data);
        }

        for ((collection, id), data) in staged {
            if let Some(doc) = collections
                .get_mut(&collection)
                .and_then(|docs| docs.iter_mut().find(|d| d.id == id))
            {
                doc.data = Value::Object(data);
            }
        }
        Ok(())
    }

    fn max_batch_ops(&self) -> usize {
        self.max_batch_ops
    }
}
