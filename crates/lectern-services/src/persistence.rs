//! Metadata records for a published item

use lectern_core::models::{PersistenceStrategy, PublishRequest, PublishedContent};
use lectern_db::{DocumentStore, DocumentStoreError};
use serde_json::{json, Map, Value};

/// Failure part-way through writing records. `created` holds the ids already written.
#[derive(Debug)]
pub struct RecordWriteError {
    pub source: DocumentStoreError,
    pub created: Vec<String>,
}

/// Build the records for `request` following its persistence strategy.
///
/// PerTier yields one record per tier carrying a `tier` field. TierList yields
/// a single record carrying the whole `tiers` array. Extra fields are merged
/// last and never override the fields set here.
pub fn build_records(
    request: &PublishRequest,
    parent_id: &str,
    thumbnail_url: Option<&str>,
    content: &PublishedContent,
) -> Vec<Value> {
    let mut base = Map::new();
    base.insert("parent_id".into(), json!(parent_id));
    base.insert("title".into(), json!(request.title));
    base.insert("description".into(), json!(request.description));
    base.insert("category".into(), json!(request.category));
    base.insert("thumbnail_url".into(), json!(thumbnail_url));
    match content {
        PublishedContent::Single {
            url,
            filename,
            storage_key,
        } => {
            base.insert("url".into(), json!(url));
            base.insert("filename".into(), json!(filename));
            base.insert("storage_key".into(), json!(storage_key));
        }
        PublishedContent::Manifest { entries } => {
            base.insert("lessons".into(), json!(entries));
            base.insert("lesson_count".into(), json!(entries.len()));
        }
    }
    for (key, value) in &request.extra {
        base.entry(key.clone()).or_insert_with(|| value.clone());
    }
    base.insert("created_at".into(), json!(chrono::Utc::now().to_rfc3339()));

    match request.strategy {
        PersistenceStrategy::PerTier => request
            .tiers
            .iter()
            .map(|tier| {
                let mut record = base.clone();
                record.insert("tier".into(), json!(tier));
                Value::Object(record)
            })
            .collect(),
        PersistenceStrategy::TierList => {
            base.insert("tiers".into(), json!(request.tiers));
            vec![Value::Object(base)]
        }
    }
}

/// Write `records` one after another into `collection`.
pub async fn write_records(
    store: &dyn DocumentStore,
    collection: &str,
    records: Vec<Value>,
) -> Result<Vec<String>, RecordWriteError> {
    let mut created = Vec::with_capacity(records.len());
    for record in records {
        match store.create(collection, record).await {
            Ok(id) => created.push(id),
            Err(source) => return Err(RecordWriteError { source, created }),
        }
    }
    Ok(created)
}
