//! Strictly sequential upload of an ordered lesson list
//!
//! Items are transferred one at a time in list order. Each item gets the
//! configured number of attempts; the first item that exhausts them aborts
//! the batch and the caller receives the manifest of everything committed
//! before it.

use crate::error::{AssetRole, BatchItemError, PartialBatchError, RetryExhaustedError, StoredAsset};
use crate::retry::RetryPolicy;
use crate::transfer::{TransferRequest, TransferSession};
use lectern_core::models::{BatchProgress, LessonItem, PublishManifestEntry, TransferStatus};
use lectern_db::DocumentStore;
use lectern_storage::{content_type_for, KeyVars, PathTemplate, Storage, StorageError, TransferControl};
use serde_json::json;
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Instant;
use tokio::sync::watch;
use tokio_util::sync::CancellationToken;

/// Collection receiving one record per published lesson.
///
/// Records are keyed by parent and lesson id, so a retried write whose first
/// reply was lost still leaves one record.
#[derive(Clone)]
pub struct LessonCatalog {
    pub store: Arc<dyn DocumentStore>,
    pub collection: String,
}

impl LessonCatalog {
    pub fn new(store: Arc<dyn DocumentStore>, collection: impl Into<String>) -> Self {
        Self {
            store,
            collection: collection.into(),
        }
    }
}

/// Caller handle for a running batch.
///
/// Pause and resume act on the item currently in flight. Cancel stops the
/// current item and prevents any further item from starting.
#[derive(Debug)]
pub struct BatchControl {
    progress: watch::Sender<BatchProgress>,
    active: Mutex<Option<Arc<TransferControl>>>,
    cancel: CancellationToken,
}

impl Default for BatchControl {
    fn default() -> Self {
        Self::new()
    }
}

impl BatchControl {
    pub fn new() -> Self {
        Self::with_cancel_token(CancellationToken::new())
    }

    pub fn with_cancel_token(cancel: CancellationToken) -> Self {
        let (progress, _) = watch::channel(BatchProgress::default());
        Self {
            progress,
            active: Mutex::new(None),
            cancel,
        }
    }

    pub fn subscribe(&self) -> watch::Receiver<BatchProgress> {
        self.progress.subscribe()
    }

    pub fn progress(&self) -> BatchProgress {
        self.progress.borrow().clone()
    }

    pub fn pause(&self) -> bool {
        self.active().map(|c| c.pause()).unwrap_or(false)
    }

    pub fn resume(&self) -> bool {
        self.active().map(|c| c.resume()).unwrap_or(false)
    }

    /// Cancel the batch. Returns false when it was already cancelled.
    pub fn cancel(&self) -> bool {
        if self.cancel.is_cancelled() {
            return false;
        }
        self.cancel.cancel();
        if let Some(active) = self.active() {
            active.cancel();
        }
        true
    }

    pub fn is_cancelled(&self) -> bool {
        self.cancel.is_cancelled()
    }

    fn slot(&self) -> MutexGuard<'_, Option<Arc<TransferControl>>> {
        self.active.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    fn active(&self) -> Option<Arc<TransferControl>> {
        self.slot().clone()
    }

    fn set_active(&self, control: Option<Arc<TransferControl>>) {
        *self.slot() = control;
    }

    fn update(&self, f: impl FnOnce(&mut BatchProgress)) {
        self.progress.send_modify(f);
    }
}

/// Successful batch outcome.
#[derive(Debug, Clone, Default)]
pub struct BatchReport {
    /// One entry per item, in list order.
    pub manifest: Vec<PublishManifestEntry>,
    /// Attempts used by each item's transfer.
    pub attempts: Vec<u32>,
    /// Catalog record ids, empty without a catalog.
    pub catalog_ids: Vec<String>,
}

pub struct SequentialBatchUploader {
    storage: Arc<dyn Storage>,
    retry: RetryPolicy,
    catalog: Option<LessonCatalog>,
}

impl SequentialBatchUploader {
    pub fn new(storage: Arc<dyn Storage>, retry: RetryPolicy) -> Self {
        Self {
            storage,
            retry,
            catalog: None,
        }
    }

    /// Write a catalog record for every lesson once its transfer is confirmed.
    pub fn with_catalog(mut self, catalog: LessonCatalog) -> Self {
        self.catalog = Some(catalog);
        self
    }

    /// Upload `items` under `parent_id` in list order.
    #[tracing::instrument(skip_all, fields(parent_id = %parent_id, items = items.len()))]
    pub async fn upload(
        &self,
        parent_id: &str,
        items: &[LessonItem],
        template: &PathTemplate,
        control: &BatchControl,
    ) -> Result<BatchReport, PartialBatchError> {
        let total_items = items.len();
        control.progress.send_replace(BatchProgress::new(total_items));
        let start = Instant::now();

        let keys = render_keys(parent_id, items, template).map_err(|source| PartialBatchError {
            source,
            manifest: Vec::new(),
            total_items,
        })?;

        let mut report = BatchReport::default();
        for (index, (item, key)) in items.iter().zip(keys.iter()).enumerate() {
            match self.upload_item(parent_id, index, item, key, control).await {
                Ok((entry, attempts, catalog_id)) => {
                    tracing::info!(
                        index = index,
                        key = %entry.storage_key,
                        attempts = attempts,
                        "Lesson published"
                    );
                    report.manifest.push(entry);
                    report.attempts.push(attempts);
                    report.catalog_ids.extend(catalog_id);
                    control.update(|p| p.completed_items = index + 1);
                }
                Err(source) => {
                    if source.is_cancelled() {
                        tracing::info!(index = index, completed = report.manifest.len(), "Batch cancelled");
                    } else {
                        tracing::error!(
                            index = index,
                            completed = report.manifest.len(),
                            attempts = source.attempts,
                            error = %source.last_error,
                            "Batch aborted"
                        );
                    }
                    return Err(PartialBatchError {
                        source,
                        manifest: report.manifest,
                        total_items,
                    });
                }
            }
        }

        control.update(|p| p.current_index = None);
        tracing::info!(
            items = total_items,
            duration_ms = start.elapsed().as_millis() as u64,
            "Batch completed"
        );
        Ok(report)
    }

    async fn upload_item(
        &self,
        parent_id: &str,
        index: usize,
        item: &LessonItem,
        key: &str,
        control: &BatchControl,
    ) -> Result<(PublishManifestEntry, u32, Option<String>), RetryExhaustedError> {
        control.update(|p| {
            p.current_index = Some(index);
            p.current_attempt = 0;
            p.current = TransferStatus::idle();
        });

        let exhausted = |last_error: BatchItemError, attempts: u32, orphan: Option<StoredAsset>| {
            RetryExhaustedError {
                item_id: item.id.clone(),
                index,
                attempts,
                last_error,
                orphan,
            }
        };

        let (url, attempts) = self
            .retry
            .run(&control.cancel, |attempt| self.transfer_once(item, key, attempt, control))
            .await
            .map_err(|(e, attempts)| exhausted(e, attempts, None))?;

        let entry = PublishManifestEntry {
            id: item.id.clone(),
            order: item.order,
            kind: item.kind,
            title: item.title.clone(),
            url,
            filename: item.filename(),
            duration_seconds: item.duration_seconds,
            storage_key: key.to_string(),
        };

        let catalog_id = match &self.catalog {
            Some(catalog) => {
                let id = catalog_record_id(parent_id, &entry.id);
                let record = catalog_record(parent_id, &entry);
                let written = self
                    .retry
                    .run(&control.cancel, |_| {
                        let record = record.clone();
                        let id = id.as_str();
                        async move {
                            catalog
                                .store
                                .put(&catalog.collection, id, record)
                                .await
                                .map_err(BatchItemError::from)
                        }
                    })
                    .await;
                match written {
                    Ok(((), _)) => Some(id),
                    Err((e, _)) => {
                        let orphan = StoredAsset {
                            role: AssetRole::Lesson { index },
                            storage_key: entry.storage_key.clone(),
                            url: entry.url.clone(),
                        };
                        return Err(exhausted(e, attempts, Some(orphan)));
                    }
                }
            }
            None => None,
        };

        Ok((entry, attempts, catalog_id))
    }

    async fn transfer_once(
        &self,
        item: &LessonItem,
        key: &str,
        attempt: u32,
        control: &BatchControl,
    ) -> Result<String, BatchItemError> {
        let transfer = Arc::new(TransferControl::with_cancel_token(control.cancel.child_token()));
        control.set_active(Some(transfer.clone()));
        control.update(|p| {
            p.current_attempt = attempt;
            p.current = TransferStatus::idle();
        });

        let request = TransferRequest::file(
            item.source_file.clone(),
            key,
            content_type_for(&item.filename()),
        );
        let result = TransferSession::start_with_control(self.storage.clone(), request, transfer)
            .wait_with(|status| control.update(|p| p.current = status.clone()))
            .await;
        control.set_active(None);

        if let Err(e) = &result {
            if !e.is_cancelled() {
                tracing::warn!(key = %key, attempt = attempt, error = %e, "Lesson transfer attempt failed");
            }
        }
        result.map_err(BatchItemError::from)
    }
}

fn render_keys(
    parent_id: &str,
    items: &[LessonItem],
    template: &PathTemplate,
) -> Result<Vec<String>, RetryExhaustedError> {
    items
        .iter()
        .enumerate()
        .map(|(index, item)| {
            let filename = item.filename();
            let vars = KeyVars::new(parent_id)
                .id(&item.id)
                .order(item.order)
                .filename(&filename);
            template.render(&vars).map_err(|e: StorageError| RetryExhaustedError {
                item_id: item.id.clone(),
                index,
                attempts: 0,
                last_error: BatchItemError::Transfer(e),
                orphan: None,
            })
        })
        .collect()
}

fn catalog_record_id(parent_id: &str, lesson_id: &str) -> String {
    format!("{}:{}", parent_id, lesson_id)
}

fn catalog_record(parent_id: &str, entry: &PublishManifestEntry) -> serde_json::Value {
    json!({
        "parent_id": parent_id,
        "lesson_id": entry.id,
        "order": entry.order,
        "kind": entry.kind,
        "title": entry.title,
        "url": entry.url,
        "filename": entry.filename,
        "storage_key": entry.storage_key,
        "duration_seconds": entry.duration_seconds,
        "published_at": chrono::Utc::now().to_rfc3339(),
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use lectern_core::models::{LessonKind, LessonList};
    use lectern_db::{MemoryDocumentStore, RecordFilter};
    use lectern_storage::LocalStorage;
    use std::time::Duration;
    use tempfile::TempDir;

    async fn fixture(dir: &TempDir, count: usize) -> (Arc<dyn Storage>, Vec<LessonItem>) {
        let src = dir.path().join("src");
        tokio::fs::create_dir_all(&src).await.unwrap();
        let mut list = LessonList::new();
        for i in 0..count {
            let path = src.join(format!("lesson {}.mp4", i));
            tokio::fs::write(&path, vec![i as u8; 32]).await.unwrap();
            list.push(LessonItem::new(LessonKind::Video, path, format!("Lesson {}", i)).with_id(format!("l{}", i)))
                .unwrap();
        }
        let storage: Arc<dyn Storage> = Arc::new(
            LocalStorage::new(dir.path().join("store"), "http://cdn".to_string())
                .await
                .unwrap(),
        );
        (storage, list.into_items())
    }

    fn template() -> PathTemplate {
        PathTemplate::new(PathTemplate::LESSON).unwrap()
    }

    #[tokio::test]
    async fn test_uploads_in_order_with_catalog_records() {
        let dir = TempDir::new().unwrap();
        let (storage, items) = fixture(&dir, 3).await;
        let store = Arc::new(MemoryDocumentStore::new(500));
        let uploader = SequentialBatchUploader::new(storage, RetryPolicy::fixed(3, Duration::from_millis(1)))
            .with_catalog(LessonCatalog::new(store.clone(), "lessons"));
        let control = BatchControl::new();

        let report = uploader.upload("c1", &items, &template(), &control).await.unwrap();

        let orders: Vec<u32> = report.manifest.iter().map(|e| e.order).collect();
        assert_eq!(orders, vec![0, 1, 2]);
        assert_eq!(report.attempts, vec![1, 1, 1]);
        assert_eq!(report.manifest[1].storage_key, "courses/c1/lessons/1-l1/lesson-1.mp4");
        assert_eq!(report.manifest[1].url, "http://cdn/courses/c1/lessons/1-l1/lesson-1.mp4");
        assert_eq!(report.manifest[1].filename, "lesson 1.mp4");
        assert_eq!(report.catalog_ids, vec!["c1:l0", "c1:l1", "c1:l2"]);

        let records = store
            .query("lessons", &RecordFilter::field_equals("parent_id", "c1"))
            .await
            .unwrap();
        assert_eq!(records.len(), 3);

        let progress = control.progress();
        assert_eq!(progress.completed_items, 3);
        assert_eq!(progress.percent(), 100.0);
    }

    #[tokio::test]
    async fn test_missing_source_aborts_with_partial_manifest() {
        let dir = TempDir::new().unwrap();
        let (storage, mut items) = fixture(&dir, 3).await;
        items[2].source_file = dir.path().join("gone.mp4");
        let uploader = SequentialBatchUploader::new(storage, RetryPolicy::fixed(2, Duration::from_millis(1)));

        let err = uploader
            .upload("c1", &items, &template(), &BatchControl::new())
            .await
            .unwrap_err();

        assert_eq!(err.manifest.len(), 2);
        assert_eq!(err.source.index, 2);
        assert_eq!(err.source.item_id, "l2");
        assert_eq!(err.source.attempts, 2);
        assert!(!err.is_cancelled());
    }

    #[tokio::test]
    async fn test_cancel_before_start_publishes_nothing() {
        let dir = TempDir::new().unwrap();
        let (storage, items) = fixture(&dir, 2).await;
        let uploader = SequentialBatchUploader::new(storage, RetryPolicy::fixed(3, Duration::from_millis(1)));
        let control = BatchControl::new();
        assert!(control.cancel());
        assert!(!control.cancel());

        let err = uploader.upload("c1", &items, &template(), &control).await.unwrap_err();
        assert!(err.is_cancelled());
        assert!(err.manifest.is_empty());
        assert_eq!(err.source.attempts, 1);
    }

    #[tokio::test]
    async fn test_pause_without_active_item_is_noop() {
        let control = BatchControl::new();
        assert!(!control.pause());
        assert!(!control.resume());
    }
}
