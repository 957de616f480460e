//! Test helpers: temp storage, scripted backends and fixtures.
//!
//! Run from workspace root: `cargo test -p lectern-services`.

#![allow(dead_code)]

use async_trait::async_trait;
use lectern_core::models::{LessonItem, LessonKind, LessonList};
use lectern_core::{FanOutSettings, StorageBackend};
use lectern_db::{
    BatchOp, Document, DocumentStore, DocumentStoreError, DocumentStoreResult, MemoryDocumentStore,
    RecordFilter,
};
use lectern_processing::ThumbnailEncoder;
use lectern_services::{OrchestratorSettings, RetryPolicy};
use lectern_storage::{
    ByteReader, LocalStorage, PathTemplate, Storage, StorageError, StorageResult, TransferControl,
};
use serde_json::Value;
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tempfile::TempDir;
use tokio::sync::Notify;

pub const BASE_URL: &str = "http://localhost:3000/media";

/// Temp directory holding both source files and the local storage root.
pub struct TestStorage {
    pub temp_dir: TempDir,
    pub storage: Arc<LocalStorage>,
}

impl TestStorage {
    pub async fn new() -> Self {
        let temp_dir = tempfile::tempdir().expect("Failed to create temp directory");
        let storage = LocalStorage::new(temp_dir.path().join("store"), BASE_URL.to_string())
            .await
            .expect("Failed to create local storage")
            .with_chunk_size(16);
        Self {
            temp_dir,
            storage: Arc::new(storage),
        }
    }

    pub fn source_dir(&self) -> PathBuf {
        self.temp_dir.path().join("src")
    }

    /// Write a source file of `size` bytes and return its path.
    pub async fn source(&self, name: &str, size: usize) -> PathBuf {
        let dir = self.source_dir();
        tokio::fs::create_dir_all(&dir).await.unwrap();
        let path = dir.join(name);
        tokio::fs::write(&path, vec![b'x'; size]).await.unwrap();
        path
    }

    pub fn stored_path(&self, key: &str) -> PathBuf {
        self.temp_dir.path().join("store").join(key)
    }
}

/// Build a lesson list with one source file per `(kind, name)` pair.
pub async fn lessons(storage: &TestStorage, specs: &[(LessonKind, &str)]) -> LessonList {
    let mut list = LessonList::new();
    for (index, (kind, name)) in specs.iter().enumerate() {
        let path = storage.source(name, 48).await;
        let item = LessonItem::new(*kind, path, format!("Lesson {}", index))
            .with_id(format!("lesson-{}", index));
        list.push(item).unwrap();
    }
    list
}

pub fn fast_retry(max_attempts: u32) -> RetryPolicy {
    RetryPolicy::fixed(max_attempts, Duration::from_millis(1))
}

pub fn lesson_template() -> PathTemplate {
    PathTemplate::new(PathTemplate::LESSON).unwrap()
}

pub fn orchestrator_settings(catalog: Option<&str>) -> OrchestratorSettings {
    OrchestratorSettings {
        retry: fast_retry(3),
        thumbnail: ThumbnailEncoder::new(64, 80),
        fan_out: FanOutSettings::default(),
        lesson_catalog_collection: catalog.map(String::from),
        lesson_template: lesson_template(),
    }
}

/// PNG of the given size.
pub fn png(width: u32, height: u32) -> Vec<u8> {
    let img = image::RgbaImage::from_pixel(width, height, image::Rgba([200, 30, 30, 255]));
    let mut buffer = Vec::new();
    img.write_to(&mut std::io::Cursor::new(&mut buffer), image::ImageFormat::Png)
        .unwrap();
    buffer
}

/// Storage wrapper that fails or holds transfers whose key contains a fragment.
pub struct ScriptedStorage {
    inner: Arc<dyn Storage>,
    failures: Mutex<HashMap<String, u32>>,
    hold: Mutex<Option<String>>,
    calls: Mutex<Vec<String>>,
    held: Notify,
}

impl ScriptedStorage {
    pub fn new(inner: Arc<dyn Storage>) -> Self {
        Self {
            inner,
            failures: Mutex::new(HashMap::new()),
            hold: Mutex::new(None),
            calls: Mutex::new(Vec::new()),
            held: Notify::new(),
        }
    }

    /// Fail the next `times` transfers whose key contains `fragment`.
    pub fn fail_times(self, fragment: &str, times: u32) -> Self {
        self.failures
            .lock()
            .unwrap()
            .insert(fragment.to_string(), times);
        self
    }

    /// Park transfers whose key contains `fragment` until they are cancelled.
    pub fn hold(self, fragment: &str) -> Self {
        *self.hold.lock().unwrap() = Some(fragment.to_string());
        self
    }

    /// Resolves once a held transfer has started.
    pub async fn wait_until_held(&self) {
        tokio::time::timeout(Duration::from_secs(5), self.held.notified())
            .await
            .expect("held transfer never started");
    }

    /// Keys passed to `put_stream`, one per attempt.
    pub fn calls(&self) -> Vec<String> {
        self.calls.lock().unwrap().clone()
    }

    pub fn attempts_for(&self, fragment: &str) -> usize {
        self.calls().iter().filter(|k| k.contains(fragment)).count()
    }

    fn take_failure(&self, key: &str) -> bool {
        let mut failures = self.failures.lock().unwrap();
        for (fragment, remaining) in failures.iter_mut() {
            if key.contains(fragment.as_str()) && *remaining > 0 {
                *remaining -= 1;
                return true;
            }
        }
        false
    }

    fn is_held(&self, key: &str) -> bool {
        self.hold
            .lock()
            .unwrap()
            .as_deref()
            .map(|fragment| key.contains(fragment))
            .unwrap_or(false)
    }
}

#[async_trait]
impl Storage for ScriptedStorage {
    async fn put_stream(
        &self,
        storage_key: &str,
        content_type: &str,
        content_length: Option<u64>,
        reader: ByteReader,
        control: &TransferControl,
    ) -> StorageResult<String> {
        self.calls.lock().unwrap().push(storage_key.to_string());
        if self.take_failure(storage_key) {
            return Err(StorageError::UploadFailed("connection reset".to_string()));
        }
        if self.is_held(storage_key) {
            control.advance(1);
            self.held.notify_one();
            control.cancellation_token().cancelled().await;
            return Err(StorageError::Cancelled);
        }
        self.inner
            .put_stream(storage_key, content_type, content_length, reader, control)
            .await
    }

    async fn download(&self, storage_key: &str) -> StorageResult<Vec<u8>> {
        self.inner.download(storage_key).await
    }

    async fn delete(&self, storage_key: &str) -> StorageResult<()> {
        self.inner.delete(storage_key).await
    }

    async fn exists(&self, storage_key: &str) -> StorageResult<bool> {
        self.inner.exists(storage_key).await
    }

    fn public_url(&self, storage_key: &str) -> String {
        self.inner.public_url(storage_key)
    }

    fn backend_type(&self) -> StorageBackend {
        self.inner.backend_type()
    }
}

/// Document store wrapper that records commits and fails on demand.
pub struct ScriptedDocumentStore {
    inner: MemoryDocumentStore,
    failing_collections: Mutex<Vec<String>>,
    fail_commit_at: Mutex<Option<usize>>,
    lost_put_replies: Mutex<usize>,
    hold_next_create: Mutex<bool>,
    held: Notify,
    release: Notify,
    commits: Mutex<Vec<usize>>,
}

impl ScriptedDocumentStore {
    pub fn new(max_batch_ops: usize) -> Self {
        Self {
            inner: MemoryDocumentStore::new(max_batch_ops),
            failing_collections: Mutex::new(Vec::new()),
            fail_commit_at: Mutex::new(None),
            lost_put_replies: Mutex::new(0),
            hold_next_create: Mutex::new(false),
            held: Notify::new(),
            release: Notify::new(),
            commits: Mutex::new(Vec::new()),
        }
    }

    /// Every `create` and `put` in `collection` fails.
    pub fn fail_writes_in(self, collection: &str) -> Self {
        self.failing_collections
            .lock()
            .unwrap()
            .push(collection.to_string());
        self
    }

    /// The commit with this zero-based index fails, and so does every later one.
    pub fn fail_commit_at(self, index: usize) -> Self {
        *self.fail_commit_at.lock().unwrap() = Some(index);
        self
    }

    /// The next `n` puts are applied but report a failure, like a lost reply.
    pub fn lose_put_replies(self, n: usize) -> Self {
        *self.lost_put_replies.lock().unwrap() = n;
        self
    }

    /// Park the next `create` until [`release`](Self::release) is called.
    pub fn hold_next_create(self) -> Self {
        *self.hold_next_create.lock().unwrap() = true;
        self
    }

    /// Resolves once the held `create` has started.
    pub async fn wait_until_held(&self) {
        tokio::time::timeout(Duration::from_secs(5), self.held.notified())
            .await
            .expect("held create never started");
    }

    pub fn release(&self) {
        self.release.notify_one();
    }

    /// Sizes of every attempted commit, in order.
    pub fn commit_sizes(&self) -> Vec<usize> {
        self.commits.lock().unwrap().clone()
    }

    fn fails_in(&self, collection: &str) -> bool {
        self.failing_collections
            .lock()
            .unwrap()
            .iter()
            .any(|c| c == collection)
    }

    pub async fn count(&self, collection: &str) -> usize {
        self.inner.count(collection).await
    }

    /// Insert `n` empty records into `collection`.
    pub async fn seed(&self, collection: &str, n: usize) {
        for _ in 0..n {
            self.inner
                .create(collection, serde_json::json!({}))
                .await
                .unwrap();
        }
    }
}

#[async_trait]
impl DocumentStore for ScriptedDocumentStore {
    async fn create(&self, collection: &str, record: Value) -> DocumentStoreResult<String> {
        if self.fails_in(collection) {
            return Err(DocumentStoreError::Unavailable(format!(
                "{} is read-only",
                collection
            )));
        }
        let hold = std::mem::take(&mut *self.hold_next_create.lock().unwrap());
        if hold {
            self.held.notify_one();
            self.release.notified().await;
        }
        self.inner.create(collection, record).await
    }

    async fn put(&self, collection: &str, id: &str, record: Value) -> DocumentStoreResult<()> {
        if self.fails_in(collection) {
            return Err(DocumentStoreError::Unavailable(format!(
                "{} is read-only",
                collection
            )));
        }
        self.inner.put(collection, id, record).await?;
        let mut lost = self.lost_put_replies.lock().unwrap();
        if *lost > 0 {
            *lost -= 1;
            return Err(DocumentStoreError::Unavailable("connection reset".into()));
        }
        Ok(())
    }

    async fn get(&self, collection: &str, id: &str) -> DocumentStoreResult<Option<Document>> {
        self.inner.get(collection, id).await
    }

    async fn query(
        &self,
        collection: &str,
        filter: &RecordFilter,
    ) -> DocumentStoreResult<Vec<Document>> {
        self.inner.query(collection, filter).await
    }

    async fn commit_batch(&self, ops: Vec<BatchOp>) -> DocumentStoreResult<()> {
        let index = {
            let mut commits = self.commits.lock().unwrap();
            commits.push(ops.len());
            commits.len() - 1
        };
        let fail_at = *self.fail_commit_at.lock().unwrap();
        if fail_at.is_some_and(|at| index >= at) {
            return Err(DocumentStoreError::Unavailable("commit rejected".to_string()));
        }
        self.inner.commit_batch(ops).await
    }

    fn max_batch_ops(&self) -> usize {
        self.inner.max_batch_ops()
    }
}

/// Read a stored object back from the local store.
pub async fn read_stored(storage: &TestStorage, key: &str) -> Vec<u8> {
    tokio::fs::read(storage.stored_path(key)).await.unwrap()
}

pub fn file_name(path: &Path) -> String {
    path.file_name().unwrap().to_string_lossy().into_owned()
}
