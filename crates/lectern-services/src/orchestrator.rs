//! Publish workflow
//!
//! Validate, transfer the thumbnail, transfer the content, persist records,
//! then trigger the analytics fan-out. One workflow runs at a time per
//! orchestrator; its progress is published on a single status channel.

use crate::batch_uploader::{BatchControl, BatchReport, LessonCatalog, SequentialBatchUploader};
use crate::error::{
    AssetRole, PartialBatchError, PublishError, PublishResult, StoredAsset, TransferFailure,
};
use crate::fan_out::{FanOutBatchWriter, FanOutSelector, FanOutUpdate};
use crate::persistence::{build_records, write_records};
use crate::retry::RetryPolicy;
use crate::transfer::{TransferRequest, TransferSession};
use lectern_core::models::{
    file_name_of, AnalyticsIncrement, BatchProgress, ContentCategory, LessonItem, PublishContent,
    PublishFailure, PublishManifestEntry, PublishReceipt, PublishRequest, PublishStage, PublishStatus,
    PublishedContent, TransferState, TransferStatus,
};
use lectern_core::{Config, ErrorMetadata, FanOutSettings, LogLevel};
use lectern_db::DocumentStore;
use lectern_processing::ThumbnailEncoder;
use lectern_storage::{
    content_type_for, KeyVars, PathTemplate, Storage, StorageError, StorageResult, TransferControl,
};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Instant;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

#[derive(Debug, Clone)]
pub struct OrchestratorSettings {
    pub retry: RetryPolicy,
    pub thumbnail: ThumbnailEncoder,
    pub fan_out: FanOutSettings,
    /// Catalog collection for per-lesson records; `None` disables the catalog.
    pub lesson_catalog_collection: Option<String>,
    pub lesson_template: PathTemplate,
}

impl OrchestratorSettings {
    pub fn from_config(config: &Config) -> StorageResult<Self> {
        Ok(Self {
            retry: RetryPolicy::from_settings(&config.retry),
            thumbnail: ThumbnailEncoder::from_settings(&config.thumbnail),
            fan_out: config.fan_out.clone(),
            lesson_catalog_collection: Some(config.lesson_catalog_collection.clone()),
            lesson_template: PathTemplate::new(PathTemplate::LESSON)?,
        })
    }
}

enum ActiveTransfer {
    Idle,
    Single(Arc<TransferControl>),
    Batch(Arc<BatchControl>),
}

struct RunHandles {
    cancel: Option<CancellationToken>,
    active: ActiveTransfer,
}

/// Releases the in-flight flag when a run ends, however it ends.
struct InFlightGuard<'a>(&'a AtomicBool);

impl<'a> InFlightGuard<'a> {
    fn acquire(flag: &'a AtomicBool) -> Option<Self> {
        flag.compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
            .ok()
            .map(|_| Self(flag))
    }
}

impl Drop for InFlightGuard<'_> {
    fn drop(&mut self) {
        self.0.store(false, Ordering::Release);
    }
}

pub struct PublishOrchestrator {
    storage: Arc<dyn Storage>,
    store: Arc<dyn DocumentStore>,
    settings: OrchestratorSettings,
    status: watch::Sender<PublishStatus>,
    in_flight: AtomicBool,
    handles: Mutex<RunHandles>,
    background: Mutex<Vec<JoinHandle<()>>>,
}

impl PublishOrchestrator {
    pub fn new(
        storage: Arc<dyn Storage>,
        store: Arc<dyn DocumentStore>,
        settings: OrchestratorSettings,
    ) -> Self {
        let (status, _) = watch::channel(PublishStatus::default());
        Self {
            storage,
            store,
            settings,
            status,
            in_flight: AtomicBool::new(false),
            handles: Mutex::new(RunHandles {
                cancel: None,
                active: ActiveTransfer::Idle,
            }),
            background: Mutex::new(Vec::new()),
        }
    }

    pub fn from_config(
        storage: Arc<dyn Storage>,
        store: Arc<dyn DocumentStore>,
        config: &Config,
    ) -> StorageResult<Self> {
        Ok(Self::new(storage, store, OrchestratorSettings::from_config(config)?))
    }

    pub fn subscribe(&self) -> watch::Receiver<PublishStatus> {
        self.status.subscribe()
    }

    pub fn status(&self) -> PublishStatus {
        self.status.borrow().clone()
    }

    pub fn is_busy(&self) -> bool {
        self.in_flight.load(Ordering::Acquire)
    }

    /// Pause the active transfer. No-op outside a transfer stage.
    pub fn pause(&self) -> bool {
        match &self.handles().active {
            ActiveTransfer::Single(control) => control.pause(),
            ActiveTransfer::Batch(control) => control.pause(),
            ActiveTransfer::Idle => false,
        }
    }

    pub fn resume(&self) -> bool {
        match &self.handles().active {
            ActiveTransfer::Single(control) => control.resume(),
            ActiveTransfer::Batch(control) => control.resume(),
            ActiveTransfer::Idle => false,
        }
    }

    /// Cancel the active transfer and every transfer the run has not started yet.
    ///
    /// Returns false when no run is in flight or the run has left the transfer stages.
    pub fn cancel(&self) -> bool {
        // Stage changes take this lock too.
        let handles = self.handles();
        let stage = self.status.borrow().stage;
        if !stage.is_cancellable() {
            return false;
        }
        let Some(token) = &handles.cancel else {
            return false;
        };
        if token.is_cancelled() {
            return false;
        }
        token.cancel();
        match &handles.active {
            ActiveTransfer::Single(control) => {
                control.cancel();
            }
            ActiveTransfer::Batch(control) => {
                control.cancel();
            }
            ActiveTransfer::Idle => {}
        }
        tracing::info!(stage = %stage, "Publish cancelled");
        true
    }

    /// Number of spawned analytics fan-outs still running.
    pub fn pending_background(&self) -> usize {
        let mut background = self.background();
        background.retain(|handle| !handle.is_finished());
        background.len()
    }

    /// Await every spawned analytics fan-out.
    pub async fn wait_for_background(&self) {
        let pending = std::mem::take(&mut *self.background());
        for handle in pending {
            if let Err(e) = handle.await {
                tracing::warn!(error = %e, "Background task failed");
            }
        }
    }

    /// Delete orphaned objects reported by a failed publish. Returns the number deleted.
    pub async fn discard_orphans(&self, orphans: &[StoredAsset]) -> StorageResult<usize> {
        let mut deleted = 0;
        for orphan in orphans {
            self.storage.delete(&orphan.storage_key).await?;
            tracing::info!(key = %orphan.storage_key, role = %orphan.role, "Orphaned asset deleted");
            deleted += 1;
        }
        Ok(deleted)
    }

    /// Run one publish workflow to its terminal state.
    #[tracing::instrument(skip_all, fields(category = %request.category, title = %request.title))]
    pub async fn publish(&self, request: PublishRequest) -> PublishResult {
        let Some(_guard) = InFlightGuard::acquire(&self.in_flight) else {
            tracing::debug!("Publish rejected, another run is in flight");
            return Err(PublishError::Busy);
        };

        let run_token = CancellationToken::new();
        {
            let mut handles = self.handles();
            handles.cancel = Some(run_token.clone());
            handles.active = ActiveTransfer::Idle;
        }
        self.status.send_replace(PublishStatus::default());
        let start = Instant::now();

        let result = self.run(request, &run_token).await;

        {
            let mut handles = self.handles();
            handles.cancel = None;
            handles.active = ActiveTransfer::Idle;
        }
        match &result {
            Ok(receipt) => {
                self.set_stage(PublishStage::Succeeded);
                tracing::info!(
                    parent_id = %receipt.parent_id,
                    records = receipt.record_ids.len(),
                    duration_ms = start.elapsed().as_millis() as u64,
                    "Publish succeeded"
                );
            }
            Err(e) => {
                let failure = PublishFailure {
                    error_code: e.error_code().to_string(),
                    message: e.client_message(),
                };
                self.status.send_modify(|s| {
                    s.stage = PublishStage::Failed;
                    s.transfer.fail(failure.message.clone());
                    s.failure = Some(failure);
                });
                log_failure(e, start);
            }
        }
        result
    }

    async fn run(&self, request: PublishRequest, run_token: &CancellationToken) -> PublishResult {
        self.set_stage(PublishStage::Validating);
        request.validate()?;

        let parent_id = request
            .parent_id
            .clone()
            .unwrap_or_else(|| uuid::Uuid::new_v4().to_string());
        let collection = request.category.collection();
        let mut uploaded: Vec<StoredAsset> = Vec::new();

        let thumbnail_url = match &request.thumbnail {
            Some(path) => {
                self.set_stage(PublishStage::TransferringThumbnail);
                let transfer_error = |source: TransferFailure, orphans: &[StoredAsset]| {
                    PublishError::Transfer {
                        asset: AssetRole::Thumbnail,
                        source,
                        orphans: orphans.to_vec(),
                    }
                };
                let asset = self
                    .settings
                    .thumbnail
                    .prepare_file(path)
                    .await
                    .map_err(|e| transfer_error(e.into(), uploaded.as_slice()))?;
                let key = render_single(
                    &format!("{}/thumbnails", collection),
                    &parent_id,
                    &asset.filename,
                )
                .map_err(|e| transfer_error(e.into(), uploaded.as_slice()))?;
                let request =
                    TransferRequest::bytes(asset.data, key.clone(), asset.content_type);
                let url = self
                    .transfer_single(request, run_token)
                    .await
                    .map_err(|e| transfer_error(e.into(), uploaded.as_slice()))?;
                uploaded.push(StoredAsset {
                    role: AssetRole::Thumbnail,
                    storage_key: key,
                    url: url.clone(),
                });
                Some(url)
            }
            None => None,
        };

        self.set_stage(PublishStage::TransferringContent);
        let content = match &request.content {
            PublishContent::Single { file } => {
                let transfer_error = |source: StorageError, orphans: &[StoredAsset]| {
                    PublishError::Transfer {
                        asset: AssetRole::Content,
                        source: source.into(),
                        orphans: orphans.to_vec(),
                    }
                };
                let filename = file_name_of(file);
                let key = render_single(collection, &parent_id, &filename)
                    .map_err(|e| transfer_error(e, uploaded.as_slice()))?;
                let request =
                    TransferRequest::file(file.clone(), key.clone(), content_type_for(&filename));
                let url = self
                    .transfer_single(request, run_token)
                    .await
                    .map_err(|e| transfer_error(e, uploaded.as_slice()))?;
                uploaded.push(StoredAsset {
                    role: AssetRole::Content,
                    storage_key: key.clone(),
                    url: url.clone(),
                });
                PublishedContent::Single {
                    url,
                    filename,
                    storage_key: key,
                }
            }
            PublishContent::Lessons { lessons } => {
                let report = self
                    .upload_batch(&parent_id, lessons.items(), run_token)
                    .await
                    .map_err(|source| {
                        let mut orphans = uploaded.clone();
                        orphans.extend(lesson_assets(&source.manifest));
                        orphans.extend(source.source.orphan.clone());
                        PublishError::PartialBatch { source, orphans }
                    })?;
                uploaded.extend(lesson_assets(&report.manifest));
                PublishedContent::Manifest {
                    entries: report.manifest,
                }
            }
        };

        if !self.leave_transfer_stages(run_token) {
            return Err(PublishError::Transfer {
                asset: AssetRole::Content,
                source: StorageError::Cancelled.into(),
                orphans: uploaded,
            });
        }
        let records = build_records(&request, &parent_id, thumbnail_url.as_deref(), &content);
        let record_ids = write_records(self.store.as_ref(), collection, records)
            .await
            .map_err(|e| PublishError::Persistence {
                source: e.source,
                records_created: e.created,
                orphans: uploaded,
            })?;

        self.set_stage(PublishStage::UpdatingAnalytics);
        self.spawn_analytics(request.category);

        Ok(PublishReceipt {
            parent_id,
            record_ids,
            thumbnail_url,
            content,
        })
    }

    async fn transfer_single(
        &self,
        request: TransferRequest,
        run_token: &CancellationToken,
    ) -> StorageResult<String> {
        let control = Arc::new(TransferControl::with_cancel_token(run_token.child_token()));
        self.set_active(ActiveTransfer::Single(control.clone()));
        self.status.send_modify(|s| {
            s.transfer = TransferStatus::idle();
            s.batch = None;
        });

        let result = TransferSession::start_with_control(self.storage.clone(), request, control)
            .wait_with(|status| self.status.send_modify(|s| s.transfer = status.clone()))
            .await;

        self.set_active(ActiveTransfer::Idle);
        result
    }

    async fn upload_batch(
        &self,
        parent_id: &str,
        items: &[LessonItem],
        run_token: &CancellationToken,
    ) -> Result<BatchReport, PartialBatchError> {
        let control = Arc::new(BatchControl::with_cancel_token(run_token.child_token()));
        self.set_active(ActiveTransfer::Batch(control.clone()));
        self.status.send_modify(|s| {
            s.transfer = TransferStatus::idle();
            s.transfer.start(0);
            s.batch = Some(BatchProgress::new(items.len()));
        });

        let mut uploader = SequentialBatchUploader::new(self.storage.clone(), self.settings.retry);
        if let Some(collection) = &self.settings.lesson_catalog_collection {
            uploader = uploader.with_catalog(LessonCatalog::new(self.store.clone(), collection.clone()));
        }

        let mut progress = control.subscribe();
        let upload = uploader.upload(parent_id, items, &self.settings.lesson_template, &control);
        tokio::pin!(upload);
        let result = loop {
            tokio::select! {
                result = &mut upload => break result,
                changed = progress.changed() => {
                    if changed.is_err() {
                        break (&mut upload).await;
                    }
                    let batch = progress.borrow_and_update().clone();
                    self.publish_batch(batch);
                }
            }
        };
        self.publish_batch(control.progress());

        if result.is_ok() {
            self.status.send_modify(|s| {
                s.transfer.state = TransferState::Success;
                s.transfer.progress_pct = 100.0;
            });
        }
        self.set_active(ActiveTransfer::Idle);
        result
    }

    /// Batch view: the item in flight drives bytes, the item count drives the percentage.
    fn publish_batch(&self, batch: BatchProgress) {
        self.status.send_modify(|s| {
            s.transfer.state = if batch.current.state == TransferState::Paused {
                TransferState::Paused
            } else {
                TransferState::Running
            };
            s.transfer.progress_pct = s.transfer.progress_pct.max(batch.percent());
            s.transfer.transferred_bytes = batch.current.transferred_bytes;
            s.transfer.total_bytes = batch.current.total_bytes;
            s.batch = Some(batch);
        });
    }

    fn spawn_analytics(&self, category: ContentCategory) {
        let settings = &self.settings.fan_out;
        let writer = match FanOutBatchWriter::new(self.store.clone(), settings.max_batch_ops) {
            Ok(writer) => writer,
            Err(e) => {
                tracing::warn!(error = %e, error_code = e.error_code(), "Analytics fan-out skipped");
                return;
            }
        };
        let selector = FanOutSelector::all(settings.analytics_collection.clone());
        let update = FanOutUpdate::increment(AnalyticsIncrement::new(category.analytics_field(), 1))
            .with_timestamp(settings.timestamp_field.clone());

        let handle = tokio::spawn(async move {
            if let Err(e) = writer.apply(&selector, &update).await {
                tracing::warn!(
                    error = %e,
                    error_code = e.error_code(),
                    updated = e.updated(),
                    collection = %selector.collection,
                    "Analytics fan-out failed"
                );
            }
        });
        let mut background = self.background();
        background.retain(|handle| !handle.is_finished());
        background.push(handle);
    }

    fn set_stage(&self, stage: PublishStage) {
        let _handles = self.handles();
        self.status.send_modify(|s| s.stage = stage);
        tracing::info!(stage = %stage, "Publish stage changed");
    }

    /// Enter `Persisting` unless a cancel arrived after the last transfer
    /// finished. From here on `cancel()` has nothing to act on.
    fn leave_transfer_stages(&self, run_token: &CancellationToken) -> bool {
        let mut handles = self.handles();
        if run_token.is_cancelled() {
            return false;
        }
        handles.cancel = None;
        let stage = PublishStage::Persisting;
        self.status.send_modify(|s| s.stage = stage);
        tracing::info!(stage = %stage, "Publish stage changed");
        true
    }

    fn set_active(&self, active: ActiveTransfer) {
        self.handles().active = active;
    }

    fn background(&self) -> MutexGuard<'_, Vec<JoinHandle<()>>> {
        self.background
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    fn handles(&self) -> MutexGuard<'_, RunHandles> {
        self.handles
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }
}

fn render_single(prefix: &str, parent_id: &str, filename: &str) -> StorageResult<String> {
    PathTemplate::single(prefix)?.render(&KeyVars::new(parent_id).filename(filename))
}

fn lesson_assets(manifest: &[PublishManifestEntry]) -> Vec<StoredAsset> {
    manifest
        .iter()
        .enumerate()
        .map(|(index, entry)| StoredAsset {
            role: AssetRole::Lesson { index },
            storage_key: entry.storage_key.clone(),
            url: entry.url.clone(),
        })
        .collect()
}

fn log_failure(err: &PublishError, start: Instant) {
    let duration_ms = start.elapsed().as_millis() as u64;
    let orphans = err.orphans().len();
    match err.log_level() {
        LogLevel::Debug => tracing::debug!(
            error = %err,
            error_code = err.error_code(),
            orphans = orphans,
            duration_ms = duration_ms,
            "Publish failed"
        ),
        LogLevel::Warn => tracing::warn!(
            error = %err,
            error_code = err.error_code(),
            orphans = orphans,
            duration_ms = duration_ms,
            "Publish failed"
        ),
        LogLevel::Error => tracing::error!(
            error = %err,
            error_code = err.error_code(),
            orphans = orphans,
            duration_ms = duration_ms,
            "Publish failed"
        ),
    }
}
