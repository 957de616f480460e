//! Single resumable transfer of one local asset to a storage key

use bytes::Bytes;
use lectern_core::models::TransferStatus;
use lectern_storage::{
    ByteReader, Storage, StorageError, StorageResult, TransferControl, CANCELLED_MESSAGE,
};
use std::io::Cursor;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Instant;
use tokio::sync::watch;
use tokio::task::JoinHandle;

/// Where the bytes of a transfer come from.
#[derive(Debug, Clone)]
pub enum TransferSource {
    File(PathBuf),
    /// Already in memory, e.g. a re-encoded thumbnail.
    Bytes(Bytes),
}

#[derive(Debug, Clone)]
pub struct TransferRequest {
    pub source: TransferSource,
    pub storage_key: String,
    pub content_type: String,
}

impl TransferRequest {
    pub fn file(
        path: impl Into<PathBuf>,
        storage_key: impl Into<String>,
        content_type: impl Into<String>,
    ) -> Self {
        Self {
            source: TransferSource::File(path.into()),
            storage_key: storage_key.into(),
            content_type: content_type.into(),
        }
    }

    pub fn bytes(
        data: Bytes,
        storage_key: impl Into<String>,
        content_type: impl Into<String>,
    ) -> Self {
        Self {
            source: TransferSource::Bytes(data),
            storage_key: storage_key.into(),
            content_type: content_type.into(),
        }
    }
}

/// A running transfer.
///
/// Created already running; the caller observes it through [`subscribe`](Self::subscribe)
/// and drives it with [`pause`](Self::pause), [`resume`](Self::resume) and
/// [`cancel`](Self::cancel). The URL is only handed out after the backend
/// confirmed the object.
pub struct TransferSession {
    control: Arc<TransferControl>,
    storage_key: String,
    handle: JoinHandle<StorageResult<String>>,
}

impl TransferSession {
    pub fn start(storage: Arc<dyn Storage>, request: TransferRequest) -> Self {
        Self::start_with_control(storage, request, Arc::new(TransferControl::new()))
    }

    /// Start with a caller-supplied control, e.g. one whose token is a child of a batch token.
    pub fn start_with_control(
        storage: Arc<dyn Storage>,
        request: TransferRequest,
        control: Arc<TransferControl>,
    ) -> Self {
        let storage_key = request.storage_key.clone();
        let handle = tokio::spawn(run_transfer(storage, request, control.clone()));
        Self {
            control,
            storage_key,
            handle,
        }
    }

    pub fn storage_key(&self) -> &str {
        &self.storage_key
    }

    /// Running -> Paused. Returns false when the transfer was not running.
    pub fn pause(&self) -> bool {
        let paused = self.control.pause();
        if paused {
            tracing::debug!(key = %self.storage_key, "Transfer paused");
        }
        paused
    }

    /// Paused -> Running. Returns false when the transfer was not paused.
    pub fn resume(&self) -> bool {
        let resumed = self.control.resume();
        if resumed {
            tracing::debug!(key = %self.storage_key, "Transfer resumed");
        }
        resumed
    }

    /// Abort the transfer. Returns false when it had already ended.
    pub fn cancel(&self) -> bool {
        let cancelled = self.control.cancel();
        if cancelled {
            tracing::info!(key = %self.storage_key, "Transfer cancelled");
        }
        cancelled
    }

    pub fn status(&self) -> TransferStatus {
        self.control.status()
    }

    pub fn subscribe(&self) -> watch::Receiver<TransferStatus> {
        self.control.subscribe()
    }

    pub fn control(&self) -> Arc<TransferControl> {
        self.control.clone()
    }

    /// Wait for the terminal state and return the confirmed URL.
    pub async fn wait(self) -> StorageResult<String> {
        join(self.handle).await
    }

    /// Wait like [`wait`](Self::wait), invoking `on_status` on every status change.
    pub async fn wait_with<F>(self, mut on_status: F) -> StorageResult<String>
    where
        F: FnMut(&TransferStatus),
    {
        let mut rx = self.control.subscribe();
        on_status(&*rx.borrow_and_update());

        let mut handle = self.handle;
        let result = loop {
            tokio::select! {
                result = &mut handle => break result,
                changed = rx.changed() => {
                    if changed.is_err() {
                        break (&mut handle).await;
                    }
                    on_status(&*rx.borrow_and_update());
                }
            }
        };

        // Terminal transition may have landed together with task completion.
        if rx.has_changed().unwrap_or(false) {
            on_status(&*rx.borrow_and_update());
        }
        flatten(result)
    }
}

async fn join(handle: JoinHandle<StorageResult<String>>) -> StorageResult<String> {
    flatten(handle.await)
}

fn flatten(
    result: Result<StorageResult<String>, tokio::task::JoinError>,
) -> StorageResult<String> {
    result.map_err(|e| StorageError::BackendError(format!("Transfer task failed: {}", e)))?
}

async fn open_source(source: TransferSource) -> StorageResult<(ByteReader, u64)> {
    match source {
        TransferSource::File(path) => {
            let file = tokio::fs::File::open(&path).await?;
            let size = file.metadata().await?.len();
            let reader: ByteReader = Box::pin(file);
            Ok((reader, size))
        }
        TransferSource::Bytes(data) => {
            let size = data.len() as u64;
            let reader: ByteReader = Box::pin(Cursor::new(data));
            Ok((reader, size))
        }
    }
}

async fn run_transfer(
    storage: Arc<dyn Storage>,
    request: TransferRequest,
    control: Arc<TransferControl>,
) -> StorageResult<String> {
    let TransferRequest {
        source,
        storage_key,
        content_type,
    } = request;
    let start = Instant::now();

    let result = async {
        let (reader, size) = open_source(source).await?;
        control.start(size);
        control.checkpoint().await?;
        storage
            .put_stream(&storage_key, &content_type, Some(size), reader, &control)
            .await
    }
    .await;

    match result {
        Ok(url) => {
            if control.succeed(url.clone()) {
                tracing::info!(
                    key = %storage_key,
                    size_bytes = control.status().total_bytes,
                    duration_ms = start.elapsed().as_millis() as u64,
                    "Transfer completed"
                );
                return Ok(url);
            }
            // Cancelled after the backend confirmed: the object must not survive.
            tracing::info!(key = %storage_key, "Transfer cancelled after completion, removing object");
            if let Err(e) = storage.delete(&storage_key).await {
                tracing::warn!(key = %storage_key, error = %e, "Failed to remove cancelled object");
            }
            Err(StorageError::Cancelled)
        }
        Err(e) => {
            if e.is_cancelled() {
                control.fail(CANCELLED_MESSAGE);
                tracing::debug!(key = %storage_key, "Transfer stopped by cancellation");
            } else {
                control.fail(e.to_string());
                tracing::warn!(
                    key = %storage_key,
                    error = %e,
                    duration_ms = start.elapsed().as_millis() as u64,
                    "Transfer failed"
                );
            }
            Err(e)
        }
    }
}
