//! Storage abstraction trait
//!
//! This module defines the Storage trait that all storage backends must implement,
//! and the [`TransferControl`] handle a backend consults while streaming.

use async_trait::async_trait;
use lectern_core::models::{TransferState, TransferStatus};
use lectern_core::StorageBackend;
use std::pin::Pin;
use thiserror::Error;
use tokio::io::AsyncRead;
use tokio::sync::watch;
use tokio_util::sync::CancellationToken;

/// Message recorded on a status that ended through `cancel()`.
pub const CANCELLED_MESSAGE: &str = "Transfer cancelled";

/// Storage operation errors
#[derive(Debug, Error)]
pub enum StorageError {
    #[error("Upload failed: {0}")]
    UploadFailed(String),

    #[error("Download failed: {0}")]
    DownloadFailed(String),

    #[error("Delete failed: {0}")]
    DeleteFailed(String),

    #[error("File not found: {0}")]
    NotFound(String),

    #[error("Invalid storage key: {0}")]
    InvalidKey(String),

    #[error("Storage backend error: {0}")]
    BackendError(String),

    #[error("IO error: {0}")]
    IoError(#[from] std::io::Error),

    #[error("Configuration error: {0}")]
    ConfigError(String),

    #[error("{}", CANCELLED_MESSAGE)]
    Cancelled,
}

impl StorageError {
    pub fn is_cancelled(&self) -> bool {
        matches!(self, StorageError::Cancelled)
    }
}

/// Result type for storage operations
pub type StorageResult<T> = Result<T, StorageError>;

/// Boxed reader handed to [`Storage::put_stream`].
pub type ByteReader = Pin<Box<dyn AsyncRead + Send + Unpin>>;

/// Pause/cancel/progress handle shared by a transfer and the backend executing it.
///
/// The status lives in a `watch` channel so any number of observers can follow
/// it. Backends call [`checkpoint`](Self::checkpoint) before every chunk and
/// [`advance`](Self::advance) after it.
#[derive(Debug)]
pub struct TransferControl {
    status: watch::Sender<TransferStatus>,
    cancel: CancellationToken,
}

impl Default for TransferControl {
    fn default() -> Self {
        Self::new()
    }
}

impl TransferControl {
    pub fn new() -> Self {
        Self::with_cancel_token(CancellationToken::new())
    }

    /// Use `token` for cancellation, typically a child of a batch-wide token.
    pub fn with_cancel_token(token: CancellationToken) -> Self {
        let (status, _) = watch::channel(TransferStatus::idle());
        Self {
            status,
            cancel: token,
        }
    }

    pub fn subscribe(&self) -> watch::Receiver<TransferStatus> {
        self.status.subscribe()
    }

    pub fn status(&self) -> TransferStatus {
        self.status.borrow().clone()
    }

    pub fn start(&self, total_bytes: u64) -> bool {
        self.status.send_if_modified(|s| s.start(total_bytes))
    }

    pub fn advance(&self, bytes: u64) -> bool {
        self.status.send_if_modified(|s| s.advance(bytes))
    }

    pub fn pause(&self) -> bool {
        self.status.send_if_modified(|s| s.pause())
    }

    pub fn resume(&self) -> bool {
        self.status.send_if_modified(|s| s.resume())
    }

    /// Cancel the transfer. No-op once the status is terminal.
    pub fn cancel(&self) -> bool {
        if self.status.borrow().is_terminal() {
            return false;
        }
        self.cancel.cancel();
        self.status.send_if_modified(|s| s.fail(CANCELLED_MESSAGE))
    }

    pub fn is_cancelled(&self) -> bool {
        self.cancel.is_cancelled()
    }

    pub fn cancellation_token(&self) -> CancellationToken {
        self.cancel.clone()
    }

    pub fn succeed(&self, url: String) -> bool {
        self.status.send_if_modified(|s| s.succeed(url))
    }

    pub fn fail(&self, message: impl Into<String>) -> bool {
        let message = message.into();
        self.status.send_if_modified(|s| s.fail(message))
    }

    /// Wait while paused; fail with [`StorageError::Cancelled`] once cancelled.
    pub async fn checkpoint(&self) -> StorageResult<()> {
        let mut rx = self.status.subscribe();
        loop {
            if self.cancel.is_cancelled() {
                return Err(StorageError::Cancelled);
            }
            if rx.borrow_and_update().state != TransferState::Paused {
                return Ok(());
            }
            tokio::select! {
                _ = self.cancel.cancelled() => return Err(StorageError::Cancelled),
                changed = rx.changed() => {
                    if changed.is_err() {
                        return Err(StorageError::Cancelled);
                    }
                }
            }
        }
    }
}

/// Storage abstraction trait
///
/// All storage backends (S3, local filesystem) must implement this trait.
/// Keys are produced by [`crate::keys`] and never contain `..` or a leading `/`.
#[async_trait]
pub trait Storage: Send + Sync {
    /// Stream `reader` to `storage_key` and return the public URL.
    ///
    /// The URL is returned only after the backend has confirmed the object is
    /// complete. Implementations must call `control.checkpoint()` before each
    /// chunk and `control.advance()` after it, and must not leave an object
    /// under `storage_key` when the transfer fails or is cancelled.
    async fn put_stream(
        &self,
        storage_key: &str,
        content_type: &str,
        content_length: Option<u64>,
        reader: ByteReader,
        control: &TransferControl,
    ) -> StorageResult<String>;

    /// Download a file by its storage key
    async fn download(&self, storage_key: &str) -> StorageResult<Vec<u8>>;

    /// Delete a file by its storage key. Deleting a missing key succeeds.
    async fn delete(&self, storage_key: &str) -> StorageResult<()>;

    /// Check if a file exists
    async fn exists(&self, storage_key: &str) -> StorageResult<bool>;

    /// Public URL for a key, without checking that the object exists.
    fn public_url(&self, storage_key: &str) -> String;

    /// Get the storage backend type
    fn backend_type(&self) -> StorageBackend;
}
