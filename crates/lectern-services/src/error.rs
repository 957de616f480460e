//! Publish pipeline errors
//!
//! Every error a caller can receive from the pipeline implements
//! [`ErrorMetadata`]. Static presentation data lives in one table per type.

use lectern_core::models::{PublishManifestEntry, PublishReceipt};
use lectern_core::{ErrorMetadata, LogLevel, ValidationError};
use lectern_db::DocumentStoreError;
use lectern_processing::ProcessingError;
use lectern_storage::StorageError;
use serde::{Deserialize, Serialize};
use std::fmt::{Display, Formatter, Result as FmtResult};
use thiserror::Error;

/// Which asset of a publish an object belongs to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "role", rename_all = "snake_case")]
pub enum AssetRole {
    Thumbnail,
    Content,
    Lesson { index: usize },
}

impl Display for AssetRole {
    fn fmt(&self, f: &mut Formatter<'_>) -> FmtResult {
        match self {
            AssetRole::Thumbnail => write!(f, "thumbnail"),
            AssetRole::Content => write!(f, "content"),
            AssetRole::Lesson { index } => write!(f, "lesson {}", index),
        }
    }
}

/// An object confirmed by the storage backend.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StoredAsset {
    #[serde(flatten)]
    pub role: AssetRole,
    pub storage_key: String,
    pub url: String,
}

/// Failure of one attempt at a batch item.
#[derive(Debug, Error)]
pub enum BatchItemError {
    #[error("transfer failed: {0}")]
    Transfer(#[from] StorageError),

    #[error("catalog write failed: {0}")]
    Catalog(#[from] DocumentStoreError),
}

impl BatchItemError {
    pub fn is_cancelled(&self) -> bool {
        matches!(self, BatchItemError::Transfer(e) if e.is_cancelled())
    }
}

/// Cause of a failed single-asset transfer.
///
/// A thumbnail that cannot be read or re-encoded fails its transfer before
/// any bytes reach the store.
#[derive(Debug, Error)]
pub enum TransferFailure {
    #[error(transparent)]
    Storage(#[from] StorageError),

    #[error("preprocessing failed: {0}")]
    Preprocessing(#[from] ProcessingError),
}

impl TransferFailure {
    pub fn is_cancelled(&self) -> bool {
        matches!(self, TransferFailure::Storage(e) if e.is_cancelled())
    }
}

/// A batch item failed on every allowed attempt, or was cancelled.
#[derive(Debug, Error)]
#[error("Item {item_id} (index {index}) failed after {attempts} attempt(s): {last_error}")]
pub struct RetryExhaustedError {
    pub item_id: String,
    pub index: usize,
    pub attempts: u32,
    #[source]
    pub last_error: BatchItemError,
    /// Object uploaded for this item before a later phase failed.
    pub orphan: Option<StoredAsset>,
}

impl RetryExhaustedError {
    pub fn is_cancelled(&self) -> bool {
        self.last_error.is_cancelled()
    }
}

/// A batch aborted part-way. `manifest` holds every item committed before the failure.
#[derive(Debug, Error)]
#[error("Batch aborted at item {} of {total_items}: {source}", .source.index + 1)]
pub struct PartialBatchError {
    #[source]
    pub source: RetryExhaustedError,
    pub manifest: Vec<PublishManifestEntry>,
    pub total_items: usize,
}

impl PartialBatchError {
    pub fn is_cancelled(&self) -> bool {
        self.source.is_cancelled()
    }
}

/// Fan-out update failure. Groups before `group_index` stay applied.
#[derive(Debug, Error)]
pub enum FanOutError {
    #[error("max_batch_ops must be at least 1")]
    InvalidBatchSize,

    #[error("Failed to select fan-out targets: {0}")]
    Query(#[source] DocumentStoreError),

    #[error("Commit of group {group_index} failed after {updated} record(s) were updated: {source}")]
    Commit {
        group_index: usize,
        updated: usize,
        #[source]
        source: DocumentStoreError,
    },
}

impl FanOutError {
    /// Records already updated when the error occurred.
    pub fn updated(&self) -> usize {
        match self {
            FanOutError::Commit { updated, .. } => *updated,
            _ => 0,
        }
    }
}

/// Terminal failure of a publish workflow.
#[derive(Debug, Error)]
pub enum PublishError {
    #[error("A publish is already in progress")]
    Busy,

    #[error("Validation failed: {0}")]
    Validation(#[from] ValidationError),

    #[error("Transfer of {asset} failed: {source}")]
    Transfer {
        asset: AssetRole,
        #[source]
        source: TransferFailure,
        orphans: Vec<StoredAsset>,
    },

    #[error("{source}")]
    PartialBatch {
        #[source]
        source: PartialBatchError,
        orphans: Vec<StoredAsset>,
    },

    #[error("Persisting records failed after upload: {source}")]
    Persistence {
        #[source]
        source: DocumentStoreError,
        records_created: Vec<String>,
        orphans: Vec<StoredAsset>,
    },
}

impl PublishError {
    /// Objects that exist in storage but are not referenced by any record.
    pub fn orphans(&self) -> &[StoredAsset] {
        match self {
            PublishError::Transfer { orphans, .. }
            | PublishError::PartialBatch { orphans, .. }
            | PublishError::Persistence { orphans, .. } => orphans,
            _ => &[],
        }
    }

    pub fn is_cancelled(&self) -> bool {
        match self {
            PublishError::Transfer { source, .. } => source.is_cancelled(),
            PublishError::PartialBatch { source, .. } => source.is_cancelled(),
            _ => false,
        }
    }

    /// Partial manifest of a failed batch.
    pub fn partial_manifest(&self) -> Option<&[PublishManifestEntry]> {
        match self {
            PublishError::PartialBatch { source, .. } => Some(&source.manifest),
            _ => None,
        }
    }
}

/// Terminal outcome of a publish workflow.
pub type PublishResult = Result<PublishReceipt, PublishError>;

/// Static metadata: (error_code, recoverable, suggested_action, log_level).
fn publish_error_static_metadata(
    err: &PublishError,
) -> (&'static str, bool, Option<&'static str>, LogLevel) {
    match err {
        PublishError::Busy => (
            "PUBLISH_IN_PROGRESS",
            true,
            Some("Wait for the current publish to finish"),
            LogLevel::Debug,
        ),
        PublishError::Validation(_) => (
            "VALIDATION_ERROR",
            false,
            Some("Check required fields and selected tiers"),
            LogLevel::Debug,
        ),
        PublishError::Transfer { source, .. } if source.is_cancelled() => (
            "TRANSFER_CANCELLED",
            true,
            Some("Start the publish again when ready"),
            LogLevel::Debug,
        ),
        PublishError::Transfer {
            source: TransferFailure::Preprocessing(_),
            ..
        } => (
            "TRANSFER_ERROR",
            false,
            Some("Check the thumbnail file or choose a different image"),
            LogLevel::Warn,
        ),
        PublishError::Transfer { .. } => (
            "TRANSFER_ERROR",
            true,
            Some("Check connectivity and retry"),
            LogLevel::Error,
        ),
        PublishError::PartialBatch { source, .. } if source.is_cancelled() => (
            "BATCH_CANCELLED",
            true,
            Some("Resume from the first item missing from the manifest"),
            LogLevel::Debug,
        ),
        PublishError::PartialBatch { .. } => (
            "PARTIAL_BATCH_ERROR",
            true,
            Some("Resume from the first item missing from the manifest or discard uploaded items"),
            LogLevel::Error,
        ),
        PublishError::Persistence { .. } => (
            "PERSISTENCE_ERROR",
            true,
            Some("Retry persisting records or discard the orphaned assets"),
            LogLevel::Error,
        ),
    }
}

impl ErrorMetadata for PublishError {
    fn error_code(&self) -> &'static str {
        publish_error_static_metadata(self).0
    }

    fn is_recoverable(&self) -> bool {
        publish_error_static_metadata(self).1
    }

    fn suggested_action(&self) -> Option<&'static str> {
        publish_error_static_metadata(self).2
    }

    fn client_message(&self) -> String {
        match self {
            PublishError::Busy | PublishError::Validation(_) => self.to_string(),
            PublishError::Transfer { asset, .. } if self.is_cancelled() => {
                format!("Upload of the {} was cancelled", asset)
            }
            PublishError::Transfer {
                source: TransferFailure::Preprocessing(_),
                asset,
                ..
            } => format!("The {} could not be prepared for upload", asset),
            PublishError::Transfer { asset, .. } => format!("Upload of the {} failed", asset),
            PublishError::PartialBatch { source, .. } => source.client_message(),
            PublishError::Persistence { orphans, .. } => format!(
                "Files were uploaded but records could not be saved ({} orphaned asset(s))",
                orphans.len()
            ),
        }
    }

    fn log_level(&self) -> LogLevel {
        publish_error_static_metadata(self).3
    }
}

impl ErrorMetadata for RetryExhaustedError {
    fn error_code(&self) -> &'static str {
        if self.is_cancelled() {
            return "TRANSFER_CANCELLED";
        }
        match &self.last_error {
            BatchItemError::Transfer(_) => "RETRY_EXHAUSTED",
            BatchItemError::Catalog(_) => "CATALOG_RETRY_EXHAUSTED",
        }
    }

    fn is_recoverable(&self) -> bool {
        true
    }

    fn suggested_action(&self) -> Option<&'static str> {
        Some("Check connectivity and retry the failed item")
    }

    fn client_message(&self) -> String {
        if self.is_cancelled() {
            format!("Item {} was cancelled", self.index + 1)
        } else {
            format!(
                "Item {} failed after {} attempt(s)",
                self.index + 1,
                self.attempts
            )
        }
    }

    fn log_level(&self) -> LogLevel {
        if self.is_cancelled() {
            LogLevel::Debug
        } else {
            LogLevel::Error
        }
    }
}

impl ErrorMetadata for PartialBatchError {
    fn error_code(&self) -> &'static str {
        if self.is_cancelled() {
            "BATCH_CANCELLED"
        } else {
            "PARTIAL_BATCH_ERROR"
        }
    }

    fn is_recoverable(&self) -> bool {
        true
    }

    fn suggested_action(&self) -> Option<&'static str> {
        Some("Resume from the first item missing from the manifest")
    }

    fn client_message(&self) -> String {
        format!(
            "{} of {} items were published. {}",
            self.manifest.len(),
            self.total_items,
            self.source.client_message()
        )
    }

    fn log_level(&self) -> LogLevel {
        self.source.log_level()
    }
}

impl ErrorMetadata for FanOutError {
    fn error_code(&self) -> &'static str {
        match self {
            FanOutError::InvalidBatchSize => "FANOUT_CONFIG_ERROR",
            FanOutError::Query(_) => "FANOUT_QUERY_ERROR",
            FanOutError::Commit { .. } => "FANOUT_PARTIAL_COMMIT",
        }
    }

    fn is_recoverable(&self) -> bool {
        !matches!(self, FanOutError::InvalidBatchSize)
    }

    fn suggested_action(&self) -> Option<&'static str> {
        match self {
            FanOutError::InvalidBatchSize => Some("Set FANOUT_MAX_BATCH_OPS to at least 1"),
            _ => Some("Counters may be partially updated; reconcile analytics records"),
        }
    }

    fn client_message(&self) -> String {
        self.to_string()
    }

    // Fan-out never fails a publish.
    fn log_level(&self) -> LogLevel {
        LogLevel::Warn
    }
}
