//! Lectern Services Library
//!
//! The publishing pipeline: single transfers, sequential batch uploads with
//! bounded retry, fan-out record updates and the publish workflow that ties
//! them together.

pub mod batch_uploader;
pub mod error;
pub mod fan_out;
pub mod orchestrator;
pub mod persistence;
pub mod retry;
pub mod transfer;

pub use batch_uploader::{BatchControl, BatchReport, LessonCatalog, SequentialBatchUploader};
pub use error::{
    AssetRole, BatchItemError, FanOutError, PartialBatchError, PublishError, PublishResult,
    RetryExhaustedError, StoredAsset, TransferFailure,
};
pub use fan_out::{FanOutBatchWriter, FanOutReport, FanOutSelector, FanOutUpdate};
pub use orchestrator::{OrchestratorSettings, PublishOrchestrator};
pub use persistence::{build_records, write_records, RecordWriteError};
pub use retry::{Backoff, RetryPolicy, Retryable};
pub use transfer::{TransferRequest, TransferSession, TransferSource};
