//! Lectern Core Library
//!
//! This crate provides the domain models, configuration and shared error metadata
//! used by every stage of the publishing pipeline: transfer status, lesson lists,
//! publish manifests, publish requests and their results.

pub mod config;
pub mod error;
pub mod models;
pub mod storage_types;

// Re-export commonly used types
pub use config::{
    Config, DatabaseSettings, FanOutSettings, LogFormat, RetryBackoff, RetrySettings,
    StorageSettings, ThumbnailSettings,
};
pub use error::{ErrorMetadata, LogLevel, ValidationError};
pub use storage_types::StorageBackend;
// Note: Storage and DocumentStore traits live in lectern-storage and lectern-db.
