//! Lectern Storage Library
//!
//! Object storage for published assets. It includes the Storage trait, the
//! [`TransferControl`] handle used to pause and cancel a running upload, and
//! implementations for S3 and the local filesystem.
//!
//! # Storage key format
//!
//! Keys are rendered from a [`PathTemplate`] such as
//! `courses/{parent}/lessons/{order}-{id}/{filename}`. Keys must not contain
//! `..` or a leading `/`; rendering and validation are centralized in the
//! `keys` module so all backends stay consistent.

pub mod factory;
pub mod keys;
#[cfg(feature = "storage-local")]
pub mod local;
#[cfg(feature = "storage-s3")]
pub mod s3;
pub mod traits;

// Re-export commonly used types
pub use factory::create_storage;
pub use keys::{content_type_for, sanitize_filename, validate_key, KeyVars, PathTemplate};
pub use lectern_core::StorageBackend;
#[cfg(feature = "storage-local")]
pub use local::LocalStorage;
#[cfg(feature = "storage-s3")]
pub use s3::S3Storage;
pub use traits::{
    ByteReader, Storage, StorageError, StorageResult, TransferControl, CANCELLED_MESSAGE,
};
