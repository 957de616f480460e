//! Lectern DB Library
//!
//! Document store used for published content records, lesson catalog entries
//! and analytics counters. PostgreSQL in production, in-memory for tests and
//! dry runs.

pub mod document;
pub mod factory;
pub mod memory;
pub mod postgres;
pub mod transaction;

pub use document::{
    BatchOp, Document, DocumentStore, DocumentStoreError, DocumentStoreResult, FieldChange,
    RecordFilter,
};
pub use factory::create_document_store;
pub use memory::MemoryDocumentStore;
pub use postgres::{connect_pool, PgDocumentStore};
pub use transaction::TransactionGuard;
