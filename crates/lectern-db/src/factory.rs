use crate::{
    connect_pool, DocumentStore, DocumentStoreResult, MemoryDocumentStore, PgDocumentStore,
};
use lectern_core::Config;
use std::sync::Arc;

/// Create the document store selected by configuration
///
/// PostgreSQL when `DATABASE_URL` is set, otherwise an in-memory store.
pub async fn create_document_store(config: &Config) -> DocumentStoreResult<Arc<dyn DocumentStore>> {
    let max_batch_ops = config.fan_out.max_batch_ops;

    match config.database.url {
        Some(_) => {
            tracing::info!("Initializing PostgreSQL document store");
            let pool = connect_pool(&config.database).await?;
            Ok(Arc::new(PgDocumentStore::new(pool, max_batch_ops)))
        }
        None => {
            tracing::warn!("DATABASE_URL not set - using in-memory document store");
            Ok(Arc::new(MemoryDocumentStore::new(max_batch_ops)))
        }
    }
}
