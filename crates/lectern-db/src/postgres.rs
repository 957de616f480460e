use crate::document::{
    require_object, BatchOp, Document, DocumentStore, DocumentStoreError, DocumentStoreResult,
    FieldChange, RecordFilter,
};
use crate::transaction::TransactionGuard;
use async_trait::async_trait;
use lectern_core::DatabaseSettings;
use serde_json::Value;
use sqlx::postgres::PgPoolOptions;
use sqlx::types::Json;
use sqlx::{PgPool, Row};
use std::time::Duration;
use uuid::Uuid;

/// Connect to PostgreSQL and apply pending migrations.
pub async fn connect_pool(settings: &DatabaseSettings) -> DocumentStoreResult<PgPool> {
    let url = settings.url.as_deref().ok_or_else(|| {
        DocumentStoreError::Unavailable("DATABASE_URL not configured".to_string())
    })?;

    tracing::info!("Connecting to database...");
    let pool = PgPoolOptions::new()
        .max_connections(settings.max_connections)
        .acquire_timeout(Duration::from_secs(settings.timeout_seconds))
        .idle_timeout(Duration::from_secs(600))
        .max_lifetime(Duration::from_secs(1800))
        .connect(url)
        .await?;

    tracing::info!(
        max_connections = settings.max_connections,
        "Database connected successfully"
    );

    sqlx::migrate!("../../migrations")
        .run(&pool)
        .await
        .map_err(|e| DocumentStoreError::Migration(e.to_string()))?;
    tracing::info!("Database migrations applied");

    Ok(pool)
}

/// PostgreSQL-backed document store over the `documents` JSONB table.
#[derive(Clone)]
pub struct PgDocumentStore {
    pool: PgPool,
    max_batch_ops: usize,
}

impl PgDocumentStore {
    pub fn new(pool: PgPool, max_batch_ops: usize) -> Self {
        Self {
            pool,
            max_batch_ops,
        }
    }

    pub fn pool(&self) -> &PgPool {
        &self.pool
    }

    fn row_to_document(collection: &str, row: &sqlx::postgres::PgRow) -> DocumentStoreResult<Document> {
        let id: String = row.try_get("id")?;
        let data: Json<Value> = row.try_get("data")?;
        Ok(Document {
            id,
            collection: collection.to_string(),
            data: data.0,
        })
    }
}

#[async_trait]
impl DocumentStore for PgDocumentStore {
    #[tracing::instrument(skip(self, record), fields(
        db.system = "postgresql",
        db.table = "documents",
        db.operation = "insert"
    ))]
    async fn create(&self, collection: &str, record: Value) -> DocumentStoreResult<String> {
        let data = require_object(record)?;
        let id = Uuid::new_v4().to_string();

        sqlx::query(
            r#"
            INSERT INTO documents (collection, id, data)
            VALUES ($1, $2, $3)
            "#,
        )
        .bind(collection)
        .bind(&id)
        .bind(Json(Value::Object(data)))
        .execute(&self.pool)
        .await
        .map_err(|e| {
            tracing::error!(error = ?e, collection = %collection, "Failed to insert document");
            DocumentStoreError::Database(e)
        })?;

        Ok(id)
    }

    #[tracing::instrument(skip(self, record), fields(
        db.system = "postgresql",
        db.table = "documents",
        db.operation = "upsert"
    ))]
    async fn put(&self, collection: &str, id: &str, record: Value) -> DocumentStoreResult<()> {
        let data = require_object(record)?;

        sqlx::query(
            r#"
            INSERT INTO documents (collection, id, data)
            VALUES ($1, $2, $3)
            ON CONFLICT (collection, id)
            DO UPDATE SET data = EXCLUDED.data, updated_at = now()
            "#,
        )
        .bind(collection)
        .bind(id)
        .bind(Json(Value::Object(data)))
        .execute(&self.pool)
        .await
        .map_err(|e| {
            tracing::error!(error = ?e, collection = %collection, id = %id, "Failed to upsert document");
            DocumentStoreError::Database(e)
        })?;

        Ok(())
    }

    #[tracing::instrument(skip(self), fields(
        db.system = "postgresql",
        db.table = "documents",
        db.operation = "select"
    ))]
    async fn get(&self, collection: &str, id: &str) -> DocumentStoreResult<Option<Document>> {
        let row = sqlx::query("SELECT id, data FROM documents WHERE collection = $1 AND id = $2")
            .bind(collection)
            .bind(id)
            .fetch_optional(&self.pool)
            .await?;

        row.map(|r| Self::row_to_document(collection, &r))
            .transpose()
    }

    #[tracing::instrument(skip(self), fields(
        db.system = "postgresql",
        db.table = "documents",
        db.operation = "select"
    ))]
    async fn query(
        &self,
        collection: &str,
        filter: &RecordFilter,
    ) -> DocumentStoreResult<Vec<Document>> {
        let rows = match filter {
            RecordFilter::All => {
                sqlx::query(
                    r#"
                    SELECT id, data FROM documents
                    WHERE collection = $1
                    ORDER BY created_at, id
                    "#,
                )
                .bind(collection)
                .fetch_all(&self.pool)
                .await?
            }
            RecordFilter::FieldEquals { field, value } => {
                sqlx::query(
                    r#"
                    SELECT id, data FROM documents
                    WHERE collection = $1 AND data -> $2::text = $3::jsonb
                    ORDER BY created_at, id
                    "#,
                )
                .bind(collection)
                .bind(field)
                .bind(Json(value))
                .fetch_all(&self.pool)
                .await?
            }
        };

        rows.iter()
            .map(|row| Self::row_to_document(collection, row))
            .collect()
    }

    #[tracing::instrument(skip(self, ops), fields(
        db.system = "postgresql",
        db.table = "documents",
        db.operation = "batch_update",
        ops = ops.len()
    ))]
    async fn commit_batch(&self, ops: Vec<BatchOp>) -> DocumentStoreResult<()> {
        if ops.len() > self.max_batch_ops {
            return Err(DocumentStoreError::BatchTooLarge {
                ops: ops.len(),
                max: self.max_batch_ops,
            });
        }

        let mut tx = TransactionGuard::begin(&self.pool).await?;

        for op in &ops {
            for change in &op.changes {
                let result = match change {
                    FieldChange::Increment { field, delta } => {
                        sqlx::query(
                            r#"
                            UPDATE documents
                            SET data = jsonb_set(
                                    data,
                                    ARRAY[$3::text],
                                    to_jsonb(COALESCE((data ->> $3)::bigint, 0) + $4)
                                ),
                                updated_at = now()
                            WHERE collection = $1 AND id = $2
                            "#,
                        )
                        .bind(&op.collection)
                        .bind(&op.id)
                        .bind(field)
                        .bind(*delta)
                        .execute(tx.connection()?)
                        .await?
                    }
                    FieldChange::Set { field, value } => {
                        sqlx::query(
                            r#"
                            UPDATE documents
                            SET data = jsonb_set(data, ARRAY[$3::text], $4),
                                updated_at = now()
                            WHERE collection = $1 AND id = $2
                            "#,
                        )
                        .bind(&op.collection)
                        .bind(&op.id)
                        .bind(field)
                        .bind(Json(value))
                        .execute(tx.connection()?)
                        .await?
                    }
                };

                if result.rows_affected() == 0 {
                    tx.rollback().await?;
                    return Err(DocumentStoreError::NotFound {
                        collection: op.collection.clone(),
                        id: op.id.clone(),
                    });
                }
            }
        }

        tx.commit().await?;
        Ok(())
    }

    fn max_batch_ops(&self) -> usize {
        self.max_batch_ops
    }
}
