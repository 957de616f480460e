use crate::keys::validate_key;
use crate::traits::{ByteReader, Storage, StorageError, StorageResult, TransferControl};
use crate::StorageBackend;
use async_trait::async_trait;
use bytes::Bytes;
use object_store::aws::{AmazonS3, AmazonS3Builder};
use object_store::path::Path;
use object_store::Error as ObjectStoreError;
use object_store::{MultipartUpload, ObjectStoreExt, PutPayload, Result as ObjectResult};
use tokio::io::AsyncReadExt;

/// S3 minimum part size for every part but the last.
pub const MIN_PART_SIZE: usize = 5 * 1024 * 1024;

/// S3 storage implementation
///
/// Objects up to one part are written with a single `put`; larger objects
/// use a multipart upload so pause and cancel take effect between parts.
#[derive(Clone)]
pub struct S3Storage {
    store: AmazonS3,
    bucket: String,
    region: String,
    endpoint_url: Option<String>, // Custom endpoint for S3-compatible providers
    part_size: usize,
}

impl S3Storage {
    /// Create a new S3Storage instance
    ///
    /// # Arguments
    /// * `bucket` - S3 bucket name
    /// * `region` - AWS region (or region identifier for S3-compatible providers)
    /// * `endpoint_url` - Optional custom endpoint URL for S3-compatible providers
    ///   (e.g., "http://localhost:9000" for MinIO)
    pub async fn new(
        bucket: String,
        region: String,
        endpoint_url: Option<String>,
    ) -> StorageResult<Self> {
        let mut builder = AmazonS3Builder::from_env()
            .with_region(region.clone())
            .with_bucket_name(bucket.clone());

        if let Some(ref endpoint) = endpoint_url {
            let allow_http = endpoint.starts_with("http://");
            builder = builder
                .with_endpoint(endpoint.clone())
                .with_allow_http(allow_http);
        }

        let store = builder
            .build()
            .map_err(|e| StorageError::ConfigError(e.to_string()))?;

        Ok(S3Storage {
            store,
            bucket,
            region,
            endpoint_url,
            part_size: 8 * 1024 * 1024,
        })
    }

    pub fn with_part_size(mut self, part_size: usize) -> Self {
        self.part_size = part_size.max(MIN_PART_SIZE);
        self
    }

    /// Fill a buffer of up to `part_size` bytes; a short buffer means end of stream.
    async fn read_part(&self, reader: &mut ByteReader) -> StorageResult<Vec<u8>> {
        let mut buf = Vec::with_capacity(self.part_size);
        let mut limited = reader.take(self.part_size as u64);
        limited
            .read_to_end(&mut buf)
            .await
            .map_err(|e| StorageError::UploadFailed(format!("Failed to read source: {}", e)))?;
        Ok(buf)
    }

    async fn put_single(
        &self,
        location: &Path,
        data: Vec<u8>,
        control: &TransferControl,
    ) -> StorageResult<u64> {
        let size = data.len() as u64;
        control.checkpoint().await?;
        let result: ObjectResult<_> = self
            .store
            .put(location, PutPayload::from(Bytes::from(data)))
            .await;
        result.map_err(|e| StorageError::UploadFailed(e.to_string()))?;
        control.advance(size);
        Ok(size)
    }

    async fn put_parts(
        &self,
        location: &Path,
        first: Vec<u8>,
        reader: &mut ByteReader,
        control: &TransferControl,
    ) -> StorageResult<u64> {
        let mut upload = self
            .store
            .put_multipart(location)
            .await
            .map_err(|e| StorageError::UploadFailed(e.to_string()))?;

        let result = self.send_parts(upload.as_mut(), first, reader, control).await;
        match result {
            Ok(written) => {
                upload
                    .complete()
                    .await
                    .map_err(|e| StorageError::UploadFailed(e.to_string()))?;
                Ok(written)
            }
            Err(e) => {
                if let Err(abort_err) = upload.abort().await {
                    tracing::warn!(
                        error = %abort_err,
                        bucket = %self.bucket,
                        key = %location,
                        "Failed to abort S3 multipart upload"
                    );
                }
                Err(e)
            }
        }
    }

    async fn send_parts(
        &self,
        upload: &mut dyn MultipartUpload,
        first: Vec<u8>,
        reader: &mut ByteReader,
        control: &TransferControl,
    ) -> StorageResult<u64> {
        let mut written = 0u64;
        let mut part = first;
        loop {
            control.checkpoint().await?;
            let size = part.len();
            upload
                .put_part(PutPayload::from(Bytes::from(part)))
                .await
                .map_err(|e| StorageError::UploadFailed(e.to_string()))?;
            written += size as u64;
            control.advance(size as u64);
            if size < self.part_size {
                break;
            }
            part = self.read_part(reader).await?;
            if part.is_empty() {
                break;
            }
        }
        control.checkpoint().await?;
        Ok(written)
    }
}

#[async_trait]
impl Storage for S3Storage {
    async fn put_stream(
        &self,
        storage_key: &str,
        _content_type: &str,
        content_length: Option<u64>,
        mut reader: ByteReader,
        control: &TransferControl,
    ) -> StorageResult<String> {
        validate_key(storage_key)?;
        let location = Path::from(storage_key.to_string());
        let start = std::time::Instant::now();

        let first = self.read_part(&mut reader).await?;
        let result = if first.len() < self.part_size {
            self.put_single(&location, first, control).await
        } else {
            self.put_parts(&location, first, &mut reader, control)
                .await
        };

        let written = result.map_err(|e| {
            tracing::error!(
                error = %e,
                bucket = %self.bucket,
                key = %storage_key,
                duration_ms = start.elapsed().as_secs_f64() * 1000.0,
                "S3 upload failed"
            );
            e
        })?;

        if let Some(expected) = content_length {
            if expected != written {
                let _ = self.delete(storage_key).await;
                return Err(StorageError::UploadFailed(format!(
                    "Size mismatch for {}: expected {} bytes, sent {}",
                    storage_key, expected, written
                )));
            }
        }

        let url = self.public_url(storage_key);

        tracing::info!(
            bucket = %self.bucket,
            key = %storage_key,
            size_bytes = written,
            duration_ms = start.elapsed().as_secs_f64() * 1000.0,
            "S3 upload successful"
        );

        Ok(url)
    }

    async fn download(&self, storage_key: &str) -> StorageResult<Vec<u8>> {
        let start = std::time::Instant::now();
        let location = Path::from(storage_key.to_string());

        let result: ObjectResult<_> = self.store.get(&location).await;

        let result = result.map_err(|e| match e {
            ObjectStoreError::NotFound { .. } => StorageError::NotFound(storage_key.to_string()),
            other => StorageError::DownloadFailed(other.to_string()),
        })?;

        let bytes = result
            .bytes()
            .await
            .map_err(|e| StorageError::DownloadFailed(e.to_string()))?;

        tracing::debug!(
            bucket = %self.bucket,
            key = %storage_key,
            size_bytes = bytes.len(),
            duration_ms = start.elapsed().as_secs_f64() * 1000.0,
            "S3 download successful"
        );

        Ok(bytes.to_vec())
    }

    async fn delete(&self, storage_key: &str) -> StorageResult<()> {
        let start = std::time::Instant::now();
        let location = Path::from(storage_key.to_string());

        let result: ObjectResult<_> = self.store.delete(&location).await;

        match result {
            Ok(()) | Err(ObjectStoreError::NotFound { .. }) => {}
            Err(e) => {
                tracing::error!(
                    error = %e,
                    bucket = %self.bucket,
                    key = %storage_key,
                    duration_ms = start.elapsed().as_secs_f64() * 1000.0,
                    "S3 delete failed"
                );
                return Err(StorageError::DeleteFailed(e.to_string()));
            }
        }

        tracing::info!(
            bucket = %self.bucket,
            key = %storage_key,
            duration_ms = start.elapsed().as_secs_f64() * 1000.0,
            "S3 delete successful"
        );

        Ok(())
    }

    async fn exists(&self, storage_key: &str) -> StorageResult<bool> {
        let location = Path::from(storage_key.to_string());
        match self.store.head(&location).await {
            Ok(_) => Ok(true),
            Err(ObjectStoreError::NotFound { .. }) => Ok(false),
            Err(e) => Err(StorageError::BackendError(e.to_string())),
        }
    }

    /// For AWS S3: `https://{bucket}.s3.{region}.amazonaws.com/{key}`; with a
    /// custom endpoint, path-style `{endpoint}/{bucket}/{key}`.
    fn public_url(&self, storage_key: &str) -> String {
        match self.endpoint_url {
            Some(ref endpoint) => format!(
                "{}/{}/{}",
                endpoint.trim_end_matches('/'),
                self.bucket,
                storage_key
            ),
            None => format!(
                "https://{}.s3.{}.amazonaws.com/{}",
                self.bucket, self.region, storage_key
            ),
        }
    }

    fn backend_type(&self) -> StorageBackend {
        StorageBackend::S3
    }
}
