use crate::keys::validate_key;
use crate::traits::{ByteReader, Storage, StorageError, StorageResult, TransferControl};
use crate::StorageBackend;
use async_trait::async_trait;
use std::path::{Path, PathBuf};
use tokio::fs;
use tokio::io::{AsyncReadExt, AsyncWriteExt};

const DEFAULT_CHUNK_SIZE: usize = 256 * 1024;

/// Local filesystem storage implementation
///
/// Uploads are written to `<key>.part` and renamed into place once the last
/// chunk is synced, so a reader never sees a partial object under its key.
#[derive(Clone)]
pub struct LocalStorage {
    base_path: PathBuf,
    base_url: String,
    chunk_size: usize,
}

impl LocalStorage {
    /// Create a new LocalStorage instance
    ///
    /// # Arguments
    /// * `base_path` - Root directory for file storage (e.g., "/var/lib/lectern/media")
    /// * `base_url` - Base URL for serving files (e.g., "http://localhost:3000/media")
    pub async fn new(base_path: impl Into<PathBuf>, base_url: String) -> StorageResult<Self> {
        let base_path = base_path.into();

        fs::create_dir_all(&base_path).await.map_err(|e| {
            StorageError::ConfigError(format!(
                "Failed to create storage directory {}: {}",
                base_path.display(),
                e
            ))
        })?;

        Ok(LocalStorage {
            base_path,
            base_url,
            chunk_size: DEFAULT_CHUNK_SIZE,
        })
    }

    /// Bytes written between progress updates and pause/cancel checks.
    pub fn with_chunk_size(mut self, chunk_size: usize) -> Self {
        self.chunk_size = chunk_size.max(1);
        self
    }

    /// Convert storage key to filesystem path with security validation
    fn key_to_path(&self, storage_key: &str) -> StorageResult<PathBuf> {
        validate_key(storage_key)?;

        let path = self.base_path.join(storage_key);
        if !path.starts_with(&self.base_path) {
            return Err(StorageError::InvalidKey(
                "Storage key resolves outside storage directory".to_string(),
            ));
        }
        Ok(path)
    }

    fn part_path(path: &Path) -> PathBuf {
        let mut name = path.as_os_str().to_owned();
        name.push(".part");
        PathBuf::from(name)
    }

    /// Ensure parent directory exists
    async fn ensure_parent_dir(&self, path: &Path) -> StorageResult<()> {
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent).await?;
        }
        Ok(())
    }

    async fn write_chunks(
        &self,
        part: &Path,
        mut reader: ByteReader,
        control: &TransferControl,
    ) -> StorageResult<u64> {
        let mut file = fs::File::create(part).await.map_err(|e| {
            StorageError::UploadFailed(format!("Failed to create file {}: {}", part.display(), e))
        })?;

        let mut buf = vec![0u8; self.chunk_size];
        let mut written = 0u64;
        loop {
            control.checkpoint().await?;
            let n = reader.read(&mut buf).await.map_err(|e| {
                StorageError::UploadFailed(format!("Failed to read source: {}", e))
            })?;
            if n == 0 {
                break;
            }
            file.write_all(&buf[..n]).await.map_err(|e| {
                StorageError::UploadFailed(format!("Failed to write file {}: {}", part.display(), e))
            })?;
            written += n as u64;
            control.advance(n as u64);
        }

        file.sync_all().await.map_err(|e| {
            StorageError::UploadFailed(format!("Failed to sync file {}: {}", part.display(), e))
        })?;
        Ok(written)
    }
}

#[async_trait]
impl Storage for LocalStorage {
    async fn put_stream(
        &self,
        storage_key: &str,
        _content_type: &str,
        content_length: Option<u64>,
        reader: ByteReader,
        control: &TransferControl,
    ) -> StorageResult<String> {
        let path = self.key_to_path(storage_key)?;
        let part = Self::part_path(&path);
        self.ensure_parent_dir(&path).await?;

        let start = std::time::Instant::now();

        let written = match self.write_chunks(&part, reader, control).await {
            Ok(written) => written,
            Err(e) => {
                let _ = fs::remove_file(&part).await;
                tracing::warn!(
                    key = %storage_key,
                    error = %e,
                    duration_ms = start.elapsed().as_secs_f64() * 1000.0,
                    "Local storage upload aborted"
                );
                return Err(e);
            }
        };

        if let Some(expected) = content_length {
            if expected != written {
                let _ = fs::remove_file(&part).await;
                return Err(StorageError::UploadFailed(format!(
                    "Size mismatch for {}: expected {} bytes, wrote {}",
                    storage_key, expected, written
                )));
            }
        }

        // Last chance to honour a cancel that arrived during the final chunk.
        if let Err(e) = control.checkpoint().await {
            let _ = fs::remove_file(&part).await;
            return Err(e);
        }

        fs::rename(&part, &path).await.map_err(|e| {
            StorageError::UploadFailed(format!("Failed to finalize {}: {}", path.display(), e))
        })?;

        let url = self.public_url(storage_key);

        tracing::info!(
            path = %path.display(),
            key = %storage_key,
            size_bytes = written,
            duration_ms = start.elapsed().as_secs_f64() * 1000.0,
            "Local storage upload successful"
        );

        Ok(url)
    }

    async fn download(&self, storage_key: &str) -> StorageResult<Vec<u8>> {
        let path = self.key_to_path(storage_key)?;
        let start = std::time::Instant::now();

        if !fs::try_exists(&path).await.unwrap_or(false) {
            return Err(StorageError::NotFound(storage_key.to_string()));
        }

        let data = fs::read(&path).await.map_err(|e| {
            StorageError::DownloadFailed(format!("Failed to read file {}: {}", path.display(), e))
        })?;

        tracing::debug!(
            key = %storage_key,
            size_bytes = data.len(),
            duration_ms = start.elapsed().as_secs_f64() * 1000.0,
            "Local storage download successful"
        );

        Ok(data)
    }

    async fn delete(&self, storage_key: &str) -> StorageResult<()> {
        let path = self.key_to_path(storage_key)?;

        match fs::remove_file(&path).await {
            Ok(()) => {}
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
            Err(e) => {
                return Err(StorageError::DeleteFailed(format!(
                    "Failed to delete file {}: {}",
                    path.display(),
                    e
                )))
            }
        }

        tracing::info!(key = %storage_key, "Local storage delete successful");
        Ok(())
    }

    async fn exists(&self, storage_key: &str) -> StorageResult<bool> {
        let path = self.key_to_path(storage_key)?;
        Ok(fs::try_exists(&path).await.unwrap_or(false))
    }

    fn public_url(&self, storage_key: &str) -> String {
        format!("{}/{}", self.base_url.trim_end_matches('/'), storage_key)
    }

    fn backend_type(&self) -> StorageBackend {
        StorageBackend::Local
    }
}
