//! Configuration module
//!
//! Configuration for storage, the document store, retry policy, fan-out
//! batching and thumbnail preprocessing, loaded from environment variables.

use std::env;
use std::str::FromStr;
use std::time::Duration;

use crate::storage_types::StorageBackend;

// Common constants
const UPLOAD_MAX_ATTEMPTS: u32 = 3;
const UPLOAD_RETRY_DELAY_MS: u64 = 2000;
const UPLOAD_RETRY_MAX_DELAY_MS: u64 = 30_000;
const UPLOAD_CHUNK_SIZE_KB: usize = 256;
const S3_PART_SIZE_MB: usize = 8;
const S3_MIN_PART_SIZE_MB: usize = 5;
const FANOUT_MAX_BATCH_OPS: usize = 500;
const DB_MAX_CONNECTIONS: u32 = 10;
const DB_TIMEOUT_SECS: u64 = 30;
const THUMBNAIL_MAX_WIDTH: u32 = 1280;
const THUMBNAIL_QUALITY: u8 = 80;

/// Log output format for binaries
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LogFormat {
    Pretty,
    Json,
}

impl FromStr for LogFormat {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "pretty" | "text" => Ok(LogFormat::Pretty),
            "json" => Ok(LogFormat::Json),
            _ => Err(anyhow::anyhow!("Invalid log format: {}", s)),
        }
    }
}

/// Inter-attempt delay growth
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RetryBackoff {
    Fixed,
    Exponential,
}

impl FromStr for RetryBackoff {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "fixed" => Ok(RetryBackoff::Fixed),
            "exponential" => Ok(RetryBackoff::Exponential),
            _ => Err(anyhow::anyhow!("Invalid retry backoff: {}", s)),
        }
    }
}

#[derive(Clone, Debug)]
pub struct StorageSettings {
    pub backend: StorageBackend,
    pub s3_bucket: Option<String>,
    pub s3_region: Option<String>,
    pub s3_endpoint: Option<String>, // Custom endpoint for S3-compatible providers (MinIO, etc.)
    pub aws_region: Option<String>,
    pub local_storage_path: Option<String>,
    pub local_storage_base_url: Option<String>,
    pub chunk_size_bytes: usize,
    pub s3_part_size_bytes: usize,
}

#[derive(Clone, Debug)]
pub struct DatabaseSettings {
    /// PostgreSQL URL; the in-memory document store is used when absent.
    pub url: Option<String>,
    pub max_connections: u32,
    pub timeout_seconds: u64,
}

#[derive(Clone, Debug)]
pub struct RetrySettings {
    pub max_attempts: u32,
    pub delay: Duration,
    pub backoff: RetryBackoff,
    pub max_delay: Duration,
}

impl Default for RetrySettings {
    fn default() -> Self {
        Self {
            max_attempts: UPLOAD_MAX_ATTEMPTS,
            delay: Duration::from_millis(UPLOAD_RETRY_DELAY_MS),
            backoff: RetryBackoff::Fixed,
            max_delay: Duration::from_millis(UPLOAD_RETRY_MAX_DELAY_MS),
        }
    }
}

#[derive(Clone, Debug)]
pub struct FanOutSettings {
    pub max_batch_ops: usize,
    pub analytics_collection: String,
    pub timestamp_field: String,
}

impl Default for FanOutSettings {
    fn default() -> Self {
        Self {
            max_batch_ops: FANOUT_MAX_BATCH_OPS,
            analytics_collection: "analytics".to_string(),
            timestamp_field: "updated_at".to_string(),
        }
    }
}

#[derive(Clone, Debug)]
pub struct ThumbnailSettings {
    pub max_width: u32,
    pub quality: u8,
}

impl Default for ThumbnailSettings {
    fn default() -> Self {
        Self {
            max_width: THUMBNAIL_MAX_WIDTH,
            quality: THUMBNAIL_QUALITY,
        }
    }
}

/// Application configuration.
#[derive(Clone, Debug)]
pub struct Config {
    pub environment: String,
    pub log_format: LogFormat,
    pub storage: StorageSettings,
    pub database: DatabaseSettings,
    pub retry: RetrySettings,
    pub fan_out: FanOutSettings,
    pub thumbnail: ThumbnailSettings,
    pub lesson_catalog_collection: String,
}

impl Config {
    /// Load from the process environment (and `.env` when present).
    pub fn from_env() -> Result<Self, anyhow::Error> {
        dotenvy::dotenv().ok();
        Self::from_lookup(|key| env::var(key).ok())
    }

    /// Load from an arbitrary key lookup. Used by `from_env` and by tests.
    pub fn from_lookup<F>(lookup: F) -> Result<Self, anyhow::Error>
    where
        F: Fn(&str) -> Option<String>,
    {
        let var = |key: &str| lookup(key).filter(|v| !v.trim().is_empty());

        let environment = var("ENVIRONMENT")
            .or_else(|| var("APP_ENV"))
            .unwrap_or_else(|| "development".to_string());

        let log_format = match var("LOG_FORMAT") {
            Some(s) => s.parse()?,
            None => LogFormat::Pretty,
        };

        let backend = match var("STORAGE_BACKEND") {
            Some(s) => s.parse()?,
            None => StorageBackend::Local,
        };

        let storage = StorageSettings {
            backend,
            s3_bucket: var("S3_BUCKET"),
            s3_region: var("S3_REGION"),
            s3_endpoint: var("S3_ENDPOINT"),
            aws_region: var("AWS_REGION"),
            local_storage_path: var("LOCAL_STORAGE_PATH"),
            local_storage_base_url: var("LOCAL_STORAGE_BASE_URL"),
            chunk_size_bytes: parse_or(var("UPLOAD_CHUNK_SIZE_KB"), UPLOAD_CHUNK_SIZE_KB)? * 1024,
            s3_part_size_bytes: parse_or(var("S3_PART_SIZE_MB"), S3_PART_SIZE_MB)? * 1024 * 1024,
        };

        let database = DatabaseSettings {
            url: var("DATABASE_URL"),
            max_connections: parse_or(var("DB_MAX_CONNECTIONS"), DB_MAX_CONNECTIONS)?,
            timeout_seconds: parse_or(var("DB_TIMEOUT_SECONDS"), DB_TIMEOUT_SECS)?,
        };

        let retry = RetrySettings {
            max_attempts: parse_or(var("UPLOAD_MAX_ATTEMPTS"), UPLOAD_MAX_ATTEMPTS)?,
            delay: Duration::from_millis(parse_or(
                var("UPLOAD_RETRY_DELAY_MS"),
                UPLOAD_RETRY_DELAY_MS,
            )?),
            backoff: match var("UPLOAD_RETRY_BACKOFF") {
                Some(s) => s.parse()?,
                None => RetryBackoff::Fixed,
            },
            max_delay: Duration::from_millis(parse_or(
                var("UPLOAD_RETRY_MAX_DELAY_MS"),
                UPLOAD_RETRY_MAX_DELAY_MS,
            )?),
        };

        let fan_out = FanOutSettings {
            max_batch_ops: parse_or(var("FANOUT_MAX_BATCH_OPS"), FANOUT_MAX_BATCH_OPS)?,
            analytics_collection: var("ANALYTICS_COLLECTION")
                .unwrap_or_else(|| "analytics".to_string()),
            timestamp_field: var("ANALYTICS_TIMESTAMP_FIELD")
                .unwrap_or_else(|| "updated_at".to_string()),
        };

        let thumbnail = ThumbnailSettings {
            max_width: parse_or(var("THUMBNAIL_MAX_WIDTH"), THUMBNAIL_MAX_WIDTH)?,
            quality: parse_or(var("THUMBNAIL_QUALITY"), THUMBNAIL_QUALITY)?,
        };

        let config = Config {
            environment,
            log_format,
            storage,
            database,
            retry,
            fan_out,
            thumbnail,
            lesson_catalog_collection: var("LESSON_CATALOG_COLLECTION")
                .unwrap_or_else(|| "lessons".to_string()),
        };

        config.validate()?;
        Ok(config)
    }

    /// Check if the application is running in production mode
    pub fn is_production(&self) -> bool {
        matches!(
            self.environment.to_lowercase().as_str(),
            "production" | "prod"
        )
    }

    pub fn validate(&self) -> Result<(), anyhow::Error> {
        if self.retry.max_attempts == 0 {
            return Err(anyhow::anyhow!("UPLOAD_MAX_ATTEMPTS must be at least 1"));
        }

        if self.fan_out.max_batch_ops == 0 {
            return Err(anyhow::anyhow!("FANOUT_MAX_BATCH_OPS must be at least 1"));
        }

        if self.storage.chunk_size_bytes == 0 {
            return Err(anyhow::anyhow!("UPLOAD_CHUNK_SIZE_KB must be at least 1"));
        }

        if self.storage.s3_part_size_bytes < S3_MIN_PART_SIZE_MB * 1024 * 1024 {
            return Err(anyhow::anyhow!(
                "S3_PART_SIZE_MB must be at least {}",
                S3_MIN_PART_SIZE_MB
            ));
        }

        if !(1..=100).contains(&self.thumbnail.quality) {
            return Err(anyhow::anyhow!("THUMBNAIL_QUALITY must be between 1 and 100"));
        }

        if self.thumbnail.max_width == 0 {
            return Err(anyhow::anyhow!("THUMBNAIL_MAX_WIDTH must be at least 1"));
        }

        if let Some(url) = &self.database.url {
            if !url.starts_with("postgres://") && !url.starts_with("postgresql://") {
                return Err(anyhow::anyhow!(
                    "DATABASE_URL must be a valid PostgreSQL connection string"
                ));
            }
        }

        // Validate storage backend configuration
        match self.storage.backend {
            StorageBackend::S3 => {
                if self.storage.s3_bucket.is_none() {
                    return Err(anyhow::anyhow!(
                        "S3_BUCKET must be set when using S3 storage backend"
                    ));
                }
                if self.storage.s3_region.is_none() && self.storage.aws_region.is_none() {
                    return Err(anyhow::anyhow!(
                        "S3_REGION or AWS_REGION must be set when using S3 storage backend"
                    ));
                }
            }
            StorageBackend::Local => {
                if self.storage.local_storage_path.is_none() {
                    return Err(anyhow::anyhow!(
                        "LOCAL_STORAGE_PATH must be set when using local storage backend"
                    ));
                }
                if self.storage.local_storage_base_url.is_none() {
                    return Err(anyhow::anyhow!(
                        "LOCAL_STORAGE_BASE_URL must be set when using local storage backend"
                    ));
                }
            }
        }

        Ok(())
    }
}

fn parse_or<T>(value: Option<String>, default: T) -> Result<T, anyhow::Error>
where
    T: FromStr,
    T::Err: std::fmt::Display,
{
    match value {
        Some(raw) => raw
            .trim()
            .parse()
            .map_err(|e| anyhow::anyhow!("Invalid numeric value '{}': {}", raw, e)),
        None => Ok(default),
    }
}
