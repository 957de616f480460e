//! Thumbnail preprocessing

use bytes::Bytes;
use image::codecs::jpeg::JpegEncoder;
use image::imageops::FilterType;
use image::{DynamicImage, GenericImageView, ImageFormat, ImageReader};
use lectern_core::ThumbnailSettings;
use std::io::Cursor;
use std::path::Path;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum ProcessingError {
    #[error("Failed to read asset: {0}")]
    Io(#[from] std::io::Error),

    #[error("Failed to encode image: {0}")]
    Encode(#[from] image::ImageError),

    #[error("Processing task failed: {0}")]
    Task(String),
}

/// Bytes ready to hand to a transfer.
#[derive(Debug, Clone)]
pub struct PreparedAsset {
    pub data: Bytes,
    pub filename: String,
    pub content_type: String,
    /// Output dimensions, `None` for pass-through assets.
    pub dimensions: Option<(u32, u32)>,
    pub reencoded: bool,
}

/// Resizes to a maximum width and recompresses as JPEG.
#[derive(Debug, Clone, Copy)]
pub struct ThumbnailEncoder {
    max_width: u32,
    quality: u8,
}

impl ThumbnailEncoder {
    pub fn new(max_width: u32, quality: u8) -> Self {
        Self {
            max_width: max_width.max(1),
            quality: quality.clamp(1, 100),
        }
    }

    pub fn from_settings(settings: &ThumbnailSettings) -> Self {
        Self::new(settings.max_width, settings.quality)
    }

    /// Read `path` and prepare it on the blocking pool.
    pub async fn prepare_file(&self, path: &Path) -> Result<PreparedAsset, ProcessingError> {
        let data = tokio::fs::read(path).await?;
        let filename = path
            .file_name()
            .map(|n| n.to_string_lossy().into_owned())
            .unwrap_or_else(|| "thumbnail".to_string());

        let encoder = *self;
        // Image decode is CPU-bound; run off the async pool.
        tokio::task::spawn_blocking(move || encoder.prepare(data, &filename))
            .await
            .map_err(|e| ProcessingError::Task(e.to_string()))?
    }

    /// Re-encode a raster image, or return the input unchanged when it is not one.
    ///
    /// GIF is passed through so animations survive.
    pub fn prepare(&self, data: Vec<u8>, filename: &str) -> Result<PreparedAsset, ProcessingError> {
        let Some(img) = Self::decode_raster(&data)? else {
            tracing::debug!(filename = %filename, "Thumbnail is not a raster image, passing through");
            return Ok(Self::pass_through(data, filename));
        };

        let (width, height) = img.dimensions();
        let img = if width > self.max_width {
            let target_height = scaled_height(width, height, self.max_width);
            img.resize_exact(self.max_width, target_height, FilterType::Lanczos3)
        } else {
            img
        };

        let mut buffer = Vec::new();
        let encoder = JpegEncoder::new_with_quality(Cursor::new(&mut buffer), self.quality);
        DynamicImage::ImageRgb8(img.to_rgb8()).write_with_encoder(encoder)?;

        let dimensions = img.dimensions();
        tracing::debug!(
            filename = %filename,
            original_width = width,
            width = dimensions.0,
            height = dimensions.1,
            size_bytes = buffer.len(),
            "Thumbnail re-encoded"
        );

        Ok(PreparedAsset {
            data: Bytes::from(buffer),
            filename: jpeg_filename(filename),
            content_type: "image/jpeg".to_string(),
            dimensions: Some(dimensions),
            reencoded: true,
        })
    }

    /// `None` for unrecognised formats and GIF. A recognised format that
    /// fails to decode is an error, not a pass-through.
    fn decode_raster(data: &[u8]) -> Result<Option<DynamicImage>, ProcessingError> {
        let reader = ImageReader::new(Cursor::new(data)).with_guessed_format()?;
        match reader.format() {
            None | Some(ImageFormat::Gif) => Ok(None),
            Some(_) => Ok(Some(reader.decode()?)),
        }
    }

    fn pass_through(data: Vec<u8>, filename: &str) -> PreparedAsset {
        PreparedAsset {
            content_type: content_type_of(filename).to_string(),
            data: Bytes::from(data),
            filename: filename.to_string(),
            dimensions: None,
            reencoded: false,
        }
    }
}

fn scaled_height(width: u32, height: u32, target_width: u32) -> u32 {
    let scaled = (height as u64 * target_width as u64 + width as u64 / 2) / width as u64;
    (scaled as u32).max(1)
}

fn jpeg_filename(filename: &str) -> String {
    let stem = Path::new(filename)
        .file_stem()
        .map(|s| s.to_string_lossy().into_owned())
        .filter(|s| !s.is_empty())
        .unwrap_or_else(|| "thumbnail".to_string());
    format!("{}.jpg", stem)
}

fn content_type_of(filename: &str) -> &'static str {
    match Path::new(filename)
        .extension()
        .map(|e| e.to_string_lossy().to_ascii_lowercase())
        .as_deref()
    {
        Some("gif") => "image/gif",
        Some("svg") => "image/svg+xml",
        Some("png") => "image/png",
        Some("jpg") | Some("jpeg") => "image/jpeg",
        Some("webp") => "image/webp",
        _ => "application/octet-stream",
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use image::{Rgba, RgbaImage};

    fn png(width: u32, height: u32) -> Vec<u8> {
        let img = RgbaImage::from_pixel(width, height, Rgba([10, 120, 200, 255]));
        let mut buffer = Vec::new();
        img.write_to(&mut Cursor::new(&mut buffer), ImageFormat::Png)
            .unwrap();
        buffer
    }

    fn decoded_dimensions(data: &[u8]) -> (u32, u32) {
        ImageReader::new(Cursor::new(data))
            .with_guessed_format()
            .unwrap()
            .decode()
            .unwrap()
            .dimensions()
    }

    #[test]
    fn test_wide_image_is_downscaled_keeping_aspect_ratio() {
        let encoder = ThumbnailEncoder::new(100, 80);
        let asset = encoder.prepare(png(400, 200), "cover.png").unwrap();

        assert!(asset.reencoded);
        assert_eq!(asset.content_type, "image/jpeg");
        assert_eq!(asset.filename, "cover.jpg");
        assert_eq!(asset.dimensions, Some((100, 50)));
        assert_eq!(decoded_dimensions(&asset.data), (100, 50));
        assert_eq!(image::guess_format(&asset.data).unwrap(), ImageFormat::Jpeg);
    }

    #[test]
    fn test_narrow_image_keeps_dimensions() {
        let encoder = ThumbnailEncoder::new(1280, 80);
        let asset = encoder.prepare(png(64, 48), "small.png").unwrap();
        assert!(asset.reencoded);
        assert_eq!(decoded_dimensions(&asset.data), (64, 48));
    }

    #[test]
    fn test_non_image_passes_through_unchanged() {
        let encoder = ThumbnailEncoder::new(100, 80);
        let svg = b"<svg xmlns=\"http://www.w3.org/2000/svg\"/>".to_vec();
        let asset = encoder.prepare(svg.clone(), "logo.svg").unwrap();

        assert!(!asset.reencoded);
        assert_eq!(asset.data.as_ref(), svg.as_slice());
        assert_eq!(asset.filename, "logo.svg");
        assert_eq!(asset.content_type, "image/svg+xml");
        assert_eq!(asset.dimensions, None);
    }

    #[test]
    fn test_truncated_image_is_an_error() {
        let encoder = ThumbnailEncoder::new(100, 80);
        let mut data = png(64, 64);
        data.truncate(40);

        let err = encoder.prepare(data, "broken.png").unwrap_err();
        assert!(matches!(err, ProcessingError::Encode(_)));
    }

    #[test]
    fn test_scaled_height_never_zero() {
        assert_eq!(scaled_height(10_000, 1, 100), 1);
        assert_eq!(scaled_height(300, 200, 150), 100);
    }

    #[tokio::test]
    async fn test_prepare_file_reads_from_disk() {
        let dir = tempfile::TempDir::new().unwrap();
        let path = dir.path().join("thumb.png");
        tokio::fs::write(&path, png(300, 300)).await.unwrap();

        let asset = ThumbnailEncoder::new(150, 70)
            .prepare_file(&path)
            .await
            .unwrap();
        assert_eq!(asset.dimensions, Some((150, 150)));
        assert_eq!(asset.filename, "thumb.jpg");
    }
}
