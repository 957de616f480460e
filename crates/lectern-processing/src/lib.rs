//! Lectern Processing Library
//!
//! Asset preparation that runs before a transfer. Currently thumbnail
//! re-encoding: wide images are downscaled, every raster image is recompressed
//! as JPEG and anything else is passed through untouched.

pub mod thumbnail;

pub use thumbnail::{PreparedAsset, ProcessingError, ThumbnailEncoder};
