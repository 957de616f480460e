//! Data models for the publishing pipeline
//!
//! Organized by concern: transfer status, lessons, manifests, analytics
//! mutations and publish requests/results.

mod analytics;
mod lesson;
mod manifest;
mod publish;
mod transfer;

// Re-export all models for convenient imports
pub use analytics::*;
pub use lesson::*;
pub use manifest::*;
pub use publish::*;
pub use transfer::*;
