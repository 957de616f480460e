use serde::{Deserialize, Serialize};

use super::lesson::LessonKind;

/// Durable result of one published lesson.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PublishManifestEntry {
    pub id: String,
    pub order: u32,
    pub kind: LessonKind,
    pub title: String,
    pub url: String,
    pub filename: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub duration_seconds: Option<f64>,
    /// Storage key the object was written under, used to reconcile orphaned assets.
    pub storage_key: String,
}
