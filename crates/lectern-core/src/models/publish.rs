use serde::{Deserialize, Serialize};
use serde_json::{Map, Value as JsonValue};
use std::collections::HashSet;
use std::fmt::{Display, Formatter, Result as FmtResult};
use std::path::PathBuf;
use std::str::FromStr;

use super::lesson::LessonList;
use super::manifest::PublishManifestEntry;
use super::transfer::TransferStatus;
use crate::error::ValidationError;

/// Content category of a publish request
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ContentCategory {
    Video,
    Audio,
    Ebook,
    Course,
}

impl ContentCategory {
    pub fn as_str(self) -> &'static str {
        match self {
            ContentCategory::Video => "video",
            ContentCategory::Audio => "audio",
            ContentCategory::Ebook => "ebook",
            ContentCategory::Course => "course",
        }
    }

    /// Document collection holding records of this category.
    pub fn collection(self) -> &'static str {
        match self {
            ContentCategory::Video => "videos",
            ContentCategory::Audio => "audios",
            ContentCategory::Ebook => "ebooks",
            ContentCategory::Course => "courses",
        }
    }

    /// Analytics counter incremented on every publish of this category.
    pub fn analytics_field(self) -> &'static str {
        match self {
            ContentCategory::Video => "videos_published",
            ContentCategory::Audio => "audios_published",
            ContentCategory::Ebook => "ebooks_published",
            ContentCategory::Course => "courses_published",
        }
    }

    /// Courses are ordered multi-item content; everything else is a single file.
    pub fn is_multi_item(self) -> bool {
        matches!(self, ContentCategory::Course)
    }

    pub fn default_strategy(self) -> PersistenceStrategy {
        match self {
            ContentCategory::Course => PersistenceStrategy::TierList,
            _ => PersistenceStrategy::PerTier,
        }
    }
}

impl Display for ContentCategory {
    fn fmt(&self, f: &mut Formatter<'_>) -> FmtResult {
        f.write_str(self.as_str())
    }
}

impl FromStr for ContentCategory {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "video" => Ok(ContentCategory::Video),
            "audio" | "music" => Ok(ContentCategory::Audio),
            "ebook" => Ok(ContentCategory::Ebook),
            "course" => Ok(ContentCategory::Course),
            _ => Err(anyhow::anyhow!("Invalid content category: {}", s)),
        }
    }
}

/// Distribution tier selected by the caller.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct DistributionTier(pub String);

impl DistributionTier {
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl Display for DistributionTier {
    fn fmt(&self, f: &mut Formatter<'_>) -> FmtResult {
        f.write_str(&self.0)
    }
}

/// How metadata records are laid out for the selected tiers.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PersistenceStrategy {
    /// One record per selected tier.
    PerTier,
    /// A single record carrying the full tier list.
    TierList,
}

impl Display for PersistenceStrategy {
    fn fmt(&self, f: &mut Formatter<'_>) -> FmtResult {
        match self {
            PersistenceStrategy::PerTier => write!(f, "per_tier"),
            PersistenceStrategy::TierList => write!(f, "tier_list"),
        }
    }
}

impl FromStr for PersistenceStrategy {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().replace('-', "_").as_str() {
            "per_tier" => Ok(PersistenceStrategy::PerTier),
            "tier_list" => Ok(PersistenceStrategy::TierList),
            _ => Err(anyhow::anyhow!("Invalid persistence strategy: {}", s)),
        }
    }
}

/// Primary content of a publish request.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "shape", rename_all = "lowercase")]
pub enum PublishContent {
    Single { file: PathBuf },
    Lessons { lessons: LessonList },
}

/// Validated input handed over by the caller boundary.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PublishRequest {
    /// Identifier the storage paths and records are grouped under; generated when absent.
    pub parent_id: Option<String>,
    pub title: String,
    pub description: String,
    pub category: ContentCategory,
    pub tiers: Vec<DistributionTier>,
    pub strategy: PersistenceStrategy,
    pub thumbnail: Option<PathBuf>,
    pub content: PublishContent,
    /// Category-specific fields copied verbatim into every record.
    #[serde(default)]
    pub extra: Map<String, JsonValue>,
}

impl PublishRequest {
    pub fn new(
        title: impl Into<String>,
        description: impl Into<String>,
        category: ContentCategory,
        content: PublishContent,
    ) -> Self {
        Self {
            parent_id: None,
            title: title.into(),
            description: description.into(),
            category,
            tiers: Vec::new(),
            strategy: category.default_strategy(),
            thumbnail: None,
            content,
            extra: Map::new(),
        }
    }

    pub fn with_tier(mut self, tier: impl Into<String>) -> Self {
        self.tiers.push(DistributionTier::new(tier));
        self
    }

    pub fn with_thumbnail(mut self, path: impl Into<PathBuf>) -> Self {
        self.thumbnail = Some(path.into());
        self
    }

    pub fn with_strategy(mut self, strategy: PersistenceStrategy) -> Self {
        self.strategy = strategy;
        self
    }

    pub fn with_parent_id(mut self, parent_id: impl Into<String>) -> Self {
        self.parent_id = Some(parent_id.into());
        self
    }

    pub fn validate(&self) -> Result<(), ValidationError> {
        if self.title.trim().is_empty() {
            return Err(ValidationError::MissingField("title"));
        }
        if self.description.trim().is_empty() {
            return Err(ValidationError::MissingField("description"));
        }
        if self.tiers.is_empty() {
            return Err(ValidationError::NoTiers);
        }
        let mut seen = HashSet::new();
        for tier in &self.tiers {
            if tier.as_str().trim().is_empty() {
                return Err(ValidationError::MissingField("tier"));
            }
            if !seen.insert(tier.as_str()) {
                return Err(ValidationError::DuplicateTier(tier.0.clone()));
            }
        }
        match (&self.content, self.category.is_multi_item()) {
            (PublishContent::Single { file }, false) => {
                if file.as_os_str().is_empty() {
                    return Err(ValidationError::MissingField("file"));
                }
            }
            (PublishContent::Lessons { lessons }, true) => lessons.validate()?,
            _ => {
                return Err(ValidationError::ContentShapeMismatch(
                    self.category.to_string(),
                ))
            }
        }
        if let Some(parent_id) = &self.parent_id {
            if parent_id.is_empty() || parent_id.contains('/') || parent_id.contains("..") {
                return Err(ValidationError::InvalidValue {
                    field: "parent_id",
                    reason: "must be a single non-empty path segment".to_string(),
                });
            }
        }
        Ok(())
    }
}

/// Workflow stage reported to the caller.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum PublishStage {
    #[default]
    Idle,
    Validating,
    TransferringThumbnail,
    TransferringContent,
    Persisting,
    UpdatingAnalytics,
    Succeeded,
    Failed,
}

impl PublishStage {
    pub fn is_terminal(self) -> bool {
        matches!(self, PublishStage::Succeeded | PublishStage::Failed)
    }

    /// Stages before any record is written.
    pub fn is_cancellable(self) -> bool {
        matches!(
            self,
            PublishStage::Idle
                | PublishStage::Validating
                | PublishStage::TransferringThumbnail
                | PublishStage::TransferringContent
        )
    }
}

impl Display for PublishStage {
    fn fmt(&self, f: &mut Formatter<'_>) -> FmtResult {
        let name = match self {
            PublishStage::Idle => "idle",
            PublishStage::Validating => "validating",
            PublishStage::TransferringThumbnail => "transferring_thumbnail",
            PublishStage::TransferringContent => "transferring_content",
            PublishStage::Persisting => "persisting",
            PublishStage::UpdatingAnalytics => "updating_analytics",
            PublishStage::Succeeded => "succeeded",
            PublishStage::Failed => "failed",
        };
        f.write_str(name)
    }
}

/// Per-item view of a running batch upload.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, Default)]
pub struct BatchProgress {
    pub completed_items: usize,
    pub total_items: usize,
    pub current_index: Option<usize>,
    pub current_attempt: u32,
    /// Live status of the item currently in flight.
    pub current: TransferStatus,
}

impl BatchProgress {
    pub fn new(total_items: usize) -> Self {
        Self {
            total_items,
            ..Self::default()
        }
    }

    /// Aggregate progress with per-item granularity.
    pub fn percent(&self) -> f64 {
        if self.total_items == 0 {
            return 0.0;
        }
        self.completed_items as f64 / self.total_items as f64 * 100.0
    }
}

/// The single status object a caller observes during a publish.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, Default)]
pub struct PublishStatus {
    pub stage: PublishStage,
    pub transfer: TransferStatus,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub batch: Option<BatchProgress>,
    /// Set when the run ends in `Failed`, independent of the transfer state.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub failure: Option<PublishFailure>,
}

/// Why a publish run failed, as shown to the caller.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PublishFailure {
    pub error_code: String,
    pub message: String,
}

/// Published primary content.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "shape", rename_all = "lowercase")]
pub enum PublishedContent {
    Single {
        url: String,
        filename: String,
        storage_key: String,
    },
    Manifest {
        entries: Vec<PublishManifestEntry>,
    },
}

/// Success side of a publish result.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PublishReceipt {
    pub parent_id: String,
    pub record_ids: Vec<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub thumbnail_url: Option<String>,
    pub content: PublishedContent,
}
