use serde::{Deserialize, Serialize};
use std::collections::HashSet;
use std::fmt::{Display, Formatter, Result as FmtResult};
use std::path::{Path, PathBuf};
use std::str::FromStr;

use crate::error::ValidationError;

/// Kind of lesson content
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LessonKind {
    Video,
    Document,
}

impl Display for LessonKind {
    fn fmt(&self, f: &mut Formatter<'_>) -> FmtResult {
        match self {
            LessonKind::Video => write!(f, "video"),
            LessonKind::Document => write!(f, "document"),
        }
    }
}

impl FromStr for LessonKind {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "video" => Ok(LessonKind::Video),
            "document" | "doc" => Ok(LessonKind::Document),
            _ => Err(anyhow::anyhow!("Invalid lesson kind: {}", s)),
        }
    }
}

/// One orderable unit of multi-part content.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LessonItem {
    pub id: String,
    pub order: u32,
    pub kind: LessonKind,
    pub source_file: PathBuf,
    pub title: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub duration_seconds: Option<f64>,
}

impl LessonItem {
    /// Create an item with a fresh id. Its order is assigned by the owning [`LessonList`].
    pub fn new(kind: LessonKind, source_file: impl Into<PathBuf>, title: impl Into<String>) -> Self {
        Self {
            id: uuid::Uuid::new_v4().to_string(),
            order: 0,
            kind,
            source_file: source_file.into(),
            title: title.into(),
            duration_seconds: None,
        }
    }

    pub fn with_id(mut self, id: impl Into<String>) -> Self {
        self.id = id.into();
        self
    }

    pub fn with_duration(mut self, seconds: f64) -> Self {
        self.duration_seconds = Some(seconds);
        self
    }

    /// File name of the source, used as the published filename.
    pub fn filename(&self) -> String {
        file_name_of(&self.source_file)
    }
}

/// Last path component as a string, or `"file"` when the path has none.
pub fn file_name_of(path: &Path) -> String {
    path.file_name()
        .map(|n| n.to_string_lossy().into_owned())
        .unwrap_or_else(|| "file".to_string())
}

/// Ordered lesson collection.
///
/// Every mutation renumbers `order` so it stays dense from 0.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct LessonList {
    items: Vec<LessonItem>,
}

impl LessonList {
    pub fn new() -> Self {
        Self::default()
    }

    /// Build a list from items in the given sequence.
    pub fn from_items(items: Vec<LessonItem>) -> Result<Self, ValidationError> {
        let mut list = Self::new();
        for item in items {
            list.push(item)?;
        }
        Ok(list)
    }

    pub fn items(&self) -> &[LessonItem] {
        &self.items
    }

    pub fn into_items(self) -> Vec<LessonItem> {
        self.items
    }

    pub fn len(&self) -> usize {
        self.items.len()
    }

    pub fn is_empty(&self) -> bool {
        self.items.is_empty()
    }

    pub fn push(&mut self, item: LessonItem) -> Result<(), ValidationError> {
        self.insert(self.items.len(), item)
    }

    pub fn insert(&mut self, index: usize, item: LessonItem) -> Result<(), ValidationError> {
        if index > self.items.len() {
            return Err(ValidationError::IndexOutOfBounds {
                index,
                len: self.items.len(),
            });
        }
        if self.items.iter().any(|existing| existing.id == item.id) {
            return Err(ValidationError::DuplicateLesson(item.id));
        }
        self.items.insert(index, item);
        self.renumber();
        Ok(())
    }

    pub fn remove(&mut self, id: &str) -> Result<LessonItem, ValidationError> {
        let index = self
            .items
            .iter()
            .position(|item| item.id == id)
            .ok_or_else(|| ValidationError::LessonNotFound(id.to_string()))?;
        let removed = self.items.remove(index);
        self.renumber();
        Ok(removed)
    }

    /// Move the item at `from` so that it ends up at position `to`.
    pub fn move_item(&mut self, from: usize, to: usize) -> Result<(), ValidationError> {
        let len = self.items.len();
        for index in [from, to] {
            if index >= len {
                return Err(ValidationError::IndexOutOfBounds { index, len });
            }
        }
        let item = self.items.remove(from);
        self.items.insert(to, item);
        self.renumber();
        Ok(())
    }

    /// Check the invariants a batch upload relies on.
    pub fn validate(&self) -> Result<(), ValidationError> {
        if self.items.is_empty() {
            return Err(ValidationError::EmptyLessons);
        }
        let mut seen = HashSet::new();
        for (expected, item) in self.items.iter().enumerate() {
            if !seen.insert(item.id.as_str()) {
                return Err(ValidationError::DuplicateLesson(item.id.clone()));
            }
            if item.order != expected as u32 {
                return Err(ValidationError::NonContiguousOrder {
                    id: item.id.clone(),
                    expected: expected as u32,
                    found: item.order,
                });
            }
            if item.title.trim().is_empty() {
                return Err(ValidationError::MissingField("lesson title"));
            }
        }
        Ok(())
    }

    fn renumber(&mut self) {
        for (order, item) in self.items.iter_mut().enumerate() {
            item.order = order as u32;
        }
    }
}
