//! Shared key generation for storage backends.
//!
//! Destination keys are rendered from templates with the placeholders
//! `{parent}`, `{id}`, `{order}` and `{filename}`. Every rendered key goes
//! through [`validate_key`] before it reaches a backend.

use crate::traits::{StorageError, StorageResult};

const PLACEHOLDERS: [&str; 4] = ["parent", "id", "order", "filename"];

/// Reject keys that could escape the storage root or address nothing.
pub fn validate_key(key: &str) -> StorageResult<()> {
    if key.is_empty() {
        return Err(StorageError::InvalidKey("Storage key is empty".to_string()));
    }
    if key.starts_with('/') || key.contains('\\') {
        return Err(StorageError::InvalidKey(format!(
            "Storage key must be relative: {}",
            key
        )));
    }
    if key.split('/').any(|segment| segment == ".." || segment.is_empty()) {
        return Err(StorageError::InvalidKey(format!(
            "Storage key contains invalid segments: {}",
            key
        )));
    }
    Ok(())
}

/// Replace characters that are awkward in URLs with `-`.
pub fn sanitize_filename(name: &str) -> String {
    let cleaned: String = name
        .chars()
        .map(|c| {
            if c.is_ascii_alphanumeric() || matches!(c, '.' | '-' | '_') {
                c
            } else {
                '-'
            }
        })
        .collect();
    let cleaned = cleaned.trim_matches('.').to_string();
    if cleaned.is_empty() {
        "file".to_string()
    } else {
        cleaned
    }
}

/// Content type from the file extension, `application/octet-stream` when unknown.
pub fn content_type_for(filename: &str) -> &'static str {
    let ext = filename
        .rsplit_once('.')
        .map(|(_, ext)| ext.to_ascii_lowercase())
        .unwrap_or_default();
    match ext.as_str() {
        "jpg" | "jpeg" => "image/jpeg",
        "png" => "image/png",
        "webp" => "image/webp",
        "gif" => "image/gif",
        "svg" => "image/svg+xml",
        "mp4" => "video/mp4",
        "webm" => "video/webm",
        "mov" => "video/quicktime",
        "mkv" => "video/x-matroska",
        "mp3" => "audio/mpeg",
        "wav" => "audio/wav",
        "ogg" => "audio/ogg",
        "m4a" => "audio/mp4",
        "pdf" => "application/pdf",
        "epub" => "application/epub+zip",
        "txt" => "text/plain",
        "md" => "text/markdown",
        _ => "application/octet-stream",
    }
}

/// Values substituted into a [`PathTemplate`].
#[derive(Debug, Clone, Default)]
pub struct KeyVars<'a> {
    pub parent: Option<&'a str>,
    pub id: Option<&'a str>,
    pub order: Option<u32>,
    pub filename: Option<&'a str>,
}

impl<'a> KeyVars<'a> {
    pub fn new(parent: &'a str) -> Self {
        Self {
            parent: Some(parent),
            ..Self::default()
        }
    }

    pub fn id(mut self, id: &'a str) -> Self {
        self.id = Some(id);
        self
    }

    pub fn order(mut self, order: u32) -> Self {
        self.order = Some(order);
        self
    }

    pub fn filename(mut self, filename: &'a str) -> Self {
        self.filename = Some(filename);
        self
    }

    fn lookup(&self, name: &str) -> Option<String> {
        match name {
            "parent" => self.parent.map(String::from),
            "id" => self.id.map(String::from),
            "order" => self.order.map(|o| o.to_string()),
            "filename" => self.filename.map(sanitize_filename),
            _ => None,
        }
    }
}

/// Destination path template, e.g. `courses/{parent}/lessons/{order}-{id}/{filename}`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PathTemplate {
    template: String,
}

impl PathTemplate {
    pub const LESSON: &'static str = "courses/{parent}/lessons/{order}-{id}/{filename}";

    /// Parse a template, rejecting unknown placeholders and unbalanced braces.
    pub fn new(template: impl Into<String>) -> StorageResult<Self> {
        let template = template.into();
        for name in Self::placeholders(&template)? {
            if !PLACEHOLDERS.contains(&name) {
                return Err(StorageError::InvalidKey(format!(
                    "Unknown placeholder {{{}}} in template {}",
                    name, template
                )));
            }
        }
        if template.starts_with('/') || template.contains("..") {
            return Err(StorageError::InvalidKey(format!(
                "Template must be a relative path: {}",
                template
            )));
        }
        Ok(Self { template })
    }

    /// Template for a parent's single-file content under `prefix`.
    pub fn single(prefix: &str) -> StorageResult<Self> {
        Self::new(format!("{}/{{parent}}/{{filename}}", prefix.trim_matches('/')))
    }

    pub fn as_str(&self) -> &str {
        &self.template
    }

    /// Substitute `vars` and validate the resulting key.
    pub fn render(&self, vars: &KeyVars<'_>) -> StorageResult<String> {
        let mut out = String::with_capacity(self.template.len() + 32);
        let mut rest = self.template.as_str();
        while let Some(open) = rest.find('{') {
            out.push_str(&rest[..open]);
            let after = &rest[open + 1..];
            let close = after.find('}').ok_or_else(|| {
                StorageError::InvalidKey(format!("Unbalanced braces in {}", self.template))
            })?;
            let name = &after[..close];
            let value = vars.lookup(name).ok_or_else(|| {
                StorageError::InvalidKey(format!(
                    "No value for placeholder {{{}}} in {}",
                    name, self.template
                ))
            })?;
            if value.contains('/') || value == ".." || value.is_empty() {
                return Err(StorageError::InvalidKey(format!(
                    "Invalid value for {{{}}}: {:?}",
                    name, value
                )));
            }
            out.push_str(&value);
            rest = &after[close + 1..];
        }
        out.push_str(rest);
        validate_key(&out)?;
        Ok(out)
    }

    fn placeholders(template: &str) -> StorageResult<Vec<&str>> {
        let mut names = Vec::new();
        let mut rest = template;
        while let Some(open) = rest.find('{') {
            let after = &rest[open + 1..];
            let close = after.find('}').ok_or_else(|| {
                StorageError::InvalidKey(format!("Unbalanced braces in {}", template))
            })?;
            names.push(&after[..close]);
            rest = &after[close + 1..];
        }
        if rest.contains('}') {
            return Err(StorageError::InvalidKey(format!(
                "Unbalanced braces in {}",
                template
            )));
        }
        Ok(names)
    }
}
