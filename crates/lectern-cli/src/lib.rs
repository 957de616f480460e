//! Request building and output helpers for the `lectern` binary.

use anyhow::{bail, Context};
use clap::Args;
use lectern_core::models::{
    ContentCategory, LessonItem, LessonKind, LessonList, PersistenceStrategy, PublishContent,
    PublishRequest, PublishStatus, TransferState,
};
use lectern_core::LogFormat;
use std::path::PathBuf;

/// Flags of `lectern publish`.
#[derive(Debug, Clone, Args)]
pub struct PublishArgs {
    #[arg(long)]
    pub title: String,
    #[arg(long)]
    pub description: String,
    /// video, audio, ebook or course
    #[arg(long)]
    pub category: ContentCategory,
    /// Distribution tier id, repeatable
    #[arg(long = "tier", required = true)]
    pub tiers: Vec<String>,
    /// per_tier or tier_list; defaults by category
    #[arg(long)]
    pub strategy: Option<PersistenceStrategy>,
    #[arg(long)]
    pub thumbnail: Option<PathBuf>,
    /// Content file for single-file categories
    #[arg(long, conflicts_with = "lessons")]
    pub file: Option<PathBuf>,
    /// Course lesson as kind:path[:title[:duration_seconds]], repeatable, in order
    #[arg(long = "lesson")]
    pub lessons: Vec<String>,
    /// Identifier to group paths and records under; generated when absent
    #[arg(long)]
    pub parent_id: Option<String>,
    /// Keep records in memory instead of the configured database
    #[arg(long)]
    pub dry_run: bool,
}

impl PublishArgs {
    pub fn to_request(&self) -> anyhow::Result<PublishRequest> {
        let content = match (&self.file, self.lessons.is_empty()) {
            (Some(file), true) => PublishContent::Single { file: file.clone() },
            (None, false) => {
                let items = self
                    .lessons
                    .iter()
                    .map(|spec| parse_lesson_spec(spec))
                    .collect::<anyhow::Result<Vec<_>>>()?;
                PublishContent::Lessons {
                    lessons: LessonList::from_items(items)?,
                }
            }
            (None, true) => bail!("Either --file or at least one --lesson is required"),
            (Some(_), false) => bail!("--file and --lesson cannot be combined"),
        };

        let mut request = PublishRequest::new(
            self.title.clone(),
            self.description.clone(),
            self.category,
            content,
        );
        for tier in &self.tiers {
            request = request.with_tier(tier.clone());
        }
        if let Some(strategy) = self.strategy {
            request = request.with_strategy(strategy);
        }
        if let Some(thumbnail) = &self.thumbnail {
            request = request.with_thumbnail(thumbnail.clone());
        }
        if let Some(parent_id) = &self.parent_id {
            request = request.with_parent_id(parent_id.clone());
        }
        Ok(request)
    }
}

/// Parse `kind:path[:title[:duration_seconds]]`. The title defaults to the file stem.
pub fn parse_lesson_spec(spec: &str) -> anyhow::Result<LessonItem> {
    let mut parts = spec.splitn(4, ':');
    let kind: LessonKind = parts
        .next()
        .filter(|s| !s.is_empty())
        .context("Lesson spec is missing its kind")?
        .parse()?;
    let path = PathBuf::from(
        parts
            .next()
            .filter(|s| !s.is_empty())
            .with_context(|| format!("Lesson spec {:?} is missing a path", spec))?,
    );
    let title = match parts.next().filter(|s| !s.is_empty()) {
        Some(title) => title.to_string(),
        None => path
            .file_stem()
            .map(|s| s.to_string_lossy().into_owned())
            .with_context(|| format!("Lesson spec {:?} has no usable title", spec))?,
    };

    let mut item = LessonItem::new(kind, path, title);
    if let Some(duration) = parts.next() {
        let seconds: f64 = duration
            .parse()
            .with_context(|| format!("Invalid lesson duration {:?}", duration))?;
        item = item.with_duration(seconds);
    }
    Ok(item)
}

/// One-line rendering of a publish status for the terminal.
pub fn format_status(status: &PublishStatus) -> String {
    let mut line = format!("[{}]", status.stage);
    if status.transfer.state != TransferState::Idle {
        line.push_str(&format!(
            " {} {:.1}%",
            status.transfer.state, status.transfer.progress_pct
        ));
    }
    if let Some(batch) = &status.batch {
        line.push_str(&format!(
            " item {}/{}",
            (batch.completed_items + 1).min(batch.total_items),
            batch.total_items
        ));
        if batch.current_attempt > 1 {
            line.push_str(&format!(" attempt {}", batch.current_attempt));
        }
    }
    match &status.failure {
        Some(failure) => line.push_str(&format!(" {}: {}", failure.error_code, failure.message)),
        None => {
            if let Some(message) = &status.transfer.error_message {
                line.push_str(&format!(" ({})", message));
            }
        }
    }
    line
}

/// Initialize tracing for the CLI binary.
pub fn init_tracing(format: LogFormat) {
    let filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info"));
    let builder = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr);
    match format {
        LogFormat::Json => builder.json().init(),
        LogFormat::Pretty => builder.init(),
    }
}
