//! Error types module
//!
//! Shared error vocabulary for the pipeline. Backend crates define their own
//! `thiserror` enums; every error that reaches a caller also implements
//! [`ErrorMetadata`] so callers can log and present it uniformly.

/// Log level for error reporting
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LogLevel {
    /// Debug level - for expected errors like validation failures
    Debug,
    /// Warning level - for recoverable or non-fatal issues
    Warn,
    /// Error level - for unexpected failures
    Error,
}

/// Metadata describing how an error should be reported to a caller.
pub trait ErrorMetadata {
    /// Machine-readable error code (e.g., "TRANSFER_ERROR")
    fn error_code(&self) -> &'static str;

    /// Whether retrying the same operation may succeed
    fn is_recoverable(&self) -> bool;

    /// Suggested action for the caller
    fn suggested_action(&self) -> Option<&'static str>;

    /// Caller-facing message (may differ from the internal error message)
    fn client_message(&self) -> String;

    /// Log level for this error
    fn log_level(&self) -> LogLevel;
}

/// Bad input detected before any side effect took place.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum ValidationError {
    #[error("Missing required field: {0}")]
    MissingField(&'static str),

    #[error("At least one distribution tier must be selected")]
    NoTiers,

    #[error("Duplicate tier: {0}")]
    DuplicateTier(String),

    #[error("Lesson list is empty")]
    EmptyLessons,

    #[error("Duplicate lesson id: {0}")]
    DuplicateLesson(String),

    #[error("Lesson not found: {0}")]
    LessonNotFound(String),

    #[error("Lesson {id} has order {found}, expected {expected}")]
    NonContiguousOrder {
        id: String,
        expected: u32,
        found: u32,
    },

    #[error("Index {index} out of bounds for {len} lessons")]
    IndexOutOfBounds { index: usize, len: usize },

    #[error("Content category {0} does not accept this content shape")]
    ContentShapeMismatch(String),

    #[error("Invalid value for {field}: {reason}")]
    InvalidValue { field: &'static str, reason: String },
}

impl ErrorMetadata for ValidationError {
    fn error_code(&self) -> &'static str {
        "VALIDATION_ERROR"
    }

    fn is_recoverable(&self) -> bool {
        false
    }

    fn suggested_action(&self) -> Option<&'static str> {
        Some("Check request parameters and try again")
    }

    fn client_message(&self) -> String {
        self.to_string()
    }

    fn log_level(&self) -> LogLevel {
        LogLevel::Debug
    }
}
