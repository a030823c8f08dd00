//! Job input validation errors.

use thiserror::Error;

/// Result type used by job validation.
pub type ValidationResult<T> = Result<T, ValidationError>;

/// Why a job specification was rejected before reaching the queue.
///
/// Keep this focused on deterministic input failures. Storage and network
/// concerns belong to the infra and ai crates.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum ValidationError {
    /// Neither `prompt` nor `sub_tasks` carried any text.
    #[error("job has no prompt and no sub_tasks")]
    MissingPrompt,

    /// A sub-task prompt was empty or whitespace only.
    #[error("sub_task[{index}] has empty prompt")]
    EmptySubTaskPrompt { index: usize },

    /// Both `prompt` and `sub_tasks` were supplied.
    #[error("job must set either prompt or sub_tasks, not both")]
    AmbiguousShape,

    /// A `schema_name` shortcut was not present in the schema table.
    #[error("unknown schema name: {0}")]
    UnknownSchema(String),

    /// Both an inline `schema` and a `schema_name` were supplied.
    #[error("schema and schema_name are mutually exclusive{}", .location.as_deref().map(|l| format!(" ({l})")).unwrap_or_default())]
    ConflictingSchema { location: Option<String> },
}

impl ValidationError {
    pub fn unknown_schema(name: impl Into<String>) -> Self {
        Self::UnknownSchema(name.into())
    }

    pub fn conflicting_schema(location: Option<String>) -> Self {
        Self::ConflictingSchema { location }
    }
}
