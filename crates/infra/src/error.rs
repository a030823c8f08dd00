//! Persistence errors shared by every store implementation.

use dprompts_core::{GroupId, JobId};

pub type StoreResult<T> = Result<T, StoreError>;

#[derive(Debug, Clone, thiserror::Error)]
pub enum StoreError {
    #[error("database error in {operation}: {message}")]
    Database { operation: String, message: String },

    /// Completion was attempted for a job that is no longer running under the
    /// claimed attempt (rescued, cancelled, or completed elsewhere).
    #[error("job {0} is not held by this attempt")]
    NotHeld(JobId),

    #[error("group {0:?} could not be resolved")]
    GroupUnresolved(String),

    #[error("serialization error: {0}")]
    Serialization(String),

    #[error("group {0} not found")]
    GroupNotFound(GroupId),
}

impl StoreError {
    pub fn database(operation: &str, message: impl Into<String>) -> Self {
        Self::Database {
            operation: operation.to_string(),
            message: message.into(),
        }
    }
}

impl From<serde_json::Error> for StoreError {
    fn from(err: serde_json::Error) -> Self {
        Self::Serialization(err.to_string())
    }
}

/// Map a sqlx error to a store error, tagging it with the failing operation.
pub(crate) fn map_sqlx_error(operation: &str, err: sqlx::Error) -> StoreError {
    match err {
        sqlx::Error::Database(db_err) => {
            let kind = match db_err.code().as_deref() {
                Some("23505") => "unique violation",
                Some("23503") => "foreign key violation",
                Some("23514") => "check violation",
                Some("40001") => "serialization failure",
                _ => "error",
            };
            StoreError::database(operation, format!("{kind}: {}", db_err.message()))
        }
        sqlx::Error::PoolClosed => StoreError::database(operation, "connection pool closed"),
        sqlx::Error::PoolTimedOut => {
            StoreError::database(operation, "timed out acquiring a connection")
        }
        sqlx::Error::RowNotFound => StoreError::database(operation, "unexpected row not found"),
        other => StoreError::database(operation, other.to_string()),
    }
}
