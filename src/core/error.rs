use thiserror::Error;

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum DbError {
    #[error("{entity} '{id}' not found")]
    NotFound { entity: String, id: String },

    #[error("Timed out waiting for {kind} lock on '{key}'")]
    LockTimeout { kind: String, key: String },

    #[error("Write failure: {0}")]
    WriteFailure(String),

    #[error("Corrupt artifact '{path}': {reason}")]
    CorruptArtifact { path: String, reason: String },

    #[error("Validation failure: {0}")]
    ValidationFailure(String),

    #[error("Serialization error: {0}")]
    SerializationError(String),

    #[error("Execution error: {0}")]
    ExecutionError(String),

    #[error("Lock error: {0}")]
    LockError(String),

    #[error("I/O error: {0}")]
    IoError(String),
}

impl DbError {
    pub fn not_found(entity: impl Into<String>, id: impl Into<String>) -> Self {
        Self::NotFound {
            entity: entity.into(),
            id: id.into(),
        }
    }

    pub fn corrupt(path: impl std::fmt::Display, reason: impl std::fmt::Display) -> Self {
        Self::CorruptArtifact {
            path: path.to_string(),
            reason: reason.to_string(),
        }
    }

    /// True for the lease-contention error, the one callers usually retry.
    pub fn is_lock_timeout(&self) -> bool {
        matches!(self, Self::LockTimeout { .. })
    }
}

pub type Result<T> = std::result::Result<T, DbError>;

impl From<std::io::Error> for DbError {
    fn from(err: std::io::Error) -> Self {
        Self::IoError(err.to_string())
    }
}

impl From<serde_json::Error> for DbError {
    fn from(err: serde_json::Error) -> Self {
        Self::SerializationError(err.to_string())
    }
}

impl<T> From<std::sync::PoisonError<T>> for DbError {
    fn from(err: std::sync::PoisonError<T>) -> Self {
        Self::LockError(err.to_string())
    }
}
