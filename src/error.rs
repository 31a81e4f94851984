//! Error types for the storage-and-transaction core.

use thiserror::Error;

pub type Result<T> = std::result::Result<T, StorageError>;

/// Errors surfaced by the storage core.
///
/// Variants are grouped by how a caller is expected to react: constraint
/// and conflict errors are ordinary control flow for a transaction; `Io`
/// marks the owning table unhealthy; `Invariant` and `Usage` are bugs
/// (either in this crate or in the caller) and should not be retried.
#[derive(Error, Debug)]
pub enum StorageError {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("serialization error: {0}")]
    Serialization(String),

    #[error("data corruption: {0}")]
    Corruption(String),

    #[error("transaction conflict: {0}")]
    Conflict(String),

    #[error("constraint violation ({code}): {message}")]
    Constraint {
        code: ConstraintCode,
        message: String,
    },

    #[error("table not found: {0}")]
    TableNotFound(String),

    #[error("table already exists: {0}")]
    TableExists(String),

    #[error("lock error: {0}")]
    Lock(String),

    #[error("invariant violation: {0}")]
    Invariant(String),

    #[error("usage error: {0}")]
    Usage(String),

    #[error("schema error: {0}")]
    Schema(String),
}

impl From<bincode::Error> for StorageError {
    fn from(err: bincode::Error) -> Self {
        StorageError::Serialization(err.to_string())
    }
}

/// Constraint violation codes, fixed to the numbering the wire/JDBC layer
/// expects.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConstraintCode {
    PrimaryKeyViolation = 20,
    Unique = 21,
    Check = 22,
    ForeignKey = 23,
    Nullable = 24,
    Type = 25,
    DropTable = 26,
    DropColumn = 27,
}

impl std::fmt::Display for ConstraintCode {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", *self as i32)
    }
}
