//! Storage error classification.

use std::fmt;

use thiserror::Error;

/// Structured classification for database failures, mirroring the queue-layer
/// classification this lineage uses elsewhere: callers branch on the kind, not on
/// string-matching the driver's message.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StorageErrorKind {
    BusyOrLocked,
    ConstraintViolation,
    PoolTimeout,
    PoolClosed,
    RowNotFound,
    Io,
    Protocol,
    Other,
}

impl StorageErrorKind {
    #[must_use]
    pub fn from_sqlx(error: &sqlx::Error) -> Self {
        match error {
            sqlx::Error::PoolTimedOut => Self::PoolTimeout,
            sqlx::Error::PoolClosed => Self::PoolClosed,
            sqlx::Error::RowNotFound => Self::RowNotFound,
            sqlx::Error::Io(_) => Self::Io,
            sqlx::Error::Protocol(_) => Self::Protocol,
            sqlx::Error::Database(db_err) => classify_database_error(db_err.as_ref()),
            _ => Self::Other,
        }
    }
}

impl fmt::Display for StorageErrorKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let label = match self {
            Self::BusyOrLocked => "busy_or_locked",
            Self::ConstraintViolation => "constraint_violation",
            Self::PoolTimeout => "pool_timeout",
            Self::PoolClosed => "pool_closed",
            Self::RowNotFound => "row_not_found",
            Self::Io => "io",
            Self::Protocol => "protocol",
            Self::Other => "other",
        };
        write!(f, "{label}")
    }
}

fn classify_database_error(db_err: &(dyn sqlx::error::DatabaseError + 'static)) -> StorageErrorKind {
    let code = db_err.code();
    if matches!(code.as_deref(), Some("SQLITE_BUSY" | "SQLITE_LOCKED" | "5" | "6")) {
        return StorageErrorKind::BusyOrLocked;
    }
    if db_err.is_unique_violation()
        || db_err.is_foreign_key_violation()
        || db_err.is_check_violation()
        || code.as_deref().is_some_and(|c| c.starts_with("SQLITE_CONSTRAINT"))
    {
        return StorageErrorKind::ConstraintViolation;
    }
    let message = db_err.message().to_ascii_lowercase();
    if message.contains("database is locked") || message.contains("database is busy") {
        return StorageErrorKind::BusyOrLocked;
    }
    StorageErrorKind::Other
}

/// Errors surfaced by the [`crate::storage::Storage`] layer.
#[derive(Debug, Error)]
pub enum StorageError {
    #[error("storage error ({kind}): {message}")]
    Database { kind: StorageErrorKind, message: String },

    #[error("download {0} not found")]
    DownloadNotFound(String),

    #[error("failed to run migrations: {0}")]
    Migration(#[from] sqlx::migrate::MigrateError),
}

impl From<sqlx::Error> for StorageError {
    fn from(err: sqlx::Error) -> Self {
        Self::Database {
            kind: StorageErrorKind::from_sqlx(&err),
            message: err.to_string(),
        }
    }
}

impl StorageError {
    #[must_use]
    pub fn is_busy_or_locked(&self) -> bool {
        matches!(self, Self::Database { kind, .. } if *kind == StorageErrorKind::BusyOrLocked)
    }
}
