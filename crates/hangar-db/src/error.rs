//! Database error types.

use thiserror::Error;

#[derive(Debug, Error)]
pub enum DbError {
    #[error("not found: {0}")]
    NotFound(String),

    #[error("duplicate: {0}")]
    Duplicate(String),

    /// The row changed since it was read.
    #[error("version conflict: {0}")]
    Conflict(String),

    #[error("database error: {0}")]
    Database(#[from] sqlx::Error),

    #[error("migration error: {0}")]
    Migration(#[from] sqlx::migrate::MigrateError),

    #[error("invalid stored data: {0}")]
    Domain(#[from] hangar_core::Error),
}

pub type DbResult<T> = std::result::Result<T, DbError>;

/// Map unique-constraint violations to `Duplicate`, everything else to `Database`.
pub(crate) fn classify(err: sqlx::Error, what: impl FnOnce() -> String) -> DbError {
    match &err {
        sqlx::Error::Database(db) if db.is_unique_violation() => DbError::Duplicate(what()),
        _ => DbError::Database(err),
    }
}
