//! Typed error type for the cache crate.

use thiserror::Error;

#[derive(Debug, Error)]
pub enum CacheError {
    #[error("sqlx error: {0}")]
    Sqlx(#[from] sqlx::Error),

    #[error("row not found")]
    NotFound,

    #[error("migration error: {0}")]
    Migration(#[from] sqlx::migrate::MigrateError),

    #[error("cache directory error: {0}")]
    Io(#[from] std::io::Error),

    /// A stored value could not be decoded.
    #[error("corrupt cache entry: {0}")]
    Corrupt(String),
}
