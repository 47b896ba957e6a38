//! SQLite connection pool for the build cache.

use std::path::{Path, PathBuf};
use std::time::Duration;

use sqlx::sqlite::{SqliteConnectOptions, SqliteJournalMode, SqlitePool, SqlitePoolOptions};
use tracing::info;

use crate::CacheError;

/// Type alias for the shared pool used across the whole application.
pub type CachePool = SqlitePool;

/// File name of the database inside the cache directory.
pub const DATABASE_FILE: &str = "cache.db";

/// Directory (inside the cache directory) holding materialized target values.
pub const VALUES_DIR: &str = "values";

/// Open (creating if needed) the cache stored in `cache_dir` and apply
/// pending migrations.
pub async fn open(cache_dir: &Path) -> Result<CachePool, CacheError> {
    tokio::fs::create_dir_all(cache_dir.join(VALUES_DIR)).await?;

    let db_path = cache_dir.join(DATABASE_FILE);
    info!(path = %db_path.display(), "opening build cache");

    let options = SqliteConnectOptions::new()
        .filename(&db_path)
        .journal_mode(SqliteJournalMode::Wal)
        .foreign_keys(true)
        .busy_timeout(Duration::from_secs(5))
        .create_if_missing(true);

    let pool = SqlitePoolOptions::new()
        .max_connections(4)
        .connect_with(options)
        .await?;

    run_migrations(&pool).await?;
    Ok(pool)
}

/// Open a throwaway in-memory cache. A single connection keeps every query
/// on the same database.
pub async fn open_in_memory() -> Result<CachePool, CacheError> {
    let options = SqliteConnectOptions::new()
        .in_memory(true)
        .foreign_keys(true);

    let pool = SqlitePoolOptions::new()
        .max_connections(1)
        .idle_timeout(None)
        .max_lifetime(None)
        .connect_with(options)
        .await?;

    run_migrations(&pool).await?;
    Ok(pool)
}

/// Run embedded SQLx migrations located in `./migrations` (relative to this
/// crate at build time).
pub async fn run_migrations(pool: &CachePool) -> Result<(), CacheError> {
    sqlx::migrate!("./migrations").run(pool).await?;
    Ok(())
}

/// Path of the materialized value file for `target`.
pub fn value_path(cache_dir: &Path, target: &str) -> PathBuf {
    cache_dir.join(VALUES_DIR).join(target)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn open_creates_database_and_tables() {
        let dir = tempfile::tempdir().unwrap();
        let cache_dir = dir.path().join(".drover");

        let pool = open(&cache_dir).await.unwrap();

        assert!(cache_dir.join(DATABASE_FILE).exists());
        assert!(cache_dir.join(VALUES_DIR).is_dir());

        let tables: Vec<(String,)> = sqlx::query_as(
            "SELECT name FROM sqlite_master WHERE type='table' AND name NOT LIKE 'sqlite_%' AND name != '_sqlx_migrations' ORDER BY name",
        )
        .fetch_all(&pool)
        .await
        .unwrap();
        let names: Vec<&str> = tables.iter().map(|t| t.0.as_str()).collect();
        assert_eq!(names, vec!["build_events", "files", "runs", "targets"]);
    }

    #[tokio::test]
    async fn reopening_keeps_existing_cache() {
        let dir = tempfile::tempdir().unwrap();
        let pool = open(dir.path()).await.unwrap();
        sqlx::query("INSERT INTO runs (id, status, started_at) VALUES ('r1', 'running', 'now')")
            .execute(&pool)
            .await
            .unwrap();
        pool.close().await;

        let pool = open(dir.path()).await.unwrap();
        let (count,): (i64,) = sqlx::query_as("SELECT COUNT(*) FROM runs")
            .fetch_one(&pool)
            .await
            .unwrap();
        assert_eq!(count, 1);
    }

    #[test]
    fn value_path_lives_under_values_dir() {
        let p = value_path(Path::new("/tmp/c"), "model");
        assert_eq!(p, PathBuf::from("/tmp/c/values/model"));
    }
}
