//! File fingerprint memo.

use chrono::Utc;

use crate::{
    models::{format_datetime, FileRecord},
    CacheError, CachePool,
};

pub async fn get_file(pool: &CachePool, path: &str) -> Result<Option<FileRecord>, CacheError> {
    let row = sqlx::query_as::<_, FileRecord>(
        "SELECT path, hash, size, mtime_ns, checked_at FROM files WHERE path = ?1",
    )
    .bind(path)
    .fetch_optional(pool)
    .await?;

    Ok(row)
}

/// Store the fingerprint of `path` together with the size and mtime it was
/// computed for.
pub async fn upsert_file(
    pool: &CachePool,
    path: &str,
    hash: &str,
    size: i64,
    mtime_ns: i64,
) -> Result<(), CacheError> {
    sqlx::query(
        r#"
        INSERT INTO files (path, hash, size, mtime_ns, checked_at)
        VALUES (?1, ?2, ?3, ?4, ?5)
        ON CONFLICT(path) DO UPDATE SET
            hash = excluded.hash,
            size = excluded.size,
            mtime_ns = excluded.mtime_ns,
            checked_at = excluded.checked_at
        "#,
    )
    .bind(path)
    .bind(hash)
    .bind(size)
    .bind(mtime_ns)
    .bind(format_datetime(&Utc::now()))
    .execute(pool)
    .await?;

    Ok(())
}

/// Forget a file; a no-op when it was never recorded.
pub async fn delete_file(pool: &CachePool, path: &str) -> Result<(), CacheError> {
    sqlx::query("DELETE FROM files WHERE path = ?1")
        .bind(path)
        .execute(pool)
        .await?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::pool::open_in_memory;

    #[tokio::test]
    async fn upsert_overwrites_previous_fingerprint() {
        let pool = open_in_memory().await.unwrap();
        upsert_file(&pool, "data/raw.csv", "h1", 10, 100).await.unwrap();
        upsert_file(&pool, "data/raw.csv", "h2", 11, 200).await.unwrap();

        let rec = get_file(&pool, "data/raw.csv").await.unwrap().unwrap();
        assert_eq!((rec.hash.as_str(), rec.size, rec.mtime_ns), ("h2", 11, 200));

        delete_file(&pool, "data/raw.csv").await.unwrap();
        assert!(get_file(&pool, "data/raw.csv").await.unwrap().is_none());
    }
}
