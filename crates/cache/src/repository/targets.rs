//! Target record operations.

use chrono::Utc;

use crate::{
    models::{format_datetime, NewTargetRecord, RecordStatus, TargetRecord},
    CacheError, CachePool,
};

const TARGET_COLUMNS: &str = "name, value, value_hash, command_hash, depend_hash, file_out_hash, \
     change_hash, status, error, elapsed_ms, built_at";

/// Fetch the record of a target, `None` if it was never built.
pub async fn get_target(pool: &CachePool, name: &str) -> Result<Option<TargetRecord>, CacheError> {
    let row = sqlx::query_as::<_, TargetRecord>(&format!(
        "SELECT {TARGET_COLUMNS} FROM targets WHERE name = ?1"
    ))
    .bind(name)
    .fetch_optional(pool)
    .await?;

    Ok(row)
}

/// Insert or replace the record of a successfully built target.
pub async fn upsert_target(
    pool: &CachePool,
    record: &NewTargetRecord<'_>,
) -> Result<(), CacheError> {
    sqlx::query(
        r#"
        INSERT INTO targets
            (name, value, value_hash, command_hash, depend_hash, file_out_hash,
             change_hash, status, error, elapsed_ms, built_at)
        VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, NULL, ?9, ?10)
        ON CONFLICT(name) DO UPDATE SET
            value = excluded.value,
            value_hash = excluded.value_hash,
            command_hash = excluded.command_hash,
            depend_hash = excluded.depend_hash,
            file_out_hash = excluded.file_out_hash,
            change_hash = excluded.change_hash,
            status = excluded.status,
            error = NULL,
            elapsed_ms = excluded.elapsed_ms,
            built_at = excluded.built_at
        "#,
    )
    .bind(record.name)
    .bind(record.value)
    .bind(record.value_hash)
    .bind(record.command_hash)
    .bind(record.depend_hash)
    .bind(record.file_out_hash)
    .bind(record.change_hash)
    .bind(RecordStatus::Built.to_string())
    .bind(record.elapsed_ms)
    .bind(format_datetime(&Utc::now()))
    .execute(pool)
    .await?;

    Ok(())
}

/// Record a failed build. An existing value is kept so it can still be
/// inspected, but the target counts as outdated until it builds again.
pub async fn mark_failed(
    pool: &CachePool,
    name: &str,
    error: &str,
    elapsed_ms: i64,
) -> Result<(), CacheError> {
    sqlx::query(
        r#"
        INSERT INTO targets
            (name, value, value_hash, command_hash, depend_hash, status, error, elapsed_ms, built_at)
        VALUES (?1, X'', '', '', '', ?2, ?3, ?4, ?5)
        ON CONFLICT(name) DO UPDATE SET
            status = excluded.status,
            error = excluded.error,
            elapsed_ms = excluded.elapsed_ms,
            built_at = excluded.built_at
        "#,
    )
    .bind(name)
    .bind(RecordStatus::Failed.to_string())
    .bind(error)
    .bind(elapsed_ms)
    .bind(format_datetime(&Utc::now()))
    .execute(pool)
    .await?;

    Ok(())
}

/// Remove one target from the cache.
///
/// Returns `CacheError::NotFound` if no row was deleted.
pub async fn delete_target(pool: &CachePool, name: &str) -> Result<(), CacheError> {
    let result = sqlx::query("DELETE FROM targets WHERE name = ?1")
        .bind(name)
        .execute(pool)
        .await?;

    if result.rows_affected() == 0 {
        return Err(CacheError::NotFound);
    }

    Ok(())
}

/// Return every cached target ordered by name.
pub async fn list_targets(pool: &CachePool) -> Result<Vec<TargetRecord>, CacheError> {
    let rows = sqlx::query_as::<_, TargetRecord>(&format!(
        "SELECT {TARGET_COLUMNS} FROM targets ORDER BY name"
    ))
    .fetch_all(pool)
    .await?;

    Ok(rows)
}

/// Remove every target; returns how many were deleted.
pub async fn clear_targets(pool: &CachePool) -> Result<u64, CacheError> {
    let result = sqlx::query("DELETE FROM targets").execute(pool).await?;
    Ok(result.rows_affected())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::pool::open_in_memory;

    fn record<'a>(name: &'a str, value: &'a [u8]) -> NewTargetRecord<'a> {
        NewTargetRecord {
            name,
            value,
            value_hash: "vh",
            command_hash: "ch",
            depend_hash: "dh",
            file_out_hash: None,
            change_hash: Some("xh"),
            elapsed_ms: 12,
        }
    }

    #[tokio::test]
    async fn upsert_then_get() {
        let pool = open_in_memory().await.unwrap();
        upsert_target(&pool, &record("data", b"1,2,3")).await.unwrap();

        let got = get_target(&pool, "data").await.unwrap().expect("stored");
        assert_eq!(got.value, b"1,2,3");
        assert_eq!(got.change_hash.as_deref(), Some("xh"));
        assert!(got.is_built());
        assert!(got.built_at().is_ok());
    }

    #[tokio::test]
    async fn missing_target_is_none() {
        let pool = open_in_memory().await.unwrap();
        assert!(get_target(&pool, "ghost").await.unwrap().is_none());
    }

    #[tokio::test]
    async fn failure_keeps_previous_value() {
        let pool = open_in_memory().await.unwrap();
        upsert_target(&pool, &record("model", b"v1")).await.unwrap();
        mark_failed(&pool, "model", "boom", 3).await.unwrap();

        let got = get_target(&pool, "model").await.unwrap().unwrap();
        assert_eq!(got.value, b"v1");
        assert_eq!(got.status().unwrap(), RecordStatus::Failed);
        assert_eq!(got.error.as_deref(), Some("boom"));

        // A later success clears the error.
        upsert_target(&pool, &record("model", b"v2")).await.unwrap();
        let got = get_target(&pool, "model").await.unwrap().unwrap();
        assert!(got.is_built());
        assert!(got.error.is_none());
    }

    #[tokio::test]
    async fn failure_without_previous_build_inserts_empty_record() {
        let pool = open_in_memory().await.unwrap();
        mark_failed(&pool, "fresh", "nope", 0).await.unwrap();
        let got = get_target(&pool, "fresh").await.unwrap().unwrap();
        assert!(got.value.is_empty());
        assert!(!got.is_built());
    }

    #[tokio::test]
    async fn delete_and_clear() {
        let pool = open_in_memory().await.unwrap();
        upsert_target(&pool, &record("a", b"")).await.unwrap();
        upsert_target(&pool, &record("b", b"")).await.unwrap();
        upsert_target(&pool, &record("c", b"")).await.unwrap();

        delete_target(&pool, "b").await.unwrap();
        assert!(matches!(delete_target(&pool, "b").await, Err(CacheError::NotFound)));

        let names: Vec<String> = list_targets(&pool).await.unwrap().into_iter().map(|r| r.name).collect();
        assert_eq!(names, vec!["a", "c"]);

        assert_eq!(clear_targets(&pool).await.unwrap(), 2);
        assert!(list_targets(&pool).await.unwrap().is_empty());
    }
}
