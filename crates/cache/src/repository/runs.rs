//! Build run and build log repository functions.

use chrono::Utc;
use uuid::Uuid;

use crate::{
    models::{format_datetime, BuildEventRow, BuildStatus, RunRow, RunStatus},
    CacheError, CachePool,
};

// ---------------------------------------------------------------------------
// runs
// ---------------------------------------------------------------------------

/// Create a new run record in `running` status.
pub async fn create_run(pool: &CachePool) -> Result<RunRow, CacheError> {
    let id = Uuid::new_v4().to_string();
    let now = format_datetime(&Utc::now());

    let row = sqlx::query_as::<_, RunRow>(
        r#"
        INSERT INTO runs (id, status, started_at)
        VALUES (?1, ?2, ?3)
        RETURNING id, status, started_at, finished_at
        "#,
    )
    .bind(id)
    .bind(RunStatus::Running.to_string())
    .bind(now)
    .fetch_one(pool)
    .await?;

    Ok(row)
}

/// Close a run with its final status.
pub async fn finish_run(pool: &CachePool, run_id: Uuid, status: RunStatus) -> Result<(), CacheError> {
    let result = sqlx::query("UPDATE runs SET status = ?1, finished_at = ?2 WHERE id = ?3")
        .bind(status.to_string())
        .bind(format_datetime(&Utc::now()))
        .bind(run_id.to_string())
        .execute(pool)
        .await?;

    if result.rows_affected() == 0 {
        return Err(CacheError::NotFound);
    }
    Ok(())
}

/// The most recently started run, if any.
pub async fn latest_run(pool: &CachePool) -> Result<Option<RunRow>, CacheError> {
    let row = sqlx::query_as::<_, RunRow>(
        "SELECT id, status, started_at, finished_at FROM runs ORDER BY started_at DESC, rowid DESC LIMIT 1",
    )
    .fetch_optional(pool)
    .await?;

    Ok(row)
}

// ---------------------------------------------------------------------------
// build_events
// ---------------------------------------------------------------------------

/// Append a status transition to the build log.
pub async fn insert_event(
    pool: &CachePool,
    run_id: Uuid,
    target: &str,
    status: BuildStatus,
    message: Option<&str>,
    elapsed_ms: Option<i64>,
) -> Result<(), CacheError> {
    sqlx::query(
        r#"
        INSERT INTO build_events (run_id, target, status, message, elapsed_ms, at)
        VALUES (?1, ?2, ?3, ?4, ?5, ?6)
        "#,
    )
    .bind(run_id.to_string())
    .bind(target)
    .bind(status.to_string())
    .bind(message)
    .bind(elapsed_ms)
    .bind(format_datetime(&Utc::now()))
    .execute(pool)
    .await?;

    Ok(())
}

/// Every event of a run in the order it was recorded.
pub async fn list_events(pool: &CachePool, run_id: Uuid) -> Result<Vec<BuildEventRow>, CacheError> {
    let rows = sqlx::query_as::<_, BuildEventRow>(
        r#"
        SELECT id, run_id, target, status, message, elapsed_ms, at
        FROM build_events
        WHERE run_id = ?1
        ORDER BY id
        "#,
    )
    .bind(run_id.to_string())
    .fetch_all(pool)
    .await?;

    Ok(rows)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::pool::open_in_memory;

    #[tokio::test]
    async fn run_lifecycle_and_events() {
        let pool = open_in_memory().await.unwrap();
        let run = create_run(&pool).await.unwrap();
        assert_eq!(run.status, "running");
        let run_id = Uuid::parse_str(&run.id).unwrap();

        insert_event(&pool, run_id, "a", BuildStatus::Started, None, None).await.unwrap();
        insert_event(&pool, run_id, "a", BuildStatus::Built, None, Some(5)).await.unwrap();
        insert_event(&pool, run_id, "b", BuildStatus::Failed, Some("boom"), Some(1)).await.unwrap();
        finish_run(&pool, run_id, RunStatus::Failed).await.unwrap();

        let events = list_events(&pool, run_id).await.unwrap();
        let seen: Vec<(&str, BuildStatus)> = events
            .iter()
            .map(|e| (e.target.as_str(), e.status().unwrap()))
            .collect();
        assert_eq!(
            seen,
            vec![("a", BuildStatus::Started), ("a", BuildStatus::Built), ("b", BuildStatus::Failed)]
        );
        assert_eq!(events[2].message.as_deref(), Some("boom"));

        let latest = latest_run(&pool).await.unwrap().unwrap();
        assert_eq!(latest.id, run.id);
        assert_eq!(latest.status, "failed");
        assert!(latest.finished_at.is_some());
    }

    #[tokio::test]
    async fn finishing_unknown_run_is_not_found() {
        let pool = open_in_memory().await.unwrap();
        let err = finish_run(&pool, Uuid::new_v4(), RunStatus::Succeeded).await;
        assert!(matches!(err, Err(CacheError::NotFound)));
    }

    #[tokio::test]
    async fn events_require_an_existing_run() {
        let pool = open_in_memory().await.unwrap();
        let err = insert_event(&pool, Uuid::new_v4(), "a", BuildStatus::Started, None, None).await;
        assert!(matches!(err, Err(CacheError::Sqlx(_))));
    }
}
