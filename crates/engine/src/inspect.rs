//! Read-only queries over a plan and its cache, plus `clean`.

use std::collections::{HashMap, HashSet};
use std::path::Path;
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::Serialize;
use tracing::info;
use uuid::Uuid;

use cache::models::BuildStatus;
use cache::pool::value_path;
use cache::repository::{runs, targets};
use cache::{CacheError, CachePool};
use workers::Worker;

use crate::config::EngineConfig;
use crate::dag::{DependencyGraph, TargetDeps};
use crate::models::Plan;
use crate::probe::Probe;
use crate::staleness::{decide, follows_upstream, Reason};
use crate::EngineError;

/// A target `make` would rebuild, and why.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct OutdatedTarget {
    pub name: String,
    pub reasons: Vec<Reason>,
}

/// List the outdated targets of `plan` in build order.
///
/// Unlike `make`, this cannot know whether a rebuilt upstream value will
/// change, so a target downstream of an outdated one is reported too, unless
/// its trigger ignores dependencies. Condition and change triggers are
/// evaluated.
pub async fn outdated(
    pool: &CachePool,
    worker: &dyn Worker,
    config: &EngineConfig,
    plan: &Plan,
) -> Result<Vec<OutdatedTarget>, EngineError> {
    let graph = DependencyGraph::build(plan)?;
    let probe = Probe::prepare(pool, worker, config, plan, &graph).await?;
    let run_id = Uuid::new_v4();

    let mut values: HashMap<String, String> = HashMap::new();
    let mut stale: HashSet<&str> = HashSet::new();
    let mut out = Vec::new();

    for name in graph.order() {
        let (Some(spec), Some(deps)) = (plan.target(name), graph.deps(name)) else {
            continue;
        };
        let record = targets::get_target(pool, name).await?;
        let fingerprints = probe.fingerprints(run_id, spec, deps, &values).await?;

        let mut reasons = decide(&spec.trigger, record.as_ref(), &fingerprints);
        if follows_upstream(&spec.trigger, &fingerprints) {
            for upstream in &deps.targets {
                if stale.contains(upstream.as_str()) {
                    reasons.push(Reason::UpstreamOutdated(upstream.clone()));
                }
            }
        }

        if let Some(record) = record.filter(|r| r.is_built()) {
            values.insert(name.clone(), record.value_hash);
        }
        if !reasons.is_empty() {
            stale.insert(name.as_str());
            out.push(OutdatedTarget {
                name: name.clone(),
                reasons,
            });
        }
    }

    Ok(out)
}

/// The stored value of a built target.
pub async fn read_target(pool: &CachePool, name: &str) -> Result<Vec<u8>, EngineError> {
    match targets::get_target(pool, name).await? {
        Some(record) if record.is_built() => Ok(record.value),
        _ => Err(EngineError::NotBuilt(name.to_owned())),
    }
}

/// Remove targets from the cache (all of them when `names` is empty), along
/// with their value files. Returns the removed names.
pub async fn clean(pool: &CachePool, cache_dir: &Path, names: &[String]) -> Result<Vec<String>, EngineError> {
    let names: Vec<String> = if names.is_empty() {
        targets::list_targets(pool).await?.into_iter().map(|r| r.name).collect()
    } else {
        names.to_vec()
    };

    let mut removed = Vec::with_capacity(names.len());
    for name in names {
        match targets::delete_target(pool, &name).await {
            Ok(()) => {}
            Err(CacheError::NotFound) => continue,
            Err(e) => return Err(e.into()),
        }
        let path = value_path(cache_dir, &name);
        match tokio::fs::remove_file(&path).await {
            Ok(()) => {}
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
            Err(e) => return Err(EngineError::io(path, e)),
        }
        removed.push(name);
    }

    info!(count = removed.len(), "cleaned targets");
    Ok(removed)
}

/// How long a cached target took to build.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct BuildTime {
    pub name: String,
    pub elapsed: Duration,
    pub built_at: DateTime<Utc>,
}

/// Build times of every successfully built target, slowest first.
pub async fn build_times(pool: &CachePool) -> Result<Vec<BuildTime>, EngineError> {
    let mut times = Vec::new();
    for record in targets::list_targets(pool).await? {
        if !record.is_built() {
            continue;
        }
        times.push(BuildTime {
            built_at: record.built_at()?,
            elapsed: Duration::from_millis(record.elapsed_ms.max(0) as u64),
            name: record.name,
        });
    }
    times.sort_by(|a, b| b.elapsed.cmp(&a.elapsed).then_with(|| a.name.cmp(&b.name)));
    Ok(times)
}

/// Last recorded status of every target of a run (the latest run when
/// `run_id` is `None`), in the order targets first appeared in the log.
pub async fn progress(
    pool: &CachePool,
    run_id: Option<Uuid>,
) -> Result<Vec<(String, BuildStatus)>, EngineError> {
    let run_id = match run_id {
        Some(id) => id,
        None => match runs::latest_run(pool).await? {
            Some(run) => Uuid::parse_str(&run.id)
                .map_err(|e| CacheError::Corrupt(format!("invalid run id: {e}")))?,
            None => return Ok(Vec::new()),
        },
    };

    let mut order: Vec<String> = Vec::new();
    let mut last: HashMap<String, BuildStatus> = HashMap::new();
    for event in runs::list_events(pool, run_id).await? {
        let status = event.status()?;
        if last.insert(event.target.clone(), status).is_none() {
            order.push(event.target);
        }
    }

    Ok(order
        .into_iter()
        .map(|name| {
            let status = last[&name];
            (name, status)
        })
        .collect())
}

/// The analyzed dependencies of one target.
pub fn deps_target(plan: &Plan, name: &str) -> Result<TargetDeps, EngineError> {
    let graph = DependencyGraph::build(plan)?;
    graph
        .deps(name)
        .cloned()
        .ok_or_else(|| EngineError::UnknownTarget(name.to_owned()))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::TargetSpec;
    use cache::models::NewTargetRecord;
    use cache::pool::open_in_memory;

    async fn store(pool: &CachePool, name: &str, value: &[u8], elapsed_ms: i64) {
        targets::upsert_target(
            pool,
            &NewTargetRecord {
                name,
                value,
                value_hash: "v",
                command_hash: "c",
                depend_hash: "d",
                file_out_hash: None,
                change_hash: None,
                elapsed_ms,
            },
        )
        .await
        .unwrap();
    }

    #[tokio::test]
    async fn read_target_requires_a_built_value() {
        let pool = open_in_memory().await.unwrap();
        store(&pool, "a", b"42", 1).await;
        targets::mark_failed(&pool, "b", "boom", 0).await.unwrap();

        assert_eq!(read_target(&pool, "a").await.unwrap(), b"42");
        assert!(matches!(read_target(&pool, "b").await, Err(EngineError::NotBuilt(_))));
        assert!(matches!(read_target(&pool, "c").await, Err(EngineError::NotBuilt(_))));
    }

    #[tokio::test]
    async fn clean_removes_records_and_value_files() {
        let dir = tempfile::tempdir().unwrap();
        let pool = open_in_memory().await.unwrap();
        std::fs::create_dir_all(dir.path().join("values")).unwrap();
        for name in ["a", "b"] {
            store(&pool, name, b"x", 1).await;
            std::fs::write(value_path(dir.path(), name), "x").unwrap();
        }

        let removed = clean(&pool, dir.path(), &["a".into(), "ghost".into()]).await.unwrap();
        assert_eq!(removed, vec!["a"]);
        assert!(!value_path(dir.path(), "a").exists());
        assert!(value_path(dir.path(), "b").exists());

        let removed = clean(&pool, dir.path(), &[]).await.unwrap();
        assert_eq!(removed, vec!["b"]);
        assert!(targets::list_targets(&pool).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn build_times_are_sorted_slowest_first() {
        let pool = open_in_memory().await.unwrap();
        store(&pool, "fast", b"", 5).await;
        store(&pool, "slow", b"", 500).await;
        targets::mark_failed(&pool, "broken", "x", 9999).await.unwrap();

        let names: Vec<String> = build_times(&pool).await.unwrap().into_iter().map(|t| t.name).collect();
        assert_eq!(names, vec!["slow", "fast"]);
    }

    #[tokio::test]
    async fn progress_reports_last_status_per_target() {
        let pool = open_in_memory().await.unwrap();
        assert!(progress(&pool, None).await.unwrap().is_empty());

        let run = runs::create_run(&pool).await.unwrap();
        let id = Uuid::parse_str(&run.id).unwrap();
        runs::insert_event(&pool, id, "a", BuildStatus::Started, None, None).await.unwrap();
        runs::insert_event(&pool, id, "b", BuildStatus::Skipped, None, None).await.unwrap();
        runs::insert_event(&pool, id, "a", BuildStatus::Built, None, Some(3)).await.unwrap();

        assert_eq!(
            progress(&pool, None).await.unwrap(),
            vec![("a".to_string(), BuildStatus::Built), ("b".to_string(), BuildStatus::Skipped)]
        );
    }

    #[test]
    fn deps_target_reports_analysis() {
        let plan = Plan::new(
            vec![
                TargetSpec::new("raw", r#"cat file_in("raw.csv")"#),
                TargetSpec::new("fit", r#"cat {{raw}} > file_out("fit.txt")"#),
            ],
            vec![],
        );
        let deps = deps_target(&plan, "fit").unwrap();
        assert!(deps.targets.contains("raw"));
        assert!(deps.files_out.contains("fit.txt"));
        assert!(matches!(deps_target(&plan, "nope"), Err(EngineError::UnknownTarget(_))));
    }
}
