//! Plan execution engine.
//!
//! `PlanExecutor` is the central orchestrator:
//! 1. Builds the dependency graph and opens a run in the cache.
//! 2. Fingerprints imports and input files.
//! 3. Walks the graph with a ready queue: a target is checked for staleness
//!    once all of its upstream targets are finished, using their *current*
//!    value fingerprints, so an upstream rebuild that reproduces the same
//!    value does not cascade.
//! 4. Dispatches outdated targets to the `Worker`, at most `jobs` at a time.
//! 5. Handles `WorkerError::Retryable` (up to `retries`) and
//!    `WorkerError::Fatal` (fail the target).
//! 6. Persists values, fingerprints and the build log via the `cache` crate.

use std::collections::{HashMap, HashSet, VecDeque};
use std::path::Path;
use std::sync::Arc;
use std::time::{Duration, Instant};

use serde::Serialize;
use tokio::task::JoinSet;
use tracing::{debug, error, info, instrument, warn};
use uuid::Uuid;

use cache::models::{BuildStatus, NewTargetRecord, RunStatus, TargetRecord};
use cache::repository::{runs, targets};
use cache::CachePool;
use workers::{Job, JobKind, Worker, WorkerError, WorkerOutput};

use crate::config::EngineConfig;
use crate::dag::DependencyGraph;
use crate::hash::{hash_bytes, hash_file};
use crate::models::Plan;
use crate::probe::Probe;
use crate::staleness::{decide, Fingerprints, Reason};
use crate::EngineError;

// ---------------------------------------------------------------------------
// Output of a completed run
// ---------------------------------------------------------------------------

/// What `make` did.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct MakeReport {
    pub run_id: Uuid,
    /// Targets that were (re)built, in completion order.
    pub built: Vec<String>,
    /// Targets that were already up to date.
    pub skipped: Vec<String>,
    /// Targets whose build failed, with the error message.
    pub failed: Vec<(String, String)>,
    /// Targets not attempted because an upstream target failed or the run stopped.
    pub cancelled: Vec<String>,
}

impl MakeReport {
    pub fn is_success(&self) -> bool {
        self.failed.is_empty()
    }
}

// ---------------------------------------------------------------------------
// Internal bookkeeping
// ---------------------------------------------------------------------------

/// A build handed to a worker task.
struct Finished {
    name: String,
    fingerprints: Fingerprints,
    result: Result<WorkerOutput, String>,
    elapsed: Duration,
}

enum Dispatch {
    UpToDate(TargetRecord),
    Build(Job, Fingerprints, Vec<Reason>),
    Failed(String),
}

/// Retry policy of one build.
#[derive(Debug, Clone, Copy)]
struct RetryPolicy {
    retries: u32,
    base_delay: Duration,
    timeout: Option<Duration>,
}

// ---------------------------------------------------------------------------
// PlanExecutor
// ---------------------------------------------------------------------------

/// Orchestrator that brings the targets of a plan up to date.
///
/// Construct one executor per process and call [`PlanExecutor::make`] with
/// the plan.
pub struct PlanExecutor {
    pool: CachePool,
    worker: Arc<dyn Worker>,
    config: EngineConfig,
}

impl PlanExecutor {
    /// Create a new executor.
    pub fn new(pool: CachePool, worker: Arc<dyn Worker>, config: EngineConfig) -> Self {
        Self { pool, worker, config }
    }

    pub fn config(&self) -> &EngineConfig {
        &self.config
    }

    /// Bring every target of the plan up to date.
    ///
    /// # Errors
    /// Returns `EngineError` for invalid plans, cache problems, and the first failed
    /// target unless `keep_going` is set.
    pub async fn make(&self, plan: &Plan) -> Result<MakeReport, EngineError> {
        self.make_targets(plan, &[]).await
    }

    /// Bring `names` and everything they depend on up to date. An empty
    /// slice selects the whole plan.
    ///
    /// # Errors
    /// As [`PlanExecutor::make`].
    pub async fn make_targets(
        &self,
        plan: &Plan,
        names: &[String],
    ) -> Result<MakeReport, EngineError> {
        let report = self.build_targets(plan, names).await?;
        match report.failed.first() {
            Some((target, message)) if !self.config.keep_going => Err(EngineError::TargetFailed {
                target: target.clone(),
                message: message.clone(),
            }),
            _ => Ok(report),
        }
    }

    /// Like [`PlanExecutor::make_targets`], but failed targets are only
    /// reported, never returned as an error. Without `keep_going` the run
    /// still stops at the first failure.
    ///
    /// # Errors
    /// Returns `EngineError` for invalid plans and cache problems.
    #[instrument(skip(self, plan), fields(targets = plan.targets.len(), jobs = self.config.backend().jobs()))]
    pub async fn build_targets(
        &self,
        plan: &Plan,
        names: &[String],
    ) -> Result<MakeReport, EngineError> {
        // ------------------------------------------------------------------
        // Validate and sort the graph.
        // ------------------------------------------------------------------
        let graph = DependencyGraph::build(plan)?;
        let selected: HashSet<String> = if names.is_empty() {
            graph.order().iter().cloned().collect()
        } else {
            graph.with_upstream(names)?
        };
        info!("graph validated: {} of {} targets selected", selected.len(), graph.order().len());

        // ------------------------------------------------------------------
        // Create the run row.
        // ------------------------------------------------------------------
        let run = runs::create_run(&self.pool).await?;
        let run_id = Uuid::parse_str(&run.id)
            .map_err(|e| cache::CacheError::Corrupt(format!("invalid run id: {e}")))?;

        let outcome = self.run_graph(run_id, plan, &graph, &selected).await;

        // ------------------------------------------------------------------
        // Close the run.
        // ------------------------------------------------------------------
        let status = match &outcome {
            Ok(report) if report.is_success() => RunStatus::Succeeded,
            _ => RunStatus::Failed,
        };
        if let Err(e) = runs::finish_run(&self.pool, run_id, status).await {
            warn!("could not close run {run_id}: {e}");
        }

        let report = outcome?;
        info!(
            run_id = %run_id,
            built = report.built.len(),
            skipped = report.skipped.len(),
            failed = report.failed.len(),
            cancelled = report.cancelled.len(),
            "run finished"
        );

        Ok(report)
    }

    async fn run_graph(
        &self,
        run_id: Uuid,
        plan: &Plan,
        graph: &DependencyGraph,
        selected: &HashSet<String>,
    ) -> Result<MakeReport, EngineError> {
        let probe = Probe::prepare(&self.pool, self.worker.as_ref(), &self.config, plan, graph).await?;
        let jobs = self.config.backend().jobs();

        let mut report = MakeReport {
            run_id,
            ..MakeReport::default()
        };

        // Unfinished upstream targets per selected target.
        let mut waiting: HashMap<&str, usize> = graph
            .order()
            .iter()
            .filter(|n| selected.contains(*n))
            .map(|n| (n.as_str(), graph.deps(n).map_or(0, |d| d.targets.len())))
            .collect();
        let mut ready: VecDeque<String> = graph
            .order()
            .iter()
            .filter(|n| waiting.get(n.as_str()) == Some(&0))
            .cloned()
            .collect();

        let mut values: HashMap<String, String> = HashMap::new();
        let mut finished: HashSet<String> = HashSet::new();
        let mut cancelled: HashSet<String> = HashSet::new();
        let mut stopping = false;
        let mut in_flight: JoinSet<Finished> = JoinSet::new();

        loop {
            // --------------------------------------------------------------
            // Dispatch as many ready targets as the backend allows.
            // --------------------------------------------------------------
            while !stopping && in_flight.len() < jobs {
                let Some(name) = ready.pop_front() else { break };
                let Some(spec) = plan.target(&name) else { continue };

                match self.dispatch(&probe, graph, run_id, spec, &values).await? {
                    Dispatch::UpToDate(record) => {
                        debug!(target_name = %name, "up to date");
                        self.materialize(&probe.value_path(&name), &record.value, Some(&record.value_hash)).await?;
                        self.log(run_id, &name, BuildStatus::Skipped, None, None).await;
                        values.insert(name.clone(), record.value_hash);
                        report.skipped.push(name.clone());
                        finished.insert(name.clone());
                        release(graph, &name, selected, &mut waiting, &mut ready);
                    }
                    Dispatch::Build(job, fingerprints, reasons) => {
                        let why: Vec<String> = reasons.iter().map(ToString::to_string).collect();
                        info!(target_name = %name, reasons = ?why, "building");
                        self.log(run_id, &name, BuildStatus::Started, Some(&why.join("; ")), None).await;

                        let policy = RetryPolicy {
                            retries: spec.retries.unwrap_or(self.config.retries),
                            base_delay: self.config.retry_base_delay(),
                            timeout: spec
                                .timeout_secs
                                .map(Duration::from_secs)
                                .or(self.config.timeout()),
                        };
                        let worker = Arc::clone(&self.worker);
                        let pool = self.pool.clone();

                        in_flight.spawn(async move {
                            let started = Instant::now();
                            let result = execute_with_retry(worker.as_ref(), &pool, job, policy).await;
                            Finished {
                                name,
                                fingerprints,
                                result,
                                elapsed: started.elapsed(),
                            }
                        });
                    }
                    Dispatch::Failed(message) => {
                        self.fail(run_id, graph, selected, &name, message, Duration::ZERO, &mut report, &mut cancelled)
                            .await?;
                        finished.insert(name);
                        stopping |= !self.config.keep_going;
                    }
                }
            }

            // --------------------------------------------------------------
            // Wait for the next build to finish.
            // --------------------------------------------------------------
            let Some(joined) = in_flight.join_next().await else { break };
            let done = joined.map_err(|e| EngineError::TaskAborted(e.to_string()))?;
            let name = done.name.clone();

            match self.record_build(&probe, graph, done).await? {
                Ok((value_hash, elapsed)) => {
                    info!(target_name = %name, elapsed_ms = elapsed.as_millis() as u64, "built");
                    self.log(run_id, &name, BuildStatus::Built, None, Some(elapsed)).await;
                    values.insert(name.clone(), value_hash);
                    report.built.push(name.clone());
                    finished.insert(name.clone());
                    release(graph, &name, selected, &mut waiting, &mut ready);
                }
                Err((message, elapsed)) => {
                    self.fail(run_id, graph, selected, &name, message, elapsed, &mut report, &mut cancelled)
                        .await?;
                    finished.insert(name);
                    stopping |= !self.config.keep_going;
                }
            }
        }

        // Anything left was never reached because the run stopped early.
        for name in graph.order() {
            if selected.contains(name) && !finished.contains(name) && !cancelled.contains(name) {
                self.log(run_id, name, BuildStatus::Cancelled, Some("run stopped"), None).await;
                report.cancelled.push(name.clone());
            }
        }

        Ok(report)
    }

    /// Decide what to do with a target whose upstream targets are finished.
    async fn dispatch(
        &self,
        probe: &Probe<'_>,
        graph: &DependencyGraph,
        run_id: Uuid,
        spec: &crate::models::TargetSpec,
        values: &HashMap<String, String>,
    ) -> Result<Dispatch, EngineError> {
        let Some(deps) = graph.deps(&spec.name) else {
            return Err(EngineError::UnknownTarget(spec.name.clone()));
        };

        let fingerprints = match probe.fingerprints(run_id, spec, deps, values).await {
            Ok(fp) => fp,
            Err(e @ EngineError::Cache(_)) => return Err(e),
            Err(e) => return Ok(Dispatch::Failed(e.to_string())),
        };

        let record = targets::get_target(&self.pool, &spec.name).await?;
        let reasons = decide(&spec.trigger, record.as_ref(), &fingerprints);
        if reasons.is_empty() {
            if let Some(record) = record {
                return Ok(Dispatch::UpToDate(record));
            }
        }

        let command = match probe.render(&spec.name, &spec.command) {
            Ok(c) => c,
            Err(e) => return Ok(Dispatch::Failed(e.to_string())),
        };
        let job = probe.job(run_id, &spec.name, JobKind::Build, command);
        Ok(Dispatch::Build(job, fingerprints, reasons))
    }

    /// Store the result of a finished build. The inner `Err` carries the
    /// failure message when the build (or its outputs) failed.
    async fn record_build(
        &self,
        probe: &Probe<'_>,
        graph: &DependencyGraph,
        done: Finished,
    ) -> Result<Result<(String, Duration), (String, Duration)>, EngineError> {
        let output = match done.result {
            Ok(output) => output,
            Err(message) => return Ok(Err((message, done.elapsed))),
        };

        let file_out_hash = match graph.deps(&done.name) {
            Some(deps) if !deps.files_out.is_empty() => {
                for path in &deps.files_out {
                    if probe.hasher().fingerprint(path).await?.is_none() {
                        return Ok(Err((
                            format!("declared output file '{path}' was not created"),
                            done.elapsed,
                        )));
                    }
                }
                Some(probe.hasher().fingerprint_all(&deps.files_out).await?)
            }
            _ => None,
        };

        let value_hash = hash_bytes(&output.stdout);
        targets::upsert_target(
            &self.pool,
            &NewTargetRecord {
                name: &done.name,
                value: &output.stdout,
                value_hash: &value_hash,
                command_hash: &done.fingerprints.command,
                depend_hash: &done.fingerprints.depend,
                file_out_hash: file_out_hash.as_deref(),
                change_hash: done.fingerprints.change.as_deref(),
                elapsed_ms: done.elapsed.as_millis() as i64,
            },
        )
        .await?;
        self.materialize(&probe.value_path(&done.name), &output.stdout, None).await?;

        Ok(Ok((value_hash, done.elapsed)))
    }

    #[allow(clippy::too_many_arguments)]
    async fn fail(
        &self,
        run_id: Uuid,
        graph: &DependencyGraph,
        selected: &HashSet<String>,
        name: &str,
        message: String,
        elapsed: Duration,
        report: &mut MakeReport,
        cancelled: &mut HashSet<String>,
    ) -> Result<(), EngineError> {
        error!(target_name = %name, "build failed: {message}");
        targets::mark_failed(&self.pool, name, &message, elapsed.as_millis() as i64).await?;
        self.log(run_id, name, BuildStatus::Failed, Some(&message), Some(elapsed)).await;
        report.failed.push((name.to_owned(), message));

        if self.config.keep_going {
            for downstream in graph.downstream(name) {
                if selected.contains(downstream) && cancelled.insert(downstream.to_owned()) {
                    let why = format!("upstream target '{name}' failed");
                    self.log(run_id, downstream, BuildStatus::Cancelled, Some(&why), None).await;
                    report.cancelled.push(downstream.to_owned());
                }
            }
        }
        Ok(())
    }

    /// Write a value file. When `current_hash` is given, an existing file
    /// whose contents already hash to it is left alone.
    async fn materialize(&self, path: &Path, value: &[u8], current_hash: Option<&str>) -> Result<(), EngineError> {
        if let Some(expected) = current_hash {
            if let Ok(on_disk) = hash_file(path).await {
                if on_disk == expected {
                    return Ok(());
                }
                debug!(path = %path.display(), "value file out of sync with the cache, rewriting");
            }
        }
        if let Some(parent) = path.parent() {
            tokio::fs::create_dir_all(parent)
                .await
                .map_err(|e| EngineError::io(parent, e))?;
        }
        tokio::fs::write(path, value)
            .await
            .map_err(|e| EngineError::io(path, e))
    }

    /// Append to the build log. A log write failure never fails the build.
    async fn log(
        &self,
        run_id: Uuid,
        target: &str,
        status: BuildStatus,
        message: Option<&str>,
        elapsed: Option<Duration>,
    ) {
        let elapsed_ms = elapsed.map(|d| d.as_millis() as i64);
        if let Err(e) = runs::insert_event(&self.pool, run_id, target, status, message, elapsed_ms).await {
            warn!(target_name = %target, "could not record {status} event: {e}");
        }
    }
}

/// Mark `name` finished and queue dependents whose upstream is now complete.
fn release<'g>(
    graph: &'g DependencyGraph,
    name: &str,
    selected: &HashSet<String>,
    waiting: &mut HashMap<&'g str, usize>,
    ready: &mut VecDeque<String>,
) {
    for dependent in graph.dependents(name) {
        if !selected.contains(dependent) {
            continue;
        }
        if let Some(count) = waiting.get_mut(dependent.as_str()) {
            *count = count.saturating_sub(1);
            if *count == 0 {
                ready.push_back(dependent.clone());
            }
        }
    }
}

// ---------------------------------------------------------------------------
// Internal: execute a single build with retry logic.
// ---------------------------------------------------------------------------

/// Longest pause between two attempts of a build.
pub(crate) const MAX_RETRY_DELAY: Duration = Duration::from_secs(60);

/// Delay before retry number `attempt` (1-based): `base * 2^(attempt - 1)`,
/// capped at [`MAX_RETRY_DELAY`].
pub(crate) fn backoff_delay(base: Duration, attempt: u32) -> Duration {
    2u32.checked_pow(attempt.saturating_sub(1))
        .and_then(|factor| base.checked_mul(factor))
        .map_or(MAX_RETRY_DELAY, |d| d.min(MAX_RETRY_DELAY))
}

async fn execute_with_retry(
    worker: &dyn Worker,
    pool: &CachePool,
    mut job: Job,
    policy: RetryPolicy,
) -> Result<WorkerOutput, String> {
    let mut attempts = 0u32;

    loop {
        job.attempt = attempts + 1;
        let result = match policy.timeout {
            Some(limit) => match tokio::time::timeout(limit, worker.run(&job)).await {
                Ok(result) => result,
                Err(_) => return Err(format!("timed out after {}s", limit.as_secs_f64())),
            },
            None => worker.run(&job).await,
        };

        match result {
            Ok(output) => return Ok(output),

            Err(WorkerError::Fatal(msg)) => return Err(msg),

            Err(WorkerError::Retryable(msg)) => {
                attempts += 1;
                if attempts > policy.retries {
                    return Err(format!("retry limit ({}) exceeded: {msg}", policy.retries));
                }

                let delay = backoff_delay(policy.base_delay, attempts);

                warn!(
                    "target '{}' retryable error (attempt {}/{}), retrying in {:?}: {}",
                    job.target, attempts, policy.retries, delay, msg
                );
                let note = format!("attempt {attempts} failed: {msg}");
                if let Err(e) = runs::insert_event(pool, job.run_id, &job.target, BuildStatus::Retrying, Some(&note), None).await {
                    warn!("could not record retry: {e}");
                }

                tokio::time::sleep(delay).await;
            }
        }
    }
}
