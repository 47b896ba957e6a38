//! Gathers the current fingerprints of a target: input files, imports,
//! outputs and trigger commands. Shared by `make` and `outdated`.

use std::collections::HashMap;
use std::path::PathBuf;

use tracing::debug;
use uuid::Uuid;

use cache::{pool::value_path, CachePool};
use workers::{Job, JobKind, Worker, WorkerOutput};

use crate::analyze::{normalize_command, render_command};
use crate::config::EngineConfig;
use crate::dag::{DependencyGraph, TargetDeps};
use crate::hash::{hash_bytes, hash_str, FileHasher};
use crate::models::{Plan, TargetSpec};
use crate::staleness::{depend_fingerprint, Fingerprints};
use crate::EngineError;

/// Fingerprints of everything that is not a target, taken once per run.
#[derive(Debug, Clone, Default)]
pub struct Inputs {
    pub import_hashes: HashMap<String, String>,
    /// What `{{import}}` renders to: the path as written, or the literal.
    pub import_renders: HashMap<String, String>,
    /// Files read by targets and produced by none.
    pub leaf_files: HashMap<String, Option<String>>,
}

pub struct Probe<'a> {
    graph: &'a DependencyGraph,
    worker: &'a dyn Worker,
    config: &'a EngineConfig,
    hasher: FileHasher,
    inputs: Inputs,
}

impl<'a> Probe<'a> {
    /// Fingerprint imports and leaf input files.
    ///
    /// # Errors
    /// [`EngineError::MissingImport`] if an import file does not exist.
    pub async fn prepare(
        pool: &CachePool,
        worker: &'a dyn Worker,
        config: &'a EngineConfig,
        plan: &Plan,
        graph: &'a DependencyGraph,
    ) -> Result<Probe<'a>, EngineError> {
        let hasher = FileHasher::new(pool.clone(), config.root.clone());
        let mut inputs = Inputs::default();

        for import in &plan.imports {
            let (hash, render) = match (&import.path, &import.value) {
                (Some(path), _) => {
                    let key = path.to_string_lossy().into_owned();
                    let hash = hasher.fingerprint(&key).await?.ok_or_else(|| {
                        EngineError::MissingImport {
                            name: import.name.clone(),
                            path: path.clone(),
                        }
                    })?;
                    (hash, key)
                }
                (None, Some(value)) => (hash_str(value), value.clone()),
                (None, None) => return Err(EngineError::InvalidImport(import.name.clone())),
            };
            inputs.import_hashes.insert(import.name.clone(), hash);
            inputs.import_renders.insert(import.name.clone(), render);
        }

        for path in graph.leaf_files() {
            let fp = hasher.fingerprint(path).await?;
            inputs.leaf_files.insert(path.to_owned(), fp);
        }

        debug!(
            imports = inputs.import_hashes.len(),
            files = inputs.leaf_files.len(),
            "fingerprinted inputs"
        );

        Ok(Probe {
            graph,
            worker,
            config,
            hasher,
            inputs,
        })
    }

    pub fn hasher(&self) -> &FileHasher {
        &self.hasher
    }

    pub fn value_path(&self, target: &str) -> PathBuf {
        value_path(&self.config.cache_path(), target)
    }

    /// Substitute the markers of a command belonging to `target`.
    pub fn render(&self, target: &str, command: &str) -> Result<String, EngineError> {
        render_command(command, |name| {
            if let Some(r) = self.inputs.import_renders.get(name) {
                Some(r.clone())
            } else if self.graph.contains(name) {
                Some(self.value_path(name).display().to_string())
            } else {
                None
            }
        })
        .map_err(|e| EngineError::MalformedCommand {
            target: target.to_owned(),
            message: e.to_string(),
        })
    }

    /// Build the job that runs `command` for `target`.
    pub fn job(&self, run_id: Uuid, target: &str, kind: JobKind, command: String) -> Job {
        let mut env = std::collections::BTreeMap::new();
        env.insert(
            "DROVER_CACHE_DIR".to_owned(),
            self.config.cache_path().display().to_string(),
        );
        Job {
            run_id,
            target: target.to_owned(),
            kind,
            command,
            workdir: self.config.root.clone(),
            env,
            attempt: 1,
        }
    }

    /// Current fingerprints of `spec`, given the value fingerprints of the
    /// targets it depends on. Runs the trigger's condition/change commands.
    pub async fn fingerprints(
        &self,
        run_id: Uuid,
        spec: &TargetSpec,
        deps: &TargetDeps,
        values: &HashMap<String, String>,
    ) -> Result<Fingerprints, EngineError> {
        let mut files = HashMap::with_capacity(deps.files_in.len());
        for path in &deps.files_in {
            let fp = match self.inputs.leaf_files.get(path) {
                Some(fp) => fp.clone(),
                // Produced by an upstream target during this run.
                None => self.hasher.fingerprint(path).await?,
            };
            files.insert(path.clone(), fp);
        }

        let file_out = if deps.files_out.is_empty() {
            None
        } else {
            Some(self.hasher.fingerprint_all(&deps.files_out).await?)
        };

        let condition = match &spec.trigger.condition {
            Some(cmd) => Some(self.run_trigger(run_id, spec, JobKind::Condition, cmd).await?.success()),
            None => None,
        };
        let change = match &spec.trigger.change {
            Some(cmd) => Some(hash_bytes(&self.run_trigger(run_id, spec, JobKind::Change, cmd).await?.stdout)),
            None => None,
        };

        Ok(Fingerprints {
            command: hash_str(&normalize_command(&spec.command)),
            depend: depend_fingerprint(deps, values, &self.inputs.import_hashes, &files),
            file_out,
            condition,
            change,
        })
    }

    async fn run_trigger(
        &self,
        run_id: Uuid,
        spec: &TargetSpec,
        kind: JobKind,
        command: &str,
    ) -> Result<WorkerOutput, EngineError> {
        let rendered = self.render(&spec.name, command)?;
        let job = self.job(run_id, &spec.name, kind, rendered);
        self.worker
            .run(&job)
            .await
            .map_err(|e| EngineError::TargetFailed {
                target: spec.name.clone(),
                message: format!("{kind:?} trigger failed: {e}"),
            })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::{ImportSpec, Trigger};
    use cache::pool::open_in_memory;
    use workers::ShellWorker;

    fn config(root: &std::path::Path) -> EngineConfig {
        EngineConfig {
            root: root.to_path_buf(),
            ..EngineConfig::default()
        }
    }

    #[tokio::test]
    async fn imports_are_fingerprinted_and_rendered() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(dir.path().join("fit.py"), "print(1)").unwrap();
        let plan = Plan::new(
            vec![TargetSpec::new("model", "python3 {{fit}} {{alpha}} < {{data}}"), TargetSpec::new("data", "echo 1")],
            vec![ImportSpec::file("fit", "fit.py"), ImportSpec::value("alpha", "0.1")],
        );
        let graph = DependencyGraph::build(&plan).unwrap();
        let pool = open_in_memory().await.unwrap();
        let worker = ShellWorker::default();
        let cfg = config(dir.path());

        let probe = Probe::prepare(&pool, &worker, &cfg, &plan, &graph).await.unwrap();
        assert_eq!(probe.inputs.import_hashes["fit"], hash_str("print(1)"));
        assert_eq!(probe.inputs.import_hashes["alpha"], hash_str("0.1"));

        let rendered = probe.render("model", &plan.targets[0].command).unwrap();
        let data_path = value_path(&cfg.cache_path(), "data");
        assert_eq!(
            rendered,
            format!("python3 fit.py 0.1 < {}", crate::analyze::shell_quote(&data_path.display().to_string()))
        );
    }

    #[tokio::test]
    async fn missing_import_file_is_an_error() {
        let dir = tempfile::tempdir().unwrap();
        let plan = Plan::new(
            vec![TargetSpec::new("a", "sh {{script}}")],
            vec![ImportSpec::file("script", "nope.sh")],
        );
        let graph = DependencyGraph::build(&plan).unwrap();
        let pool = open_in_memory().await.unwrap();
        let worker = ShellWorker::default();
        let cfg = config(dir.path());

        let err = Probe::prepare(&pool, &worker, &cfg, &plan, &graph).await.err().unwrap();
        assert!(matches!(err, EngineError::MissingImport { name, .. } if name == "script"));
    }

    #[tokio::test]
    async fn trigger_commands_are_evaluated() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(dir.path().join("version"), "v1").unwrap();
        let spec = TargetSpec::new("a", "echo 1").with_trigger(Trigger {
            condition: Some("test -f go".into()),
            change: Some("cat version".into()),
            ..Trigger::default()
        });
        let plan = Plan::new(vec![spec.clone()], vec![]);
        let graph = DependencyGraph::build(&plan).unwrap();
        let pool = open_in_memory().await.unwrap();
        let worker = ShellWorker::default();
        let cfg = config(dir.path());
        let probe = Probe::prepare(&pool, &worker, &cfg, &plan, &graph).await.unwrap();
        let deps = graph.deps("a").unwrap();

        let fp = probe.fingerprints(Uuid::new_v4(), &spec, deps, &HashMap::new()).await.unwrap();
        assert_eq!(fp.condition, Some(false));
        assert_eq!(fp.change, Some(hash_str("v1")));
        assert_eq!(fp.file_out, None);

        std::fs::write(dir.path().join("go"), "").unwrap();
        let fp = probe.fingerprints(Uuid::new_v4(), &spec, deps, &HashMap::new()).await.unwrap();
        assert_eq!(fp.condition, Some(true));
    }
}
