//! `ShellWorker`: runs commands through a local shell.

use std::process::Stdio;

use async_trait::async_trait;
use tokio::process::Command;
use tracing::debug;

use crate::{Job, JobKind, Worker, WorkerError, WorkerOutput};

/// Exit status a command uses to ask for a retry (`EX_TEMPFAIL`).
pub const EXIT_TEMPFAIL: i32 = 75;

/// Runs every job as `<shell> -c <command>` in the job's working directory.
#[derive(Debug, Clone)]
pub struct ShellWorker {
    shell: String,
}

impl ShellWorker {
    pub fn new(shell: impl Into<String>) -> Self {
        Self { shell: shell.into() }
    }
}

impl Default for ShellWorker {
    fn default() -> Self {
        Self::new("sh")
    }
}

#[async_trait]
impl Worker for ShellWorker {
    async fn run(&self, job: &Job) -> Result<WorkerOutput, WorkerError> {
        debug!(target_name = %job.target, kind = ?job.kind, attempt = job.attempt, "spawning command");

        let output = Command::new(&self.shell)
            .arg("-c")
            .arg(&job.command)
            .current_dir(&job.workdir)
            .envs(&job.env)
            .env("DROVER_TARGET", &job.target)
            .env("DROVER_RUN_ID", job.run_id.to_string())
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true)
            .output()
            .await
            .map_err(|e| match e.kind() {
                std::io::ErrorKind::Interrupted | std::io::ErrorKind::WouldBlock => {
                    WorkerError::Retryable(format!("failed to spawn '{}': {e}", self.shell))
                }
                _ => WorkerError::Fatal(format!("failed to spawn '{}': {e}", self.shell)),
            })?;

        // Killed by a signal: no exit code.
        let status = output.status.code().unwrap_or(-1);
        let out = WorkerOutput {
            status,
            stdout: output.stdout,
            stderr: String::from_utf8_lossy(&output.stderr).into_owned(),
        };

        if job.kind != JobKind::Build || out.success() {
            return Ok(out);
        }

        let message = format!("command exited with status {status}: {}", out.stderr.trim());
        if status == EXIT_TEMPFAIL {
            Err(WorkerError::Retryable(message))
        } else {
            Err(WorkerError::Fatal(message))
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::BTreeMap;

    fn job(command: &str, kind: JobKind, dir: &std::path::Path) -> Job {
        Job {
            run_id: uuid::Uuid::new_v4(),
            target: "t".into(),
            kind,
            command: command.into(),
            workdir: dir.to_path_buf(),
            env: BTreeMap::new(),
            attempt: 1,
        }
    }

    #[tokio::test]
    async fn captures_stdout() {
        let dir = tempfile::tempdir().unwrap();
        let out = ShellWorker::default()
            .run(&job("printf hello", JobKind::Build, dir.path()))
            .await
            .unwrap();
        assert_eq!(out.stdout, b"hello");
        assert!(out.success());
    }

    #[tokio::test]
    async fn runs_in_workdir_with_env() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(dir.path().join("input.txt"), "abc").unwrap();
        let mut j = job("cat input.txt; printf \"-$GREETING\"", JobKind::Build, dir.path());
        j.env.insert("GREETING".into(), "hi".into());

        let out = ShellWorker::default().run(&j).await.unwrap();
        assert_eq!(out.stdout, b"abc-hi");
    }

    #[tokio::test]
    async fn nonzero_exit_is_fatal() {
        let dir = tempfile::tempdir().unwrap();
        let err = ShellWorker::default()
            .run(&job("echo oops >&2; exit 3", JobKind::Build, dir.path()))
            .await
            .unwrap_err();
        match err {
            WorkerError::Fatal(msg) => assert!(msg.contains("status 3") && msg.contains("oops")),
            other => panic!("expected fatal, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn tempfail_exit_is_retryable() {
        let dir = tempfile::tempdir().unwrap();
        let err = ShellWorker::default()
            .run(&job("exit 75", JobKind::Build, dir.path()))
            .await
            .unwrap_err();
        assert!(err.is_retryable());
    }

    #[tokio::test]
    async fn condition_jobs_report_status_instead_of_failing() {
        let dir = tempfile::tempdir().unwrap();
        let out = ShellWorker::default()
            .run(&job("false", JobKind::Condition, dir.path()))
            .await
            .unwrap();
        assert_eq!(out.status, 1);
    }
}
