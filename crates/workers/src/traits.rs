//! The `Worker` trait: the contract every build backend must fulfil.

use std::collections::BTreeMap;
use std::path::PathBuf;

use async_trait::async_trait;

use crate::WorkerError;

/// Why a command is being run.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum JobKind {
    /// Produce the value of a target.
    Build,
    /// Evaluate a trigger condition (exit status decides).
    Condition,
    /// Evaluate a change trigger (stdout is fingerprinted).
    Change,
}

/// One unit of work handed to a worker.
///
/// Defined here (in the workers crate) so both the engine and individual
/// worker implementations can import it without a circular dependency.
#[derive(Debug, Clone)]
pub struct Job {
    /// ID of the build run this job belongs to.
    pub run_id: uuid::Uuid,
    /// Name of the target the job is for.
    pub target: String,
    pub kind: JobKind,
    /// Fully rendered command line (dependency markers already substituted).
    pub command: String,
    /// Directory the command runs in (the project root).
    pub workdir: PathBuf,
    /// Extra environment variables exported to the command.
    pub env: BTreeMap<String, String>,
    /// 1-based attempt number.
    pub attempt: u32,
}

/// What a finished command produced.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct WorkerOutput {
    /// Exit status; `0` on success.
    pub status: i32,
    pub stdout: Vec<u8>,
    pub stderr: String,
}

impl WorkerOutput {
    pub fn success(&self) -> bool {
        self.status == 0
    }
}

/// The core worker trait.
///
/// A worker executes exactly one job at a time; the executor runs several
/// jobs concurrently by calling `run` from multiple tasks.
#[async_trait]
pub trait Worker: Send + Sync {
    /// Execute the job and return its captured output.
    ///
    /// For `JobKind::Build`, a non-zero exit status must be reported as an
    /// error. Trigger jobs return their output whatever the exit status.
    async fn run(&self, job: &Job) -> Result<WorkerOutput, WorkerError>;
}
