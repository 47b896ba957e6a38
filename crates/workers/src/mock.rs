//! `MockWorker`: a test double for `Worker`.
//!
//! Useful in unit and integration tests where spawning real processes is
//! either unavailable or irrelevant.

use std::collections::HashMap;
use std::sync::{Arc, Mutex};

use async_trait::async_trait;

use crate::{Job, Worker, WorkerError, WorkerOutput};

/// Behaviour injected into `MockWorker` per target.
#[derive(Debug, Clone)]
pub enum MockBehaviour {
    /// Succeed with the given stdout.
    ReturnValue(Vec<u8>),
    /// Fail with a `Retryable` error.
    FailRetryable(String),
    /// Fail `n` times with a `Retryable` error, then succeed with the value.
    FlakyThenReturn(u32, Vec<u8>),
    /// Fail with a `Fatal` error.
    FailFatal(String),
    /// Sleep before succeeding (for timeout tests).
    Slow(std::time::Duration, Vec<u8>),
}

/// A mock worker that records every job it receives and answers with a
/// programmer-specified result. Targets without a behaviour succeed and echo
/// their rendered command.
#[derive(Default, Clone)]
pub struct MockWorker {
    behaviours: HashMap<String, MockBehaviour>,
    /// All jobs seen by this worker (in call order).
    pub calls: Arc<Mutex<Vec<Job>>>,
}

impl MockWorker {
    pub fn new() -> Self {
        Self::default()
    }

    /// Set the behaviour for one target.
    pub fn with(mut self, target: impl Into<String>, behaviour: MockBehaviour) -> Self {
        self.behaviours.insert(target.into(), behaviour);
        self
    }

    /// Shorthand for a target that succeeds with `value`.
    pub fn returning(self, target: impl Into<String>, value: impl Into<Vec<u8>>) -> Self {
        self.with(target, MockBehaviour::ReturnValue(value.into()))
    }

    /// Number of times `target` has been run.
    pub fn call_count(&self, target: &str) -> usize {
        self.calls
            .lock()
            .unwrap()
            .iter()
            .filter(|j| j.target == target)
            .count()
    }

    /// Target names in the order their jobs arrived.
    pub fn call_order(&self) -> Vec<String> {
        self.calls
            .lock()
            .unwrap()
            .iter()
            .map(|j| j.target.clone())
            .collect()
    }
}

fn ok(stdout: &[u8]) -> Result<WorkerOutput, WorkerError> {
    Ok(WorkerOutput {
        status: 0,
        stdout: stdout.to_vec(),
        stderr: String::new(),
    })
}

#[async_trait]
impl Worker for MockWorker {
    async fn run(&self, job: &Job) -> Result<WorkerOutput, WorkerError> {
        let seen = {
            let mut calls = self.calls.lock().unwrap();
            calls.push(job.clone());
            calls.iter().filter(|j| j.target == job.target).count() as u32
        };

        match self.behaviours.get(&job.target) {
            None => ok(job.command.as_bytes()),
            Some(MockBehaviour::ReturnValue(v)) => ok(v),
            Some(MockBehaviour::FailRetryable(msg)) => Err(WorkerError::Retryable(msg.clone())),
            Some(MockBehaviour::FailFatal(msg)) => Err(WorkerError::Fatal(msg.clone())),
            Some(MockBehaviour::FlakyThenReturn(failures, v)) => {
                if seen <= *failures {
                    Err(WorkerError::Retryable(format!("flaky failure #{seen}")))
                } else {
                    ok(v)
                }
            }
            Some(MockBehaviour::Slow(delay, v)) => {
                tokio::time::sleep(*delay).await;
                ok(v)
            }
        }
    }
}
